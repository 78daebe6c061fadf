//! Progress bars for extract jobs, driven by the library's progress callbacks
use std::{
    borrow::Cow,
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }

    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Progress should be hidden in verbose mode (log output would garble the bars) and in quiet mode
pub(crate) fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Renders the progress of extract jobs.
///
/// Clones share the same bars, so one report can follow several archives extracted one after
/// another.
#[derive(Clone)]
pub(crate) struct ExtractProgressReport {
    /// Aggregate which groups all of the below progress bars together
    multi: indicatif::MultiProgress,

    /// The raw bytes read from the archive, tar headers included
    raw_bytes_read: indicatif::ProgressBar,

    /// Bytes of the current file read from the archive
    extract_object: indicatif::ProgressBar,

    /// Bytes of the current file uploaded to object storage.  For multipart uploads this lags
    /// behind `extract_object`.
    upload_object: indicatif::ProgressBar,

    /// Size and bytes uploaded so far of the file currently being uploaded
    object_upload_progress: Arc<Mutex<HashMap<String, ObjectUploadProgress>>>,
}

struct ObjectUploadProgress {
    total_size: u64,
    total_bytes_uploaded: u64,
}

impl ExtractProgressReport {
    pub(crate) fn new(hide_progress: bool) -> Self {
        fn standard_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<55!} [{bar:20.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        }

        /// Right-align the prefix ourselves; the template's alignment doesn't pad it
        fn pad_prefix(prefix: &'static str) -> String {
            format!("{prefix:>25}")
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let raw_bytes_read = multi.add(indicatif::ProgressBar::new(0));
        raw_bytes_read.set_prefix(pad_prefix("Read from archive"));
        raw_bytes_read.set_style(standard_style());

        let extract_object = multi.add(indicatif::ProgressBar::new(0));
        extract_object.set_style(standard_style());
        extract_object.set_prefix(pad_prefix("Extract file"));

        let upload_object = multi.add(indicatif::ProgressBar::new(0));
        upload_object.set_style(standard_style());
        upload_object.set_prefix(pad_prefix("Upload object to S3"));

        Self {
            multi,
            raw_bytes_read,
            extract_object,
            upload_object,
            object_upload_progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn uploads(&self) -> std::sync::MutexGuard<'_, HashMap<String, ObjectUploadProgress>> {
        self.object_upload_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ova_extract::ExtractProgressCallback for ExtractProgressReport {
    fn extract_starting(&self, archive_size: Option<u64>) {
        // Streams have no known size; the bar then just counts bytes
        self.raw_bytes_read.reset();
        self.extract_object.reset();
        self.upload_object.reset();
        self.raw_bytes_read
            .set_length(archive_size.unwrap_or_default());
        self.raw_bytes_read.set_message("Extracting files");
    }

    fn extract_archive_part_read(&self, bytes: usize) {
        self.raw_bytes_read.inc(bytes as u64);
    }

    fn extract_object_starting(&self, key: &str, size: u64) {
        self.extract_object.set_position(0);
        self.extract_object.set_length(size);
        self.extract_object.set_message(key.to_string());

        self.upload_object.set_position(0);
        self.upload_object.set_length(size);
        self.upload_object.set_message(key.to_string());

        self.uploads().insert(
            key.to_string(),
            ObjectUploadProgress {
                total_size: size,
                total_bytes_uploaded: 0,
            },
        );
    }

    fn extract_object_part_read(&self, _key: &str, bytes: usize) {
        self.extract_object.inc(bytes as u64);
    }

    fn object_part_uploaded(&self, key: &str, bytes: usize) {
        let mut uploads = self.uploads();

        if let Some(progress) = uploads.get_mut(key) {
            progress.total_bytes_uploaded += bytes as u64;

            self.upload_object.set_length(progress.total_size);
            self.upload_object
                .set_position(progress.total_bytes_uploaded);
        }
    }

    fn object_uploaded(&self, key: &str, size: u64) {
        self.extract_object.set_position(size);
        self.upload_object.set_length(size);
        self.upload_object.set_position(size);

        self.uploads().remove(key);

        let _ = self.multi.println(format!(
            "Extracted {key} ({})",
            indicatif::BinaryBytes(size)
        ));
    }

    fn extract_finished(
        &self,
        extracted_objects: usize,
        extracted_object_bytes: u64,
        total_bytes: u64,
        duration: Duration,
    ) {
        let bytes_per_second = (total_bytes as f64 / duration.as_secs_f64().max(0.001)) as u64;
        let bytes_per_second = indicatif::BinaryBytes(bytes_per_second);
        let extracted_objects = indicatif::HumanCount(extracted_objects as u64);
        let extracted_object_bytes = indicatif::BinaryBytes(extracted_object_bytes);
        let total_bytes = indicatif::BinaryBytes(total_bytes);
        let duration = indicatif::HumanDuration(duration);

        let _ = self.multi.println(format!(
            "Extraction complete!  Extracted {extracted_objects} files ({extracted_object_bytes}) from {total_bytes} of archive in {duration} ({bytes_per_second}/s)"
        ));

        self.raw_bytes_read.finish_and_clear();
        self.extract_object.finish_and_clear();
        self.upload_object.finish_and_clear();
    }
}

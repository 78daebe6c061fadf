//! Processing of S3 event notifications: every archive named in a batch of notifications is
//! extracted, one after another.
use crate::{
    objstore, ArchiveTask, Config, ExtractArchiveJobBuilder, ExtractProgressCallback,
    ExtractedArchive, ObjectStorage, Result, S3Event, SourceArchive,
};
use tracing::{error, info, info_span, Instrument};

/// Turns S3 event notifications into extract jobs and runs them.
#[derive(Clone, Debug)]
pub struct Intake {
    config: Config,
    objstore: Box<dyn ObjectStorage>,
}

impl Intake {
    /// Create an intake that reads archives from and writes extracted files to S3, configured
    /// according to `config`
    pub async fn new(config: Config) -> Self {
        let objstore = objstore::s3(config.clone()).await;

        Self::with_object_storage(config, objstore)
    }

    /// Create an intake that uses some other [`ObjectStorage`] implementation
    pub fn with_object_storage(config: Config, objstore: Box<dyn ObjectStorage>) -> Self {
        Self { config, objstore }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The archive extraction tasks for every record in the notification batch, in order
    pub fn tasks(&self, event: &S3Event) -> Vec<ArchiveTask> {
        event
            .records
            .iter()
            .map(|record| ArchiveTask::from_record(record, &self.config))
            .collect()
    }

    /// Extract every archive named in the notification batch.
    ///
    /// Archives are extracted one at a time in the order they appear in the batch.  The first
    /// failure stops the whole batch; later records are not attempted.
    pub async fn process(&self, event: &S3Event) -> Result<Vec<ExtractedArchive>> {
        #[derive(Clone)]
        struct NoProgress {}
        impl ExtractProgressCallback for NoProgress {}

        self.process_with_progress(event, NoProgress {}).await
    }

    /// Like [`Self::process`], reporting the progress of each archive to a clone of `progress`
    pub async fn process_with_progress<P>(
        &self,
        event: &S3Event,
        progress: P,
    ) -> Result<Vec<ExtractedArchive>>
    where
        P: ExtractProgressCallback + Clone + 'static,
    {
        let tasks = self.tasks(event);

        info!(records = tasks.len(), "Processing S3 event notification");

        let mut extracted = Vec::with_capacity(tasks.len());

        for task in tasks {
            extracted.push(self.process_task(task, progress.clone()).await?);
        }

        Ok(extracted)
    }

    /// Extract a single archive
    pub async fn process_task<P>(&self, task: ArchiveTask, progress: P) -> Result<ExtractedArchive>
    where
        P: ExtractProgressCallback + 'static,
    {
        let span = info_span!("process_task",
            source_bucket = %task.source_bucket,
            source_key = %task.source_key,
            destination_bucket = %task.destination_bucket);

        async move {
            if self.config.destination_bucket_override().is_some() {
                info!("Extracting archive to the configured destination bucket");
            } else {
                info!("No destination bucket configured; extracting archive to the source bucket");
            }

            let result = async {
                ExtractArchiveJobBuilder::new(
                    self.objstore.clone(),
                    SourceArchive::ObjectStorage {
                        bucket: task.source_bucket,
                        key: task.source_key,
                    },
                    task.destination_bucket,
                )
                .build()
                .await?
                .run(progress)
                .await
            }
            .await;

            match result {
                Ok(extracted) => {
                    info!(
                        objects = extracted.objects.len(),
                        elapsed = ?extracted.elapsed,
                        "Archive extracted"
                    );

                    Ok(extracted)
                }
                Err(e) => {
                    error!(err = %e, kind = ?e.kind(), "Failed to extract archive");

                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

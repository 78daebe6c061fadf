//! Test helper that implements [`ova_extract::ExtractProgressCallback`] and keeps a record of
//! every progress update in order, so tests can verify progress reporting.
use more_asserts::*;
use ova_extract::{ExtractProgressCallback, ExtractedArchive};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not every field is checked, but every event is captured in full
pub(crate) enum ExtractProgressEvent {
    ExtractStarting {
        archive_size: Option<u64>,
    },

    ExtractArchivePartRead {
        bytes: usize,
    },

    ExtractObjectStarting {
        key: String,
        size: u64,
    },

    ExtractObjectPartRead {
        key: String,
        bytes: usize,
    },

    ObjectPartUploaded {
        key: String,
        bytes: usize,
    },

    ObjectUploaded {
        key: String,
        size: u64,
    },

    ExtractFinished {
        extracted_objects: usize,
        extracted_object_bytes: u64,
        total_bytes: u64,
        duration: Duration,
    },
}

#[derive(Clone)]
pub(crate) struct TestExtractProgressCallback {
    events: Arc<Mutex<Vec<ExtractProgressEvent>>>,
}

impl TestExtractProgressCallback {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Check the updates reported by a job that ran to successful completion against each other
    /// and against the job's result.
    ///
    /// Only valid when exactly one archive was extracted with this callback.
    pub fn sanity_check_updates(&self, extracted: &ExtractedArchive) {
        let started = self.filter_events(ExtractProgressEventDiscriminants::ExtractStarting);
        assert_eq!(1, started.len(), "Expected exactly one start event");

        // Objects start and finish in archive order, one at a time
        let starting = self.object_sizes(ExtractProgressEventDiscriminants::ExtractObjectStarting);
        let uploaded = self.object_sizes(ExtractProgressEventDiscriminants::ObjectUploaded);
        assert_eq!(starting, uploaded);

        let expected = extracted
            .objects
            .iter()
            .map(|object| (object.key.clone(), object.len))
            .collect::<Vec<_>>();
        assert_eq!(expected, uploaded);

        // The data read from the archive and the data uploaded each add up to the object size
        let read = self.bytes_per_key(ExtractProgressEventDiscriminants::ExtractObjectPartRead);
        let sent = self.bytes_per_key(ExtractProgressEventDiscriminants::ObjectPartUploaded);
        for (key, size) in &expected {
            assert_eq!(
                *size,
                read.get(key).copied().unwrap_or_default(),
                "Bytes read from the archive for '{key}'"
            );
            assert_eq!(
                *size,
                sent.get(key).copied().unwrap_or_default(),
                "Bytes uploaded for '{key}'"
            );
        }

        // Raw archive reads cover every object plus the tar headers
        let archive_bytes_read: u64 = self
            .filter_events(ExtractProgressEventDiscriminants::ExtractArchivePartRead)
            .into_iter()
            .map(|event| match event {
                ExtractProgressEvent::ExtractArchivePartRead { bytes } => bytes as u64,
                _ => unreachable!(),
            })
            .sum();
        assert_eq!(extracted.archive_bytes, archive_bytes_read);
        assert_ge!(archive_bytes_read, extracted.total_object_bytes());

        match self
            .filter_single_event(ExtractProgressEventDiscriminants::ExtractFinished)
            .expect("Job finished without reporting it")
        {
            ExtractProgressEvent::ExtractFinished {
                extracted_objects,
                extracted_object_bytes,
                total_bytes,
                ..
            } => {
                assert_eq!(extracted.objects.len(), extracted_objects);
                assert_eq!(extracted.total_object_bytes(), extracted_object_bytes);
                assert_eq!(extracted.archive_bytes, total_bytes);
            }
            _ => unreachable!(),
        }
    }

    /// The archive size reported when extraction started
    pub fn archive_size(&self) -> Option<u64> {
        match self.filter_single_event(ExtractProgressEventDiscriminants::ExtractStarting) {
            Some(ExtractProgressEvent::ExtractStarting { archive_size }) => archive_size,
            _ => None,
        }
    }

    /// Keys of the objects whose extraction started, in order
    pub fn objects_started(&self) -> Vec<String> {
        self.object_sizes(ExtractProgressEventDiscriminants::ExtractObjectStarting)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    /// Keys of the objects that were uploaded, in order
    pub fn objects_uploaded(&self) -> Vec<String> {
        self.object_sizes(ExtractProgressEventDiscriminants::ObjectUploaded)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    pub fn finished(&self) -> bool {
        self.filter_single_event(ExtractProgressEventDiscriminants::ExtractFinished)
            .is_some()
    }

    /// `(key, size)` of every object starting or object uploaded event, in order
    fn object_sizes(&self, typ: ExtractProgressEventDiscriminants) -> Vec<(String, u64)> {
        self.filter_events(typ)
            .into_iter()
            .map(|event| match event {
                ExtractProgressEvent::ExtractObjectStarting { key, size }
                | ExtractProgressEvent::ObjectUploaded { key, size } => (key, size),
                other => unreachable!("{other:?} doesn't describe an object"),
            })
            .collect()
    }

    /// Sum of the bytes of every part event, per object key
    fn bytes_per_key(&self, typ: ExtractProgressEventDiscriminants) -> HashMap<String, u64> {
        let mut totals = HashMap::new();

        for event in self.filter_events(typ) {
            let (key, bytes) = match event {
                ExtractProgressEvent::ExtractObjectPartRead { key, bytes }
                | ExtractProgressEvent::ObjectPartUploaded { key, bytes } => (key, bytes),
                other => unreachable!("{other:?} isn't a part event"),
            };

            *totals.entry(key).or_default() += bytes as u64;
        }

        totals
    }

    /// All events of a certain type
    pub fn filter_events(
        &self,
        typ: ExtractProgressEventDiscriminants,
    ) -> Vec<ExtractProgressEvent> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter(|event| {
                let event_typ: ExtractProgressEventDiscriminants = (*event).into();

                event_typ == typ
            })
            .cloned()
            .collect::<Vec<_>>()
    }

    /// The single ocurrence of an event that can appear at most once
    pub fn filter_single_event(
        &self,
        typ: ExtractProgressEventDiscriminants,
    ) -> Option<ExtractProgressEvent> {
        let mut events = self.filter_events(typ);

        assert!(
            events.len() <= 1,
            "Expected 0 or 1 instances of {:?}, but found {}",
            typ,
            events.len()
        );

        events.pop()
    }

    fn report_event(&self, event: ExtractProgressEvent) {
        let mut events = self.events.lock().unwrap();

        events.push(event)
    }
}

impl std::fmt::Debug for TestExtractProgressCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.events.lock().unwrap();
        events.fmt(f)
    }
}

impl ExtractProgressCallback for TestExtractProgressCallback {
    fn extract_starting(&self, archive_size: Option<u64>) {
        self.report_event(ExtractProgressEvent::ExtractStarting { archive_size })
    }

    fn extract_archive_part_read(&self, bytes: usize) {
        self.report_event(ExtractProgressEvent::ExtractArchivePartRead { bytes })
    }

    fn extract_object_starting(&self, key: &str, size: u64) {
        self.report_event(ExtractProgressEvent::ExtractObjectStarting {
            key: key.to_string(),
            size,
        })
    }

    fn extract_object_part_read(&self, key: &str, bytes: usize) {
        self.report_event(ExtractProgressEvent::ExtractObjectPartRead {
            key: key.to_string(),
            bytes,
        })
    }

    fn object_part_uploaded(&self, key: &str, bytes: usize) {
        self.report_event(ExtractProgressEvent::ObjectPartUploaded {
            key: key.to_string(),
            bytes,
        })
    }

    fn object_uploaded(&self, key: &str, size: u64) {
        self.report_event(ExtractProgressEvent::ObjectUploaded {
            key: key.to_string(),
            size,
        })
    }

    fn extract_finished(
        &self,
        extracted_objects: usize,
        extracted_object_bytes: u64,
        total_bytes: u64,
        duration: Duration,
    ) {
        self.report_event(ExtractProgressEvent::ExtractFinished {
            extracted_objects,
            extracted_object_bytes,
            total_bytes,
            duration,
        })
    }
}

//! Per-archive extraction parameters, and the rules for naming the extracted objects.
use crate::{Config, Result, S3EventRecord};

/// The suffix every archive name must carry
pub const OVA_SUFFIX: &str = ".ova";

/// One archive to extract: where it lives, and which bucket its contents are written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveTask {
    pub source_bucket: String,
    pub source_key: String,
    pub destination_bucket: String,
}

impl ArchiveTask {
    pub fn new(
        source_bucket: impl Into<String>,
        source_key: impl Into<String>,
        destination_bucket: impl Into<String>,
    ) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            destination_bucket: destination_bucket.into(),
        }
    }

    /// Derive the task for a single notification record.
    ///
    /// The destination is the configured destination bucket if there is one, otherwise the
    /// bucket the archive was uploaded to.
    pub fn from_record(record: &S3EventRecord, config: &Config) -> Self {
        let source_bucket = record.bucket_name();

        Self::new(
            source_bucket,
            record.object_key(),
            config.destination_bucket_for(source_bucket),
        )
    }

    /// The name of the folder in the destination bucket that receives the archive contents
    pub fn archive_base_name(&self) -> Result<&str> {
        archive_base_name(&self.source_key)
    }
}

/// Strip the `.ova` suffix from an archive name.
///
/// The result is the prefix under which every file in the archive is written.  Names that don't
/// end in `.ova` (the check is case-sensitive) aren't OVA archives and are rejected.
pub fn archive_base_name(name: &str) -> Result<&str> {
    match name.strip_suffix(OVA_SUFFIX) {
        Some(base) => Ok(base),
        None => crate::error::InvalidArchiveNameSnafu { name }.fail(),
    }
}

/// The object key an archive entry is written to
pub fn destination_key(archive_base_name: &str, entry_name: &str) -> String {
    format!("{archive_base_name}/{entry_name}")
}

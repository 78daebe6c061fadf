use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    complete_multipart_upload::CompleteMultipartUploadError,
    create_multipart_upload::CreateMultipartUploadError, get_object::GetObjectError,
    head_bucket::HeadBucketError, put_object::PutObjectError, upload_part::UploadPartError,
};
use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = OvaExtractError> = std::result::Result<T, E>;

/// The broad category of an [`OvaExtractError`].
///
/// Every error is fatal to the job that produced it; the category exists so that callers can
/// report which stage failed without matching on every individual variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The source object key (or file name) doesn't end in `.ova`
    InvalidArchiveName,

    /// The tar stream could not be parsed, or ended in the middle of an entry
    MalformedArchive,

    /// The archive contains something other than regular files
    UnsupportedEntryType,

    /// Reading the archive from its source failed
    ReadError,

    /// Writing an extracted object to the destination failed
    UploadError,

    /// A notification document, URL or other caller-provided input is unusable
    InvalidInput,

    /// Failures of the runtime itself, like a panicked blocking task
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OvaExtractError {
    #[snafu(display("Unable to parse the S3 event notification document"))]
    InvalidEvent { source: serde_json::Error },

    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The archive URL '{url}' is not valid; it must name an object in a bucket"))]
    ArchiveUrlInvalid { url: Url },

    #[snafu(display(
        "The source '{name}' is not an OVA archive (the name doesn't end with '.ova')"
    ))]
    InvalidArchiveName { name: String },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<HeadBucketError>,
    },

    #[snafu(display("The bucket '{bucket}' does not exist"))]
    BucketNotFound { bucket: String },

    #[snafu(display("Error reading object '{key}' from S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<GetObjectError>,
    },

    #[snafu(display("Error reading the body of object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error opening archive file '{}'", path.display()))]
    OpeningArchiveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading archive {archive} from its source"))]
    ReadArchive {
        archive: String,
        source: std::io::Error,
    },

    #[snafu(display("The archive {archive} is not a valid tar archive"))]
    MalformedArchive {
        archive: String,
        source: std::io::Error,
    },

    #[snafu(display("The archive {archive} ended in the middle of entry '{path}': expected {expected} bytes but only {actual} were present"))]
    TruncatedEntry {
        archive: String,
        path: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("The archive {archive} contains an entry whose name is not valid UTF-8: '{path}'"))]
    NonUtf8EntryPath { archive: String, path: String },

    #[snafu(display("The archive {archive} contains entry '{path}' of type {entry_type}; only regular files are supported"))]
    UnsupportedEntryType {
        archive: String,
        path: String,
        entry_type: String,
    },

    #[snafu(display("Error starting multi-part upload of object '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' to S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display(
        "Error completing multi-part upload of object '{key}' to S3 bucket '{bucket}'"
    ))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display("Upload of object '{key}' to bucket '{bucket}' received {actual} bytes but {expected} were expected; the object was not created"))]
    ObjectLengthMismatch {
        bucket: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("Object '{key}' in bucket '{bucket}' would be {len} bytes, which is more than object storage accepts"))]
    ObjectTooLarge { bucket: String, key: String, len: u64 },

    #[snafu(display("The upload task for object '{key}' in bucket '{bucket}' exited without reporting a result"))]
    ObjectWriterAbandoned { bucket: String, key: String },

    #[snafu(display("Error writing extracted data for object '{key}' in bucket '{bucket}'"))]
    WriteObjectData {
        bucket: String,
        key: String,
        source: std::io::Error,
    },

    /// Catch-all for read errors reported by [`crate::Bucket`] implementations other than S3
    #[snafu(display("Error reading object '{key}' from bucket '{bucket}'"))]
    ObjectStoreRead {
        bucket: String,
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Catch-all for write errors reported by [`crate::Bucket`] implementations other than S3
    #[snafu(display("Error writing object '{key}' to bucket '{bucket}'"))]
    ObjectStoreWrite {
        bucket: String,
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[snafu(display("A blocking task panicked or was canceled"))]
    SpawnBlocking { source: tokio::task::JoinError },
}

impl OvaExtractError {
    /// The category of failure this error represents
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArchiveName { .. } => ErrorKind::InvalidArchiveName,

            Self::MalformedArchive { .. }
            | Self::TruncatedEntry { .. }
            | Self::NonUtf8EntryPath { .. } => ErrorKind::MalformedArchive,

            Self::UnsupportedEntryType { .. } => ErrorKind::UnsupportedEntryType,

            Self::GetObject { .. }
            | Self::ReadByteStream { .. }
            | Self::OpeningArchiveFile { .. }
            | Self::ReadArchive { .. }
            | Self::ObjectStoreRead { .. } => ErrorKind::ReadError,

            Self::CreateMultipartUpload { .. }
            | Self::UploadPart { .. }
            | Self::CompleteMultipartUpload { .. }
            | Self::PutObject { .. }
            | Self::ObjectLengthMismatch { .. }
            | Self::ObjectTooLarge { .. }
            | Self::ObjectWriterAbandoned { .. }
            | Self::WriteObjectData { .. }
            | Self::ObjectStoreWrite { .. } => ErrorKind::UploadError,

            // A bucket that doesn't exist or isn't accessible is detected while the job is being
            // set up, before anything is read or written
            Self::InvalidEvent { .. }
            | Self::BucketInvalidOrNotAccessible { .. }
            | Self::BucketNotFound { .. }
            | Self::UnsupportedObjectStorage { .. }
            | Self::MissingBucket { .. }
            | Self::ArchiveUrlInvalid { .. } => ErrorKind::InvalidInput,

            Self::SpawnBlocking { .. } => ErrorKind::Internal,
        }
    }
}

use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

mod s3;

/// The largest object S3 accepts, 5 TiB
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

/// An object storage system like S3.
///
/// The S3 API is the only one implemented in this crate, but the extractor only ever talks to
/// object storage through this trait, so that other implementations (like the in-memory store
/// used in tests) can be substituted.
///
/// Note that all implementations must be trivially cloneable such that the cost of a clone is the
/// cost of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Get a handle to the named bucket.
    ///
    /// Fails if the bucket doesn't exist or isn't accessible with the current credentials.
    async fn bucket(&self, name: &str) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// Note that all implementations must be trivially cloneable such that the cost of a clone is the
/// cost of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// Start reading an entire object, front to back, as a single stream.
    ///
    /// The object's data is delivered in chunks of whatever size is convenient for the
    /// implementation on the [`ObjectReader::chunks`] channel, in order.  If reading fails part
    /// way through, the error is delivered on the same channel and no further chunks follow.
    async fn read_object(&self, key: &str) -> Result<ObjectReader>;

    /// Start writing an object of exactly `len` bytes at `key`.
    ///
    /// Whatever is written to [`ObjectWriter::writer`] becomes the contents of the object.  The
    /// object is created only when the writer has been shut down after exactly `len` bytes were
    /// written; if fewer or more bytes arrive, or any error occurs, the object is not created
    /// (nor is an existing object at that key modified), and [`ObjectWriter::result`] reports the
    /// error.
    ///
    /// Callers must always await [`ObjectWriter::result`] to learn the outcome.  If the upload
    /// fails while data is still being written, writes fail with a `BrokenPipe` error, and the
    /// actual cause is delivered on the result channel.
    async fn create_object_writer(&self, key: &str, len: u64) -> Result<ObjectWriter>;
}

dyn_clone::clone_trait_object!(Bucket);

/// The receiving end of an object read started with [`Bucket::read_object`]
#[derive(Debug)]
pub struct ObjectReader {
    /// The length of the object, if the object storage reported it
    pub len: Option<u64>,

    /// The object data, in order
    pub chunks: mpsc::Receiver<Result<Bytes>>,
}

/// The sending end of an object write started with [`Bucket::create_object_writer`]
#[derive(Debug)]
pub struct ObjectWriter {
    /// The object data should be written here, followed by a shutdown
    pub writer: DuplexStream,

    /// Receives the number of bytes each time some part of the object has been stored.  Callers
    /// that don't care about progress can drop this.
    pub progress: mpsc::UnboundedReceiver<u64>,

    /// Completes when the object has been stored, or the write has failed
    pub result: oneshot::Receiver<Result<UploadedObject>>,
}

/// An object that was written in its entirety
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedObject {
    pub bucket: String,
    pub key: String,
    pub len: u64,

    /// The entity tag the object storage assigned to the new object, if it reports one
    pub e_tag: Option<String>,
}

impl std::fmt::Display for UploadedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Create an [`ObjectStorage`] implementation for S3 or an S3-compatible API, using the endpoint,
/// region and credentials in `config`.
pub async fn s3(config: Config) -> Box<dyn ObjectStorage> {
    // Each call makes a new client instead of sharing one for the whole process.  AWS SDK clients
    // hold `hyper` resources tied to the tokio runtime they were created on, and using them after
    // that runtime is dropped panics, which is exactly what happens in tests that each use their
    // own runtime.
    Box::new(s3::S3::new(config).await)
}

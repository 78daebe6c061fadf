//! An in-memory implementation of the `ova-extract` object storage traits, for tests that don't
//! need a real S3 endpoint.
//!
//! Besides storing objects, it keeps a record of what was asked of it (reads, attempted writes,
//! the order writes completed in) and can be told to fail specific reads and writes.
use bytes::Bytes;
use ova_extract::{Bucket, ObjectReader, ObjectStorage, ObjectWriter, UploadedObject};
use snafu::IntoError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Objects are read back in chunks of this size unless configured otherwise
const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on the buffer reserved up front for an object, whatever length it claims
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStorage {
    state: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    buckets: HashMap<String, BTreeMap<String, Bytes>>,

    /// `(bucket, key)` of every write that completed, in order
    completed_writes: Vec<(String, String)>,

    /// `(bucket, key)` of every write that was started, in order
    attempted_writes: Vec<(String, String)>,

    reads: usize,

    read_chunk_size: usize,

    failing_writes: HashSet<(String, String)>,

    /// Reads of these objects fail after this many bytes were delivered
    failing_reads: HashMap<(String, String), usize>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            completed_writes: Vec::new(),
            attempted_writes: Vec::new(),
            reads: 0,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            failing_writes: HashSet::new(),
            failing_reads: HashMap::new(),
        }
    }
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A boxed clone, ready to hand to the code under test
    pub fn boxed(&self) -> Box<dyn ObjectStorage> {
        Box::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.lock().buckets.entry(bucket.into()).or_default();
    }

    /// Store an object directly, without counting it as a write
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    /// All keys in the bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn completed_writes(&self) -> Vec<(String, String)> {
        self.lock().completed_writes.clone()
    }

    pub fn attempted_writes(&self) -> Vec<(String, String)> {
        self.lock().attempted_writes.clone()
    }

    /// How many times an object read was started
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn set_read_chunk_size(&self, chunk_size: usize) {
        self.lock().read_chunk_size = chunk_size.max(1);
    }

    /// Make every write to this object fail
    pub fn fail_writes_to(&self, bucket: &str, key: &str) {
        self.lock()
            .failing_writes
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make reads of this object fail once `after_bytes` bytes have been delivered
    pub fn fail_reads_of(&self, bucket: &str, key: &str, after_bytes: usize) {
        self.lock()
            .failing_reads
            .insert((bucket.to_string(), key.to_string()), after_bytes);
    }

    fn handle(&self, bucket: &str) -> MemoryBucket {
        MemoryBucket {
            name: bucket.to_string(),
            storage: self.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn bucket(&self, name: &str) -> ova_extract::Result<Box<dyn Bucket>> {
        if self.lock().buckets.contains_key(name) {
            Ok(Box::new(self.handle(name)))
        } else {
            ova_extract::error::BucketNotFoundSnafu { bucket: name }.fail()
        }
    }
}

#[derive(Clone, Debug)]
struct MemoryBucket {
    name: String,
    storage: MemoryObjectStorage,
}

fn injected(message: &str, kind: std::io::ErrorKind) -> BoxError {
    Box::new(std::io::Error::new(kind, message.to_string()))
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_object(&self, key: &str) -> ova_extract::Result<ObjectReader> {
        let (data, chunk_size, fail_after) = {
            let mut state = self.storage.lock();
            state.reads += 1;

            let data = state
                .buckets
                .get(&self.name)
                .and_then(|objects| objects.get(key).cloned());
            let fail_after = state
                .failing_reads
                .get(&(self.name.clone(), key.to_string()))
                .copied();

            (data, state.read_chunk_size, fail_after)
        };

        let data = match data {
            Some(data) => data,
            None => {
                return Err(ova_extract::error::ObjectStoreReadSnafu {
                    bucket: self.name.clone(),
                    key,
                }
                .into_error(injected("no such object", std::io::ErrorKind::NotFound)));
            }
        };

        let len = data.len() as u64;
        let (sender, receiver) = mpsc::channel(4);
        let bucket = self.name.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let mut offset = 0usize;
            let end = fail_after.map_or(data.len(), |after| after.min(data.len()));

            while offset < end {
                let chunk_end = (offset + chunk_size).min(end);

                if sender
                    .send(Ok(data.slice(offset..chunk_end)))
                    .await
                    .is_err()
                {
                    return;
                }

                offset = chunk_end;
            }

            if fail_after.is_some() {
                debug!(%bucket, %key, offset, "Failing object read");

                let _ = sender
                    .send(Err(ova_extract::error::ObjectStoreReadSnafu { bucket, key }
                        .into_error(injected(
                            "injected read failure",
                            std::io::ErrorKind::ConnectionReset,
                        ))))
                    .await;
            }
        });

        Ok(ObjectReader {
            len: Some(len),
            chunks: receiver,
        })
    }

    async fn create_object_writer(&self, key: &str, len: u64) -> ova_extract::Result<ObjectWriter> {
        let fail = {
            let mut state = self.storage.lock();
            state
                .attempted_writes
                .push((self.name.clone(), key.to_string()));

            state
                .failing_writes
                .contains(&(self.name.clone(), key.to_string()))
        };

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();
        let (result_sender, result_receiver) = oneshot::channel();

        let bucket = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let result = async move {
                if fail {
                    // Dropping the reader makes further writes fail, like a broken connection
                    drop(reader);

                    return Err(ova_extract::error::ObjectStoreWriteSnafu {
                        bucket: bucket.name.clone(),
                        key: key.clone(),
                    }
                    .into_error(injected(
                        "injected write failure",
                        std::io::ErrorKind::BrokenPipe,
                    )));
                }

                let mut data = Vec::with_capacity(len.min(MAX_PREALLOCATION) as usize);
                reader.read_to_end(&mut data).await.map_err(|e| {
                    ova_extract::error::ObjectStoreWriteSnafu {
                        bucket: bucket.name.clone(),
                        key: key.clone(),
                    }
                    .into_error(Box::new(e) as BoxError)
                })?;

                let actual = data.len() as u64;
                if actual != len {
                    return ova_extract::error::ObjectLengthMismatchSnafu {
                        bucket: bucket.name.clone(),
                        key: key.clone(),
                        expected: len,
                        actual,
                    }
                    .fail();
                }

                {
                    let mut state = bucket.storage.lock();
                    state
                        .buckets
                        .entry(bucket.name.clone())
                        .or_default()
                        .insert(key.clone(), Bytes::from(data));
                    state
                        .completed_writes
                        .push((bucket.name.clone(), key.clone()));
                }

                let _ = progress_sender.send(len);

                Ok(UploadedObject {
                    bucket: bucket.name.clone(),
                    key: key.clone(),
                    len,
                    e_tag: None,
                })
            }
            .await;

            let _ = result_sender.send(result);
        });

        Ok(ObjectWriter {
            writer,
            progress: progress_receiver,
            result: result_receiver,
        })
    }
}

//! Implementation of the extract operation which writes every file in an OVA archive to object
//! storage.
//!
//! The caller starts with [`ExtractArchiveJobBuilder`], then calls
//! [`ExtractArchiveJobBuilder::build`] to validate the archive name and destination bucket and
//! construct an [`ExtractArchiveJob`].  A call to [`ExtractArchiveJob::run`] actually performs the
//! job.  Progress is reported via a caller-provided implementation of the
//! [`ExtractProgressCallback`] trait.
//!
//! The tar format is strictly sequential, and the `tar` crate only works with blocking I/O, so
//! the archive is read front to back in a blocking worker thread.  The archive itself is
//! downloaded by an async task and fed to the `tar` crate through a blocking `Read` bridge.  Each
//! file in the archive is then copied, still in the blocking thread, into an async object writer
//! which uploads it.  Only one file is in flight at a time, and the next entry header isn't read
//! until the previous file has been completely stored.
use crate::async_bridge::{async_write_as_writer, stream_as_reader};
use crate::objstore::{
    Bucket, ObjectReader, ObjectStorage, ObjectWriter, UploadedObject, MAX_OBJECT_SIZE,
};
use crate::tar::{CountingReader, EntryKind, TarEntryHeader};
use crate::task::{archive_base_name, destination_key};
use crate::{OvaExtractError, Result};
use snafu::{prelude::*, IntoError};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, info, info_span, instrument, Instrument};
use url::Url;

/// Reads of local files and arbitrary streams are buffered with this much memory
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Archive entries are copied to object storage through a buffer this big
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Represents from where the archive will be read
pub enum SourceArchive {
    /// Read the archive from an object in object storage.
    ObjectStorage { bucket: String, key: String },

    /// Read the archive from the local filesystem
    File(PathBuf),

    /// Read the archive from some arbitrary [`std::io::Read`] impl.
    ///
    /// There's no object key or file name to derive the destination folder from, so the caller
    /// must supply the archive's name.
    Reader {
        name: String,
        reader: Box<dyn Read + Send>,
    },
}

impl SourceArchive {
    /// Parse an `s3://bucket/path/to/archive.ova` URL
    pub fn from_url(url: &Url) -> Result<Self> {
        ensure!(
            url.scheme() == "s3",
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }
        );

        // In URL terms, the bucket part of an S3 URL is the host name
        let bucket = url
            .host_str()
            .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

        // The URL path always starts with `/` but that's not part of the object key
        let path = url.path();
        let key = percent_encoding::percent_decode_str(path.strip_prefix('/').unwrap_or(path))
            .decode_utf8_lossy()
            .into_owned();

        ensure!(
            !key.is_empty(),
            crate::error::ArchiveUrlInvalidSnafu { url: url.clone() }
        );

        Ok(Self::ObjectStorage {
            bucket: bucket.to_string(),
            key,
        })
    }

    /// The name the `.ova` rule is applied to: the object key, file name, or caller-supplied name
    pub fn name(&self) -> String {
        match self {
            Self::ObjectStorage { key, .. } => key.clone(),
            Self::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Reader { name, .. } => name.clone(),
        }
    }

    /// The source bucket, if the archive is in object storage
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::ObjectStorage { bucket, .. } => Some(bucket),
            _ => None,
        }
    }

    /// Obtain more details about the archive source and convert this into a
    /// [`SourceArchiveInternal`]
    #[instrument(skip(objstore))]
    async fn into_internal(self, objstore: &dyn ObjectStorage) -> Result<SourceArchiveInternal> {
        match self {
            Self::ObjectStorage { bucket, key } => {
                let bucket = objstore.bucket(&bucket).await?;

                Ok(SourceArchiveInternal::ObjectStorage { bucket, key })
            }
            Self::File(path) => {
                let metadata = tokio::fs::metadata(&path).await.with_context(|_| {
                    crate::error::OpeningArchiveFileSnafu { path: path.clone() }
                })?;

                Ok(SourceArchiveInternal::File {
                    path,
                    len: metadata.len(),
                })
            }
            Self::Reader { reader, .. } => Ok(SourceArchiveInternal::Reader(reader)),
        }
    }
}

impl std::fmt::Display for SourceArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectStorage { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Reader { name, .. } => write!(f, "{name} (stream)"),
        }
    }
}

impl std::fmt::Debug for SourceArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectStorage { bucket, key } => f
                .debug_struct("ObjectStorage")
                .field("bucket", bucket)
                .field("key", key)
                .finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Reader { name, .. } => f
                .debug_struct("Reader")
                .field("name", name)
                .field("reader", &"dyn Read")
                .finish(),
        }
    }
}

/// Internal-only representation of [`SourceArchive`] once the source has been validated
enum SourceArchiveInternal {
    ObjectStorage { bucket: Box<dyn Bucket>, key: String },

    File { path: PathBuf, len: u64 },

    Reader(Box<dyn Read + Send>),
}

impl std::fmt::Debug for SourceArchiveInternal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectStorage { bucket, key } => f
                .debug_struct("ObjectStorage")
                .field("bucket", &bucket.name())
                .field("key", key)
                .finish(),
            Self::File { path, len } => f
                .debug_struct("File")
                .field("path", path)
                .field("len", len)
                .finish(),
            Self::Reader(_) => f.debug_tuple("Reader").field(&"dyn Read").finish(),
        }
    }
}

impl SourceArchiveInternal {
    /// Produce a blocking [`std::io::Read`] impl that will produce the contents of the tar
    /// archive, along with the size of the archive if that's known.
    ///
    /// For object storage this starts the download.
    async fn into_reader(
        self,
        progress: Arc<dyn ExtractProgressCallback>,
    ) -> Result<(CountingReader<Box<dyn Read + Send>>, Option<u64>)> {
        let (reader, len): (Box<dyn Read + Send>, _) = match self {
            Self::ObjectStorage { bucket, key } => {
                let ObjectReader { len, chunks } = bucket.read_object(&key).await?;

                (
                    Box::new(stream_as_reader(
                        tokio_stream::wrappers::ReceiverStream::new(chunks),
                    )),
                    len,
                )
            }
            Self::File { path, len } => {
                let file = tokio::task::spawn_blocking(move || {
                    std::fs::File::open(&path).with_context(|_| {
                        crate::error::OpeningArchiveFileSnafu { path: path.clone() }
                    })
                })
                .await
                .context(crate::error::SpawnBlockingSnafu {})??;

                (
                    Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
                    Some(len),
                )
            }
            Self::Reader(reader) => (
                Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, reader)),
                None,
            ),
        };

        Ok((CountingReader::new(reader, progress), len))
    }
}

#[derive(Debug)]
pub struct ExtractArchiveJobBuilder {
    objstore: Box<dyn ObjectStorage>,
    source_archive: SourceArchive,
    target_bucket: String,
}

impl ExtractArchiveJobBuilder {
    /// Start building a job that extracts `source` into `target_bucket`.
    ///
    /// `objstore` is used both to write the extracted objects and, if the source archive is in
    /// object storage, to read the archive.
    pub fn new(
        objstore: Box<dyn ObjectStorage>,
        source: SourceArchive,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self {
            objstore,
            source_archive: source,
            target_bucket: target_bucket.into(),
        }
    }

    pub async fn build(self) -> Result<ExtractArchiveJob> {
        // An archive with the wrong name is rejected before anything is read or written
        let archive = self.source_archive.to_string();
        let base_name = archive_base_name(&self.source_archive.name())?.to_string();

        let target_bucket = self.objstore.bucket(&self.target_bucket).await?;

        let source_archive = self
            .source_archive
            .into_internal(self.objstore.as_ref())
            .await?;

        Ok(ExtractArchiveJob {
            archive,
            base_name,
            source_archive,
            target_bucket,
        })
    }
}

/// A trait which callers can implement to get detailed progress updates as the extract operation
/// is progressing.
///
/// All methods have empty default implementations.
#[allow(unused_variables)]
pub trait ExtractProgressCallback: Sync + Send {
    /// The extracting operation is now starting.
    ///
    /// The archive size is provided if it's known.  Extraction from an arbitrary stream doesn't
    /// have a known size.
    fn extract_starting(&self, archive_size: Option<u64>) {}

    /// Some bytes from the archive have been read.
    ///
    /// This measures raw bytes read from the archive, it will include actual objects' data, plus
    /// the metadata structures of the `tar` format.
    fn extract_archive_part_read(&self, bytes: usize) {}

    /// Starting to extract the data for a given object
    fn extract_object_starting(&self, key: &str, size: u64) {}

    /// A part of an object has been read from the archive and written to the object writer
    fn extract_object_part_read(&self, key: &str, bytes: usize) {}

    /// A part of an object has been uploaded to object storage
    fn object_part_uploaded(&self, key: &str, bytes: usize) {}

    /// The object has been uploaded in its entirety
    fn object_uploaded(&self, key: &str, size: u64) {}

    /// The extraction has finished successfully.
    ///
    /// The `total_bytes` argument is the total number of bytes read from the archive, and it
    /// includes all tar format headers.
    fn extract_finished(
        &self,
        extracted_objects: usize,
        extracted_object_bytes: u64,
        total_bytes: u64,
        duration: Duration,
    ) {
    }
}

/// The result of extracting one archive
#[derive(Clone, Debug)]
pub struct ExtractedArchive {
    /// Description of where the archive was read from
    pub archive: String,

    pub destination_bucket: String,

    /// The archive name without the `.ova` suffix; every object was written under this prefix
    pub base_name: String,

    /// Every object written, in archive order
    pub objects: Vec<UploadedObject>,

    /// Total bytes read from the archive, including tar headers
    pub archive_bytes: u64,

    pub elapsed: Duration,
}

impl ExtractedArchive {
    pub fn total_object_bytes(&self) -> u64 {
        self.objects.iter().map(|object| object.len).sum()
    }
}

#[derive(Debug)]
pub struct ExtractArchiveJob {
    archive: String,
    base_name: String,
    source_archive: SourceArchiveInternal,
    target_bucket: Box<dyn Bucket>,
}

impl ExtractArchiveJob {
    /// The folder in the target bucket that the archive contents will be written to
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn target_bucket(&self) -> &str {
        self.target_bucket.name()
    }

    /// Alternative to [`Self::run`] for callers that do not care about progress information.
    pub async fn run_without_progress(self) -> Result<ExtractedArchive> {
        struct NoProgress {}
        impl ExtractProgressCallback for NoProgress {}

        self.run(NoProgress {}).await
    }

    /// Run the job, returning only when the job has run to completion (or failed).
    ///
    /// Extraction stops at the first error.  Objects that were completely written before the
    /// error remain in the target bucket; the object that was being written when the error
    /// happened is never created.
    pub async fn run<Progress>(self, progress: Progress) -> Result<ExtractedArchive>
    where
        Progress: ExtractProgressCallback + 'static,
    {
        let span = info_span!("run",
            archive = %self.archive,
            target_bucket = self.target_bucket.name(),
            base_name = %self.base_name);

        async move {
            info!("Starting extract archive job");

            let progress: Arc<dyn ExtractProgressCallback> = Arc::new(progress);
            let started = Instant::now();

            let (reader, archive_size) = self.source_archive.into_reader(progress.clone()).await?;

            progress.extract_starting(archive_size);

            let job = BlockingExtract {
                archive: self.archive,
                base_name: self.base_name,
                target_bucket: self.target_bucket,
                progress: progress.clone(),
                handle: tokio::runtime::Handle::current(),
            };

            // The `tar` crate does blocking reads, so the whole extraction happens on a blocking
            // thread
            let reader_span = debug_span!("read_tar_entries_blocking");
            let result = tokio::task::spawn_blocking(move || {
                let _guard = reader_span.enter();

                debug!("Starting blocking tar read task");

                job.read_tar_entries(reader, started)
            })
            .await
            .context(crate::error::SpawnBlockingSnafu {})?;

            match result {
                Ok(extracted) => {
                    progress.extract_finished(
                        extracted.objects.len(),
                        extracted.total_object_bytes(),
                        extracted.archive_bytes,
                        extracted.elapsed,
                    );

                    info!(
                        objects = extracted.objects.len(),
                        object_bytes = extracted.total_object_bytes(),
                        archive_bytes = extracted.archive_bytes,
                        elapsed = ?extracted.elapsed,
                        "Finished extract job"
                    );

                    Ok(extracted)
                }
                Err(e) => {
                    error!(err = ?e, kind = ?e.kind(), "Extract job failed");

                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// The state of the blocking half of an extract job
struct BlockingExtract {
    archive: String,
    base_name: String,
    target_bucket: Box<dyn Bucket>,
    progress: Arc<dyn ExtractProgressCallback>,
    handle: tokio::runtime::Handle,
}

/// Why copying an entry to its object writer stopped early
enum CopyError {
    /// Reading the entry from the archive failed; the error is already classified
    Read(OvaExtractError),

    /// Writing to the object writer failed, which usually means the upload failed and the real
    /// cause is waiting on the writer's result channel
    Write(std::io::Error),
}

impl BlockingExtract {
    /// Iterate over the entries in the tar archive, writing each one to object storage before
    /// moving on to the next.
    fn read_tar_entries(
        self,
        reader: CountingReader<Box<dyn Read + Send>>,
        started: Instant,
    ) -> Result<ExtractedArchive> {
        let mut archive = tar::Archive::new(reader);
        let mut objects = Vec::new();

        let entries = archive
            .entries()
            .map_err(|e| self.archive_read_error(e))?;

        for result in entries {
            let mut entry = result.map_err(|e| self.archive_read_error(e))?;

            let header = TarEntryHeader::from_entry(&self.archive, &entry)?;

            let span = debug_span!("Processing tar entry", path = %header.name, len = header.size);
            let _guard = span.enter();

            if header.kind != EntryKind::RegularFile {
                error!(kind = %header.kind, "Archive contains an entry that is not a regular file");

                return crate::error::UnsupportedEntryTypeSnafu {
                    archive: self.archive.clone(),
                    path: header.name,
                    entry_type: header.kind.to_string(),
                }
                .fail();
            }

            let key = destination_key(&self.base_name, &header.name);

            // The declared size comes straight from the header and can be anything up to
            // `u64::MAX`
            ensure!(
                header.size <= MAX_OBJECT_SIZE,
                crate::error::ObjectTooLargeSnafu {
                    bucket: self.target_bucket.name(),
                    key: &key,
                    len: header.size,
                }
            );

            self.progress.extract_object_starting(&key, header.size);

            let object = self.upload_entry(&header, &key, &mut entry)?;

            info!(%object, len = object.len, "Extracted archive entry");

            self.progress.object_uploaded(&key, object.len);
            objects.push(object);
        }

        debug!("Completed processing all tar entries");

        // Recover the underlying CountingReader to get the total read bytes count
        let reader = archive.into_inner();

        Ok(ExtractedArchive {
            archive: self.archive,
            destination_bucket: self.target_bucket.name().to_string(),
            base_name: self.base_name,
            objects,
            archive_bytes: reader.total_bytes_read(),
            elapsed: started.elapsed(),
        })
    }

    /// Write one archive entry to object storage, returning only after the object has been
    /// stored (or failed to be)
    fn upload_entry(
        &self,
        header: &TarEntryHeader,
        key: &str,
        entry: &mut impl Read,
    ) -> Result<UploadedObject> {
        let ObjectWriter {
            writer,
            progress: mut upload_progress,
            result,
        } = self
            .handle
            .block_on(self.target_bucket.create_object_writer(key, header.size))?;

        // Forward upload progress from the object writer to the progress callback
        let forwarder = {
            let progress = self.progress.clone();
            let key = key.to_string();

            self.handle.spawn(async move {
                while let Some(bytes) = upload_progress.recv().await {
                    progress.object_part_uploaded(&key, bytes as usize);
                }
            })
        };

        let mut writer = async_write_as_writer(writer);

        let copied = self
            .copy_entry(header, key, entry, &mut writer)
            .and_then(|()| writer.shutdown().map_err(CopyError::Write));

        // Dropping the writer signals the end of the data to the uploader.  If the copy failed
        // part way, the uploader will see less data than it was promised and discard the object.
        drop(writer);

        let result = self.handle.block_on(result).map_err(|_| {
            crate::error::ObjectWriterAbandonedSnafu {
                bucket: self.target_bucket.name(),
                key,
            }
            .build()
        });

        // The uploader has finished so the progress channel is closed, and this just makes sure
        // every update was delivered before the object is reported as uploaded
        let _ = self.handle.block_on(forwarder);

        match copied {
            Ok(()) => result?,
            Err(CopyError::Read(e)) => {
                // The real problem is with the archive; the upload failing as a result is
                // expected
                if let Ok(Err(upload_error)) = result {
                    debug!(err = ?upload_error, "Object upload abandoned after archive read failed");
                }

                Err(e)
            }
            Err(CopyError::Write(e)) => match result? {
                Err(upload_error) => Err(upload_error),
                Ok(_) => Err(crate::error::WriteObjectDataSnafu {
                    bucket: self.target_bucket.name(),
                    key,
                }
                .into_error(e)),
            },
        }
    }

    /// Copy exactly `header.size` bytes of the entry's payload into the object writer
    fn copy_entry(
        &self,
        header: &TarEntryHeader,
        key: &str,
        entry: &mut impl Read,
        writer: &mut impl Write,
    ) -> Result<(), CopyError> {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;

        loop {
            let bytes_read = match entry.read(&mut buffer) {
                Ok(0) => break,
                Ok(bytes_read) => bytes_read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::Read(self.archive_read_error(e))),
            };

            writer
                .write_all(&buffer[..bytes_read])
                .map_err(CopyError::Write)?;

            copied += bytes_read as u64;
            self.progress.extract_object_part_read(key, bytes_read);
        }

        if copied < header.size {
            error!(
                expected = header.size,
                actual = copied,
                "Archive ended in the middle of an entry"
            );

            return Err(CopyError::Read(
                crate::error::TruncatedEntrySnafu {
                    archive: self.archive.clone(),
                    path: header.name.clone(),
                    expected: header.size,
                    actual: copied,
                }
                .build(),
            ));
        }

        Ok(())
    }

    /// Classify an error reported while reading the archive.
    ///
    /// Failures of the source itself come out of the async bridge wrapped in an I/O error; those
    /// are read errors.  Anything else the `tar` crate reports means the archive is not valid.
    fn archive_read_error(&self, e: std::io::Error) -> OvaExtractError {
        if is_source_failure(&e) {
            crate::error::ReadArchiveSnafu {
                archive: self.archive.clone(),
            }
            .into_error(e)
        } else {
            crate::error::MalformedArchiveSnafu {
                archive: self.archive.clone(),
            }
            .into_error(e)
        }
    }
}

/// Does this I/O error (or one it wraps) carry an error reported by the archive source?
fn is_source_failure(e: &std::io::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = e.get_ref().map(|inner| {
        let inner: &(dyn std::error::Error + 'static) = inner;
        inner
    });

    while let Some(error) = current {
        if error.is::<OvaExtractError>() {
            return true;
        }

        if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
            if io_error.get_ref().map_or(false, |inner| inner.is::<OvaExtractError>()) {
                return true;
            }
        }

        current = error.source();
    }

    // Local files and arbitrary readers report their failures as plain I/O errors, which only
    // look different from a corrupt archive by their kind.  `tar` reports malformed headers
    // through its `other()` helper (`ErrorKind::Other`) and short reads as `UnexpectedEof`.
    !matches!(
        e.kind(),
        std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::Other
    )
}

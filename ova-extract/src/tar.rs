//! Types that help with reading tar archives
use crate::extract::ExtractProgressCallback;
use crate::Result;
use std::io::Read;
use std::sync::Arc;

/// What kind of thing a tar entry describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Other(tar::EntryType),
}

impl EntryKind {
    fn new(header: &tar::Header, name: &str) -> Self {
        // Pre-POSIX tar has no directory type flag: directories are NUL-typed entries whose name
        // ends in `/`.  `tar::EntryType` maps the NUL flag to `Regular`, so look at the raw byte.
        if header.as_old().linkflag[0] == 0 && name.ends_with('/') {
            return Self::Other(tar::EntryType::Directory);
        }

        match header.entry_type() {
            tar::EntryType::Regular => Self::RegularFile,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use tar::EntryType;

        match self {
            Self::RegularFile => f.write_str("regular file"),
            Self::Other(EntryType::Directory) => f.write_str("directory"),
            Self::Other(EntryType::Symlink) => f.write_str("symbolic link"),
            Self::Other(EntryType::Link) => f.write_str("hard link"),
            Self::Other(EntryType::Char) => f.write_str("character device"),
            Self::Other(EntryType::Block) => f.write_str("block device"),
            Self::Other(EntryType::Fifo) => f.write_str("FIFO"),
            Self::Other(EntryType::Continuous) => f.write_str("contiguous file"),
            Self::Other(EntryType::XGlobalHeader) => f.write_str("global PAX header"),
            Self::Other(other) => write!(f, "'{}'", other.as_byte().escape_ascii()),
        }
    }
}

/// The parts of a tar entry header that decide what happens to the entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TarEntryHeader {
    /// The entry path exactly as recorded in the archive.
    ///
    /// GNU long names and PAX `path` records are already applied.
    pub name: String,
    pub kind: EntryKind,
    /// The length of the entry payload
    pub size: u64,
}

impl TarEntryHeader {
    pub(crate) fn from_entry<R: Read>(archive: &str, entry: &tar::Entry<'_, R>) -> Result<Self> {
        let name = String::from_utf8(entry.path_bytes().into_owned()).map_err(|e| {
            crate::error::NonUtf8EntryPathSnafu {
                archive,
                path: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }
            .build()
        })?;

        Ok(Self {
            kind: EntryKind::new(entry.header(), &name),
            name,
            size: entry.size(),
        })
    }
}

/// A wrapper around an arbitrary [`std::io::Read`] which counts how many bytes are read from the
/// underlying reader and reports them to the [`ExtractProgressCallback`] callback method
pub(crate) struct CountingReader<R: Read + Send + 'static> {
    inner: R,
    progress: Arc<dyn ExtractProgressCallback>,
    total_bytes_read: u64,
}

impl<R: Read + Send + 'static> CountingReader<R> {
    pub(crate) fn new(reader: R, progress: Arc<dyn ExtractProgressCallback>) -> Self {
        Self {
            inner: reader,
            progress,
            total_bytes_read: 0,
        }
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }
}

impl<R: Read + Send + 'static> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;

        if bytes_read > 0 {
            self.progress.extract_archive_part_read(bytes_read);
        }

        self.total_bytes_read += bytes_read as u64;

        Ok(bytes_read)
    }
}

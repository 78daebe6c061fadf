//! Builders for tar archives used as test fixtures, including deliberately broken ones.
use crate::Result;
use crate::test_data::TestEntry;

/// Offset of the checksum field within a tar header block
const CHECKSUM_OFFSET: usize = 148;
const CHECKSUM_LEN: usize = 8;

/// Size of a tar header, and the unit every entry's data is padded to
pub const BLOCK_SIZE: usize = 512;

/// Builds an in-memory tar archive one entry at a time.
///
/// Names are added with GNU long name extensions as needed, the way GNU tar and most OVA exporters
/// write them.
pub struct TestArchive {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for TestArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl TestArchive {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    /// Start an archive containing every entry in `entries`, in order
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = &'a TestEntry>) -> Result<Self> {
        let mut archive = Self::new();

        for entry in entries {
            archive.file(&entry.name, &entry.data)?;
        }

        Ok(archive)
    }

    /// Append a regular file
    pub fn file(&mut self, name: &str, data: &[u8]) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Regular, data.len() as u64);
        self.builder.append_data(&mut header, name, data)?;

        Ok(self)
    }

    pub fn directory(&mut self, name: &str) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Directory, 0);
        header.set_mode(0o755);
        self.builder
            .append_data(&mut header, name, std::io::empty())?;

        Ok(self)
    }

    pub fn symlink(&mut self, name: &str, target: &str) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Symlink, 0);
        self.builder.append_link(&mut header, name, target)?;

        Ok(self)
    }

    pub fn hard_link(&mut self, name: &str, target: &str) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Link, 0);
        self.builder.append_link(&mut header, name, target)?;

        Ok(self)
    }

    /// Append a regular file whose name is arbitrary bytes, which need not be valid UTF-8.
    ///
    /// The name is written straight into the header so it must fit in 100 bytes.
    pub fn file_with_raw_name(&mut self, name: &[u8], data: &[u8]) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Regular, data.len() as u64);

        let name_field = &mut header.as_old_mut().name;
        assert!(
            name.len() <= name_field.len(),
            "BUG: raw entry names are limited to 100 bytes"
        );
        name_field[..name.len()].copy_from_slice(name);

        header.set_cksum();
        self.builder.append(&header, data)?;

        Ok(self)
    }

    /// Append a directory the way pre-POSIX tar wrote them: a NUL type flag and a name ending in
    /// `/`.  `name` is written straight into an old-style header, so it must fit in 100 bytes.
    pub fn legacy_directory(&mut self, name: &str) -> Result<&mut Self> {
        let mut header = tar::Header::new_old();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(0);

        let old = header.as_old_mut();
        old.linkflag = [0];
        assert!(
            name.len() <= old.name.len(),
            "BUG: legacy directory names are limited to 100 bytes"
        );
        old.name[..name.len()].copy_from_slice(name.as_bytes());

        header.set_cksum();
        self.builder.append(&header, std::io::empty())?;

        Ok(self)
    }

    /// Append a regular file whose header claims `declared_size` bytes, no matter how much
    /// `data` there actually is
    pub fn file_with_declared_size(
        &mut self,
        name: &str,
        declared_size: u64,
        data: &[u8],
    ) -> Result<&mut Self> {
        let mut header = Self::header(tar::EntryType::Regular, declared_size);
        self.builder.append_data(&mut header, name, data)?;

        Ok(self)
    }

    /// Finish the archive, writing the end-of-archive marker
    pub fn build(self) -> Result<Vec<u8>> {
        Ok(self.builder.into_inner()?)
    }

    fn header(entry_type: tar::EntryType, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);

        header
    }
}

/// Build an archive containing `entries` as regular files
pub fn make_archive<'a>(entries: impl IntoIterator<Item = &'a TestEntry>) -> Result<Vec<u8>> {
    TestArchive::with_entries(entries)?.build()
}

/// An archive with no entries at all, just the end-of-archive marker
pub fn empty_archive() -> Result<Vec<u8>> {
    TestArchive::new().build()
}

/// Cut the archive off after `len` bytes, as if the upload of it had been interrupted
pub fn truncate(mut archive: Vec<u8>, len: usize) -> Vec<u8> {
    archive.truncate(len);

    archive
}

/// Corrupt the checksum of the header block at `header_offset`, which makes a tar reader reject
/// that header
pub fn corrupt_header(mut archive: Vec<u8>, header_offset: usize) -> Vec<u8> {
    let start = header_offset + CHECKSUM_OFFSET;

    for byte in &mut archive[start..start + CHECKSUM_LEN - 2] {
        *byte = b'7';
    }

    archive
}

/// Offset of the header of the entry that follows a regular file of `size` bytes whose header is
/// at `header_offset`, assuming a short name
pub fn next_header_offset(header_offset: usize, size: usize) -> usize {
    header_offset + BLOCK_SIZE + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

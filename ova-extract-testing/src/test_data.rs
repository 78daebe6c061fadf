//! Random test data for archive entries, and checks that extracted objects match it
use crate::memory::MemoryObjectStorage;
use crate::Result;
use color_eyre::eyre::eyre;
use rand::prelude::*;

/// One file to be put in a test archive
#[derive(Clone, Debug)]
pub struct TestEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl TestEntry {
    /// Make a new entry of random data with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(name: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self::with_data(name, random_data(size.get_bytes() as usize))
    }

    pub fn with_data(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// The key this entry is extracted to when it's in an archive named `<base_name>.ova`
    pub fn key(&self, base_name: &str) -> String {
        format!("{base_name}/{}", self.name)
    }
}

pub fn random_data(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);

    data
}

/// The objects of a minimal VM export: a disk image and its descriptor
pub fn vm_export_entries() -> Vec<TestEntry> {
    vec![
        TestEntry::new("disk.vmdk", "1024B"),
        TestEntry::new("descriptor.ovf", "256B"),
    ]
}

/// Verify that every one of `entries` was extracted into `bucket` under `base_name`, with exactly
/// the entry's contents, and that nothing else was written under that prefix
#[track_caller]
pub fn validate_extracted(
    objstore: &MemoryObjectStorage,
    bucket: &str,
    base_name: &str,
    entries: &[TestEntry],
) -> Result<()> {
    let prefix = format!("{base_name}/");

    for entry in entries {
        let key = entry.key(base_name);
        let data = objstore
            .get(bucket, &key)
            .ok_or_else(|| eyre!("Entry '{}' was not extracted to s3://{bucket}/{key}", entry.name))?;

        assert_eq!(
            data.len(),
            entry.data.len(),
            "Object s3://{bucket}/{key} has the wrong length"
        );
        assert!(
            data[..] == entry.data[..],
            "Object s3://{bucket}/{key} contents don't match the archive entry"
        );
    }

    let unexpected = objstore
        .keys(bucket)
        .into_iter()
        .filter(|key| key.starts_with(&prefix))
        .filter(|key| !entries.iter().any(|entry| &entry.key(base_name) == key))
        .collect::<Vec<_>>();

    if !unexpected.is_empty() {
        return Err(eyre!(
            "Bucket {bucket} contains objects that are not in the archive: {}",
            unexpected.join(",")
        ));
    }

    Ok(())
}

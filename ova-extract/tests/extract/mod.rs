//! Extract jobs run against the in-memory object store, so that every outcome (what was read,
//! what was written, and in what order) can be checked exactly.
use crate::{progress::TestExtractProgressCallback, Result};
use assert_matches::assert_matches;
use more_asserts::*;
use ova_extract::{
    ErrorKind, ExtractArchiveJobBuilder, ExtractedArchive, OvaExtractError, SourceArchive,
};
use ova_extract_testing::memory::MemoryObjectStorage;
use ova_extract_testing::tar::{self as test_tar, TestArchive};
use ova_extract_testing::test_data::{self, TestEntry};

const BUCKET: &str = "uploads";

/// A memory store with one bucket holding `archive` at `key`
fn store_with_archive(key: &str, archive: Vec<u8>) -> MemoryObjectStorage {
    let objstore = MemoryObjectStorage::new();
    objstore.create_bucket(BUCKET);
    objstore.put(BUCKET, key, archive);

    objstore
}

fn source(key: &str) -> SourceArchive {
    SourceArchive::ObjectStorage {
        bucket: BUCKET.to_string(),
        key: key.to_string(),
    }
}

async fn extract(
    objstore: &MemoryObjectStorage,
    key: &str,
    progress: TestExtractProgressCallback,
) -> ova_extract::Result<ExtractedArchive> {
    ExtractArchiveJobBuilder::new(objstore.boxed(), source(key), BUCKET)
        .build()
        .await?
        .run(progress)
        .await
}

/// Keys that were written, in the order the writes completed
fn written_keys(objstore: &MemoryObjectStorage) -> Vec<String> {
    objstore
        .completed_writes()
        .into_iter()
        .map(|(_, key)| key)
        .collect()
}

#[test]
fn vm_export() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;
        let archive_len = archive.len() as u64;
        let objstore = store_with_archive("vm-export.ova", archive);

        let progress = TestExtractProgressCallback::new();
        let extracted = extract(&objstore, "vm-export.ova", progress.clone()).await?;

        assert_eq!("vm-export", extracted.base_name);
        assert_eq!(BUCKET, extracted.destination_bucket);
        assert_eq!(
            vec!["vm-export/disk.vmdk", "vm-export/descriptor.ovf"],
            extracted
                .objects
                .iter()
                .map(|object| object.key.as_str())
                .collect::<Vec<_>>()
        );
        assert_eq!(1024 + 256, extracted.total_object_bytes());

        // Stream order is preserved
        assert_eq!(
            vec!["vm-export/disk.vmdk", "vm-export/descriptor.ovf"],
            written_keys(&objstore)
        );
        test_data::validate_extracted(&objstore, BUCKET, "vm-export", &entries)?;

        // The archive itself is untouched and read exactly once
        assert_eq!(Some(archive_len as usize), objstore.get(BUCKET, "vm-export.ova").map(|data| data.len()));
        assert_eq!(1, objstore.read_count());

        assert_eq!(Some(archive_len), progress.archive_size());
        progress.sanity_check_updates(&extracted);

        Ok(())
    })
}

#[test]
fn archive_in_folder() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = vec![
            TestEntry::new("disk1.vmdk", "20KiB"),
            TestEntry::new("disk2.vmdk", "3KB"),
            TestEntry::new("appliance.mf", "100B"),
        ];
        let objstore = store_with_archive(
            "exports/2024/appliance.ova",
            test_tar::make_archive(&entries)?,
        );

        let extracted = extract(
            &objstore,
            "exports/2024/appliance.ova",
            TestExtractProgressCallback::new(),
        )
        .await?;

        assert_eq!("exports/2024/appliance", extracted.base_name);
        test_data::validate_extracted(&objstore, BUCKET, "exports/2024/appliance", &entries)?;

        Ok(())
    })
}

#[test]
fn large_entries_in_small_chunks() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = vec![
            TestEntry::new("disk.vmdk", "3MiB"),
            TestEntry::new("nvram", "8KiB"),
        ];
        let objstore = store_with_archive("big.ova", test_tar::make_archive(&entries)?);

        // Chunks that don't line up with tar blocks
        objstore.set_read_chunk_size(1000);

        let progress = TestExtractProgressCallback::new();
        let extracted = extract(&objstore, "big.ova", progress.clone()).await?;

        test_data::validate_extracted(&objstore, BUCKET, "big", &entries)?;
        progress.sanity_check_updates(&extracted);

        Ok(())
    })
}

#[test]
fn empty_archive() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = store_with_archive("empty.ova", test_tar::empty_archive()?);

        let progress = TestExtractProgressCallback::new();
        let extracted = extract(&objstore, "empty.ova", progress.clone()).await?;

        assert!(extracted.objects.is_empty());
        assert!(objstore.attempted_writes().is_empty());
        assert!(progress.finished());
        progress.sanity_check_updates(&extracted);

        Ok(())
    })
}

#[test]
fn zero_length_source_object() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = store_with_archive("nothing.ova", Vec::new());

        let extracted = extract(&objstore, "nothing.ova", TestExtractProgressCallback::new()).await?;

        assert!(extracted.objects.is_empty());
        assert_eq!(0, extracted.archive_bytes);

        Ok(())
    })
}

#[test]
fn zero_length_and_long_named_entries() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let long_name = format!("{}/disk-with-a-very-long-name.vmdk", "deeply/nested".repeat(12));
        assert_gt!(long_name.len(), 100);

        let entries = vec![
            TestEntry::with_data("empty.txt", Vec::new()),
            TestEntry::new(long_name.clone(), "2KiB"),
            TestEntry::with_data("also-empty", Vec::new()),
        ];
        let objstore = store_with_archive("odd.ova", test_tar::make_archive(&entries)?);

        let progress = TestExtractProgressCallback::new();
        let extracted = extract(&objstore, "odd.ova", progress.clone()).await?;

        assert_eq!(3, extracted.objects.len());
        assert_eq!(
            Some(0),
            objstore.get(BUCKET, "odd/empty.txt").map(|data| data.len())
        );
        assert!(objstore.get(BUCKET, &format!("odd/{long_name}")).is_some());
        test_data::validate_extracted(&objstore, BUCKET, "odd", &entries)?;
        progress.sanity_check_updates(&extracted);

        Ok(())
    })
}

#[test]
fn rerun_overwrites_with_identical_content() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let objstore = store_with_archive("vm-export.ova", test_tar::make_archive(&entries)?);

        let first = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new()).await?;
        let keys_after_first = objstore.keys(BUCKET);

        let second = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new()).await?;

        assert_eq!(keys_after_first, objstore.keys(BUCKET));
        assert_eq!(first.total_object_bytes(), second.total_object_bytes());
        assert_eq!(4, objstore.completed_writes().len());
        test_data::validate_extracted(&objstore, BUCKET, "vm-export", &entries)?;

        Ok(())
    })
}

#[test]
fn not_an_ova_archive() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = store_with_archive(
            "image.tar",
            test_tar::make_archive(&test_data::vm_export_entries())?,
        );

        let result = ExtractArchiveJobBuilder::new(objstore.boxed(), source("image.tar"), BUCKET)
            .build()
            .await;

        let err = result.unwrap_err();
        assert_matches!(err, OvaExtractError::InvalidArchiveName { .. });
        assert_eq!(ErrorKind::InvalidArchiveName, err.kind());

        // Rejected on the name alone
        assert_eq!(0, objstore.read_count());
        assert!(objstore.attempted_writes().is_empty());

        Ok(())
    })
}

#[test]
fn missing_target_bucket() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = store_with_archive(
            "vm-export.ova",
            test_tar::make_archive(&test_data::vm_export_entries())?,
        );

        let result = ExtractArchiveJobBuilder::new(
            objstore.boxed(),
            source("vm-export.ova"),
            "no-such-bucket",
        )
        .build()
        .await;

        let err = result.unwrap_err();
        assert_matches!(err, OvaExtractError::BucketNotFound { .. });
        assert_eq!(ErrorKind::InvalidInput, err.kind());
        assert_eq!(0, objstore.read_count());

        Ok(())
    })
}

#[test]
fn missing_source_object() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = MemoryObjectStorage::new();
        objstore.create_bucket(BUCKET);

        let err = extract(&objstore, "gone.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::ReadError, err.kind());
        assert!(objstore.attempted_writes().is_empty());

        Ok(())
    })
}

#[test]
fn unsupported_entry_stops_extraction() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let disk = TestEntry::new("disk.vmdk", "4KiB");
        let descriptor = TestEntry::new("descriptor.ovf", "300B");

        let mut archive = TestArchive::new();
        archive
            .file(&disk.name, &disk.data)?
            .symlink("current.vmdk", "disk.vmdk")?
            .file(&descriptor.name, &descriptor.data)?;
        let objstore = store_with_archive("links.ova", archive.build()?);

        let progress = TestExtractProgressCallback::new();
        let err = extract(&objstore, "links.ova", progress.clone())
            .await
            .unwrap_err();

        assert_matches!(
            &err,
            OvaExtractError::UnsupportedEntryType { path, entry_type, .. } if path == "current.vmdk" && entry_type == "symbolic link"
        );
        assert_eq!(ErrorKind::UnsupportedEntryType, err.kind());

        // Everything before the link was stored, nothing after it was attempted
        assert_eq!(vec!["links/disk.vmdk"], written_keys(&objstore));
        assert_eq!(1, objstore.attempted_writes().len());
        test_data::validate_extracted(&objstore, BUCKET, "links", &[disk])?;
        assert!(!progress.finished());

        Ok(())
    })
}

#[test]
fn directory_entry_is_unsupported() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let mut archive = TestArchive::new();
        archive.directory("disks")?.file("disks/disk.vmdk", b"data")?;
        let objstore = store_with_archive("dirs.ova", archive.build()?);

        let err = extract(&objstore, "dirs.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::UnsupportedEntryType, err.kind());
        assert!(objstore.attempted_writes().is_empty());

        Ok(())
    })
}

#[test]
fn legacy_directory_entry_is_unsupported() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let mut archive = TestArchive::new();
        archive
            .file("descriptor.ovf", b"<Envelope/>")?
            .legacy_directory("disks/")?
            .file("disks/disk.vmdk", b"data")?;
        let objstore = store_with_archive("v7.ova", archive.build()?);

        let err = extract(&objstore, "v7.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(
            &err,
            OvaExtractError::UnsupportedEntryType { path, entry_type, .. }
                if path == "disks/" && entry_type == "directory"
        );
        assert_eq!(vec!["v7/descriptor.ovf"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn absurd_declared_size_is_rejected() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let mut archive = TestArchive::new();
        archive
            .file("descriptor.ovf", b"<Envelope/>")?
            .file_with_declared_size("disk.vmdk", 1 << 60, b"data")?;
        let objstore = store_with_archive("huge.ova", archive.build()?);

        let err = extract(&objstore, "huge.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(
            &err,
            OvaExtractError::ObjectTooLarge { key, len, .. }
                if key == "huge/disk.vmdk" && *len == 1 << 60
        );
        assert_eq!(ErrorKind::UploadError, err.kind());
        assert_eq!(
            vec![(BUCKET.to_string(), "huge/descriptor.ovf".to_string())],
            objstore.attempted_writes()
        );

        Ok(())
    })
}

#[test]
fn hard_link_is_unsupported() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let mut archive = TestArchive::new();
        archive
            .file("disk.vmdk", b"data")?
            .hard_link("disk-copy.vmdk", "disk.vmdk")?;
        let objstore = store_with_archive("hard.ova", archive.build()?);

        let err = extract(&objstore, "hard.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::UnsupportedEntryType, err.kind());
        assert_eq!(vec!["hard/disk.vmdk"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn truncated_archive() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        // Cut the archive off half way through the second entry's data
        let second_header = test_tar::next_header_offset(0, entries[0].data.len());
        let archive = test_tar::truncate(archive, second_header + test_tar::BLOCK_SIZE + 100);
        let objstore = store_with_archive("vm-export.ova", archive);

        let err = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(err, OvaExtractError::TruncatedEntry { expected: 256, actual: 100, .. });
        assert_eq!(ErrorKind::MalformedArchive, err.kind());

        // The complete first entry stays; the partial second one is never created
        assert_eq!(vec!["vm-export/disk.vmdk"], written_keys(&objstore));
        test_data::validate_extracted(&objstore, BUCKET, "vm-export", &entries[..1])?;

        Ok(())
    })
}

#[test]
fn truncated_header() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        let second_header = test_tar::next_header_offset(0, entries[0].data.len());
        let archive = test_tar::truncate(archive, second_header + 200);
        let objstore = store_with_archive("vm-export.ova", archive);

        let err = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::MalformedArchive, err.kind());
        assert_eq!(vec!["vm-export/disk.vmdk"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn corrupt_header() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        let second_header = test_tar::next_header_offset(0, entries[0].data.len());
        let archive = test_tar::corrupt_header(archive, second_header);
        let objstore = store_with_archive("vm-export.ova", archive);

        let err = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(err, OvaExtractError::MalformedArchive { .. });
        assert_eq!(ErrorKind::MalformedArchive, err.kind());
        assert_eq!(vec!["vm-export/disk.vmdk"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn not_a_tar_archive() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let objstore = store_with_archive("random.ova", test_data::random_data(4096));

        let err = extract(&objstore, "random.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::MalformedArchive, err.kind());
        assert!(objstore.attempted_writes().is_empty());

        Ok(())
    })
}

#[test]
fn non_utf8_entry_name() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let mut archive = TestArchive::new();
        archive
            .file("descriptor.ovf", b"<Envelope/>")?
            .file_with_raw_name(b"disk\xff.vmdk", b"data")?;
        let objstore = store_with_archive("bytes.ova", archive.build()?);

        let err = extract(&objstore, "bytes.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(err, OvaExtractError::NonUtf8EntryPath { .. });
        assert_eq!(ErrorKind::MalformedArchive, err.kind());
        assert_eq!(vec!["bytes/descriptor.ovf"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn source_read_failure() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        // Fail part way through the second entry's data
        let second_header = test_tar::next_header_offset(0, entries[0].data.len());
        let objstore = store_with_archive("vm-export.ova", archive);
        objstore.fail_reads_of(BUCKET, "vm-export.ova", second_header + test_tar::BLOCK_SIZE + 50);

        let err = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_matches!(err, OvaExtractError::ReadArchive { .. });
        assert_eq!(ErrorKind::ReadError, err.kind());
        assert_eq!(vec!["vm-export/disk.vmdk"], written_keys(&objstore));
        assert!(objstore.get(BUCKET, "vm-export/descriptor.ovf").is_none());

        Ok(())
    })
}

#[test]
fn source_read_failure_between_entries() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        let second_header = test_tar::next_header_offset(0, entries[0].data.len());
        let objstore = store_with_archive("vm-export.ova", archive);
        objstore.fail_reads_of(BUCKET, "vm-export.ova", second_header);

        let err = extract(&objstore, "vm-export.ova", TestExtractProgressCallback::new())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::ReadError, err.kind());
        assert_eq!(vec!["vm-export/disk.vmdk"], written_keys(&objstore));

        Ok(())
    })
}

#[test]
fn upload_failure() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = vec![
            TestEntry::new("descriptor.ovf", "256B"),
            TestEntry::new("disk.vmdk", "1MiB"),
            TestEntry::new("nvram", "1KiB"),
        ];
        let objstore = store_with_archive("vm.ova", test_tar::make_archive(&entries)?);
        objstore.fail_writes_to(BUCKET, "vm/disk.vmdk");

        let progress = TestExtractProgressCallback::new();
        let err = extract(&objstore, "vm.ova", progress.clone())
            .await
            .unwrap_err();

        assert_matches!(err, OvaExtractError::ObjectStoreWrite { .. });
        assert_eq!(ErrorKind::UploadError, err.kind());

        assert_eq!(vec!["vm/descriptor.ovf"], written_keys(&objstore));
        assert_eq!(2, objstore.attempted_writes().len());
        assert!(objstore.get(BUCKET, "vm/disk.vmdk").is_none());
        assert_eq!(vec!["vm/descriptor.ovf".to_string()], progress.objects_uploaded());
        assert_eq!(
            vec!["vm/descriptor.ovf".to_string(), "vm/disk.vmdk".to_string()],
            progress.objects_started()
        );

        Ok(())
    })
}

#[test]
fn extract_from_file() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("vm-export.ova");
        std::fs::write(&path, &archive)?;

        let objstore = MemoryObjectStorage::new();
        objstore.create_bucket("extracted");

        let progress = TestExtractProgressCallback::new();
        let extracted = ExtractArchiveJobBuilder::new(
            objstore.boxed(),
            SourceArchive::File(path),
            "extracted",
        )
        .build()
        .await?
        .run(progress.clone())
        .await?;

        assert_eq!(Some(archive.len() as u64), progress.archive_size());
        progress.sanity_check_updates(&extracted);
        test_data::validate_extracted(&objstore, "extracted", "vm-export", &entries)?;

        Ok(())
    })
}

#[test]
fn extract_from_missing_file() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let temp_dir = tempfile::tempdir()?;

        let objstore = MemoryObjectStorage::new();
        objstore.create_bucket("extracted");

        let err = ExtractArchiveJobBuilder::new(
            objstore.boxed(),
            SourceArchive::File(temp_dir.path().join("missing.ova")),
            "extracted",
        )
        .build()
        .await
        .unwrap_err();

        assert_matches!(err, OvaExtractError::OpeningArchiveFile { .. });
        assert_eq!(ErrorKind::ReadError, err.kind());

        Ok(())
    })
}

#[test]
fn extract_from_reader() -> Result<()> {
    ova_extract_testing::logging::test_with_logging(async move {
        let entries = test_data::vm_export_entries();
        let archive = test_tar::make_archive(&entries)?;

        let objstore = MemoryObjectStorage::new();
        objstore.create_bucket("extracted");

        let progress = TestExtractProgressCallback::new();
        let job = ExtractArchiveJobBuilder::new(
            objstore.boxed(),
            SourceArchive::Reader {
                name: "piped.ova".to_string(),
                reader: Box::new(std::io::Cursor::new(archive)),
            },
            "extracted",
        )
        .build()
        .await?;

        assert_eq!("piped", job.base_name());
        assert_eq!("extracted", job.target_bucket());

        let extracted = job.run(progress.clone()).await?;

        // Nothing knows how long a stream is
        assert_eq!(None, progress.archive_size());
        progress.sanity_check_updates(&extracted);
        test_data::validate_extracted(&objstore, "extracted", "piped", &entries)?;

        Ok(())
    })
}

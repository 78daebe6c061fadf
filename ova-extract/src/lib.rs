#![doc = include_str!("../README.md")]

mod async_bridge;
mod config;
pub mod error;
mod event;
mod extract;
mod intake;
mod objstore;
mod tar;
mod task;
mod writers;

pub use config::Config;
pub use error::{ErrorKind, OvaExtractError, Result};
pub use event::*;
pub use extract::*;
pub use intake::Intake;
pub use objstore::{
    s3, Bucket, ObjectReader, ObjectStorage, ObjectWriter, UploadedObject, MAX_OBJECT_SIZE,
};
pub use self::tar::{EntryKind, TarEntryHeader};
pub use task::{archive_base_name, destination_key, ArchiveTask, OVA_SUFFIX};

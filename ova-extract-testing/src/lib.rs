//! Testing helpers for use writing unit and integration tests of the `ova-extract` crate
//!
//! This is internal to `ova-extract` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.
pub mod logging;
pub mod memory;
pub mod minio;
pub mod tar;
pub mod test_data;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;

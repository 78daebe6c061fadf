//! Integration tests of the S3 implementation of [`ova_extract::ObjectStorage`] and
//! [`ova_extract::Bucket`], run against a local [minio](https://min.io) server.
//!
//! These only run when the `minio` executable is installed; otherwise they're ignored.

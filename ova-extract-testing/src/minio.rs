//! Runs ephemeral `minio` servers so tests can exercise the real S3 client against
//! S3-compatible object storage
use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

/// Default root credentials of a fresh minio server
const MINIO_USER: &str = "minioadmin";
const MINIO_PASSWORD: &str = "minioadmin";

pub struct MinioServer {
    #[allow(dead_code)] // Keeps the data dir alive for as long as the server runs
    temp_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Get the server other tests are already using, starting one if there isn't one.
    ///
    /// Starting minio takes a while, so tests should use this instead of [`Self::start`].
    pub async fn get() -> Result<Arc<Self>> {
        // The lock is held across await points, hence tokio's Mutex
        static INSTANCE: Lazy<Mutex<Option<Weak<MinioServer>>>> = Lazy::new(|| Mutex::new(None));

        let mut instance = INSTANCE.lock().await;

        let server = match instance.as_ref().and_then(Weak::upgrade) {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *instance = Some(Arc::downgrade(&server));

                server
            }
        };

        debug!(endpoint = %server.endpoint, "Using minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a random local port.
    ///
    /// The `minio` executable is located with the `MINIO_PATH` env var, or failing that, in the
    /// `PATH`.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;
        let endpoint = Self::random_endpoint()?;
        let temp_dir = Self::temp_data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            temp_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            temp_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio to start");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// The S3 API endpoint URL where the server is listening
    pub fn endpoint_url(&self) -> url::Url {
        // A socket address always makes a valid URL
        url::Url::parse(&format!("http://{}/", self.endpoint)).unwrap()
    }

    /// Configuration that points `ova-extract` at this server
    pub fn config(&self) -> ova_extract::Config {
        ova_extract::Config {
            s3_endpoint: Some(self.endpoint_url()),
            aws_region: Some("us-east-1".to_string()),
            aws_access_key_id: Some(MINIO_USER.to_string()),
            aws_secret_access_key: Some(MINIO_PASSWORD.to_string()),
            ..Default::default()
        }
    }

    /// A client for this server, for setting up test data and checking results
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(RegionProviderChain::first_try("us-east-1"))
            .credentials_provider(Credentials::new(
                MINIO_USER,
                MINIO_PASSWORD,
                None,
                None,
                "minio",
            ))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url().to_string())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Make a new bucket on this server.
    ///
    /// Many tests share one server, so the name gets a random prefix; the actual name is returned.
    pub async fn create_bucket(&self, bucket: impl AsRef<str>) -> Result<String> {
        // Bucket names are at most 63 letters, digits, `.` and `-`
        static REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-zA-Z\.\-]+").unwrap());

        let bucket = REGEX.replace_all(bucket.as_ref(), "-").to_lowercase();
        let bucket = &bucket[..bucket.len().min(63 - 9)];
        let bucket = format!("{:08x}-{bucket}", rand::thread_rng().next_u32());

        debug!(%bucket, "Creating bucket");

        let client = self.aws_client().await?;

        client.create_bucket().bucket(&bucket).send().await?;

        // Bucket creation isn't always visible right away
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "The bucket {bucket} is not accessible even after it was created.  Last error was:\n{e}"
            ));
        }

        Ok(bucket)
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.aws_client()
            .await?
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;

        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .aws_client()
            .await?
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;

        Ok(response.body.collect().await?.into_bytes().to_vec())
    }

    /// Every object key in the bucket, sorted
    pub async fn list_keys(&self, bucket: &str) -> Result<Vec<String>> {
        let client = self.aws_client().await?;
        let mut pages = client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            keys.extend(
                page?
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }
        keys.sort();

        Ok(keys)
    }

    /// Keys of multipart uploads in the bucket that were started but neither completed nor aborted
    pub async fn list_incomplete_uploads(&self, bucket: &str) -> Result<Vec<String>> {
        let response = self
            .aws_client()
            .await?
            .list_multipart_uploads()
            .bucket(bucket)
            .send()
            .await?;

        Ok(response
            .uploads()
            .iter()
            .filter_map(|upload| upload.key().map(str::to_string))
            .collect())
    }

    /// Wait until the server answers requests, or give up
    async fn wait_for_service_start(&self) -> Result<()> {
        // Startup can take several seconds on slow CI machines
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.list_buckets().send())
            .await
            .map_err(|e| {
                eyre!("The minio server didn't come online in time.  The last ListBuckets error was:\n{e}")
            })?;

        Ok(())
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| {
                eyre!("Unable to find `minio`; set MINIO_PATH or put the executable in your PATH")
            })
    }

    /// A free port on localhost for minio to listen on
    fn random_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Minio can't keep its data on `tmpfs` (it needs `O_DIRECT`), which rules out `/tmp` on many
    /// Linux systems, so the data dir goes in the home directory instead.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {e}");
        }
    }
}

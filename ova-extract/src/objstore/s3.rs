use super::{Bucket, ObjectReader, ObjectStorage, ObjectWriter, UploadedObject};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::StreamExt;
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn, Instrument};

/// S3 won't accept a multipart upload with more parts than this
const MAX_PARTS: u64 = 10_000;

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        let region = config.aws_region.clone();

        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config, region).await,
                config,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn bucket(&self, name: &str) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(S3Bucket::new(self, name).await?))
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}
struct S3BucketInner {
    name: String,

    objstore: S3,

    /// The region this bucket is located in, if it's different from the region the client was
    /// originally configured with.
    ///
    /// A bucket in a different region needs its own [`aws_sdk_s3::Client`] instance.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    async fn new(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = objstore.inner.client.clone();

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(&objstore.inner.config, region.clone()).await;

            // A second redirect would mean S3 is contradicting itself; don't chase it
            if let Some(other_region) = Self::validate_access_and_region(&client, name).await? {
                warn!(bucket = name, %region, %other_region, "S3 redirected to another region a second time");
            }

            Some(region)
        } else {
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                objstore: objstore.clone(),
                region,
                client,
            }),
        })
    }

    fn config(&self) -> &Config {
        &self.inner.objstore.inner.config
    }

    /// Decide how to upload an object of `len` bytes.
    ///
    /// Returns `None` if the object is small enough to be uploaded with a single request,
    /// otherwise the size of each part of a multipart upload.
    fn multipart_chunk_size(&self, key: &str, len: u64) -> Option<usize> {
        let config = self.config();

        if len <= config.multipart_threshold.get_bytes() as u64 {
            return None;
        }

        let multipart_chunk_size = (config.multipart_chunk_size.get_bytes() as u64).max(1);

        if len.div_ceil(multipart_chunk_size) <= MAX_PARTS {
            Some(multipart_chunk_size as usize)
        } else {
            // Round up so that the part count ends up at or just under the limit
            let new_chunk_size = len.div_ceil(MAX_PARTS);
            warn!(%key, len, multipart_chunk_size, new_chunk_size,
                "Object is so large that the requested chunk size will be overridden to keep the total chunk count under 10K");

            Some(new_chunk_size as usize)
        }
    }

    /// Upload the object identified by `key` using the multipart upload API.
    ///
    /// The chunks to upload are obtained from a writer task and exposed via `chunks_receiver`.
    /// Up to `max_concurrent_requests` chunks are uploaded at once.  The upload is only completed
    /// if exactly `len` bytes were received.
    ///
    /// The `progress_sender` is sent the size of each chunk as it is uploaded.  Callers that don't
    /// care about updates drop the corresponding progress receiver, so a failure to send on this
    /// channel is ignored.
    #[instrument(skip(self, chunks_receiver, progress_sender), fields(bucket = %self.inner.name))]
    async fn multipart_object_writer(
        &self,
        key: String,
        len: u64,
        upload_id: String,
        chunks_receiver: mpsc::Receiver<crate::writers::MultipartChunk>,
        progress_sender: mpsc::UnboundedSender<u64>,
    ) -> Result<UploadedObject> {
        let chunks = tokio_stream::wrappers::ReceiverStream::new(chunks_receiver);

        let chunk_futs = chunks.map(|chunk| {
            // Our chunking code numbers multipart chunks from 0, but the S3 API expects them
            // to be numbered from 1
            let part_number = chunk.part_number + 1;
            let chunk_size = chunk.data.len();

            let span = tracing::debug_span!("upload chunk", part_number, chunk_size);
            let me = self.clone();
            let key = key.clone();
            let upload_id = upload_id.clone();
            let progress_sender = progress_sender.clone();

            async move {
                debug!("Uploading multi-part chunk");

                let response = me
                    .inner
                    .client
                    .upload_part()
                    .bucket(&me.inner.name)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .content_length(chunk_size as i64)
                    .body(ByteStream::from(chunk.data))
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartSnafu {
                        bucket: me.inner.name.clone(),
                        key: key.clone(),
                        part_number,
                    })?;

                let e_tag = response.e_tag().map(|e_tag| e_tag.to_string());

                debug!(?e_tag, "Uploaded multi-part chunk");

                let _ = progress_sender.send(chunk_size as u64);

                // Every part has to be listed again in the CompleteMultipartUpload call
                let completed_part = CompletedPart::builder()
                    .set_e_tag(e_tag)
                    .part_number(part_number as i32)
                    .build();

                Ok::<_, crate::OvaExtractError>((chunk_size, completed_part))
            }
            .instrument(span)
        });

        debug!("Commencing multi-part upload");

        let mut uploaded_chunks =
            chunk_futs.buffer_unordered(self.config().max_concurrent_requests.max(1));

        let mut total_bytes = 0u64;
        let mut total_parts = 0usize;
        let mut completed_parts = Vec::new();

        while let Some(result) = uploaded_chunks.next().await {
            let (chunk_size, completed_part) = result?;

            total_bytes += chunk_size as u64;
            total_parts += 1;

            completed_parts.push(completed_part);
        }

        // The upload futures borrow `key` and `upload_id`
        drop(uploaded_chunks);

        // Whatever wrote to the stream stopped early (or kept going); either way the object
        // would not be what the caller asked for, so it must not be completed
        ensure!(
            total_bytes == len,
            crate::error::ObjectLengthMismatchSnafu {
                bucket: self.inner.name.clone(),
                key: key.clone(),
                expected: len,
                actual: total_bytes,
            }
        );

        debug!(
            total_parts,
            total_bytes, "All parts uploaded; completing multi-part upload"
        );

        // Parts must be listed in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        let response = self
            .inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.clone(),
            })?;

        Ok(UploadedObject {
            bucket: self.inner.name.clone(),
            key,
            len,
            e_tag: response.e_tag().map(|e_tag| e_tag.to_string()),
        })
    }

    /// Upload the object identified by `key` with a single `PutObject` call.
    ///
    /// The data to upload is obtained from a writer task and exposed via `chunk_receiver`.  As
    /// with multipart, nothing is written unless exactly `len` bytes were received.
    #[instrument(skip(self, chunk_receiver, progress_sender), fields(bucket = %self.inner.name))]
    async fn unipart_object_writer(
        &self,
        key: String,
        len: u64,
        chunk_receiver: oneshot::Receiver<bytes::Bytes>,
        progress_sender: mpsc::UnboundedSender<u64>,
    ) -> Result<UploadedObject> {
        let bytes = chunk_receiver.await.map_err(|_| {
            crate::error::ObjectWriterAbandonedSnafu {
                bucket: self.inner.name.clone(),
                key: key.clone(),
            }
            .build()
        })?;
        let total_bytes = bytes.len() as u64;

        ensure!(
            total_bytes == len,
            crate::error::ObjectLengthMismatchSnafu {
                bucket: self.inner.name.clone(),
                key: key.clone(),
                expected: len,
                actual: total_bytes,
            }
        );

        debug!(total_bytes, "Uploading unipart object");

        let response = self
            .inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(&key)
            .content_length(total_bytes as i64)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.clone(),
            })?;

        let _ = progress_sender.send(total_bytes);

        Ok(UploadedObject {
            bucket: self.inner.name.clone(),
            key,
            len,
            e_tag: response.e_tag().map(|e_tag| e_tag.to_string()),
        })
    }

    /// Abort a failed multipart upload so the parts that were uploaded don't linger on the server
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .inner
            .client
            .abort_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
        }
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        match client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(None),
            Err(e) => {
                if let Some(response) = e.raw_response() {
                    if response.status().as_u16() == 301 {
                        if let Some(region) = response.headers().get("x-amz-bucket-region") {
                            // This is AWS's way of telling us we have the right bucket, but it is
                            // in another region
                            return Ok(Some(region.to_string()));
                        }
                    }
                }

                Err(crate::error::BucketInvalidOrNotAccessibleSnafu {
                    bucket: name.to_string(),
                }
                .into_error(e))
            }
        }
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object(&self, key: &str) -> Result<ObjectReader> {
        debug!("Reading object");

        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        let len = response.content_length().and_then(|len| u64::try_from(len).ok());
        let mut body = response.body;

        // The body is streamed over one connection, front to back.  The channel depth bounds how
        // far ahead of the tar reader the download can get.
        let (sender, receiver) = mpsc::channel(self.config().max_concurrent_requests.max(1));
        let bucket = self.inner.name.clone();
        let key = key.to_string();

        tokio::spawn(
            async move {
                let mut total_bytes = 0u64;

                loop {
                    let result = match body.next().await {
                        None => {
                            debug!(total_bytes, "Finished reading object");
                            break;
                        }
                        Some(Ok(bytes)) => {
                            total_bytes += bytes.len() as u64;
                            Ok(bytes)
                        }
                        Some(Err(e)) => {
                            error!(err = ?e, total_bytes, "Error reading object body");
                            Err(crate::error::ReadByteStreamSnafu {
                                bucket: bucket.clone(),
                                key: key.clone(),
                            }
                            .into_error(e))
                        }
                    };

                    let failed = result.is_err();

                    if sender.send(result).await.is_err() {
                        debug!("Object reader dropped the receiver; abandoning the read");
                        break;
                    }

                    if failed {
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        Ok(ObjectReader {
            len,
            chunks: receiver,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn create_object_writer(&self, key: &str, len: u64) -> Result<ObjectWriter> {
        ensure!(
            len <= super::MAX_OBJECT_SIZE,
            crate::error::ObjectTooLargeSnafu {
                bucket: self.inner.name.clone(),
                key,
                len,
            }
        );

        let key = key.to_string();
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();
        let (result_sender, result_receiver) = oneshot::channel();

        match self.multipart_chunk_size(&key, len) {
            Some(chunk_size) => {
                // S3 requires that multi-part be initialized in advance, then each individual
                // part can be uploaded in whatever order is convenient
                let response = self
                    .inner
                    .client
                    .create_multipart_upload()
                    .bucket(&self.inner.name)
                    .key(&key)
                    .send()
                    .await
                    .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.clone(),
                    })?;
                let upload_id = response.upload_id().map(|id| id.to_string()).ok_or_else(|| {
                    crate::error::ObjectWriterAbandonedSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.clone(),
                    }
                    .build()
                })?;

                let (bytes_writer, chunks_receiver) =
                    crate::writers::multipart(chunk_size, self.config().max_concurrent_requests);

                let me = self.clone();

                tokio::spawn(
                    async move {
                        let result = me
                            .multipart_object_writer(
                                key.clone(),
                                len,
                                upload_id.clone(),
                                chunks_receiver,
                                progress_sender,
                            )
                            .await;

                        if let Err(e) = &result {
                            error!(?e, bucket = %me.inner.name, %key, %upload_id,
                                "Multi-part upload failed; aborting multi-part upload on server side");

                            me.abort_multipart_upload(&key, &upload_id).await;
                        }

                        let _ = result_sender.send(result);
                    }
                    .in_current_span(),
                );

                Ok(ObjectWriter {
                    writer: bytes_writer,
                    progress: progress_receiver,
                    result: result_receiver,
                })
            }
            None => {
                let (bytes_writer, chunk_receiver) = crate::writers::unipart(len as usize);

                let me = self.clone();

                tokio::spawn(
                    async move {
                        let _ = result_sender.send(
                            me.unipart_object_writer(key, len, chunk_receiver, progress_sender)
                                .await,
                        );
                    }
                    .in_current_span(),
                );

                Ok(ObjectWriter {
                    writer: bytes_writer,
                    progress: progress_receiver,
                    result: result_receiver,
                })
            }
        }
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region_provider = if let Some(region) = region.into() {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "ova-extract",
        ));
    }

    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't support virtual-hosted bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str().trim_end_matches('/'))
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

use url::Url;

/// The configuration settings that control where extracted archives are written and how the
/// object storage client behaves.
///
/// This is read once when the process starts and passed explicitly to [`crate::Intake`] and
/// [`crate::ExtractArchiveJobBuilder`]; nothing in this crate reads the environment on its own.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Write extracted objects to this bucket instead of the bucket the archive was read from.
    ///
    /// If this is not set, or set to an empty string, each archive is extracted into the same
    /// bucket that contains it.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "DESTINATION_S3_BUCKET", global = true, value_name = "BUCKET")
    )]
    pub destination_bucket: Option<String>,

    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.
    ///
    /// If not set, the region is taken from the usual AWS SDK sources (environment variables,
    /// config files, instance metadata), falling back to `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// Static access key ID to use instead of the default AWS credentials chain.
    ///
    /// Only used if `aws_secret_access_key` is also set.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_secret_access_key"))]
    pub aws_access_key_id: Option<String>,

    /// Static secret access key to use instead of the default AWS credentials chain.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_access_key_id"))]
    pub aws_secret_access_key: Option<String>,

    /// The chunk size used for multipart uploads of extracted files.
    ///
    /// Multipart uploads will be used for files larger than `multipart_threshold`.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// Note that the maximum number of chunks in an upload is 10,000, so for very large files
    /// this chunk size may be overridden if it's smaller than 1/10,000th of the size of the
    /// file.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The size threshold above which extracted files are uploaded in multiple parts.
    ///
    /// Files smaller than this are buffered in memory and written with a single request.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// The maximum number of concurrent part uploads for a single multipart upload.
    ///
    /// Files in the archive are always extracted one at a time, in archive order.  This only
    /// controls how many chunks of one large file may be in flight at once, and so it also
    /// bounds the memory used per file to roughly `multipart_chunk_size` times this value.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            destination_bucket: None,
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
        }
    }
}

impl Config {
    /// Resolve the bucket that archives found in `source_bucket` should be extracted into.
    ///
    /// A non-empty `destination_bucket` always wins; otherwise the archive is extracted next to
    /// itself.
    pub fn destination_bucket_for<'a>(&'a self, source_bucket: &'a str) -> &'a str {
        self.destination_bucket_override().unwrap_or(source_bucket)
    }

    /// The destination bucket override, if one is set to a non-empty value
    pub fn destination_bucket_override(&self) -> Option<&str> {
        self.destination_bucket
            .as_deref()
            .filter(|bucket| !bucket.is_empty())
    }
}

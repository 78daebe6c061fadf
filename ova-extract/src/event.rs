//! Model of the S3 "object created" event notification document which triggers extraction.
//!
//! Only the handful of fields this crate actually uses are modeled; everything else in the
//! document is ignored.
use crate::Result;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::borrow::Cow;
use std::str::FromStr;

/// A batch of S3 event notification records, as delivered by S3 to a notification target.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

impl S3Event {
    /// Parse an event notification document from a reader, like a file or stdin
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_json::from_reader(reader).context(crate::error::InvalidEventSnafu {})
    }
}

impl FromStr for S3Event {
    type Err = crate::OvaExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).context(crate::error::InvalidEventSnafu {})
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    /// The kind of event, like `ObjectCreated:Put`.
    ///
    /// Informational only; every record in a batch is processed regardless of its event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    pub s3: S3Entity,
}

impl S3EventRecord {
    /// Construct a record for an object in a bucket.  `key` is the actual object key, not the
    /// encoded form that appears in notification documents.
    pub fn new(bucket: impl Into<String>, key: &str) -> Self {
        Self {
            event_name: Some("ObjectCreated:Put".to_string()),
            s3: S3Entity {
                bucket: S3Bucket {
                    name: bucket.into(),
                },
                object: S3Object {
                    key: encode_key(key),
                    size: None,
                },
            },
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.s3.bucket.name
    }

    /// The decoded object key.
    ///
    /// S3 form-encodes the keys in event notifications (a space becomes `+`, and other special
    /// characters are percent-escaped), so the raw `key` field can't be used to read the object.
    pub fn object_key(&self) -> Cow<'_, str> {
        decode_key(&self.s3.object.key)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3Object {
    /// The object key, in the encoded form used by S3 notifications
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

fn decode_key(key: &str) -> Cow<'_, str> {
    if !key.contains(['+', '%']) {
        return Cow::Borrowed(key);
    }

    let key = key.replace('+', " ");
    Cow::Owned(percent_decode_str(&key).decode_utf8_lossy().into_owned())
}

fn encode_key(key: &str) -> String {
    use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

    // Everything S3 itself escapes in notification keys, except `/` which is left as-is
    const KEY: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'#')
        .add(b'%')
        .add(b'&')
        .add(b'+')
        .add(b',')
        .add(b':')
        .add(b';')
        .add(b'<')
        .add(b'=')
        .add(b'>')
        .add(b'?')
        .add(b'@')
        .add(b'[')
        .add(b'\\')
        .add(b']')
        .add(b'^')
        .add(b'`')
        .add(b'{')
        .add(b'|')
        .add(b'}');

    utf8_percent_encode(key, KEY).to_string()
}

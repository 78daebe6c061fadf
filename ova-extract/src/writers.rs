//! Helpers which construct [`tokio::io::AsyncWrite`] impls that collect the written bytes into
//! chunks and hand them to some other async worker to upload.
//!
//! [`multipart`] breaks up the written data into chunks of a certain size for uploading with the
//! multipart upload APIs, while [`unipart`] buffers everything written in memory and yields it as
//! a single chunk.
//!
//! In both cases the end of the data is signaled by shutting down (or dropping) the writer.

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, warn};

pub(crate) struct MultipartChunk {
    /// The part number of the chunk starting from 0.
    pub part_number: usize,

    pub data: Bytes,
}

/// Construct an [`tokio::io::AsyncWrite`] implementation which buffers written data into chunks
/// of `multipart_chunk_size` bytes and sends them to a channel, where a worker task uploads them.
///
/// At most `chunks_channel_depth` chunks are queued at once; after that writes block until the
/// worker catches up.
pub(crate) fn multipart(
    multipart_chunk_size: usize,
    chunks_channel_depth: usize,
) -> (DuplexStream, mpsc::Receiver<MultipartChunk>) {
    let (bytes_sender, mut bytes_receiver) = tokio::io::duplex(multipart_chunk_size);
    let (chunks_sender, chunks_receiver) = mpsc::channel(chunks_channel_depth.max(1));

    let mut part_number = 0usize;

    tokio::spawn(async move {
        loop {
            let mut buffer = BytesMut::with_capacity(multipart_chunk_size);

            // Read until the buffer is full, or until a 0 byte read indicates that the writer was
            // shut down or dropped
            while buffer.len() < multipart_chunk_size {
                match bytes_receiver.read_buf(&mut buffer).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        // Reads from a duplex don't fail, but if one ever does the object length
                        // check in the uploader will catch the missing data
                        error!(?e, "Error reading from duplex stream; worker task exiting");
                        return;
                    }
                }
            }

            if buffer.is_empty() {
                debug!("encountered end of duplex stream; worker task exiting");
                break;
            }

            let chunk = MultipartChunk {
                part_number,
                data: buffer.freeze(),
            };

            part_number += 1;

            // If sending on the channel fails, it can only mean the receiver was dropped because
            // the upload failed.  Dropping the duplex here will make further writes fail.
            if chunks_sender.send(chunk).await.is_err() {
                warn!("chunks receiver was dropped; aborting the worker task");
                break;
            }
        }
    });

    (bytes_sender, chunks_receiver)
}

/// Handle the special case of objects that aren't big enough to justify multipart chunking.
///
/// Everything written to the `DuplexStream` is collected into a single chunk, which is sent once
/// the writer is shut down.  `expected_bytes` is used to size the buffer; writing more than that
/// works, just less efficiently.
pub(crate) fn unipart(expected_bytes: usize) -> (DuplexStream, oneshot::Receiver<Bytes>) {
    let (bytes_sender, mut bytes_receiver) = tokio::io::duplex(expected_bytes.max(1));
    let (chunk_sender, chunk_receiver) = oneshot::channel();

    tokio::spawn(async move {
        let mut buffer = Vec::with_capacity(expected_bytes);

        if let Err(e) = bytes_receiver.read_to_end(&mut buffer).await {
            // Dropping the sender tells the uploader that the data never arrived
            error!(?e, "Error reading from duplex stream; unipart chunk is lost");
            return;
        }

        // Zero bytes is still a chunk, it's just an empty object
        if chunk_sender.send(Bytes::from(buffer)).is_err() {
            warn!("chunk receiver was dropped; unipart chunk is lost");
        }
    });

    (bytes_sender, chunk_receiver)
}

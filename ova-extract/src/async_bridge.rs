//! Types which bridge between async `Stream` and `AsyncWrite` and synchronous `Read` and `Write`
//! types.
//!
//! Archives are downloaded from and extracted objects uploaded to object storage with async code,
//! but the `tar` crate operates on synchronous `Read` and `Write` traits.

use crate::Result;
use bytes::{buf::Reader, Buf, Bytes};
use futures::{Stream, StreamExt};
use std::{io::Read, pin::Pin};
use tokio::io::AsyncWrite;

/// Given a [`Stream`] impl that yields chunks of bytes, produce a [`Read`] implementation that
/// exposes those very same bytes for blocking reads.
///
/// An error yielded by the stream is reported as an [`std::io::Error`] whose inner error is the
/// original [`crate::OvaExtractError`], so that callers further up can tell a failure of the
/// source apart from a problem with the data itself.
///
/// NOTE: The resulting [`std::io::Read`] implementation will panic if any of its `read_*` methods
/// are called from an async context.  Blocking reads must be performed in a blocking worker
/// thread, using [`tokio::task::spawn_blocking`].
pub(crate) fn stream_as_reader<S>(stream: S) -> impl Read + Send
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let handle = tokio::runtime::Handle::current();

    TryStreamReader {
        buffer: None,
        stream: Box::pin(stream),
        handle,
    }
}

/// Given an async [`tokio::io::AsyncWrite`] implementation, wrap it in a synchronous
/// [`std::io::Write`] impl which will pass writes to the async implementation internally.
///
/// Like [`stream_as_reader`], attempting to perform blocking I/O on the returned `Write` impl
/// from within an async context will panic.
pub(crate) fn async_write_as_writer<W>(writer: W) -> tokio_util::io::SyncIoBridge<W>
where
    W: AsyncWrite + Unpin + 'static,
{
    tokio_util::io::SyncIoBridge::new(writer)
}

struct TryStreamReader {
    buffer: Option<Reader<Bytes>>,
    stream: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    handle: tokio::runtime::Handle,
}

impl Read for TryStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Satisfy the read from data left over from a prior read if there is any.
        //
        // If `buf` is bigger than what's left this returns a short read, which `Read` allows
        if let Some(mut buffer) = self.buffer.take() {
            if buffer.get_ref().remaining() > 0 {
                let bytes_read = buffer.read(buf)?;

                if buffer.get_ref().remaining() > 0 {
                    self.buffer = Some(buffer);
                }

                return Ok(bytes_read);
            }
        }

        loop {
            match self.handle.block_on(self.stream.next()) {
                None => {
                    // End of the stream is EOF as far as the reader is concerned
                    return Ok(0);
                }
                Some(Err(e)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
                Some(Ok(bytes)) if bytes.is_empty() => {
                    // Returning 0 here would look like EOF
                    continue;
                }
                Some(Ok(bytes)) => {
                    let mut buffer = bytes.reader();

                    let bytes_read = buffer.read(buf)?;

                    if buffer.get_ref().remaining() > 0 {
                        self.buffer = Some(buffer);
                    }

                    return Ok(bytes_read);
                }
            }
        }
    }
}

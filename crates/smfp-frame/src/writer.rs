use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_request, RequestFrame};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete request frames to any `Write` stream.
///
/// Each request goes out as a single contiguous write sequence, so a writer
/// shared behind a lock never interleaves two requests.
pub struct RequestWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> RequestWriter<T> {
    /// Create a new request writer.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Write a complete request frame (blocking).
    pub fn write_request(&mut self, frame: &RequestFrame) -> Result<()> {
        self.send(frame.code, frame.transaction_id, frame.arg.as_ref())
    }

    /// Encode and send a request.
    pub fn send(&mut self, code: u8, transaction_id: u32, arg: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_request(code, transaction_id, arg, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

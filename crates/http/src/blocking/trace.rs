//! Tee adapters for verbose mode.
//!
//! Every read or write is logged with its byte count at `debug` and as an
//! escaped dump at `trace`.

use std::io::{self, BufRead, Read, Write};

use tracing::{debug, enabled, trace, Level};

#[derive(Debug)]
pub struct TraceReader<R> {
    inner: R,
    label: &'static str,
}

impl<R> TraceReader<R> {
    pub fn new(inner: R, label: &'static str) -> Self {
        Self { inner, label }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for TraceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        log_bytes(self.label, "read", &buf[..n]);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for TraceReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if enabled!(Level::DEBUG) {
            if let Ok(buf) = self.inner.fill_buf() {
                log_bytes(self.label, "read", &buf[..amt.min(buf.len())]);
            }
        }
        self.inner.consume(amt);
    }
}

#[derive(Debug)]
pub struct TraceWriter<W> {
    inner: W,
    label: &'static str,
}

impl<W> TraceWriter<W> {
    pub fn new(inner: W, label: &'static str) -> Self {
        Self { inner, label }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for TraceWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        log_bytes(self.label, "write", &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub(crate) fn log_bytes(label: &str, direction: &str, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    debug!(label, direction, len = bytes.len(), "io");
    trace!(label, direction, data = %bytes.escape_ascii(), "io");
}

//! Message bodies.
//!
//! A [`Body`] is consumed exactly once: read as text, read as bytes, taken as a
//! stream, written to a sink, or disposed. Disposing is idempotent; any other
//! consumption of an already consumed body fails with [`BodyError::Consumed`].

use std::fmt;
use std::io::{self, Cursor, Read, Write};

use bytes::Bytes;

use crate::protocol::BodyError;

pub struct Body {
    state: State,
}

enum State {
    Empty,
    Full(Bytes),
    Stream(Box<dyn Read + Send>),
    Consumed,
    Disposed,
}

impl Body {
    pub fn empty() -> Self {
        Self { state: State::Empty }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self { state: State::Full(bytes.into()) }
    }

    /// A body produced on demand by `reader`; its length is unknown until it ends.
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self { state: State::Stream(Box::new(reader)) }
    }

    /// The length, when it is known without reading.
    pub fn len(&self) -> Option<u64> {
        match &self.state {
            State::Empty => Some(0),
            State::Full(bytes) => Some(bytes.len() as u64),
            State::Stream(_) | State::Consumed | State::Disposed => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, State::Stream(_))
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.state, State::Consumed | State::Disposed)
    }

    pub fn text(&mut self) -> Result<String, BodyError> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn bytes(&mut self) -> Result<Bytes, BodyError> {
        match self.take()? {
            State::Empty => Ok(Bytes::new()),
            State::Full(bytes) => Ok(bytes),
            State::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
            State::Consumed | State::Disposed => Err(BodyError::Consumed),
        }
    }

    pub fn stream(&mut self) -> Result<Box<dyn Read + Send>, BodyError> {
        match self.take()? {
            State::Empty => Ok(Box::new(io::empty())),
            State::Full(bytes) => Ok(Box::new(Cursor::new(bytes))),
            State::Stream(reader) => Ok(reader),
            State::Consumed | State::Disposed => Err(BodyError::Consumed),
        }
    }

    /// Copies the body into `sink`, returning the number of bytes written.
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64, BodyError> {
        match self.take()? {
            State::Empty => Ok(0),
            State::Full(bytes) => {
                sink.write_all(&bytes)?;
                Ok(bytes.len() as u64)
            }
            State::Stream(mut reader) => Ok(io::copy(&mut reader, sink)?),
            State::Consumed | State::Disposed => Err(BodyError::Consumed),
        }
    }

    /// Releases whatever the body holds without reading it.
    pub fn dispose(&mut self) {
        if !matches!(self.state, State::Consumed | State::Disposed) {
            self.state = State::Disposed;
        }
    }

    fn take(&mut self) -> Result<State, BodyError> {
        match std::mem::replace(&mut self.state, State::Consumed) {
            State::Disposed => {
                self.state = State::Disposed;
                Err(BodyError::Consumed)
            }
            State::Consumed => Err(BodyError::Consumed),
            state => Ok(state),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Empty => f.write_str("Body::Empty"),
            State::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            State::Stream(_) => f.write_str("Body::Stream"),
            State::Consumed => f.write_str("Body::Consumed"),
            State::Disposed => f.write_str("Body::Disposed"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from_bytes(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::from_bytes(text)
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn consumed_once() {
        let mut body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        assert_eq!(body.text().unwrap(), "hello");
        assert!(body.is_consumed());
        assert!(matches!(body.bytes(), Err(BodyError::Consumed)));
        assert!(matches!(body.write_to(&mut Vec::new()), Err(BodyError::Consumed)));
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut body = Body::from_reader(Cursor::new(b"abc".to_vec()));
        body.dispose();
        body.dispose();
        assert!(matches!(body.text(), Err(BodyError::Consumed)));
        assert!(matches!(body.stream(), Err(BodyError::Consumed)));

        let mut read = Body::from("x");
        read.bytes().unwrap();
        read.dispose();
        assert!(read.is_consumed());
    }

    #[test]
    fn stream_and_write_to() {
        let mut body = Body::from_reader(Cursor::new(b"streamed".to_vec()));
        assert!(body.is_streaming());
        assert_eq!(body.len(), None);

        let mut sink = Vec::new();
        assert_eq!(body.write_to(&mut sink).unwrap(), 8);
        assert_eq!(sink, b"streamed");

        let mut body = Body::from(vec![1u8, 2, 3]);
        let mut out = Vec::new();
        body.stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn invalid_utf8() {
        let mut body = Body::from(vec![0xff, 0xfe]);
        assert!(matches!(body.text(), Err(BodyError::Utf8 { .. })));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Read for DropFlag {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispose_releases_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut body = Body::from_reader(DropFlag(Arc::clone(&dropped)));
        body.dispose();
        assert!(dropped.load(Ordering::SeqCst));
    }
}

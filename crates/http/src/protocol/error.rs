use std::error::Error;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("handler error: {source}")]
    HandlerError {
        #[from]
        source: HandlerError,
    },
}

/// The peer sent something that is not a valid HTTP/1.x message.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid line: {reason}")]
    InvalidLine { reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid start line: {line:?}")]
    InvalidStartLine { line: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk size: {reason}")]
    InvalidChunkSize { reason: String },

    #[error("unsupported transfer-encoding: {coding}")]
    UnsupportedTransferEncoding { coding: String },

    #[error("unsupported content-encoding: {coding}")]
    UnsupportedContentEncoding { coding: String },

    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("body ended early, {remaining} bytes missing")]
    IncompleteBody { remaining: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn invalid_line<S: ToString>(str: S) -> Self {
        Self::InvalidLine { reason: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_start_line<S: ToString>(line: S) -> Self {
        Self::InvalidStartLine { line: line.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk_size<S: ToString>(str: S) -> Self {
        Self::InvalidChunkSize { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(coding: S) -> Self {
        Self::UnsupportedTransferEncoding { coding: coding.to_string() }
    }

    pub fn unsupported_content_encoding<S: ToString>(coding: S) -> Self {
        Self::UnsupportedContentEncoding { coding: coding.to_string() }
    }

    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn incomplete_body(remaining: u64) -> Self {
        Self::IncompleteBody { remaining }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Errors caused by the peer's bytes, as opposed to the transport failing.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("status {status} is not a provisional status")]
    NotProvisional { status: u16 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

impl From<BodyError> for SendError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Io { source } => Self::Io { source },
            e => Self::invalid_body(e),
        }
    }
}

/// Failures reading a message [`Body`](crate::protocol::Body).
#[derive(Error, Debug)]
pub enum BodyError {
    #[error("body has already been consumed")]
    Consumed,

    #[error("body is not valid utf-8: {source}")]
    Utf8 {
        #[from]
        source: std::string::FromUtf8Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler sent a provisional response but produced no final response")]
    ProvisionalWithoutFinal,

    #[error("handler failed: {source}")]
    Failed { source: Box<dyn Error + Send + Sync> },
}

impl HandlerError {
    pub fn failed<E: Into<Box<dyn Error + Send + Sync>>>(e: E) -> Self {
        Self::Failed { source: e.into() }
    }
}

impl From<BodyError> for HandlerError {
    fn from(e: BodyError) -> Self {
        Self::failed(e)
    }
}

impl From<SendError> for HandlerError {
    fn from(e: SendError) -> Self {
        Self::failed(e)
    }
}

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("readiness poll failed: {source}")]
    Poll { source: io::Error },

    #[error("channel {token} is closed")]
    Closed { token: usize },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ReactorError {
    pub fn poll(e: io::Error) -> Self {
        Self::Poll { source: e }
    }

    pub fn closed(token: usize) -> Self {
        Self::Closed { token }
    }
}

/// Returned by [`WorkerPool::execute`](crate::WorkerPool::execute) when a job can't be admitted.
#[derive(Debug, Error)]
pub enum RejectedError {
    #[error("worker pool saturated: {threads} threads busy, {queued} jobs queued")]
    Saturated { threads: usize, queued: usize },

    #[error("worker pool is shut down")]
    Shutdown,

    #[error("failed to spawn worker thread: {source}")]
    Spawn { source: io::Error },
}

#![forbid(unsafe_code)]

use thiserror::Error;

/// Scheduling core errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no level loaded for index {0}")]
    LevelNotFound(usize),

    #[error("fragment not found: level {level} sn {sn}")]
    FragmentNotFound { level: usize, sn: u64 },

    #[error("fragment load failed after {retries} retries")]
    FragLoadFailed { retries: u32 },

    #[error("buffer append failed")]
    BufferAppendFailed,

    #[error("media element not attached")]
    MediaNotAttached,

    #[error("driver channel closed")]
    ChannelClosed,

    #[error("cancelled")]
    Cancelled,
}

pub type StreamResult<T> = Result<T, StreamError>;

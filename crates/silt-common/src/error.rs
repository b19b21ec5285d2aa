use thiserror::Error;

/// Top-level error type for the silt storage engine.
#[derive(Error, Debug)]
pub enum SiltError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("no free frame: every frame in the pool is pinned")]
    NoFreeFrame,

    #[error("page {page_no} of file {file_id} lies beyond the file end ({file_size} bytes)")]
    OutOfBounds {
        file_id: u16,
        page_no: u64,
        file_size: u64,
    },

    #[error("file is closed")]
    FileClosed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type SiltResult<T> = Result<T, SiltError>;

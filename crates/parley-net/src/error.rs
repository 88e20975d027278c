use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record exceeds {0} bytes")]
    RecordTooLong(usize),

    #[error("connection closed")]
    Closed,

    #[error("receive loop already started")]
    AlreadyStarted,
}

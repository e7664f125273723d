use thiserror::Error;

/// Errors surfaced by lock operations.
///
/// Losing a race is not an error: a contended `try_lock`, a refresh or
/// release by a non-owner, and an invalid status are all reported as
/// ordinary values.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store failed (connectivity, timeout, bad schema).
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// The store worker thread has exited.
    #[error("store worker is gone")]
    Disconnected,

    /// A blocking `lock` call was cancelled through its token.
    #[error("lock wait cancelled")]
    Cancelled,

    /// A blocking `lock` call ran past its deadline.
    #[error("lock wait deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

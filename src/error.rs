use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Journal corruption discovered while opening a cache directory is
/// not represented here: the directory is wiped and the cache starts
/// fresh, so corruption never reaches callers.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected: a malformed key, or a
    /// zero `max_size` / `value_count`.
    #[error("{0}")]
    InvalidArgument(String),

    /// The operation targeted a closed cache or a detached editor.
    #[error("{0}")]
    IllegalState(&'static str),

    /// A filesystem operation failed unrecoverably.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The error returned by every operation once a journal append has
    /// failed: the in-memory state can no longer be trusted to match
    /// what a future recovery will replay.
    pub(crate) fn wedged() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "journal write failed; cache no longer accepts operations",
        ))
    }

    pub(crate) fn closed() -> Error {
        Error::IllegalState("cache is closed")
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Admission outcome for a command queue.
///
/// `Overflow` is recoverable and carries the depth observed at the moment
/// admission failed. `Stopped` is benign: posting to a stopped queue is a
/// no-op, but callers that care can still tell it apart from overflow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full: {depth} commands pending")]
    Overflow { depth: usize },

    #[error("queue stopped")]
    Stopped,
}

impl QueueError {
    /// True for outcomes a caller may safely ignore.
    pub fn is_benign(&self) -> bool {
        matches!(self, QueueError::Stopped)
    }
}

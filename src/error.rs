//! Error types for jobq.

use thiserror::Error;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    /// No job became claimable before the timeout elapsed.
    #[error("no job available")]
    Empty,

    #[error("job is not claimed: {0}")]
    JobNotClaimed(JobId),

    #[error("job is not stalled: {0}")]
    JobNotStalled(JobId),

    #[error("item does not exist: {0}")]
    ItemDoesNotExist(JobId),

    #[error("job id already in use: {0}")]
    JobExists(JobId),

    #[error("feed does not exist: {0}")]
    FeedDoesNotExist(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the expected state conflicts a caller can recover from by
    /// re-checking the job or backing off. Infrastructure failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Empty
                | Error::JobNotClaimed(_)
                | Error::JobNotStalled(_)
                | Error::ItemDoesNotExist(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

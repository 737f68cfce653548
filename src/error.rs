use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoError {
    #[error("Recommender not ready: no model has been built or loaded yet")]
    NotReady,

    #[error("Recommender is shutting down")]
    ShuttingDown,

    #[error("Interrupted while {0}")]
    Interrupted(String),

    #[error("Update queue is full ({0} jobs pending)")]
    QueueFull(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Delta for {found} cannot be committed into {expected}")]
    DeltaMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Data reader error: {0}")]
    Reader(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecoError {
    /// True for errors that mean "try again later" rather than "bad request".
    pub fn is_not_ready(&self) -> bool {
        matches!(self, RecoError::NotReady)
    }
}

pub type Result<T> = std::result::Result<T, RecoError>;

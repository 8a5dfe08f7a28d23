//! Crate-wide error and result types.

use thiserror::Error;

use crate::job::JobFailure;

pub type HvResult<T> = Result<T, HvError>;

#[derive(Debug, Error)]
pub enum HvError {
    /// Failure to communicate with the management endpoint.
    #[error("session error: {0}")]
    Session(String),

    #[error("could not find virtual machine {0:?}")]
    NotFound(String),

    /// A management operation resolved to a failure outcome.
    ///
    /// The underlying numeric code and remote description are preserved in
    /// the source [`JobFailure`].
    #[error("failed to {what}: {source}")]
    Operation {
        what: String,
        #[source]
        source: JobFailure,
    },

    /// An external command could not be run or exited unsuccessfully.
    #[error("command failed: {0}")]
    Command(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HvError {
    /// Wrap a job failure into an operation-specific error without
    /// discarding the underlying code or description.
    pub fn operation(what: impl Into<String>, source: JobFailure) -> Self {
        HvError::Operation {
            what: what.into(),
            source,
        }
    }
}

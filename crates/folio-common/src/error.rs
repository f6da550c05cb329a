use thiserror::Error;

use crate::types::JobStatus;

#[derive(Debug, Error)]
pub enum FolioError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FolioError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound(_) => "NoSuchJob",
            Self::DocumentNotFound(_) => "NoSuchDocument",
            Self::InvalidTransition { .. } => "InvalidJobState",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Precondition(_) => "PreconditionFailed",
            Self::Persistence(_) => "PersistenceError",
            Self::Dispatch(_) => "DispatchError",
            Self::InternalError(_) => "InternalError",
            Self::Io(_) | Self::Json(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, FolioError>;

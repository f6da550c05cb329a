pub mod error;
pub mod types;

pub use error::{FolioError, Result};
pub use types::{DocumentRef, DocumentStatus, Job, JobStatus, PageRecord};

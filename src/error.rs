use crate::mem::{EntryId, Pid};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GmdError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("No such process: {0}")]
    ProcessNotFound(Pid),

    #[error("No such memory entry: {0}")]
    EntryNotFound(EntryId),

    #[error("No such diagnostics node: {0}")]
    NodeNotFound(String),

    #[error("Permission denied for process {0}")]
    PermissionDenied(Pid),

    #[error("Diagnostics node already exists: {0}")]
    NodeExists(String),

    #[error("Page index {index} out of range (entry has {count} pages)")]
    PageIndexOutOfRange { index: usize, count: usize },

    #[error("General diagnostics error: {0}")]
    General(String),
}

// A convenient alias
pub type GmdResult<T> = Result<T, GmdError>;

impl From<GmdError> for io::Error {
    fn from(err: GmdError) -> Self {
        let kind = match &err {
            GmdError::Io(e) => e.kind(),
            GmdError::ProcessNotFound(_)
            | GmdError::EntryNotFound(_)
            | GmdError::NodeNotFound(_) => io::ErrorKind::NotFound,
            GmdError::PermissionDenied(_) => io::ErrorKind::PermissionDenied,
            GmdError::NodeExists(_) => io::ErrorKind::AlreadyExists,
            GmdError::PageIndexOutOfRange { .. } => io::ErrorKind::InvalidInput,
            GmdError::General(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err.to_string())
    }
}

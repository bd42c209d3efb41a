use std::backtrace::Backtrace;
use std::io::Error as IoError;

use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("Wrong input: {description}")]
    BadInput { description: String },
    #[error("fragment not found")]
    FragmentNotFound,
    #[error("cannot create fragment, view is closed")]
    ViewClosed,
    #[error("fragment is closed")]
    FragmentClosed,
    #[error("Service internal error: {description}")]
    ServiceError {
        description: String,
        backtrace: Option<String>,
    },
}

impl IndexError {
    pub fn service_error(description: impl Into<String>) -> IndexError {
        IndexError::ServiceError {
            description: description.into(),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn bad_input(description: impl Into<String>) -> IndexError {
        IndexError::BadInput {
            description: description.into(),
        }
    }
}

impl From<IoError> for IndexError {
    fn from(err: IoError) -> Self {
        IndexError::service_error(format!("{err}"))
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::service_error(format!("json (de)serialization error: {err}"))
    }
}

impl<E: std::fmt::Display> From<atomicwrites::Error<E>> for IndexError {
    fn from(err: atomicwrites::Error<E>) -> Self {
        IndexError::service_error(format!("Failed to write file: {err}"))
    }
}

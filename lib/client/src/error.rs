use std::io::Error as IoError;

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Wrong input: {description}")]
    BadInput { description: String },
    #[error("index not found to back up")]
    IndexNotFound,
    #[error("no nodes available")]
    NoNodesAvailable,
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Service internal error: {description}")]
    ServiceError { description: String },
}

impl ClientError {
    pub fn service_error(description: impl Into<String>) -> ClientError {
        ClientError::ServiceError {
            description: description.into(),
        }
    }

    pub fn bad_input(description: impl Into<String>) -> ClientError {
        ClientError::BadInput {
            description: description.into(),
        }
    }

    /// Transient failures worth retrying within the retry period.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(err) => {
                err.is_connect() || err.is_timeout() || err.is_request()
            }
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<IoError> for ClientError {
    fn from(err: IoError) -> Self {
        ClientError::service_error(format!("{err}"))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::service_error(format!("json (de)serialization error: {err}"))
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::bad_input(format!("invalid node URI: {err}"))
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(err: tokio::task::JoinError) -> Self {
        ClientError::service_error(format!("Tokio task join error: {err}"))
    }
}

impl From<walkdir::Error> for ClientError {
    fn from(err: walkdir::Error) -> Self {
        ClientError::service_error(format!("walking output directory: {err}"))
    }
}

impl From<nix::Error> for ClientError {
    fn from(err: nix::Error) -> Self {
        ClientError::service_error(format!("{err}"))
    }
}

use crate::response::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Io(std::io::Error),
    Glob(glob::PatternError),
    DirectoryNotFound(String),
    InvalidConfig(String),
    PathTraversal,
    NotFound,
    Forbidden,
    BadRequest,
    RequestTooLarge,
    MethodNotAllowed,
    FileTooLarge,
    /// No requested range overlaps the file; carries the file length for `Content-Range`.
    Unsatisfiable(u64),
    Timeout,
    InternalServerError(String),
}

impl AppError {
    /// The status a client sees for this error, or `None` when the
    /// connection is closed without a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AppError::PathTraversal | AppError::Forbidden => Some(StatusCode::Forbidden),
            AppError::NotFound => Some(StatusCode::NotFound),
            AppError::BadRequest => Some(StatusCode::BadRequest),
            AppError::RequestTooLarge => Some(StatusCode::RequestHeaderFieldsTooLarge),
            AppError::MethodNotAllowed => Some(StatusCode::MethodNotAllowed),
            AppError::FileTooLarge => Some(StatusCode::PayloadTooLarge),
            AppError::Unsatisfiable(_) => Some(StatusCode::RangeNotSatisfiable),
            AppError::Timeout => None,
            AppError::Io(_)
            | AppError::Glob(_)
            | AppError::DirectoryNotFound(_)
            | AppError::InvalidConfig(_)
            | AppError::InternalServerError(_) => Some(StatusCode::InternalServerError),
        }
    }

    /// Whether the connection can keep serving requests after this error's response.
    pub fn keeps_connection(&self) -> bool {
        matches!(
            self,
            AppError::PathTraversal
                | AppError::NotFound
                | AppError::Forbidden
                | AppError::MethodNotAllowed
                | AppError::FileTooLarge
                | AppError::Unsatisfiable(_)
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "IO error: {err}"),
            AppError::Glob(err) => write!(f, "Glob pattern error: {err}"),
            AppError::DirectoryNotFound(path) => write!(f, "Directory not found: {path}"),
            AppError::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            AppError::PathTraversal => write!(f, "Path escapes the document root"),
            AppError::NotFound => write!(f, "Not Found"),
            AppError::Forbidden => write!(f, "Forbidden"),
            AppError::BadRequest => write!(f, "Bad request"),
            AppError::RequestTooLarge => write!(f, "Request header block too large"),
            AppError::MethodNotAllowed => write!(f, "Method not allowed"),
            AppError::FileTooLarge => write!(f, "File exceeds the configured size limit"),
            AppError::Unsatisfiable(len) => write!(f, "Range not satisfiable for length {len}"),
            AppError::Timeout => write!(f, "Timed out waiting for the client"),
            AppError::InternalServerError(msg) => write!(f, "Internal server error: {msg}"),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<glob::PatternError> for AppError {
    fn from(err: glob::PatternError) -> Self {
        AppError::Glob(err)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
            AppError::Glob(err) => Some(err),
            _ => None,
        }
    }
}

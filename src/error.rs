//! Error taxonomy and located status values.
//!
//! Every failure the executor can produce is an [`Error`]. Before it reaches a
//! caller it passes through an [`ErrorReporter`], which attaches the call-site
//! location and collapses one or more errors into a single [`Status`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ExecContext;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a database client.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{message}")]
    Driver { message: String },
}

impl DbError {
    pub fn driver(message: impl Into<String>) -> Self {
        DbError::Driver {
            message: message.into(),
        }
    }
}

/// Crate error
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────────────
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid argument: request {field} is empty")]
    MissingField { field: &'static str },

    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    // ─────────────────────────────────────────────────────────────────────────────
    // Admission Errors
    // ─────────────────────────────────────────────────────────────────────────────
    #[error("rate limited: {uri}")]
    RateLimited { uri: String },

    // ─────────────────────────────────────────────────────────────────────────────
    // Transaction Errors
    // ─────────────────────────────────────────────────────────────────────────────
    #[error("error beginning transaction: {0}")]
    Begin(#[source] DbError),

    #[error("error exec statement [{sql}] : {source}")]
    Execution {
        sql: String,
        #[source]
        source: DbError,
    },

    #[error("error exec statement [{sql}] : actual RowsAffected {actual} != expected RowsAffected {expected}")]
    CountMismatch {
        sql: String,
        actual: i64,
        expected: i64,
    },

    #[error("error rolling back transaction: {0}")]
    Rollback(#[source] DbError),

    #[error("error committing transaction: {0}")]
    Commit(#[source] DbError),

    #[error("error on ping: {0}")]
    Ping(#[source] DbError),

    // ─────────────────────────────────────────────────────────────────────────────
    // Context Errors
    // ─────────────────────────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("delegate executor failed: {0}")]
    Delegate(#[source] anyhow::Error),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedRequest {
            message: message.into(),
        }
    }

    /// Status code this error is reported under
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument { .. }
            | Error::MissingField { .. }
            | Error::MalformedRequest { .. } => StatusCode::InvalidArgument,
            Error::RateLimited { .. } => StatusCode::RateLimited,
            Error::Begin(_)
            | Error::Execution { .. }
            | Error::Rollback(_)
            | Error::Ping(_)
            | Error::Delegate(_) => StatusCode::ExecutionError,
            Error::CountMismatch { .. } => StatusCode::CountMismatch,
            Error::Commit(_) => StatusCode::CommitError,
            Error::Cancelled => StatusCode::Cancelled,
            Error::DeadlineExceeded => StatusCode::DeadlineExceeded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    RateLimited,
    ExecutionError,
    CountMismatch,
    CommitError,
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::RateLimited => "RATE_LIMITED",
            StatusCode::ExecutionError => "EXECUTION_ERROR",
            StatusCode::CountMismatch => "COUNT_MISMATCH",
            StatusCode::CommitError => "COMMIT_ERROR",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        f.write_str(s)
    }
}

/// Outcome of an executor call: a code, the location that produced it and
/// the errors behind it. The first error decides the code.
#[derive(Debug)]
pub struct Status {
    code: StatusCode,
    location: Option<String>,
    errors: Vec<Error>,
}

impl Status {
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            location: None,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(location: impl Into<String>, errors: Vec<Error>) -> Self {
        let code = errors.first().map_or(StatusCode::Ok, Error::code);
        Self {
            code,
            location: Some(location.into()),
            errors,
        }
    }

    pub fn with_code(mut self, code: StatusCode) -> Self {
        self.code = code;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn first_error(&self) -> Option<&Error> {
        self.errors.first()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(location) = &self.location {
            write!(f, " [{}]", location)?;
        }
        for err in &self.errors {
            write!(f, " : {}", err)?;
        }
        Ok(())
    }
}

/// Converts raw failures into a located [`Status`].
pub trait ErrorReporter: Send + Sync {
    /// An empty error list yields an OK status.
    fn handle(&self, ctx: &ExecContext, location: &str, errors: Vec<Error>) -> Status;
}

/// Reporter that logs each error with the request id before building the
/// status.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn handle(&self, ctx: &ExecContext, location: &str, errors: Vec<Error>) -> Status {
        if errors.is_empty() {
            return Status::ok();
        }
        for err in &errors {
            tracing::error!(
                location,
                request_id = ctx.request_id().unwrap_or_default(),
                code = %err.code(),
                "{}",
                err
            );
        }
        Status::from_errors(location, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_decides_code() {
        let status = Status::from_errors(
            "loc",
            vec![
                Error::CountMismatch {
                    sql: "DELETE FROM t".to_string(),
                    actual: 0,
                    expected: 1,
                },
                Error::Rollback(DbError::driver("conn reset")),
            ],
        );
        assert_eq!(status.code(), StatusCode::CountMismatch);
        assert_eq!(status.location(), Some("loc"));
        assert_eq!(status.errors().len(), 2);
    }

    #[test]
    fn test_count_mismatch_message() {
        let err = Error::CountMismatch {
            sql: "UPDATE t SET a = $1 WHERE id = $2".to_string(),
            actual: 0,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "error exec statement [UPDATE t SET a = $1 WHERE id = $2] : actual RowsAffected 0 != expected RowsAffected 1"
        );
    }

    #[test]
    fn test_log_reporter_empty_is_ok() {
        let status = LogReporter.handle(&ExecContext::background(), "loc", Vec::new());
        assert!(status.is_ok());
        assert!(status.location().is_none());
    }
}

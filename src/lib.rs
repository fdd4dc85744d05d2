//! Templated DML statements and transactional execution for the Runar ecosystem.
//!
//! # Intention
//!
//! - Expand SQL templates with structured predicates, assignments and rows
//!   into parameterized statements with ordered `$n` placeholders.
//! - Execute each statement in its own transaction, committing only when the
//!   affected-row count is what the caller expects.
//!
//! # Architectural Boundaries
//!
//! - The database client, admission control and error reporting are traits;
//!   SQLite, limiter and logging implementations are provided.
//! - No SQL parsing, query planning, schema or migration management.

pub mod client;
pub mod config;
pub mod context;
pub mod dml;
pub mod error;
pub mod exec;
pub mod intercept;
pub mod request;
pub mod sqlite;
pub mod uri;
pub mod value;

pub use client::{ClientStat, DbClient, QueryResult, Transaction};
pub use config::Config;
pub use context::{CancelHandle, ExecContext};
pub use error::{DbError, Error, ErrorReporter, LogReporter, Result, Status, StatusCode};
pub use exec::{CommandTag, DelegateExecutor, Executor, ExecutorBuilder, NULL_COUNT};
pub use intercept::{
    Admission, AdmitGuard, AllowAll, ConcurrencyLimiter, Interceptor, InterceptorChain,
    WindowRateLimiter,
};
pub use request::{Kind, Request};
pub use sqlite::{SqliteClient, SqliteConfig};
pub use value::{Attr, Value};

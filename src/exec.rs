//! Transactional executor.
//!
//! [`Executor::execute`] runs one [`Request`] inside its own transaction:
//!
//! 1. the interceptor admits or rejects the call,
//! 2. a delegate found in the context replaces the database round-trip,
//! 3. otherwise the statement runs in a transaction and is committed only if
//!    the affected-row count matches the expected count.
//!
//! Every outcome is reported through the configured [`ErrorReporter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{ClientStat, DbClient, QueryResult, Transaction};
use crate::context::ExecContext;
use crate::error::{Error, ErrorReporter, LogReporter, Status};
use crate::intercept::{Admission, AdmitGuard, AllowAll, Interceptor};
use crate::request::{Kind, Request};
use crate::uri;
use crate::value::Value;

/// Disables the affected-row check when passed as the expected count.
pub const NULL_COUNT: i64 = -1;

const EXEC_LOC: &str = "rust_dml/exec";
const QUERY_LOC: &str = "rust_dml/query";
const PING_LOC: &str = "rust_dml/ping";
const STAT_LOC: &str = "rust_dml/stat";

/// Result of a successful `execute`. Exactly one kind flag is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTag {
    pub sql: String,
    pub rows_affected: i64,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub select: bool,
}

impl CommandTag {
    pub fn new(kind: Kind, sql: String, rows_affected: i64) -> Self {
        Self {
            sql,
            rows_affected,
            insert: kind == Kind::Insert,
            update: kind == Kind::Update,
            delete: kind == Kind::Delete,
            select: kind == Kind::Query,
        }
    }
}

/// Replaces the database round-trip when present in the [`ExecContext`].
#[async_trait]
pub trait DelegateExecutor: Send + Sync {
    async fn exec(&self, request: &Request) -> anyhow::Result<CommandTag>;

    async fn query(&self, request: &Request) -> anyhow::Result<QueryResult> {
        anyhow::bail!("delegate does not support query for {}", request.uri())
    }
}

pub struct ExecutorBuilder {
    client: Option<Arc<dyn DbClient>>,
    interceptor: Arc<dyn Interceptor>,
    reporter: Arc<dyn ErrorReporter>,
    default_timeout: Option<Duration>,
}

impl ExecutorBuilder {
    pub fn client(mut self, client: Arc<dyn DbClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Deadline applied to calls whose context has none.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Executor {
        Executor {
            client: self.client,
            interceptor: self.interceptor,
            reporter: self.reporter,
            default_timeout: self.default_timeout,
        }
    }
}

/// Shared, stateless apart from its collaborators; clone or wrap in an `Arc`
/// to use from many tasks.
#[derive(Clone)]
pub struct Executor {
    client: Option<Arc<dyn DbClient>>,
    interceptor: Arc<dyn Interceptor>,
    reporter: Arc<dyn ErrorReporter>,
    default_timeout: Option<Duration>,
}

impl Executor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder {
            client: None,
            interceptor: Arc::new(AllowAll),
            reporter: Arc::new(LogReporter),
            default_timeout: None,
        }
    }

    pub fn new(client: Arc<dyn DbClient>) -> Self {
        Self::builder().client(client).build()
    }

    /// Executes `request` with `args` bound to its placeholders in order.
    ///
    /// `ctx = None` runs with [`ExecContext::background`]. Unless
    /// `expected_count` is [`NULL_COUNT`], the transaction is rolled back when
    /// the statement affects a different number of rows.
    pub async fn execute(
        &self,
        ctx: Option<&ExecContext>,
        expected_count: i64,
        request: Option<Request>,
        args: &[Value],
    ) -> (CommandTag, Status) {
        let ctx = self.resolve(ctx);
        let ctx = &ctx;

        let Some(mut request) = request else {
            let err = Error::invalid_argument("error on exec call : request is nil");
            return (CommandTag::default(), self.fail(ctx, EXEC_LOC, vec![err]));
        };
        if let Err(err) = request.validate() {
            return (CommandTag::default(), self.fail(ctx, EXEC_LOC, vec![err]));
        }

        let _guard = match self.admit(ctx, EXEC_LOC, request.uri(), "exec") {
            Ok(guard) => guard,
            Err(status) => return (CommandTag::default(), status),
        };

        if let Some(delegate) = ctx.delegate() {
            tracing::debug!(uri = %request.uri(), "delegating exec");
            return match delegate.exec(&request).await {
                Ok(tag) => (tag, Status::ok()),
                Err(err) => (
                    CommandTag::default(),
                    self.fail(ctx, EXEC_LOC, vec![Error::Delegate(err)]),
                ),
            };
        }

        match self.exec_in_txn(ctx, expected_count, &mut request, args).await {
            Ok(tag) => (tag, Status::ok()),
            Err(errors) => (CommandTag::default(), self.fail(ctx, EXEC_LOC, errors)),
        }
    }

    /// Runs a query request and returns its rows. The read runs in its own
    /// transaction, which is committed once the rows are collected.
    pub async fn query(
        &self,
        ctx: Option<&ExecContext>,
        request: Option<Request>,
        args: &[Value],
    ) -> (QueryResult, Status) {
        let ctx = self.resolve(ctx);
        let ctx = &ctx;

        let Some(mut request) = request else {
            let err = Error::invalid_argument("error on query call : request is nil");
            return (QueryResult::default(), self.fail(ctx, QUERY_LOC, vec![err]));
        };
        if request.kind() != Kind::Query {
            let err = Error::invalid_argument(format!(
                "error on query call : {} request is not a query",
                request.kind()
            ));
            return (QueryResult::default(), self.fail(ctx, QUERY_LOC, vec![err]));
        }
        if let Err(err) = request.validate() {
            return (QueryResult::default(), self.fail(ctx, QUERY_LOC, vec![err]));
        }

        let _guard = match self.admit(ctx, QUERY_LOC, request.uri(), "query") {
            Ok(guard) => guard,
            Err(status) => return (QueryResult::default(), status),
        };

        if let Some(delegate) = ctx.delegate() {
            tracing::debug!(uri = %request.uri(), "delegating query");
            return match delegate.query(&request).await {
                Ok(rows) => (rows, Status::ok()),
                Err(err) => (
                    QueryResult::default(),
                    self.fail(ctx, QUERY_LOC, vec![Error::Delegate(err)]),
                ),
            };
        }

        match self.query_in_txn(ctx, &mut request, args).await {
            Ok(rows) => (rows, Status::ok()),
            Err(errors) => (QueryResult::default(), self.fail(ctx, QUERY_LOC, errors)),
        }
    }

    /// Checks that the database answers.
    pub async fn ping(&self, ctx: Option<&ExecContext>) -> Status {
        let ctx = self.resolve(ctx);
        let ctx = &ctx;

        let _guard = match self.admit(ctx, PING_LOC, uri::PING_URI, "ping") {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => return self.fail(ctx, PING_LOC, vec![err]),
        };
        match ctx.run(client.ping()).await {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(err)) => self.fail(ctx, PING_LOC, vec![Error::Ping(err)]),
            Err(err) => self.fail(ctx, PING_LOC, vec![err]),
        }
    }

    /// Transaction counters of the configured client.
    pub async fn stat(&self, ctx: Option<&ExecContext>) -> (ClientStat, Status) {
        let ctx = self.resolve(ctx);
        let ctx = &ctx;

        let _guard = match self.admit(ctx, STAT_LOC, uri::STAT_URI, "stat") {
            Ok(guard) => guard,
            Err(status) => return (ClientStat::default(), status),
        };
        match self.client() {
            Ok(client) => (client.stat(), Status::ok()),
            Err(err) => (ClientStat::default(), self.fail(ctx, STAT_LOC, vec![err])),
        }
    }

    /// Context for one call: the caller's, or background, with the default
    /// timeout applied when the caller set no deadline.
    fn resolve(&self, ctx: Option<&ExecContext>) -> ExecContext {
        let ctx = ctx.cloned().unwrap_or_default();
        match self.default_timeout {
            Some(timeout) if !ctx.has_deadline() => ctx.with_timeout(timeout),
            _ => ctx,
        }
    }

    fn admit(
        &self,
        ctx: &ExecContext,
        location: &str,
        uri: &str,
        method: &str,
    ) -> Result<AdmitGuard, Status> {
        match self.interceptor.admit(ctx, uri, ctx.request_id(), method) {
            Admission::Admitted(guard) => Ok(guard),
            Admission::Rejected => {
                let err = Error::RateLimited {
                    uri: uri.to_string(),
                };
                Err(self.fail(ctx, location, vec![err]))
            }
        }
    }

    fn client(&self) -> Result<&Arc<dyn DbClient>, Error> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("error on exec call : database client is nil"))
    }

    fn fail(&self, ctx: &ExecContext, location: &str, errors: Vec<Error>) -> Status {
        self.reporter.handle(ctx, location, errors)
    }

    async fn begin(&self, ctx: &ExecContext) -> Result<Box<dyn Transaction>, Vec<Error>> {
        let client = self.client().map_err(|err| vec![err])?;
        match ctx.run(client.begin()).await {
            Ok(Ok(txn)) => Ok(txn),
            Ok(Err(err)) => Err(vec![Error::Begin(err)]),
            Err(err) => Err(vec![err]),
        }
    }

    /// Builds the statement, surfacing any expansion error.
    fn build_sql(request: &mut Request) -> Result<String, Error> {
        let sql = request.build_sql();
        match request.take_last_error() {
            Some(err) => Err(err),
            None => Ok(sql),
        }
    }

    async fn exec_in_txn(
        &self,
        ctx: &ExecContext,
        expected_count: i64,
        request: &mut Request,
        args: &[Value],
    ) -> Result<CommandTag, Vec<Error>> {
        // Expansion errors fail before a transaction is opened.
        let sql = Self::build_sql(request).map_err(|err| vec![err])?;
        tracing::debug!(uri = %request.uri(), sql = %sql, args = args.len(), "exec statement");

        let mut txn = self.begin(ctx).await?;

        let rows_affected = match ctx.run(txn.exec(&sql, args)).await {
            Ok(Ok(n)) => n,
            Ok(Err(source)) => {
                let err = Error::Execution {
                    sql: sql.clone(),
                    source,
                };
                return Err(rollback(txn, err).await);
            }
            Err(err) => return Err(rollback(txn, err).await),
        };

        if expected_count != NULL_COUNT && rows_affected != expected_count {
            let err = Error::CountMismatch {
                sql,
                actual: rows_affected,
                expected: expected_count,
            };
            return Err(rollback(txn, err).await);
        }

        if let Err(err) = ctx.check() {
            return Err(rollback(txn, err).await);
        }
        match ctx.run(txn.commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(vec![Error::Commit(err)]),
            Err(err) => return Err(vec![err]),
        }

        Ok(CommandTag::new(request.kind(), sql, rows_affected))
    }

    async fn query_in_txn(
        &self,
        ctx: &ExecContext,
        request: &mut Request,
        args: &[Value],
    ) -> Result<QueryResult, Vec<Error>> {
        // Expansion errors fail before a transaction is opened.
        let sql = Self::build_sql(request).map_err(|err| vec![err])?;
        tracing::debug!(uri = %request.uri(), sql = %sql, args = args.len(), "query statement");

        let mut txn = self.begin(ctx).await?;

        let rows = match ctx.run(txn.query(&sql, args)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(source)) => {
                let err = Error::Execution { sql, source };
                return Err(rollback(txn, err).await);
            }
            Err(err) => return Err(rollback(txn, err).await),
        };

        if let Err(err) = ctx.check() {
            return Err(rollback(txn, err).await);
        }
        match ctx.run(txn.commit()).await {
            Ok(Ok(())) => Ok(rows),
            Ok(Err(err)) => Err(vec![Error::Commit(err)]),
            Err(err) => Err(vec![err]),
        }
    }
}

/// Rolls back after `cause`. The rollback runs even when the context is
/// already cancelled, and its failure is reported next to the cause.
async fn rollback(txn: Box<dyn Transaction>, cause: Error) -> Vec<Error> {
    tracing::warn!("rolling back transaction: {}", cause);
    let mut errors = vec![cause];
    if let Err(err) = txn.rollback().await {
        errors.push(Error::Rollback(err));
    }
    errors
}

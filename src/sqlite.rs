use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, InterruptHandle};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::client::{ClientStat, DbClient, QueryResult, Transaction};
use crate::error::DbError;
use crate::value::Value;

/// SQLite client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteConfig {
    /// Path to the SQLite database file, or `:memory:`
    pub db_path: String,
}

impl SqliteConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }
}

const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    open: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// [`DbClient`] over a single SQLite connection.
///
/// Transactions hold the connection for their whole lifetime, so concurrent
/// callers queue on the connection lock rather than interleaving statements.
/// SQLite accepts `$n` placeholders and numbers them by first appearance,
/// which lines up with the positional arguments the executor binds.
#[derive(Debug, Clone)]
pub struct SqliteClient {
    conn: Arc<Mutex<Connection>>,
    counters: Arc<Counters>,
}

impl SqliteClient {
    pub fn open(config: &SqliteConfig) -> anyhow::Result<Self> {
        tracing::info!("opening sqlite database at path: {}", config.db_path);
        let conn = Connection::open(&config.db_path)
            .with_context(|| format!("failed to open sqlite database {}", config.db_path))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Runs `f` against the connection outside of any executor transaction.
    pub async fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let conn = self.conn.lock().await;
        Ok(f(&*conn)?)
    }
}

#[async_trait]
impl DbClient for SqliteClient {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN")?;
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SqliteTransaction {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Some(conn),
            pending: None,
            counters: self.counters.clone(),
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    fn stat(&self) -> ClientStat {
        ClientStat {
            total_transactions: self.counters.total.load(Ordering::Relaxed),
            open_transactions: self.counters.open.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
        }
    }
}

type Guard = OwnedMutexGuard<Connection>;

enum Outcome {
    Count(i64),
    Rows(QueryResult),
}

/// Statement running on the blocking pool. It owns the connection until it
/// returns.
type Pending = JoinHandle<(Guard, Result<Outcome, DbError>)>;

/// Interrupts the running statement unless disarmed, so a caller that stops
/// waiting does not leave the statement running to completion.
struct InterruptOnDrop<'a> {
    handle: &'a InterruptHandle,
    armed: bool,
}

impl Drop for InterruptOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("interrupting abandoned sqlite statement");
            self.handle.interrupt();
        }
    }
}

struct SqliteTransaction {
    /// `None` while a statement holds the connection on the blocking pool.
    conn: Option<Guard>,
    pending: Option<Pending>,
    interrupt: Arc<InterruptHandle>,
    counters: Arc<Counters>,
    finished: bool,
}

impl SqliteTransaction {
    /// Runs `f` on the blocking pool with the connection moved into it.
    async fn blocking(
        &mut self,
        f: impl FnOnce(&Connection) -> Result<Outcome, DbError> + Send + 'static,
    ) -> Result<Outcome, DbError> {
        let conn = self.reclaim().await?;
        let pending = self.pending.insert(tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        }));
        let mut on_drop = InterruptOnDrop {
            handle: &self.interrupt,
            armed: true,
        };
        let joined = pending.await;
        on_drop.armed = false;
        self.pending = None;
        let (conn, result) = joined.map_err(join_error)?;
        self.conn = Some(conn);
        result
    }

    /// Takes the connection back, interrupting a statement that was abandoned
    /// by an earlier call.
    async fn reclaim(&mut self) -> Result<Guard, DbError> {
        if let Some(conn) = self.conn.take() {
            return Ok(conn);
        }
        // Left in place until joined, so a caller that stops waiting here
        // still leaves the statement for the next call or for drop.
        let Some(pending) = self.pending.as_mut() else {
            return Err(DbError::driver("sqlite transaction has no connection"));
        };
        let conn = join_interrupted(pending, &self.interrupt).await;
        self.pending = None;
        conn
    }

    async fn finish(&mut self, stmt: &str) -> Result<(), DbError> {
        let conn = self.reclaim().await;
        self.finished = true;
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
        let conn = conn?;
        if stmt == "ROLLBACK" && conn.is_autocommit() {
            // An interrupted write already rolled the transaction back.
            return Ok(());
        }
        let result = conn.execute_batch(stmt);
        if result.is_err() && stmt == "COMMIT" && !conn.is_autocommit() {
            // A failed COMMIT can leave the transaction open on the shared connection.
            self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("rollback after failed {} failed: {}", stmt, err);
            }
        }
        Ok(result?)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<i64, DbError> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        let outcome = self
            .blocking(move |conn| exec_statement(conn, &sql, &args).map(Outcome::Count))
            .await?;
        match outcome {
            Outcome::Count(n) => Ok(n),
            Outcome::Rows(rows) => Ok(rows.len() as i64),
        }
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DbError> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        let outcome = self
            .blocking(move |conn| query_statement(conn, &sql, &args).map(Outcome::Rows))
            .await?;
        match outcome {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Count(_) => Err(DbError::driver("sqlite query returned a row count")),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.finish("COMMIT").await?;
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned mid-flight; never leave the shared connection inside a transaction.
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        if let Some(conn) = self.conn.take() {
            rollback_abandoned(&conn);
            return;
        }
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        self.interrupt.interrupt();
        let interrupt = self.interrupt.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match join_interrupted(&mut pending, &interrupt).await {
                        Ok(conn) => rollback_abandoned(&conn),
                        Err(err) => tracing::warn!("abandoned sqlite statement failed: {}", err),
                    }
                });
            }
            Err(err) => tracing::warn!("cannot roll back abandoned transaction: {}", err),
        }
    }
}

fn rollback_abandoned(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!("rollback of abandoned transaction failed: {}", err);
    }
}

/// Waits for an abandoned statement, interrupting it until it returns. An
/// interrupt that lands before the statement starts is lost, so it is retried.
async fn join_interrupted(
    pending: &mut Pending,
    interrupt: &InterruptHandle,
) -> Result<Guard, DbError> {
    loop {
        interrupt.interrupt();
        match tokio::time::timeout(INTERRUPT_RETRY, &mut *pending).await {
            Ok(joined) => return joined.map(|(conn, _)| conn).map_err(join_error),
            Err(_) => continue,
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> DbError {
    DbError::driver(format!("sqlite blocking task failed: {}", err))
}

fn exec_statement(conn: &Connection, sql: &str, args: &[Value]) -> Result<i64, DbError> {
    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() > 0 {
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut n = 0;
        while rows.next()?.is_some() {
            n += 1;
        }
        return Ok(n);
    }
    let affected = stmt.execute(params_from_iter(args.iter()))?;
    Ok(affected as i64)
}

fn query_statement(conn: &Connection, sql: &str, args: &[Value]) -> Result<QueryResult, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut result = QueryResult {
        columns,
        rows: Vec::new(),
    };
    while let Some(row) = rows.next()? {
        let values = (0..result.columns.len())
            .map(|i| row.get_ref(i).map(Value::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        result.rows.push(values);
    }
    Ok(result)
}

//! Database client seam.
//!
//! The executor only needs transactions that can run a statement with
//! positional arguments and then commit or roll back. Implementations are
//! expected to be safe to share between concurrent executor calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::value::Value;

/// Rows returned by a query, column names in select order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// Transaction counters reported by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStat {
    pub total_transactions: u64,
    pub open_transactions: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

#[async_trait]
pub trait DbClient: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    async fn ping(&self) -> Result<(), DbError>;

    fn stat(&self) -> ClientStat;
}

/// An open transaction. Consumed by `commit` or `rollback`.
#[async_trait]
pub trait Transaction: Send {
    /// Runs a statement and returns the affected-row count. Statements that
    /// return rows report the number of rows returned.
    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<i64, DbError>;

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

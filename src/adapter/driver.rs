//! The driver pool: the one external collaborator the core cannot do
//! without (spec.md §6). A [`Driver`] opens [`Connection`]s against a URL;
//! everything above this trait is dialect-agnostic.

use crate::error::OrmResult;
use crate::value::Value;

/// A single returned row, as ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default)]
pub struct Row(pub Vec<(String, Value)>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub enum ExecResult {
    RowsAffected(u64),
    Rows(Vec<Row>),
}

impl ExecResult {
    pub fn rows_affected(&self) -> u64 {
        match self {
            ExecResult::RowsAffected(n) => *n,
            ExecResult::Rows(r) => r.len() as u64,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            ExecResult::Rows(r) => r,
            ExecResult::RowsAffected(_) => Vec::new(),
        }
    }
}

/// A single, exclusively-owned connection to a database.
pub trait Connection: Send {
    fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<ExecResult>;
    fn begin(&mut self) -> OrmResult<()>;
    fn commit(&mut self) -> OrmResult<()>;
    fn rollback(&mut self) -> OrmResult<()>;
    fn prepare(&mut self, sql: &str) -> OrmResult<()>;
    fn ping(&mut self) -> OrmResult<()>;
}

/// Opens connections against a URL. Implemented by the embedding
/// application against whatever driver crate it links (postgres, mysql,
/// sqlite); the core ships only [`crate::testing::MockDriver`].
pub trait Driver: Send + Sync {
    fn open(&self, url: &str) -> OrmResult<Box<dyn Connection>>;
}

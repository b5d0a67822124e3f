use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Connection, Value};

pub mod introspect;
pub mod postgres;

/// SQL text plus its bound parameters. Values are never interpolated.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Placeholder for the next parameter pushed with `bind`.
    pub fn next_placeholder(&self) -> String {
        format!("${}", self.params.len() + 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub affected_rows: u64,
    /// More rows were available than `max_rows`.
    pub truncated: bool,
}

/// A live connection bound to exactly one PostgreSQL role.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn ping(&self) -> Result<()>;
    /// Runs one statement, keeping at most `max_rows` rows.
    async fn query(&self, statement: &Statement, max_rows: usize) -> Result<RowSet>;
    /// Runs every statement inside one transaction; any failure rolls the
    /// whole batch back. Returns the affected-row count per statement.
    async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>>;
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, connection: &Connection) -> Result<Arc<dyn DatabaseDriver>>;
}

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::db::{DatabaseDriver, RowSet, Statement};
use crate::error::{Result, WorkbenchError};
use crate::models::{QueryResult, Value};
use crate::sql::{split_statements, statement_keyword};

#[derive(Debug, Clone, Deserialize)]
pub struct PageRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub offset: i64,
    pub limit: i64,
    /// Already-quoted `ORDER BY` body applied to the outer page query.
    #[serde(skip)]
    pub order_by: Option<String>,
}

/// Runs SQL on a connection bound to one user, so PostgreSQL applies that
/// role's own privileges on top of ours.
pub struct QueryExecutor {
    driver: Arc<dyn DatabaseDriver>,
    hard_cap: usize,
    max_retries: u32,
    backoff: Duration,
}

impl QueryExecutor {
    pub fn new(driver: Arc<dyn DatabaseDriver>, hard_cap: usize) -> Self {
        Self {
            driver,
            hard_cap: hard_cap.max(1),
            max_retries: 0,
            backoff: Duration::from_millis(100),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }

    pub fn driver(&self) -> &Arc<dyn DatabaseDriver> {
        &self.driver
    }

    pub async fn execute_read(&self, sql: &str, params: &[Value], cancel: &CancelToken) -> Result<QueryResult> {
        let sql = single_statement(sql)?;
        self.run_statement(&sql, params, cancel).await
    }

    pub async fn execute_write(&self, sql: &str, params: &[Value], cancel: &CancelToken) -> Result<QueryResult> {
        let sql = single_statement(sql)?;
        let query_type = statement_keyword(&sql);
        let statement = Statement::with_params(sql, params.to_vec());
        match self.fetch(&statement, cancel).await {
            Ok(rows) => {
                let loaded = rows.rows.len() as u64;
                Ok(QueryResult {
                    columns: rows.columns,
                    rows: rows.rows,
                    total_rows: loaded,
                    loaded_rows: loaded,
                    success: true,
                    error_message: None,
                    affected_rows: rows.affected_rows,
                    query_type,
                })
            }
            Err(err) => fold_failure(query_type, err),
        }
    }

    /// Runs each statement of `text` in order and stops after the first
    /// failure, which is the last result returned.
    pub async fn execute_multiple(&self, text: &str, cancel: &CancelToken) -> Result<Vec<QueryResult>> {
        let statements = split_statements(text);
        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            let result = self.run_statement(&sql, &[], cancel).await?;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        debug!(statements = results.len(), "multi-statement run finished");
        Ok(results)
    }

    pub async fn execute_paged(&self, page: &PageRequest, cancel: &CancelToken) -> Result<QueryResult> {
        if page.limit <= 0 {
            return Err(WorkbenchError::InputInvalid(format!("limit must be positive, got {}", page.limit)));
        }
        if page.offset < 0 {
            return Err(WorkbenchError::InputInvalid(format!("offset must not be negative, got {}", page.offset)));
        }
        let inner = single_statement(&page.sql)?;
        let query_type = statement_keyword(&inner);
        let limit = page.limit.min(self.hard_cap as i64);

        let mut statement = Statement::with_params(String::new(), page.params.clone());
        let limit_at = statement.next_placeholder();
        statement = statement.bind(limit);
        let offset_at = statement.next_placeholder();
        statement = statement.bind(page.offset);
        let order = page
            .order_by
            .as_deref()
            .map(|clause| format!(" ORDER BY {clause}"))
            .unwrap_or_default();
        statement.sql = format!("SELECT * FROM (\n{inner}\n) AS _page{order} LIMIT {limit_at} OFFSET {offset_at}");

        let rows = match self.fetch(&statement, cancel).await {
            Ok(rows) => rows,
            Err(err) => return fold_failure(query_type, err),
        };
        let loaded = rows.rows.len() as u64;
        let fallback = page.offset as u64 + loaded;
        let total = self.count_or(&inner, &page.params, fallback, cancel).await?;

        Ok(QueryResult {
            columns: rows.columns,
            rows: rows.rows,
            total_rows: total.max(loaded),
            loaded_rows: loaded,
            success: true,
            error_message: None,
            affected_rows: rows.affected_rows,
            query_type,
        })
    }

    /// `SELECT COUNT(*)` over `sql` used as a subquery.
    pub async fn count_rows(&self, sql: &str, params: &[Value], cancel: &CancelToken) -> Result<u64> {
        let statement = Statement::with_params(format!("SELECT COUNT(*) FROM (\n{sql}\n) AS _count"), params.to_vec());
        let rows = self.fetch(&statement, cancel).await?;
        match rows.rows.first().and_then(|row| row.first()) {
            Some(Value::Int(n)) => Ok(u64::try_from(*n).unwrap_or(0)),
            Some(Value::Text(n)) => n
                .parse()
                .map_err(|_| WorkbenchError::Internal(format!("count returned {n:?}"))),
            other => Err(WorkbenchError::Internal(format!("count returned {other:?}"))),
        }
    }

    async fn run_statement(&self, sql: &str, params: &[Value], cancel: &CancelToken) -> Result<QueryResult> {
        let query_type = statement_keyword(sql);
        let statement = Statement::with_params(sql, params.to_vec());
        let rows = match self.fetch(&statement, cancel).await {
            Ok(rows) => rows,
            Err(err) => return fold_failure(query_type, err),
        };

        let loaded = rows.rows.len() as u64;
        let total = if rows.truncated {
            self.count_or(sql, params, loaded, cancel).await?
        } else {
            loaded
        };
        Ok(QueryResult {
            columns: rows.columns,
            rows: rows.rows,
            total_rows: total.max(loaded),
            loaded_rows: loaded,
            success: true,
            error_message: None,
            affected_rows: rows.affected_rows,
            query_type,
        })
    }

    async fn count_or(&self, sql: &str, params: &[Value], fallback: u64, cancel: &CancelToken) -> Result<u64> {
        match self.count_rows(sql, params, cancel).await {
            Ok(n) => Ok(n),
            Err(WorkbenchError::Cancelled) => Err(WorkbenchError::Cancelled),
            Err(err) => {
                warn!(error = %err, "row count unavailable");
                Ok(fallback)
            }
        }
    }

    async fn fetch(&self, statement: &Statement, cancel: &CancelToken) -> Result<RowSet> {
        let mut attempt = 0;
        loop {
            match cancel.run(self.driver.query(statement, self.hard_cap)).await {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "transient query failure, retrying");
                    let pause = self.backoff * attempt;
                    cancel
                        .run(async {
                            tokio::time::sleep(pause).await;
                            Ok(())
                        })
                        .await?;
                }
                other => return other,
            }
        }
    }
}

fn single_statement(sql: &str) -> Result<String> {
    let mut statements = split_statements(sql);
    match statements.len() {
        0 => Err(WorkbenchError::InputInvalid("empty statement".to_string())),
        1 => Ok(statements.remove(0)),
        _ => Err(WorkbenchError::MultiStatementForbidden),
    }
}

/// PostgreSQL errors become a failed result; everything else propagates.
fn fold_failure(query_type: String, err: WorkbenchError) -> Result<QueryResult> {
    match err {
        WorkbenchError::QueryFailed { message, .. } => Ok(QueryResult::failed(query_type, message)),
        other => Err(other),
    }
}

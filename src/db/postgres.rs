use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Either, Row, TypeInfo, ValueRef};
use tracing::{debug, warn};

use crate::db::{Connector, DatabaseDriver, RowSet, Statement};
use crate::error::{Result, WorkbenchError};
use crate::models::{Connection, SslMode, Value};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub fn connect_options(connection: &Connection) -> PgConnectOptions {
    let ssl_mode = match connection.ssl_mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    };
    PgConnectOptions::new()
        .host(&connection.host)
        .port(connection.port)
        .username(&connection.user)
        .password(&connection.password)
        .database(&connection.database)
        .ssl_mode(ssl_mode)
}

/// Connect-time failures: credential and catalog problems are authentication
/// failures, everything else is a transport problem worth retrying.
pub fn classify_connect_error(err: sqlx::Error) -> WorkbenchError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // insufficient_resources, cannot_connect_now
            Some(code) if code.starts_with("53") || code == "57P03" => {
                WorkbenchError::transient(db.message())
            }
            _ => WorkbenchError::AuthFailed(db.message().to_string()),
        },
        sqlx::Error::Configuration(e) => WorkbenchError::InputInvalid(e.to_string()),
        _ => WorkbenchError::transient(err.to_string()),
    }
}

pub async fn open_pool(
    connection: &Connection,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_with(connect_options(connection))
        .await
        .map_err(classify_connect_error)
}

pub struct PostgresDriver {
    pool: PgPool,
}

impl PostgresDriver {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(connection: &Connection, acquire_timeout: Duration) -> Result<Self> {
        // one connection per user request; never shared across roles
        let pool = open_pool(connection, 1, acquire_timeout).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn query(&self, statement: &Statement, max_rows: usize) -> Result<RowSet> {
        let mut out = RowSet::default();
        let query = bind_all(sqlx::query(&statement.sql), &statement.params);
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&self.pool);

        while let Some(result) = stream.next().await {
            match result? {
                Either::Left(done) => {
                    out.affected_rows += done.rows_affected();
                }
                Either::Right(row) => {
                    if out.columns.is_empty() {
                        out.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    if out.rows.len() >= max_rows {
                        out.truncated = true;
                        break;
                    }
                    out.rows.push((0..row.columns().len()).map(|i| decode_value(&row, i)).collect());
                }
            }
        }

        debug!(rows = out.rows.len(), truncated = out.truncated, "statement finished");
        Ok(out)
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>> {
        let mut tx = self.pool.begin().await?;
        let mut affected = Vec::with_capacity(statements.len());

        for statement in statements {
            let query = bind_all(sqlx::query(&statement.sql), &statement.params);
            match query.execute(&mut *tx).await {
                Ok(done) => affected.push(done.rows_affected()),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed statement also failed");
                    }
                    return Err(err.into());
                }
            }
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct PgConnector {
    acquire_timeout: Duration,
}

impl PgConnector {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self { acquire_timeout }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, connection: &Connection) -> Result<Arc<dyn DatabaseDriver>> {
        let driver = PostgresDriver::connect(connection, self.acquire_timeout).await?;
        Ok(Arc::new(driver))
    }
}

fn bind_all<'q>(mut query: PgQuery<'q>, params: &[Value]) -> PgQuery<'q> {
    for value in params {
        query = bind_value(query, value);
    }
    query
}

fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Bool(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Timestamp(v) => query.bind(*v),
        Value::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}

fn decode_value(row: &PgRow, index: usize) -> Value {
    let value_ref = match row.try_get_raw(index) {
        Ok(v) => v,
        Err(_) => return Value::Null,
    };

    if value_ref.is_null() {
        return Value::Null;
    }

    let type_info = value_ref.type_info();
    let type_name = type_info.name();

    match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool).unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(|v| Value::Int(i64::from(v)))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<i32, _>(index)
            .map(|v| Value::Int(i64::from(v)))
            .unwrap_or(Value::Null),
        "INT8" => row.try_get::<i64, _>(index).map(Value::Int).unwrap_or(Value::Null),
        "OID" => row
            .try_get::<sqlx::postgres::types::Oid, _>(index)
            .map(|v| Value::Int(i64::from(v.0)))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(|v| Value::Float(f64::from(v)))
            .unwrap_or(Value::Null),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::Float).unwrap_or(Value::Null),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "BPCHAR" => {
            row.try_get::<String, _>(index).map(Value::Text).unwrap_or(Value::Null)
        }
        "UUID" => row
            .try_get::<uuid::Uuid, _>(index)
            .map(|u| Value::Text(u.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|t| Value::Timestamp(t.and_utc()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|t| Value::Text(t.to_string()))
            .unwrap_or(Value::Null),
        "MONEY" => {
            // MONEY is a 64-bit count of cents; decode the raw bytes since
            // sqlx refuses MONEY -> i64.
            match value_ref.as_bytes() {
                Ok(bytes) if bytes.len() == 8 => {
                    let mut cents = [0u8; 8];
                    cents.copy_from_slice(bytes);
                    Value::Text(format_money(i64::from_be_bytes(cents)))
                }
                _ => Value::Text("<MONEY>".to_string()),
            }
        }
        "NUMERIC" => row
            .try_get::<BigDecimal, _>(index)
            .map(numeric_text)
            .unwrap_or(Value::Null),
        "INET" | "CIDR" => row
            .try_get::<ipnetwork::IpNetwork, _>(index)
            .map(|n| Value::Text(n.to_string()))
            .unwrap_or(Value::Null),
        "MACADDR" => row
            .try_get::<mac_address::MacAddress, _>(index)
            .map(|m| Value::Text(m.to_string()))
            .unwrap_or(Value::Null),
        "BYTEA" => row.try_get::<Vec<u8>, _>(index).map(Value::Bytes).unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(index)
            .map(Value::Json)
            .unwrap_or(Value::Null),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => json_array::<String>(row, index),
        "INT2[]" => json_array::<i16>(row, index),
        "INT4[]" => json_array::<i32>(row, index),
        "INT8[]" => json_array::<i64>(row, index),
        "FLOAT4[]" => json_array::<f32>(row, index),
        "FLOAT8[]" => json_array::<f64>(row, index),
        "BOOL[]" => json_array::<bool>(row, index),
        "JSON[]" | "JSONB[]" => json_array::<serde_json::Value>(row, index),
        _ => {
            if let Ok(s) = row.try_get::<String, _>(index) {
                return Value::Text(s);
            }
            // bypass type checks and read the wire text when it is UTF-8
            match value_ref.as_bytes().map(std::str::from_utf8) {
                Ok(Ok(s)) => Value::Text(s.to_string()),
                _ => Value::Text(format!("<{type_name}>")),
            }
        }
    }
}

fn json_array<T>(row: &PgRow, index: usize) -> Value
where
    T: serde::Serialize,
    Vec<T>: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    match row.try_get::<Vec<T>, _>(index) {
        Ok(items) => serde_json::to_value(items).map(Value::Json).unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}

/// NUMERIC keeps its declared scale.
fn numeric_text(value: BigDecimal) -> Value {
    Value::Text(value.to_string())
}

fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let magnitude = cents.unsigned_abs();
    format!("{sign}${}.{:02}", magnitude / 100, magnitude % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_renders_exactly() {
        let price: BigDecimal = "12.50".parse().unwrap();
        assert_eq!(numeric_text(price), Value::Text("12.50".into()));
        let refund: BigDecimal = "-0.05".parse().unwrap();
        assert_eq!(numeric_text(refund), Value::Text("-0.05".into()));
    }

    #[test]
    fn money_keeps_its_sign() {
        assert_eq!(format_money(-50), "-$0.50");
        assert_eq!(format_money(-1), "-$0.01");
        assert_eq!(format_money(-12_345), "-$123.45");
        assert_eq!(format_money(0), "$0.00");
        assert_eq!(format_money(7), "$0.07");
        assert_eq!(format_money(i64::MIN), "-$92233720368547758.08");
    }

    fn connection(ssl_mode: SslMode) -> Connection {
        Connection {
            host: "db.internal".into(),
            port: 6543,
            database: "testdb".into(),
            user: "alice".into(),
            password: "s3cret".into(),
            ssl_mode,
        }
    }

    #[test]
    fn connect_options_carry_every_field() {
        let opts = connect_options(&connection(SslMode::Require));
        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_username(), "alice");
        assert_eq!(opts.get_database(), Some("testdb"));
        assert!(matches!(opts.get_ssl_mode(), PgSslMode::Require));
    }

    #[test]
    fn transport_errors_are_transient() {
        let err = classify_connect_error(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }
}

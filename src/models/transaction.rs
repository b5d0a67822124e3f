use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{TableRef, Value};
use crate::error::WorkbenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TransactionId {
    type Err = WorkbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| WorkbenchError::InputInvalid(format!("bad transaction id: {s}")))
    }
}

/// One cell change. `row_index` is the caller's key for the row, normally
/// the primary-key value rendered as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEdit {
    pub row_index: String,
    pub column: String,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowInsert {
    pub values: BTreeMap<String, Value>,
}

impl RowInsert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEdit {
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    /// Flush in progress; buffers are frozen.
    Committing,
    Committed,
    RolledBack,
    Expired,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    pub id: TransactionId,
    pub username: String,
    pub database: String,
    pub table: TableRef,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TransactionStatus,
    /// row -> column -> edit
    pub pending_edits: BTreeMap<String, BTreeMap<String, CellEdit>>,
    /// Insertion ordered, without duplicates.
    pub pending_deletes: Vec<String>,
    pub pending_inserts: Vec<RowInsert>,
    pub last_error: Option<String>,
}

impl TransactionState {
    pub fn new(
        username: &str,
        database: &str,
        table: TableRef,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            username: username.to_string(),
            database: database.to_string(),
            table,
            started_at,
            expires_at,
            status: TransactionStatus::Active,
            pending_edits: BTreeMap::new(),
            pending_deletes: Vec::new(),
            pending_inserts: Vec::new(),
            last_error: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.status == TransactionStatus::RolledBack
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Holds the per-user slot: neither finished nor past its lease.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::Committing
        ) && !self.is_expired_at(now)
    }

    /// Copy with the lease applied to the reported status.
    pub fn observed_at(&self, now: DateTime<Utc>) -> Self {
        let mut seen = self.clone();
        if seen.status == TransactionStatus::Active && seen.is_expired_at(now) {
            seen.status = TransactionStatus::Expired;
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.pending_edits.is_empty() && self.pending_deletes.is_empty() && self.pending_inserts.is_empty()
    }

    /// Repeated edits of one cell keep the first `old_value` and the last
    /// `new_value`.
    pub fn record_edit(&mut self, edit: RowEdit) {
        let row = self.pending_edits.entry(edit.row_index).or_default();
        match row.get_mut(&edit.column) {
            Some(cell) => cell.new_value = edit.new_value,
            None => {
                row.insert(
                    edit.column,
                    CellEdit {
                        old_value: edit.old_value,
                        new_value: edit.new_value,
                    },
                );
            }
        }
    }

    pub fn record_delete(&mut self, row_index: String) {
        if !self.pending_deletes.contains(&row_index) {
            self.pending_deletes.push(row_index);
        }
    }

    pub fn record_insert(&mut self, insert: RowInsert) {
        self.pending_inserts.push(insert);
    }

    /// Flat view of the edit buffer in (row, column) order.
    pub fn edits(&self) -> Vec<RowEdit> {
        self.pending_edits
            .iter()
            .flat_map(|(row, cells)| {
                cells.iter().map(move |(column, cell)| RowEdit {
                    row_index: row.clone(),
                    column: column.clone(),
                    old_value: cell.old_value.clone(),
                    new_value: cell.new_value.clone(),
                })
            })
            .collect()
    }
}

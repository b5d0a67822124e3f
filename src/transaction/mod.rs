use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::db::DatabaseDriver;
use crate::error::{Result, WorkbenchError};
use crate::models::{
    RowEdit, RowInsert, TableMetadata, TableRef, TransactionId, TransactionState, TransactionStatus,
};

pub mod flush;

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub state: TransactionState,
    /// Per statement, in flush order.
    pub affected_rows: Vec<u64>,
    pub error: Option<WorkbenchError>,
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
struct Registry {
    by_id: HashMap<TransactionId, TransactionState>,
    /// Latest transaction started by each user.
    by_user: HashMap<String, TransactionId>,
}

impl Registry {
    fn owned_mut(&mut self, username: &str, id: TransactionId) -> Result<&mut TransactionState> {
        match self.by_id.get_mut(&id) {
            Some(state) if state.username == username => Ok(state),
            // another user's id is indistinguishable from an unknown one
            _ => Err(WorkbenchError::NotFound(format!("transaction {id}"))),
        }
    }

    fn remove(&mut self, id: TransactionId) {
        if let Some(state) = self.by_id.remove(&id) {
            if self.by_user.get(&state.username) == Some(&id) {
                self.by_user.remove(&state.username);
            }
        }
    }
}

/// Rolls a `Committing` state back if the commit future is dropped before
/// it reaches `finish`.
struct CommitGuard<'a> {
    registry: &'a Mutex<Registry>,
    id: TransactionId,
    armed: bool,
}

impl CommitGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        if let Some(state) = registry.by_id.get_mut(&self.id) {
            if state.status == TransactionStatus::Committing {
                state.status = TransactionStatus::RolledBack;
                state.last_error = Some(WorkbenchError::Cancelled.to_string());
                warn!(username = %state.username, txn = %self.id, "commit abandoned mid-flight");
            }
        }
    }
}

/// Per-user staging areas for table edits, flushed as one PostgreSQL
/// transaction on commit.
pub struct TransactionEngine {
    clock: Arc<dyn Clock>,
    lease: Duration,
    registry: Mutex<Registry>,
}

impl TransactionEngine {
    pub fn new(clock: Arc<dyn Clock>, lease_seconds: u64) -> Self {
        Self {
            clock,
            lease: Duration::seconds(i64::try_from(lease_seconds).unwrap_or(i64::MAX / 1_000)),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn start(&self, username: &str, database: &str, table: TableRef) -> Result<TransactionState> {
        let now = self.clock.now();
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;

        if let Some(current) = registry.by_user.get(username).and_then(|id| registry.by_id.get(id)) {
            if current.is_live_at(now) {
                return Err(WorkbenchError::Conflict(format!(
                    "{username} already has transaction {} open",
                    current.id
                )));
            }
        }

        let state = TransactionState::new(username, database, table, now, now + self.lease);
        registry.by_user.insert(username.to_string(), state.id);
        registry.by_id.insert(state.id, state.clone());
        info!(username, txn = %state.id, table = %state.table, "transaction started");
        Ok(state)
    }

    pub fn get(&self, username: &str, id: TransactionId) -> Result<TransactionState> {
        let now = self.clock.now();
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        Ok(registry.owned_mut(username, id)?.observed_at(now))
    }

    /// The user's latest transaction, if any.
    pub fn status_for(&self, username: &str) -> Result<Option<TransactionState>> {
        let now = self.clock.now();
        let registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        Ok(registry
            .by_user
            .get(username)
            .and_then(|id| registry.by_id.get(id))
            .map(|state| state.observed_at(now)))
    }

    fn with_active<T>(
        &self,
        username: &str,
        id: TransactionId,
        f: impl FnOnce(&mut TransactionState) -> T,
    ) -> Result<(T, TransactionState)> {
        let now = self.clock.now();
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        let state = registry.owned_mut(username, id)?;
        match state.status {
            TransactionStatus::Active if state.is_expired_at(now) => {
                Err(WorkbenchError::TransactionExpired(id.to_string()))
            }
            TransactionStatus::Active => {
                let out = f(state);
                Ok((out, state.clone()))
            }
            TransactionStatus::Expired => Err(WorkbenchError::TransactionExpired(id.to_string())),
            status => Err(WorkbenchError::Conflict(format!("transaction {id} is {status:?}"))),
        }
    }

    pub fn buffer_edit(&self, username: &str, id: TransactionId, edit: RowEdit) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.record_edit(edit)).map(|(_, s)| s)
    }

    pub fn buffer_delete(&self, username: &str, id: TransactionId, row_index: String) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.record_delete(row_index)).map(|(_, s)| s)
    }

    pub fn buffer_insert(&self, username: &str, id: TransactionId, insert: RowInsert) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.record_insert(insert)).map(|(_, s)| s)
    }

    pub fn edits(&self, username: &str, id: TransactionId) -> Result<Vec<RowEdit>> {
        Ok(self.get(username, id)?.edits())
    }

    pub fn deletes(&self, username: &str, id: TransactionId) -> Result<Vec<String>> {
        Ok(self.get(username, id)?.pending_deletes)
    }

    pub fn inserts(&self, username: &str, id: TransactionId) -> Result<Vec<RowInsert>> {
        Ok(self.get(username, id)?.pending_inserts)
    }

    pub fn clear_edits(&self, username: &str, id: TransactionId) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.pending_edits.clear()).map(|(_, s)| s)
    }

    pub fn clear_deletes(&self, username: &str, id: TransactionId) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.pending_deletes.clear()).map(|(_, s)| s)
    }

    pub fn clear_inserts(&self, username: &str, id: TransactionId) -> Result<TransactionState> {
        self.with_active(username, id, |state| state.pending_inserts.clear()).map(|(_, s)| s)
    }

    /// Discards every buffer. Allowed after the lease ran out.
    pub fn rollback(&self, username: &str, id: TransactionId) -> Result<TransactionState> {
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        let state = registry.owned_mut(username, id)?;
        if state.status != TransactionStatus::Active {
            return Err(WorkbenchError::Conflict(format!("transaction {id} is {:?}", state.status)));
        }
        state.pending_edits.clear();
        state.pending_deletes.clear();
        state.pending_inserts.clear();
        state.status = TransactionStatus::RolledBack;
        info!(username, txn = %id, "transaction rolled back");
        Ok(state.clone())
    }

    /// Flushes the buffers through `driver` inside one database transaction.
    ///
    /// The registry lock is released while statements run; the state sits in
    /// `Committing` meanwhile, which freezes its buffers. PostgreSQL failures
    /// leave the state rolled back and are reported in the outcome, while
    /// cancellation is returned as an error after the same bookkeeping.
    /// Dropping the returned future mid-flight also rolls the state back.
    pub async fn commit(
        &self,
        username: &str,
        id: TransactionId,
        table: &TableMetadata,
        driver: &dyn DatabaseDriver,
        cancel: &CancelToken,
    ) -> Result<CommitOutcome> {
        let ((), snapshot) = self.with_active(username, id, |state| {
            state.status = TransactionStatus::Committing;
        })?;
        let mut guard = CommitGuard {
            registry: &self.registry,
            id,
            armed: true,
        };

        if snapshot.is_empty() {
            guard.disarm();
            let state = self.finish(id, Ok(()))?;
            debug!(username, txn = %id, "empty transaction committed");
            return Ok(CommitOutcome {
                state,
                affected_rows: Vec::new(),
                error: None,
            });
        }

        let result = match flush::plan(&snapshot, table) {
            Ok(statements) => cancel.run(driver.transaction(&statements)).await,
            Err(err) => Err(err),
        };
        guard.disarm();

        match result {
            Ok(affected_rows) => {
                let state = self.finish(id, Ok(()))?;
                info!(username, txn = %id, statements = affected_rows.len(), "transaction committed");
                Ok(CommitOutcome {
                    state,
                    affected_rows,
                    error: None,
                })
            }
            Err(err) => {
                warn!(username, txn = %id, error = %err, "transaction commit failed");
                let state = self.finish(id, Err(&err))?;
                if err == WorkbenchError::Cancelled {
                    return Err(err);
                }
                Ok(CommitOutcome {
                    state,
                    affected_rows: Vec::new(),
                    error: Some(err),
                })
            }
        }
    }

    fn finish(&self, id: TransactionId, result: std::result::Result<(), &WorkbenchError>) -> Result<TransactionState> {
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        let state = registry
            .by_id
            .get_mut(&id)
            .ok_or_else(|| WorkbenchError::Internal(format!("transaction {id} vanished while committing")))?;
        match result {
            Ok(()) => state.status = TransactionStatus::Committed,
            Err(err) => {
                state.status = TransactionStatus::RolledBack;
                state.last_error = Some(err.to_string());
            }
        }
        Ok(state.clone())
    }

    /// Prunes finished and expired transactions. A `Committing` state gets
    /// one extra lease past its expiry before it counts as abandoned.
    /// Candidates are collected under one lock and removed one lock at a time.
    pub fn invalidate_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let lease = self.lease;
        let prunable = |state: &TransactionState| match state.status {
            TransactionStatus::Committing => state.expires_at + lease <= now,
            status => status.is_terminal() || state.is_expired_at(now),
        };

        let candidates: Vec<TransactionId> = {
            let registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
            registry
                .by_id
                .values()
                .filter(|&state| prunable(state))
                .map(|state| state.id)
                .collect()
        };

        let mut removed = 0;
        for id in candidates {
            let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
            if registry.by_id.get(&id).is_some_and(|state| prunable(state)) {
                registry.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "transactions pruned");
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.registry.lock().map_err(WorkbenchError::poisoned)?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut registry = self.registry.lock().map_err(WorkbenchError::poisoned)?;
        registry.by_id.clear();
        registry.by_user.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{RowSet, Statement};
    use crate::models::{ColumnMetadata, Value};

    #[derive(Default)]
    struct RecordingDriver {
        fail: bool,
        batches: StdMutex<Vec<Vec<Statement>>>,
    }

    #[async_trait]
    impl DatabaseDriver for RecordingDriver {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn query(&self, _statement: &Statement, _max_rows: usize) -> Result<RowSet> {
            Ok(RowSet::default())
        }

        async fn transaction(&self, statements: &[Statement]) -> Result<Vec<u64>> {
            self.batches.lock().unwrap().push(statements.to_vec());
            if self.fail {
                return Err(WorkbenchError::query_failed("duplicate key value violates unique constraint"));
            }
            Ok(vec![1; statements.len()])
        }

        async fn close(&self) {}
    }

    fn engine() -> (Arc<ManualClock>, TransactionEngine) {
        let clock = Arc::new(ManualClock::starting_now());
        (clock.clone(), TransactionEngine::new(clock, 300))
    }

    fn users() -> TableMetadata {
        TableMetadata {
            schema: "public".into(),
            name: "users".into(),
            columns: vec![
                ColumnMetadata {
                    name: "id".into(),
                    sql_type: "integer".into(),
                    nullable: false,
                    is_primary: true,
                },
                ColumnMetadata {
                    name: "name".into(),
                    sql_type: "text".into(),
                    nullable: true,
                    is_primary: false,
                },
            ],
            primary_keys: vec!["id".into()],
            foreign_keys: Vec::new(),
        }
    }

    fn rename(row: &str, old: &str, new: &str) -> RowEdit {
        RowEdit {
            row_index: row.into(),
            column: "name".into(),
            old_value: old.into(),
            new_value: new.into(),
        }
    }

    fn users_ref() -> TableRef {
        TableRef::new("public", "users")
    }

    #[test]
    fn one_live_transaction_per_user() {
        let (_clock, engine) = engine();
        let first = engine.start("alice", "testdb", users_ref()).unwrap();
        assert!(matches!(
            engine.start("alice", "testdb", users_ref()),
            Err(WorkbenchError::Conflict(_))
        ));
        assert!(engine.start("bob", "testdb", users_ref()).is_ok());

        engine.rollback("alice", first.id).unwrap();
        assert!(engine.start("alice", "testdb", users_ref()).is_ok());
    }

    #[test]
    fn users_cannot_see_each_other() {
        let (_clock, engine) = engine();
        let a = engine.start("alice", "testdb", users_ref()).unwrap();
        let b = engine.start("bob", "testdb", users_ref()).unwrap();
        engine.buffer_edit("alice", a.id, rename("1", "Alice", "Alicia")).unwrap();
        engine.buffer_edit("bob", b.id, rename("2", "Bob", "Robert")).unwrap();

        assert!(matches!(engine.get("bob", a.id), Err(WorkbenchError::NotFound(_))));
        assert!(matches!(
            engine.buffer_delete("bob", a.id, "1".into()),
            Err(WorkbenchError::NotFound(_))
        ));
        let alice_edits = engine.edits("alice", a.id).unwrap();
        assert_eq!(alice_edits.len(), 1);
        assert_eq!(alice_edits[0].row_index, "1");
    }

    #[test]
    fn expiry_blocks_buffering_and_sweep_prunes() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = TransactionEngine::new(clock.clone(), 5);
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();

        clock.advance_seconds(6);
        assert!(matches!(
            engine.buffer_edit("alice", txn.id, rename("1", "Alice", "Alicia")),
            Err(WorkbenchError::TransactionExpired(_))
        ));
        assert_eq!(engine.get("alice", txn.id).unwrap().status, TransactionStatus::Expired);
        // an expired transaction no longer holds the user's slot
        assert!(engine.start("alice", "testdb", users_ref()).is_ok());

        assert_eq!(engine.invalidate_expired().unwrap(), 1);
        assert!(engine.get("alice", txn.id).is_err());
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn clearers_touch_one_bucket() {
        let (_clock, engine) = engine();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine.buffer_edit("alice", txn.id, rename("1", "Alice", "Alicia")).unwrap();
        engine.buffer_delete("alice", txn.id, "2".into()).unwrap();
        engine
            .buffer_insert("alice", txn.id, RowInsert::new().with("name", "Eve"))
            .unwrap();
        engine
            .buffer_insert("alice", txn.id, RowInsert::new().with("name", "Frank"))
            .unwrap();

        let state = engine.clear_deletes("alice", txn.id).unwrap();
        assert!(state.pending_deletes.is_empty());
        assert_eq!(state.edits().len(), 1);
        let inserts = engine.inserts("alice", txn.id).unwrap();
        assert_eq!(inserts[0].values["name"], Value::from("Eve"));
        assert_eq!(inserts[1].values["name"], Value::from("Frank"));

        engine.clear_edits("alice", txn.id).unwrap();
        engine.clear_inserts("alice", txn.id).unwrap();
        assert!(engine.get("alice", txn.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_flushes_once_and_is_terminal() {
        let (_clock, engine) = engine();
        let driver = RecordingDriver::default();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine.buffer_edit("alice", txn.id, rename("1", "Alice", "Alicia")).unwrap();

        let outcome = engine
            .commit("alice", txn.id, &users(), &driver, &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(outcome.state.is_committed());
        assert_eq!(outcome.affected_rows, vec![1]);
        let batches = driver.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0][0].sql,
            r#"UPDATE "public"."users" SET "name" = $1::text WHERE "id" = $2::integer"#
        );

        assert!(matches!(
            engine.buffer_edit("alice", txn.id, rename("1", "Alicia", "Al")),
            Err(WorkbenchError::Conflict(_))
        ));
        assert!(engine.rollback("alice", txn.id).is_err());
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_with_error() {
        let (_clock, engine) = engine();
        let driver = RecordingDriver {
            fail: true,
            ..RecordingDriver::default()
        };
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine
            .buffer_insert("alice", txn.id, RowInsert::new().with("id", 1_i64))
            .unwrap();

        let outcome = engine
            .commit("alice", txn.id, &users(), &driver, &CancelToken::new())
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert!(outcome.state.is_rolled_back());
        assert_eq!(
            outcome.state.last_error.as_deref(),
            Some("query failed: duplicate key value violates unique constraint")
        );
    }

    #[tokio::test]
    async fn empty_commit_skips_the_database() {
        let (_clock, engine) = engine();
        let driver = RecordingDriver::default();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        let outcome = engine
            .commit("alice", txn.id, &users(), &driver, &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.state.is_committed());
        assert!(driver.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_commit_is_rolled_back() {
        let (_clock, engine) = engine();
        let driver = RecordingDriver::default();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine.buffer_delete("alice", txn.id, "1".into()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            engine.commit("alice", txn.id, &users(), &driver, &cancel).await.unwrap_err(),
            WorkbenchError::Cancelled
        );
        assert!(engine.get("alice", txn.id).unwrap().is_rolled_back());
        assert!(driver.batches.lock().unwrap().is_empty());
    }

    struct HangingDriver;

    #[async_trait]
    impl DatabaseDriver for HangingDriver {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn query(&self, _statement: &Statement, _max_rows: usize) -> Result<RowSet> {
            Ok(RowSet::default())
        }

        async fn transaction(&self, _statements: &[Statement]) -> Result<Vec<u64>> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn dropped_commit_rolls_back_and_is_pruned() {
        let (clock, engine) = engine();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine.buffer_edit("alice", txn.id, rename("1", "Alice", "Alicia")).unwrap();

        let table = users();
        let cancel = CancelToken::new();
        let commit = engine.commit("alice", txn.id, &table, &HangingDriver, &cancel);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), commit)
            .await
            .is_err());

        let state = engine.get("alice", txn.id).unwrap();
        assert!(state.is_rolled_back());
        assert_eq!(state.last_error.as_deref(), Some(WorkbenchError::Cancelled.to_string().as_str()));
        assert!(engine.start("alice", "testdb", users_ref()).is_ok());

        clock.advance_seconds(3600);
        assert_eq!(engine.invalidate_expired().unwrap(), 2);
        assert!(engine.is_empty().unwrap());
    }

    #[test]
    fn stuck_commit_is_pruned_after_a_grace_lease() {
        let (clock, engine) = engine();
        let txn = engine.start("alice", "testdb", users_ref()).unwrap();
        engine
            .with_active("alice", txn.id, |state| state.status = TransactionStatus::Committing)
            .unwrap();

        clock.advance_seconds(301);
        assert_eq!(engine.invalidate_expired().unwrap(), 0);
        clock.advance_seconds(300);
        assert_eq!(engine.invalidate_expired().unwrap(), 1);
        assert!(engine.get("alice", txn.id).is_err());
    }
}

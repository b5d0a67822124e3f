use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::access::AccessControl;
use crate::cache::{Cache, MemoryCache};
use crate::cancel::CancelToken;
use crate::cipher::Cipher;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::{CredentialService, LoginOutcome, LoginRequest, Principal};
use crate::db::introspect::{Introspector, PgIntrospector};
use crate::db::postgres::PgConnector;
use crate::db::{Connector, DatabaseDriver};
use crate::error::{Result, WorkbenchError};
use crate::metadata::{CachedMetadata, MetadataCache};
use crate::models::{
    Privilege, QueryResult, RoleMetadata, RowEdit, RowInsert, TableMetadata, TableRef, TransactionId,
    TransactionState, TransactionStatus, Value,
};
use crate::query::{PageRequest, QueryExecutor};
use crate::session::cookie::SessionCookie;
use crate::session::{MemorySessionStore, SessionPolicy, SessionStore};
use crate::sql::{is_single_statement, qualified_name, quote_ident, split_statements};
use crate::transaction::flush::decode_row_key;
use crate::transaction::{CommitOutcome, TransactionEngine};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortDirection::Asc),
            "DESC" => Ok(SortDirection::Desc),
            _ => Err(WorkbenchError::InputInvalid(format!("unknown sort direction {raw:?}"))),
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablePageRequest {
    pub database: String,
    pub schema: String,
    pub table: String,
    #[serde(default, rename = "where")]
    pub filter: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_dir: Option<String>,
    #[serde(default)]
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub database: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Single(QueryResult),
    Multiple(Vec<QueryResult>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartTransactionRequest {
    pub database: String,
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub transactions: usize,
    pub metadata: usize,
}

/// The process-wide stores and the operations bound on top of them.
pub struct Workbench {
    config: Config,
    clock: Arc<dyn Clock>,
    cipher: Arc<Cipher>,
    connector: Arc<dyn Connector>,
    sessions: Arc<dyn SessionStore>,
    metadata: Arc<MetadataCache>,
    access: AccessControl,
    credentials: CredentialService,
    transactions: TransactionEngine,
    shutdown: CancelToken,
}

impl Workbench {
    /// Wires the in-memory stores around the given database seams.
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn Connector>,
        introspector: Arc<dyn Introspector>,
    ) -> Result<Self> {
        config.validate()?;
        let base = config.introspection_connection()?;
        let cipher = Arc::new(Cipher::new(&config.cipher_key, &config.mac_key)?);

        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(clock.clone()));
        let metadata_store: Arc<dyn Cache<CachedMetadata>> = Arc::new(MemoryCache::new(clock.clone()));
        let metadata = Arc::new(MetadataCache::new(metadata_store, introspector, config.metadata_ttl));
        let policy = SessionPolicy {
            short_ttl: config.session_short_ttl,
            long_ttl: config.session_long_ttl,
        };
        let credentials = CredentialService::new(
            base,
            connector.clone(),
            cipher.clone(),
            sessions.clone(),
            metadata.clone(),
            clock.clone(),
            policy,
        );

        Ok(Self {
            access: AccessControl::new(metadata.clone()),
            transactions: TransactionEngine::new(clock.clone(), config.transaction_lease),
            config,
            clock,
            cipher,
            connector,
            sessions,
            metadata,
            credentials,
            shutdown: CancelToken::new(),
        })
    }

    /// Production wiring: system clock, sqlx connections, catalog
    /// introspection through `INTROSPECTION_DSN`.
    pub fn connect(config: Config) -> Result<Self> {
        let introspector = Arc::new(PgIntrospector::new(config.introspection_connection()?));
        Self::new(
            config,
            Arc::new(SystemClock::new()),
            Arc::new(PgConnector::default()),
            introspector,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn transactions(&self) -> &TransactionEngine {
        &self.transactions
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub async fn login(&self, request: &LoginRequest, cancel: &CancelToken) -> Result<LoginOutcome> {
        self.credentials.login(request, cancel).await
    }

    /// Ends the session the cookie belongs to. Once the user's last session
    /// is gone, any transaction they left open is rolled back.
    pub async fn logout(&self, cookie: &SessionCookie) -> Result<()> {
        let principal = self.credentials.authenticate(cookie).await?;
        self.credentials.logout(&principal.session.id).await?;
        if !self.credentials.has_live_session(principal.username()).await? {
            if let Some(state) = self.transactions.status_for(principal.username())? {
                if state.status == TransactionStatus::Active {
                    self.transactions.rollback(principal.username(), state.id)?;
                }
            }
        }
        info!(username = %principal.username(), "logged out");
        Ok(())
    }

    pub async fn authenticate(&self, cookie: &SessionCookie) -> Result<Principal> {
        self.credentials.authenticate(cookie).await
    }

    pub async fn resources(&self, principal: &Principal) -> Result<Arc<RoleMetadata>> {
        self.metadata.load_role(principal.role()).await
    }

    async fn open(&self, principal: &Principal, database: &str, cancel: &CancelToken) -> Result<Arc<dyn DatabaseDriver>> {
        cancel.run(self.connector.connect(&principal.connection_to(database))).await
    }

    fn executor(&self, driver: Arc<dyn DatabaseDriver>) -> QueryExecutor {
        QueryExecutor::new(driver, self.config.query_row_hard_cap).with_retries(self.config.query_retries, RETRY_BACKOFF)
    }

    pub async fn read_table_page(
        &self,
        principal: &Principal,
        request: &TablePageRequest,
        cancel: &CancelToken,
    ) -> Result<QueryResult> {
        if request.limit <= 0 {
            return Err(WorkbenchError::InputInvalid(format!("limit must be positive, got {}", request.limit)));
        }
        let direction = request
            .order_dir
            .as_deref()
            .map(SortDirection::parse)
            .transpose()?
            .unwrap_or_default();
        self.access
            .require(principal.role(), Privilege::Select, &request.database, &request.schema, &request.table)
            .await?;
        let table = self.metadata.table(&request.database, &request.schema, &request.table).await?;

        let mut sql = format!("SELECT * FROM {}", qualified_name(&table.schema, &table.name));
        if let Some(filter) = request.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            if !is_single_statement(&format!("SELECT 1 WHERE {filter}")) {
                return Err(WorkbenchError::MultiStatementForbidden);
            }
            sql.push_str(&format!(" WHERE ({filter}\n)"));
        }
        let order_by = match request.order_by.as_deref().filter(|c| !c.is_empty()) {
            Some(column) if !table.has_column(column) => {
                return Err(WorkbenchError::InputInvalid(format!(
                    "cannot order by {column:?}: no such column on {}",
                    table.table_ref()
                )));
            }
            Some(column) => Some(format!("{} {}", quote_ident(column), direction.as_sql())),
            None => None,
        };

        let page = PageRequest {
            sql,
            params: Vec::new(),
            offset: request.offset,
            limit: request.limit,
            order_by,
        };
        let driver = self.open(principal, &request.database, cancel).await?;
        let result = self.executor(driver.clone()).execute_paged(&page, cancel).await;
        driver.close().await;
        result
    }

    /// One statement runs alone with its parameters; a batch runs statement
    /// by statement and cannot take parameters.
    pub async fn execute_query(
        &self,
        principal: &Principal,
        request: &QueryRequest,
        cancel: &CancelToken,
    ) -> Result<QueryResponse> {
        self.access.require_connect(principal.role(), &request.database).await?;
        let statements = split_statements(&request.sql);
        if statements.is_empty() {
            return Err(WorkbenchError::InputInvalid("empty query".to_string()));
        }
        if statements.len() > 1 && !request.params.is_empty() {
            return Err(WorkbenchError::MultiStatementForbidden);
        }

        let driver = self.open(principal, &request.database, cancel).await?;
        let executor = self.executor(driver.clone());
        let result = if statements.len() > 1 {
            executor.execute_multiple(&request.sql, cancel).await.map(QueryResponse::Multiple)
        } else {
            executor
                .execute_read(&request.sql, &request.params, cancel)
                .await
                .map(QueryResponse::Single)
        };
        driver.close().await;
        result
    }

    pub async fn start_transaction(
        &self,
        principal: &Principal,
        request: &StartTransactionRequest,
    ) -> Result<TransactionState> {
        let role = principal.role();
        let (db, schema, name) = (&request.database, &request.schema, &request.table);
        self.access.require(role, Privilege::Select, db, schema, name).await?;
        let mut writable = false;
        for privilege in [Privilege::Insert, Privilege::Update, Privilege::Delete] {
            writable |= self.access.can(role, privilege, db, schema, name).await?;
        }
        if !writable {
            return Err(WorkbenchError::PermissionDenied {
                role: role.to_string(),
                privilege: Privilege::Update,
                resource: format!("{db}.{schema}.{name}"),
            });
        }
        self.metadata.table(db, schema, name).await?;
        self.transactions
            .start(principal.username(), db, TableRef::new(schema.as_str(), name.as_str()))
    }

    async fn owned_table(&self, principal: &Principal, id: TransactionId) -> Result<(TransactionState, TableMetadata)> {
        let state = self.transactions.get(principal.username(), id)?;
        let table = self
            .metadata
            .table(&state.database, &state.table.schema, &state.table.name)
            .await?;
        Ok((state, table))
    }

    async fn require_on(&self, principal: &Principal, state: &TransactionState, privilege: Privilege) -> Result<()> {
        self.access
            .require(principal.role(), privilege, &state.database, &state.table.schema, &state.table.name)
            .await
    }

    pub async fn buffer_edit(&self, principal: &Principal, id: TransactionId, edit: RowEdit) -> Result<TransactionState> {
        let (state, table) = self.owned_table(principal, id).await?;
        self.require_on(principal, &state, Privilege::Update).await?;
        require_columns(&table, std::iter::once(edit.column.as_str()))?;
        self.transactions.buffer_edit(principal.username(), id, edit)
    }

    pub async fn buffer_delete(&self, principal: &Principal, id: TransactionId, row_index: String) -> Result<TransactionState> {
        let (state, table) = self.owned_table(principal, id).await?;
        self.require_on(principal, &state, Privilege::Delete).await?;
        decode_row_key(&table, &row_index)?;
        self.transactions.buffer_delete(principal.username(), id, row_index)
    }

    pub async fn buffer_insert(&self, principal: &Principal, id: TransactionId, insert: RowInsert) -> Result<TransactionState> {
        let (state, table) = self.owned_table(principal, id).await?;
        self.require_on(principal, &state, Privilege::Insert).await?;
        require_columns(&table, insert.values.keys().map(String::as_str))?;
        self.transactions.buffer_insert(principal.username(), id, insert)
    }

    pub fn transaction(&self, principal: &Principal, id: TransactionId) -> Result<TransactionState> {
        self.transactions.get(principal.username(), id)
    }

    pub fn transaction_status(&self, principal: &Principal) -> Result<Option<TransactionState>> {
        self.transactions.status_for(principal.username())
    }

    pub async fn commit(&self, principal: &Principal, id: TransactionId, cancel: &CancelToken) -> Result<CommitOutcome> {
        let (state, table) = self.owned_table(principal, id).await?;
        if !state.pending_inserts.is_empty() {
            self.require_on(principal, &state, Privilege::Insert).await?;
        }
        if !state.pending_edits.is_empty() {
            self.require_on(principal, &state, Privilege::Update).await?;
        }
        if !state.pending_deletes.is_empty() {
            self.require_on(principal, &state, Privilege::Delete).await?;
        }

        let driver = self.open(principal, &state.database, cancel).await?;
        let outcome = self
            .transactions
            .commit(principal.username(), id, &table, driver.as_ref(), cancel)
            .await;
        driver.close().await;
        outcome
    }

    pub fn rollback(&self, principal: &Principal, id: TransactionId) -> Result<TransactionState> {
        self.transactions.rollback(principal.username(), id)
    }

    /// Re-reads role metadata. Refreshing a role other than one's own
    /// requires superuser.
    pub async fn refresh_metadata(
        &self,
        principal: &Principal,
        role: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Arc<RoleMetadata>> {
        let target = role.filter(|r| !r.is_empty()).unwrap_or(principal.role());
        if target != principal.role() {
            let caller = self.metadata.load_role(principal.role()).await?;
            if !caller.superuser {
                return Err(WorkbenchError::PermissionDenied {
                    role: principal.role().to_string(),
                    privilege: Privilege::Usage,
                    resource: format!("role {target}"),
                });
            }
        }

        let previous = self.metadata.role(target).await.ok();
        self.metadata.invalidate_role(target).await?;
        let fresh = cancel.run(self.metadata.refresh_role(target)).await?;
        let databases = previous
            .iter()
            .flat_map(|meta| meta.accessible_databases.iter())
            .chain(fresh.accessible_databases.iter());
        for database in databases {
            self.metadata.invalidate_database(database).await?;
        }
        info!(role = target, by = %principal.role(), "metadata refreshed");
        Ok(fresh)
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = SweepReport {
            sessions: self.sessions.sweep_expired().await?,
            transactions: self.transactions.invalidate_expired()?,
            metadata: self.metadata.purge().await?,
        };
        if report != SweepReport::default() {
            debug!(?report, "sweep finished");
        }
        Ok(report)
    }

    /// Runs `sweep` on a fixed tick until `shutdown`.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let workbench = Arc::clone(self);
        let period = self.config.reaper_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = workbench.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = workbench.sweep().await {
                            warn!(error = %err, "sweep failed");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Stops the reaper, drops every in-memory record and closes the
    /// introspection pools.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.sessions.clear().await?;
        self.transactions.clear()?;
        self.metadata.flush().await?;
        self.metadata.introspector().close().await;
        info!("workbench shut down");
        Ok(())
    }
}

fn require_columns<'a>(table: &TableMetadata, columns: impl IntoIterator<Item = &'a str>) -> Result<()> {
    for column in columns {
        if !table.has_column(column) {
            return Err(WorkbenchError::InputInvalid(format!(
                "column {column:?} does not exist on {}",
                table.table_ref()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_direction_is_case_insensitive() {
        assert_eq!(SortDirection::parse("desc").unwrap(), SortDirection::Desc);
        assert_eq!(SortDirection::parse(" Asc ").unwrap(), SortDirection::Asc);
        assert!(matches!(SortDirection::parse("sideways"), Err(WorkbenchError::InputInvalid(_))));
    }

    #[test]
    fn unknown_columns_are_input_errors() {
        let table = TableMetadata {
            schema: "public".into(),
            name: "users".into(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            foreign_keys: Vec::new(),
        };
        assert!(require_columns(&table, ["id"]).is_err());
        assert!(require_columns(&table, Vec::<&str>::new()).is_ok());
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::cache::Cache;
use crate::db::introspect::Introspector;
use crate::error::{Result, WorkbenchError};
use crate::models::{DatabaseMetadata, Privilege, RoleMetadata, TableMetadata};

/// Everything the metadata cache stores, behind one key space.
#[derive(Debug, Clone)]
pub enum CachedMetadata {
    Role(Arc<RoleMetadata>),
    Database(Arc<DatabaseMetadata>),
    Roles(Arc<Vec<String>>),
}

const ALL_ROLES_KEY: &str = "roles";

fn role_key(role: &str) -> String {
    format!("role:{role}")
}

fn database_key(database: &str) -> String {
    format!("db:{database}")
}

/// Snapshots of catalog metadata keyed by role and by database.
///
/// `role` and the accessibility helpers read the cache only and fail with
/// `Miss` when the role was never loaded; that is distinct from a loaded
/// role that simply has no grants, which answers with empty sets.
pub struct MetadataCache {
    cache: Arc<dyn Cache<CachedMetadata>>,
    introspector: Arc<dyn Introspector>,
    ttl_seconds: u64,
}

impl MetadataCache {
    pub fn new(
        cache: Arc<dyn Cache<CachedMetadata>>,
        introspector: Arc<dyn Introspector>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            cache,
            introspector,
            ttl_seconds,
        }
    }

    pub fn introspector(&self) -> &Arc<dyn Introspector> {
        &self.introspector
    }

    pub async fn role(&self, role: &str) -> Result<Arc<RoleMetadata>> {
        match self.cache.get(&role_key(role)).await? {
            CachedMetadata::Role(meta) => Ok(meta),
            _ => Err(WorkbenchError::Internal(format!("wrong entry kind under role {role}"))),
        }
    }

    pub async fn load_role(&self, role: &str) -> Result<Arc<RoleMetadata>> {
        match self.role(role).await {
            Err(WorkbenchError::Miss(_)) => self.refresh_role(role).await,
            other => other,
        }
    }

    pub async fn refresh_role(&self, role: &str) -> Result<Arc<RoleMetadata>> {
        let meta = self.introspector.role_metadata(role).await?;
        self.store_role(meta).await
    }

    pub async fn store_role(&self, meta: RoleMetadata) -> Result<Arc<RoleMetadata>> {
        let meta = Arc::new(meta);
        self.cache
            .set(&role_key(&meta.role_name), CachedMetadata::Role(meta.clone()), self.ttl_seconds)
            .await?;
        debug!(role = %meta.role_name, "role metadata cached");
        Ok(meta)
    }

    pub async fn database(&self, database: &str) -> Result<Arc<DatabaseMetadata>> {
        match self.cache.get(&database_key(database)).await? {
            CachedMetadata::Database(meta) => Ok(meta),
            _ => Err(WorkbenchError::Internal(format!("wrong entry kind under database {database}"))),
        }
    }

    pub async fn load_database(&self, database: &str) -> Result<Arc<DatabaseMetadata>> {
        match self.database(database).await {
            Err(WorkbenchError::Miss(_)) => self.refresh_database(database).await,
            other => other,
        }
    }

    pub async fn refresh_database(&self, database: &str) -> Result<Arc<DatabaseMetadata>> {
        let meta = Arc::new(self.introspector.database_metadata(database).await?);
        self.cache
            .set(&database_key(database), CachedMetadata::Database(meta.clone()), self.ttl_seconds)
            .await?;
        debug!(database, "database metadata cached");
        Ok(meta)
    }

    pub async fn table(&self, database: &str, schema: &str, table: &str) -> Result<TableMetadata> {
        self.load_database(database)
            .await?
            .table(schema, table)
            .cloned()
            .ok_or_else(|| WorkbenchError::NotFound(format!("table {database}.{schema}.{table}")))
    }

    pub async fn all_roles(&self) -> Result<Arc<Vec<String>>> {
        match self.cache.get(ALL_ROLES_KEY).await {
            Ok(CachedMetadata::Roles(roles)) => return Ok(roles),
            Ok(_) => return Err(WorkbenchError::Internal("wrong entry kind under roles".to_string())),
            Err(WorkbenchError::Miss(_)) => {}
            Err(err) => return Err(err),
        }
        let roles = Arc::new(self.introspector.roles().await?);
        self.cache
            .set(ALL_ROLES_KEY, CachedMetadata::Roles(roles.clone()), self.ttl_seconds)
            .await?;
        Ok(roles)
    }

    pub async fn invalidate_role(&self, role: &str) -> Result<()> {
        ignore_miss(self.cache.delete(&role_key(role)).await)?;
        ignore_miss(self.cache.delete(ALL_ROLES_KEY).await)
    }

    pub async fn invalidate_database(&self, database: &str) -> Result<()> {
        ignore_miss(self.cache.delete(&database_key(database)).await)
    }

    pub async fn flush(&self) -> Result<()> {
        self.cache.clear().await
    }

    pub async fn purge(&self) -> Result<usize> {
        self.cache.purge_expired().await
    }

    pub async fn accessible_databases(&self, role: &str) -> Result<BTreeSet<String>> {
        Ok(self.role(role).await?.accessible_databases.clone())
    }

    pub async fn accessible_schemas(&self, role: &str, database: &str) -> Result<BTreeSet<String>> {
        Ok(self.role(role).await?.schemas(database))
    }

    pub async fn accessible_tables(&self, role: &str, database: &str, schema: &str) -> Result<BTreeSet<String>> {
        Ok(self.role(role).await?.tables(database, schema))
    }

    pub async fn is_accessible(&self, role: &str, database: &str, schema: &str, table: &str) -> Result<bool> {
        Ok(self.role(role).await?.is_accessible(database, schema, table))
    }

    pub async fn permissions(
        &self,
        role: &str,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<BTreeSet<Privilege>> {
        Ok(self.role(role).await?.privileges(database, schema, table))
    }
}

fn ignore_miss(result: Result<()>) -> Result<()> {
    match result {
        Err(WorkbenchError::Miss(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::models::{ColumnMetadata, Grant};

    #[derive(Default)]
    struct CountingIntrospector {
        role_loads: AtomicUsize,
        database_loads: AtomicUsize,
    }

    #[async_trait]
    impl Introspector for CountingIntrospector {
        async fn roles(&self) -> Result<Vec<String>> {
            Ok(vec!["alice".into(), "nobody".into()])
        }

        async fn databases(&self) -> Result<Vec<String>> {
            Ok(vec!["testdb".into()])
        }

        async fn database_metadata(&self, database: &str) -> Result<DatabaseMetadata> {
            self.database_loads.fetch_add(1, Ordering::SeqCst);
            let mut meta = DatabaseMetadata {
                name: database.to_string(),
                ..DatabaseMetadata::default()
            };
            meta.insert_table(TableMetadata {
                schema: "public".into(),
                name: "users".into(),
                columns: vec![ColumnMetadata {
                    name: "id".into(),
                    sql_type: "integer".into(),
                    nullable: false,
                    is_primary: true,
                }],
                primary_keys: vec!["id".into()],
                foreign_keys: Vec::new(),
            });
            Ok(meta)
        }

        async fn role_metadata(&self, role: &str) -> Result<RoleMetadata> {
            self.role_loads.fetch_add(1, Ordering::SeqCst);
            match role {
                "alice" => Ok(RoleMetadata::from_grants(
                    role,
                    false,
                    [
                        Grant::Database { database: "testdb".into() },
                        Grant::Schema {
                            database: "testdb".into(),
                            schema: "public".into(),
                        },
                        Grant::Table {
                            database: "testdb".into(),
                            schema: "public".into(),
                            table: "users".into(),
                            privileges: [Privilege::Select].into_iter().collect(),
                        },
                    ],
                )),
                "nobody" => Ok(RoleMetadata::empty(role)),
                _ => Err(WorkbenchError::NotFound(format!("role {role}"))),
            }
        }
    }

    fn cache() -> (Arc<ManualClock>, Arc<CountingIntrospector>, MetadataCache) {
        let clock = Arc::new(ManualClock::starting_now());
        let introspector = Arc::new(CountingIntrospector::default());
        let store: Arc<dyn Cache<CachedMetadata>> = Arc::new(MemoryCache::new(clock.clone()));
        (clock, introspector.clone(), MetadataCache::new(store, introspector, 60))
    }

    #[tokio::test]
    async fn miss_is_distinct_from_no_access() {
        let (_clock, _intro, metadata) = cache();
        assert!(matches!(
            metadata.accessible_databases("nobody").await,
            Err(WorkbenchError::Miss(_))
        ));

        metadata.load_role("nobody").await.unwrap();
        assert!(metadata.accessible_databases("nobody").await.unwrap().is_empty());
        assert!(metadata.accessible_tables("nobody", "testdb", "public").await.unwrap().is_empty());
        assert!(!metadata.is_accessible("nobody", "testdb", "public", "users").await.unwrap());
    }

    #[tokio::test]
    async fn loads_once_until_invalidated_or_expired() {
        let (clock, intro, metadata) = cache();
        metadata.load_role("alice").await.unwrap();
        metadata.load_role("alice").await.unwrap();
        assert_eq!(intro.role_loads.load(Ordering::SeqCst), 1);

        metadata.invalidate_role("alice").await.unwrap();
        metadata.invalidate_role("alice").await.unwrap();
        metadata.load_role("alice").await.unwrap();
        assert_eq!(intro.role_loads.load(Ordering::SeqCst), 2);

        clock.advance_seconds(61);
        assert!(metadata.role("alice").await.is_err());
        metadata.load_role("alice").await.unwrap();
        assert_eq!(intro.role_loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn helpers_answer_from_snapshot() {
        let (_clock, _intro, metadata) = cache();
        metadata.load_role("alice").await.unwrap();
        assert!(metadata.accessible_databases("alice").await.unwrap().contains("testdb"));
        assert!(metadata.accessible_schemas("alice", "testdb").await.unwrap().contains("public"));
        assert!(metadata.is_accessible("alice", "testdb", "public", "users").await.unwrap());
        let perms = metadata.permissions("alice", "testdb", "public", "users").await.unwrap();
        assert!(perms.contains(&Privilege::Select));
        assert!(!perms.contains(&Privilege::Update));
    }

    #[tokio::test]
    async fn database_invalidation_and_flush() {
        let (_clock, intro, metadata) = cache();
        assert!(metadata.table("testdb", "public", "users").await.is_ok());
        assert!(matches!(
            metadata.table("testdb", "public", "missing").await,
            Err(WorkbenchError::NotFound(_))
        ));
        assert_eq!(intro.database_loads.load(Ordering::SeqCst), 1);

        metadata.invalidate_database("testdb").await.unwrap();
        metadata.load_database("testdb").await.unwrap();
        assert_eq!(intro.database_loads.load(Ordering::SeqCst), 2);

        metadata.load_role("alice").await.unwrap();
        assert_eq!(metadata.all_roles().await.unwrap().len(), 2);
        metadata.flush().await.unwrap();
        assert!(metadata.role("alice").await.is_err());
        assert!(metadata.database("testdb").await.is_err());
    }

    #[tokio::test]
    async fn unknown_role_is_not_found() {
        let (_clock, _intro, metadata) = cache();
        assert!(matches!(
            metadata.load_role("ghost").await,
            Err(WorkbenchError::NotFound(_))
        ));
    }
}

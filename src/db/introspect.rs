//! Reads the live catalog into metadata trees.
//!
//! Table shapes come from `information_schema`; roles and privileges come
//! from `pg_catalog` and the `has_*_privilege` functions. The introspector
//! connects as a privileged role so it can see every object it reports on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::postgres::open_pool;
use crate::error::{Result, WorkbenchError};
use crate::models::{
    ColumnMetadata, Connection, DatabaseMetadata, ForeignKey, GlobalMetadata, Grant, Privilege,
    RoleMetadata, TableMetadata,
};

#[async_trait]
pub trait Introspector: Send + Sync {
    async fn roles(&self) -> Result<Vec<String>>;
    async fn databases(&self) -> Result<Vec<String>>;
    async fn database_metadata(&self, database: &str) -> Result<DatabaseMetadata>;
    async fn role_metadata(&self, role: &str) -> Result<RoleMetadata>;

    async fn table_metadata(&self, database: &str, schema: &str, table: &str) -> Result<TableMetadata> {
        self.database_metadata(database)
            .await?
            .table(schema, table)
            .cloned()
            .ok_or_else(|| WorkbenchError::NotFound(format!("table {database}.{schema}.{table}")))
    }

    async fn global_metadata(&self) -> Result<GlobalMetadata> {
        let mut global = GlobalMetadata {
            roles: self.roles().await?,
            ..GlobalMetadata::default()
        };
        for database in self.databases().await? {
            let meta = self.database_metadata(&database).await?;
            global.databases.insert(database, meta);
        }
        Ok(global)
    }

    async fn close(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRow {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRow {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRow {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogRows {
    pub tables: Vec<(String, String)>,
    pub columns: Vec<ColumnRow>,
    pub primary_keys: Vec<KeyRow>,
    pub foreign_keys: Vec<ForeignKeyRow>,
}

pub fn assemble_database(name: &str, rows: CatalogRows) -> DatabaseMetadata {
    let mut tables: BTreeMap<(String, String), TableMetadata> = BTreeMap::new();
    let mut entry = |schema: &str, table: &str| -> (String, String) {
        let key = (schema.to_string(), table.to_string());
        tables.entry(key.clone()).or_insert_with(|| TableMetadata {
            schema: schema.to_string(),
            name: table.to_string(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
            foreign_keys: Vec::new(),
        });
        key
    };

    for (schema, table) in &rows.tables {
        entry(schema, table);
    }
    let mut columns = rows.columns;
    columns.sort_by_key(|c| c.ordinal);
    let mut keys = rows.primary_keys;
    keys.sort_by_key(|k| k.ordinal);

    let mut column_keys = Vec::with_capacity(columns.len());
    for column in &columns {
        column_keys.push(entry(&column.schema, &column.table));
    }
    let mut pk_keys = Vec::with_capacity(keys.len());
    for key in &keys {
        pk_keys.push(entry(&key.schema, &key.table));
    }
    let mut fk_keys = Vec::with_capacity(rows.foreign_keys.len());
    for fk in &rows.foreign_keys {
        fk_keys.push(entry(&fk.schema, &fk.table));
    }

    for (key, column) in column_keys.into_iter().zip(columns) {
        if let Some(table) = tables.get_mut(&key) {
            table.columns.push(ColumnMetadata {
                name: column.name,
                sql_type: column.sql_type,
                nullable: column.nullable,
                is_primary: false,
            });
        }
    }
    for (key, pk) in pk_keys.into_iter().zip(keys) {
        if let Some(table) = tables.get_mut(&key) {
            if let Some(column) = table.columns.iter_mut().find(|c| c.name == pk.column) {
                column.is_primary = true;
            }
            table.primary_keys.push(pk.column);
        }
    }
    for (key, fk) in fk_keys.into_iter().zip(rows.foreign_keys) {
        if let Some(table) = tables.get_mut(&key) {
            table.foreign_keys.push(ForeignKey {
                column: fk.column,
                referenced_schema: fk.referenced_schema,
                referenced_table: fk.referenced_table,
                referenced_column: fk.referenced_column,
            });
        }
    }

    let mut database = DatabaseMetadata {
        name: name.to_string(),
        ..DatabaseMetadata::default()
    };
    for table in tables.into_values() {
        database.insert_table(table);
    }
    database
}

/// One row of the per-table privilege probe: schema, table and the four
/// `has_table_privilege` answers in SELECT/INSERT/UPDATE/DELETE order.
pub type TablePrivilegeRow = (String, String, bool, bool, bool, bool);

pub fn database_grants(database: &str, schemas: &[String], tables: Vec<TablePrivilegeRow>) -> Vec<Grant> {
    let mut grants = vec![Grant::Database {
        database: database.to_string(),
    }];
    grants.extend(schemas.iter().map(|schema| Grant::Schema {
        database: database.to_string(),
        schema: schema.clone(),
    }));
    for (schema, table, select, insert, update, delete) in tables {
        let privileges: BTreeSet<Privilege> = [
            (select, Privilege::Select),
            (insert, Privilege::Insert),
            (update, Privilege::Update),
            (delete, Privilege::Delete),
        ]
        .into_iter()
        .filter_map(|(held, privilege)| held.then_some(privilege))
        .collect();
        if !privileges.is_empty() {
            grants.push(Grant::Table {
                database: database.to_string(),
                schema,
                table,
                privileges,
            });
        }
    }
    grants
}

const TABLES_SQL: &str = r#"
    SELECT table_schema::text, table_name::text
    FROM information_schema.tables
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg\_%'
      AND ($1::text IS NULL OR table_schema = $1)
      AND ($2::text IS NULL OR table_name = $2)
    ORDER BY table_schema, table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_schema::text,
        c.table_name::text,
        c.column_name::text,
        format_type(a.atttypid, a.atttypmod) AS sql_type,
        (c.is_nullable = 'YES') AS nullable,
        c.ordinal_position::int4
    FROM information_schema.columns c
    JOIN pg_catalog.pg_namespace n ON n.nspname = c.table_schema
    JOIN pg_catalog.pg_class k ON k.relnamespace = n.oid AND k.relname = c.table_name
    JOIN pg_catalog.pg_attribute a ON a.attrelid = k.oid AND a.attname = c.column_name
    WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND c.table_schema NOT LIKE 'pg\_%'
      AND ($1::text IS NULL OR c.table_schema = $1)
      AND ($2::text IS NULL OR c.table_name = $2)
    ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT kcu.table_schema::text, kcu.table_name::text, kcu.column_name::text, kcu.ordinal_position::int4
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON kcu.constraint_schema = tc.constraint_schema
     AND kcu.constraint_name = tc.constraint_name
     AND kcu.table_name = tc.table_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
      AND ($1::text IS NULL OR kcu.table_schema = $1)
      AND ($2::text IS NULL OR kcu.table_name = $2)
    ORDER BY kcu.table_schema, kcu.table_name, kcu.ordinal_position
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        kcu.table_schema::text,
        kcu.table_name::text,
        kcu.column_name::text,
        ref.table_schema::text,
        ref.table_name::text,
        ref.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON kcu.constraint_schema = tc.constraint_schema
     AND kcu.constraint_name = tc.constraint_name
    JOIN information_schema.referential_constraints rc
      ON rc.constraint_schema = tc.constraint_schema
     AND rc.constraint_name = tc.constraint_name
    JOIN information_schema.key_column_usage ref
      ON ref.constraint_schema = rc.unique_constraint_schema
     AND ref.constraint_name = rc.unique_constraint_name
     AND ref.ordinal_position = kcu.position_in_unique_constraint
    WHERE tc.constraint_type = 'FOREIGN KEY'
      AND ($1::text IS NULL OR kcu.table_schema = $1)
      AND ($2::text IS NULL OR kcu.table_name = $2)
    ORDER BY kcu.table_schema, kcu.table_name, kcu.ordinal_position
"#;

const ROLE_SQL: &str = "SELECT rolsuper FROM pg_catalog.pg_roles WHERE rolname = $1";

const ROLES_SQL: &str = r#"
    SELECT rolname::text FROM pg_catalog.pg_roles
    WHERE rolname NOT LIKE 'pg\_%'
    ORDER BY rolname
"#;

const DATABASES_SQL: &str = r#"
    SELECT datname::text FROM pg_catalog.pg_database
    WHERE datallowconn AND NOT datistemplate
    ORDER BY datname
"#;

const ROLE_DATABASES_SQL: &str = r#"
    SELECT datname::text FROM pg_catalog.pg_database
    WHERE datallowconn AND NOT datistemplate
      AND has_database_privilege($1, datname, 'CONNECT')
    ORDER BY datname
"#;

const ROLE_SCHEMAS_SQL: &str = r#"
    SELECT nspname::text FROM pg_catalog.pg_namespace
    WHERE nspname NOT IN ('information_schema', 'pg_catalog', 'pg_toast')
      AND nspname NOT LIKE 'pg\_temp\_%'
      AND nspname NOT LIKE 'pg\_toast\_temp\_%'
      AND has_schema_privilege($1, nspname, 'USAGE')
    ORDER BY nspname
"#;

const ROLE_TABLES_SQL: &str = r#"
    SELECT
        table_schema::text,
        table_name::text,
        has_table_privilege($1, format('%I.%I', table_schema, table_name), 'SELECT'),
        has_table_privilege($1, format('%I.%I', table_schema, table_name), 'INSERT'),
        has_table_privilege($1, format('%I.%I', table_schema, table_name), 'UPDATE'),
        has_table_privilege($1, format('%I.%I', table_schema, table_name), 'DELETE')
    FROM information_schema.tables
    WHERE table_schema = ANY($2)
    ORDER BY table_schema, table_name
"#;

/// Introspector backed by one small pool per database, all opened with the
/// privileged introspection role.
pub struct PgIntrospector {
    base: Connection,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgIntrospector {
    pub fn new(base: Connection) -> Self {
        Self {
            base,
            acquire_timeout: Duration::from_secs(5),
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool_for(&self, database: &str) -> Result<PgPool> {
        if let Some(pool) = self.pools.lock().await.get(database) {
            return Ok(pool.clone());
        }

        // connect outside the lock; a racing caller's pool wins
        let pool = open_pool(&self.base.with_database(database), 2, self.acquire_timeout).await?;
        let mut pools = self.pools.lock().await;
        if let Some(existing) = pools.get(database) {
            let existing = existing.clone();
            drop(pools);
            pool.close().await;
            return Ok(existing);
        }
        pools.insert(database.to_string(), pool.clone());
        debug!(database, "introspection pool opened");
        Ok(pool)
    }

    async fn catalog_rows(
        &self,
        database: &str,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> Result<CatalogRows> {
        let pool = self.pool_for(database).await?;

        let tables: Vec<(String, String)> = sqlx::query_as(TABLES_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(&pool)
            .await?;

        let columns: Vec<(String, String, String, String, bool, i32)> = sqlx::query_as(COLUMNS_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(&pool)
            .await?;

        let primary_keys: Vec<(String, String, String, i32)> = sqlx::query_as(PRIMARY_KEYS_SQL)
            .bind(schema)
            .bind(table)
            .fetch_all(&pool)
            .await?;

        let foreign_keys: Vec<(String, String, String, String, String, String)> =
            sqlx::query_as(FOREIGN_KEYS_SQL)
                .bind(schema)
                .bind(table)
                .fetch_all(&pool)
                .await?;

        Ok(CatalogRows {
            tables,
            columns: columns
                .into_iter()
                .map(|(schema, table, name, sql_type, nullable, ordinal)| ColumnRow {
                    schema,
                    table,
                    name,
                    sql_type,
                    nullable,
                    ordinal,
                })
                .collect(),
            primary_keys: primary_keys
                .into_iter()
                .map(|(schema, table, column, ordinal)| KeyRow {
                    schema,
                    table,
                    column,
                    ordinal,
                })
                .collect(),
            foreign_keys: foreign_keys
                .into_iter()
                .map(
                    |(schema, table, column, referenced_schema, referenced_table, referenced_column)| {
                        ForeignKeyRow {
                            schema,
                            table,
                            column,
                            referenced_schema,
                            referenced_table,
                            referenced_column,
                        }
                    },
                )
                .collect(),
        })
    }
}

#[async_trait]
impl Introspector for PgIntrospector {
    async fn roles(&self) -> Result<Vec<String>> {
        let pool = self.pool_for(&self.base.database).await?;
        let rows: Vec<(String,)> = sqlx::query_as(ROLES_SQL).fetch_all(&pool).await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let pool = self.pool_for(&self.base.database).await?;
        let rows: Vec<(String,)> = sqlx::query_as(DATABASES_SQL).fetch_all(&pool).await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn database_metadata(&self, database: &str) -> Result<DatabaseMetadata> {
        let rows = self.catalog_rows(database, None, None).await?;
        let meta = assemble_database(database, rows);
        info!(database, tables = meta.tables().count(), "database metadata loaded");
        Ok(meta)
    }

    async fn table_metadata(&self, database: &str, schema: &str, table: &str) -> Result<TableMetadata> {
        let rows = self.catalog_rows(database, Some(schema), Some(table)).await?;
        assemble_database(database, rows)
            .table(schema, table)
            .cloned()
            .ok_or_else(|| WorkbenchError::NotFound(format!("table {database}.{schema}.{table}")))
    }

    async fn role_metadata(&self, role: &str) -> Result<RoleMetadata> {
        let pool = self.pool_for(&self.base.database).await?;
        let superuser: Option<(bool,)> = sqlx::query_as(ROLE_SQL).bind(role).fetch_optional(&pool).await?;
        let Some((superuser,)) = superuser else {
            return Err(WorkbenchError::NotFound(format!("role {role}")));
        };

        let databases: Vec<(String,)> = sqlx::query_as(ROLE_DATABASES_SQL)
            .bind(role)
            .fetch_all(&pool)
            .await?;

        let mut grants = Vec::new();
        for (database,) in databases {
            let db_pool = match self.pool_for(&database).await {
                Ok(p) => p,
                Err(err) => {
                    warn!(database, error = %err, "skipping database during role introspection");
                    grants.push(Grant::Database { database });
                    continue;
                }
            };
            let schemas: Vec<String> = sqlx::query_as::<_, (String,)>(ROLE_SCHEMAS_SQL)
                .bind(role)
                .fetch_all(&db_pool)
                .await?
                .into_iter()
                .map(|(name,)| name)
                .collect();
            let tables: Vec<TablePrivilegeRow> = sqlx::query_as(ROLE_TABLES_SQL)
                .bind(role)
                .bind(&schemas)
                .fetch_all(&db_pool)
                .await?;
            grants.extend(database_grants(&database, &schemas, tables));
        }

        let meta = RoleMetadata::from_grants(role, superuser, grants);
        info!(
            role,
            databases = meta.accessible_databases.len(),
            tables = meta.permissions.len(),
            "role metadata loaded"
        );
        Ok(meta)
    }

    async fn close(&self) {
        let pools: Vec<PgPool> = self.pools.lock().await.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    Connect,
    Select,
    Insert,
    Update,
    Delete,
    Usage,
}

impl Privilege {
    pub const TABLE: [Privilege; 4] = [
        Privilege::Select,
        Privilege::Insert,
        Privilege::Update,
        Privilege::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Privilege::Connect => "CONNECT",
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Usage => "USAGE",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(schema, name)` key; foreign keys point at tables through these rather
/// than through owned references, so cyclic schemas stay a flat graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKey {
    pub fn target(&self) -> TableRef {
        TableRef::new(&self.referenced_schema, &self.referenced_table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    /// Ordered by key ordinal position.
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableMetadata {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub name: String,
    pub tables: BTreeMap<String, TableMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub schemas: BTreeMap<String, SchemaMetadata>,
}

impl DatabaseMetadata {
    pub fn table(&self, schema: &str, table: &str) -> Option<&TableMetadata> {
        self.schemas.get(schema)?.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMetadata> {
        self.schemas.values().flat_map(|s| s.tables.values())
    }

    pub fn insert_table(&mut self, table: TableMetadata) {
        let schema = self
            .schemas
            .entry(table.schema.clone())
            .or_insert_with(|| SchemaMetadata {
                name: table.schema.clone(),
                tables: BTreeMap::new(),
            });
        schema.tables.insert(table.name.clone(), table);
    }

    pub fn resolve_foreign_key(&self, fk: &ForeignKey) -> Option<&TableMetadata> {
        self.table(&fk.referenced_schema, &fk.referenced_table)
    }

    /// Tables holding a foreign key into `target`, with the edge that does so.
    pub fn referencing<'a>(
        &'a self,
        target: &'a TableRef,
    ) -> impl Iterator<Item = (&'a TableMetadata, &'a ForeignKey)> + 'a {
        self.tables().flat_map(move |table| {
            table
                .foreign_keys
                .iter()
                .filter(move |fk| fk.referenced_schema == target.schema && fk.referenced_table == target.name)
                .map(move |fk| (table, fk))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadata {
    pub databases: BTreeMap<String, DatabaseMetadata>,
    pub roles: Vec<String>,
}

/// One privilege fact read from the catalog for a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Database {
        database: String,
    },
    Schema {
        database: String,
        schema: String,
    },
    Table {
        database: String,
        schema: String,
        table: String,
        privileges: BTreeSet<Privilege>,
    },
}

/// Everything one role may reach. Access checks are answered from this
/// snapshot without touching PostgreSQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMetadata {
    pub role_name: String,
    pub superuser: bool,
    pub accessible_databases: BTreeSet<String>,
    /// database -> schemas with USAGE
    pub accessible_schemas: BTreeMap<String, BTreeSet<String>>,
    /// `database.schema` -> tables with SELECT
    pub accessible_tables: BTreeMap<String, BTreeSet<String>>,
    /// `database.schema.table` -> privileges held
    pub permissions: BTreeMap<String, BTreeSet<Privilege>>,
}

pub fn schema_key(database: &str, schema: &str) -> String {
    format!("{database}.{schema}")
}

pub fn table_key(database: &str, schema: &str, table: &str) -> String {
    format!("{database}.{schema}.{table}")
}

impl RoleMetadata {
    pub fn empty(role: &str) -> Self {
        Self {
            role_name: role.to_string(),
            ..Self::default()
        }
    }

    pub fn from_grants(role: &str, superuser: bool, grants: impl IntoIterator<Item = Grant>) -> Self {
        let mut meta = Self::empty(role);
        meta.superuser = superuser;
        for grant in grants {
            meta.apply(grant);
        }
        meta
    }

    pub fn apply(&mut self, grant: Grant) {
        match grant {
            Grant::Database { database } => {
                self.accessible_databases.insert(database);
            }
            Grant::Schema { database, schema } => {
                self.accessible_schemas.entry(database).or_default().insert(schema);
            }
            Grant::Table {
                database,
                schema,
                table,
                privileges,
            } => {
                if privileges.is_empty() {
                    return;
                }
                if privileges.contains(&Privilege::Select) {
                    self.accessible_tables
                        .entry(schema_key(&database, &schema))
                        .or_default()
                        .insert(table.clone());
                }
                self.permissions
                    .entry(table_key(&database, &schema, &table))
                    .or_default()
                    .extend(privileges);
            }
        }
    }

    pub fn can_connect(&self, database: &str) -> bool {
        self.accessible_databases.contains(database)
    }

    pub fn can_use(&self, database: &str, schema: &str) -> bool {
        self.can_connect(database)
            && self
                .accessible_schemas
                .get(database)
                .is_some_and(|schemas| schemas.contains(schema))
    }

    pub fn schemas(&self, database: &str) -> BTreeSet<String> {
        if !self.can_connect(database) {
            return BTreeSet::new();
        }
        self.accessible_schemas.get(database).cloned().unwrap_or_default()
    }

    pub fn tables(&self, database: &str, schema: &str) -> BTreeSet<String> {
        if !self.can_use(database, schema) {
            return BTreeSet::new();
        }
        self.accessible_tables
            .get(&schema_key(database, schema))
            .cloned()
            .unwrap_or_default()
    }

    pub fn privileges(&self, database: &str, schema: &str, table: &str) -> BTreeSet<Privilege> {
        if !self.can_use(database, schema) {
            return BTreeSet::new();
        }
        self.permissions
            .get(&table_key(database, schema, table))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has(&self, privilege: Privilege, database: &str, schema: &str, table: &str) -> bool {
        self.privileges(database, schema, table).contains(&privilege)
    }

    pub fn is_accessible(&self, database: &str, schema: &str, table: &str) -> bool {
        self.has(Privilege::Select, database, schema, table)
    }
}

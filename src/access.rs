use std::sync::Arc;

use crate::error::{Result, WorkbenchError};
use crate::metadata::MetadataCache;
use crate::models::{Privilege, RoleMetadata};

/// Privilege checks answered from cached role metadata. A denial never
/// reaches PostgreSQL.
pub struct AccessControl {
    metadata: Arc<MetadataCache>,
}

impl AccessControl {
    pub fn new(metadata: Arc<MetadataCache>) -> Self {
        Self { metadata }
    }

    async fn role(&self, role: &str) -> Result<Arc<RoleMetadata>> {
        self.metadata.load_role(role).await
    }

    pub async fn can(&self, role: &str, privilege: Privilege, database: &str, schema: &str, table: &str) -> Result<bool> {
        let meta = self.role(role).await?;
        Ok(match privilege {
            Privilege::Connect => meta.can_connect(database),
            Privilege::Usage => meta.can_use(database, schema),
            table_privilege => meta.has(table_privilege, database, schema, table),
        })
    }

    pub async fn can_connect(&self, role: &str, database: &str) -> Result<bool> {
        Ok(self.role(role).await?.can_connect(database))
    }

    pub async fn can_use(&self, role: &str, database: &str, schema: &str) -> Result<bool> {
        Ok(self.role(role).await?.can_use(database, schema))
    }

    /// SELECT without any of INSERT, UPDATE or DELETE.
    pub async fn is_read_only(&self, role: &str, database: &str, schema: &str, table: &str) -> Result<bool> {
        let privileges = self.role(role).await?.privileges(database, schema, table);
        Ok(privileges.contains(&Privilege::Select)
            && !privileges.contains(&Privilege::Insert)
            && !privileges.contains(&Privilege::Update)
            && !privileges.contains(&Privilege::Delete))
    }

    pub async fn require(&self, role: &str, privilege: Privilege, database: &str, schema: &str, table: &str) -> Result<()> {
        if self.can(role, privilege, database, schema, table).await? {
            Ok(())
        } else {
            Err(denied(role, privilege, format!("{database}.{schema}.{table}")))
        }
    }

    pub async fn require_connect(&self, role: &str, database: &str) -> Result<()> {
        if self.can_connect(role, database).await? {
            Ok(())
        } else {
            Err(denied(role, Privilege::Connect, database.to_string()))
        }
    }

    pub async fn require_use(&self, role: &str, database: &str, schema: &str) -> Result<()> {
        if self.can_use(role, database, schema).await? {
            Ok(())
        } else {
            Err(denied(role, Privilege::Usage, format!("{database}.{schema}")))
        }
    }
}

fn denied(role: &str, privilege: Privilege, resource: String) -> WorkbenchError {
    WorkbenchError::PermissionDenied {
        role: role.to_string(),
        privilege,
        resource,
    }
}

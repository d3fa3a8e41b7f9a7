use std::collections::HashMap;

use sqlx::SqlitePool;

use jobboard_core::access::{default_permissions, Permission, PermissionSet, Role};

use crate::RepoError;

/// Persistent role to permission map.
#[derive(Clone)]
pub struct RolePermissionRepository {
    pool: SqlitePool,
}

impl RolePermissionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the built-in map when the table is empty. Returns whether it seeded.
    pub async fn seed_defaults_if_empty(&self) -> Result<bool, RepoError> {
        let mut tx = self.pool.begin().await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM role_permissions")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            return Ok(false);
        }

        for role in Role::ALL {
            for permission in default_permissions(*role).iter() {
                sqlx::query("INSERT INTO role_permissions (role, permission) VALUES (?, ?)")
                    .bind(role.as_str())
                    .bind(permission.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Loads the whole map. Roles without rows map to an empty set.
    pub async fn load_all(&self) -> Result<HashMap<Role, PermissionSet>, RepoError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT role, permission FROM role_permissions ORDER BY role, permission",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<Role, PermissionSet> =
            Role::ALL.iter().map(|role| (*role, PermissionSet::new())).collect();
        for (role, permission) in rows {
            let role: Role = role.parse()?;
            let permission: Permission = permission.parse()?;
            map.entry(role).or_default().insert(permission);
        }
        Ok(map)
    }

    /// Replaces every permission of `role` atomically.
    pub async fn replace(&self, role: Role, permissions: &PermissionSet) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_permissions WHERE role = ?")
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;
        for permission in permissions.iter() {
            sqlx::query("INSERT INTO role_permissions (role, permission) VALUES (?, ?)")
                .bind(role.as_str())
                .bind(permission.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

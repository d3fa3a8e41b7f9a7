use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

string_enum! {
    /// Account role. Every user holds exactly one.
    pub enum Role {
        Admin => "admin",
        Employer => "employer",
        Hr => "hr",
        JobSeeker => "job_seeker",
    }
}

impl Role {
    /// Roles a visitor may pick when registering.
    pub fn is_self_assignable(self) -> bool {
        !matches!(self, Self::Admin)
    }
}

string_enum! {
    /// Fine-grained capability checked by the HTTP guard.
    pub enum Permission {
        UsersRead => "users:read",
        UsersManage => "users:manage",
        CompaniesCreate => "companies:create",
        CompaniesUpdate => "companies:update",
        CompaniesDelete => "companies:delete",
        CompaniesVerify => "companies:verify",
        JobsCreate => "jobs:create",
        JobsUpdate => "jobs:update",
        JobsDelete => "jobs:delete",
        JobsPublish => "jobs:publish",
        ApplicationsApply => "applications:apply",
        ApplicationsRead => "applications:read",
        ApplicationsManage => "applications:manage",
        ApplicationsWithdraw => "applications:withdraw",
        CvsManage => "cvs:manage",
        CvsRead => "cvs:read",
        MessagesSend => "messages:send",
        BlogCreate => "blog:create",
        BlogPublish => "blog:publish",
        BlogManage => "blog:manage",
        SubscriptionsManage => "subscriptions:manage",
        PlansManage => "plans:manage",
        StatsRead => "stats:read",
        UploadsCreate => "uploads:create",
        NotificationsBroadcast => "notifications:broadcast",
    }
}

/// Set of permissions granted to a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// Returns `true` when every required permission is granted.
    ///
    /// An empty requirement list is always satisfied.
    pub fn allows(&self, required: &[Permission]) -> bool {
        required.iter().all(|permission| self.0.contains(permission))
    }

    /// Required permissions that are not granted, in declaration order.
    pub fn missing(&self, required: &[Permission]) -> Vec<Permission> {
        required
            .iter()
            .copied()
            .filter(|permission| !self.0.contains(permission))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Built-in role to permission map used to seed `role_permissions`.
pub fn default_permissions(role: Role) -> PermissionSet {
    use Permission::*;

    match role {
        Role::Admin => Permission::ALL.iter().copied().collect(),
        Role::Employer => [
            CompaniesCreate,
            CompaniesUpdate,
            CompaniesDelete,
            JobsCreate,
            JobsUpdate,
            JobsDelete,
            JobsPublish,
            ApplicationsRead,
            ApplicationsManage,
            CvsRead,
            MessagesSend,
            BlogCreate,
            SubscriptionsManage,
            UploadsCreate,
        ]
        .into_iter()
        .collect(),
        Role::Hr => [
            CompaniesUpdate,
            JobsCreate,
            JobsUpdate,
            JobsPublish,
            ApplicationsRead,
            ApplicationsManage,
            CvsRead,
            MessagesSend,
            UploadsCreate,
        ]
        .into_iter()
        .collect(),
        Role::JobSeeker => [
            ApplicationsApply,
            ApplicationsWithdraw,
            CvsManage,
            MessagesSend,
            UploadsCreate,
        ]
        .into_iter()
        .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_holds_every_permission() {
        let set = default_permissions(Role::Admin);
        assert_eq!(set.len(), Permission::ALL.len());
        assert!(set.allows(Permission::ALL));
    }

    #[test]
    fn allows_requires_every_permission() {
        let set = default_permissions(Role::Hr);
        assert!(set.allows(&[Permission::JobsCreate, Permission::JobsPublish]));
        assert!(!set.allows(&[Permission::JobsCreate, Permission::JobsDelete]));
        assert_eq!(
            set.missing(&[Permission::JobsCreate, Permission::JobsDelete]),
            vec![Permission::JobsDelete]
        );
        assert!(set.allows(&[]));
    }

    #[test]
    fn job_seekers_cannot_post_jobs() {
        let set = default_permissions(Role::JobSeeker);
        assert!(set.contains(Permission::ApplicationsApply));
        assert!(!set.contains(Permission::JobsCreate));
        assert!(!set.contains(Permission::CvsRead));
    }

    #[test]
    fn role_parsing_round_trips() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), *role);
        }
        let err = "owner".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "Role");
        assert!(!Role::Admin.is_self_assignable());
        assert!(Role::Hr.is_self_assignable());
    }

    #[test]
    fn permission_set_serializes_as_string_list() {
        let set: PermissionSet = [Permission::StatsRead, Permission::UsersRead]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!(["users:read", "stats:read"]));
    }
}

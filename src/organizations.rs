use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Supervisor,
    Moderator,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Supervisor => "supervisor",
            MemberRole::Moderator => "moderator",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "supervisor" => Some(Self::Supervisor),
            "moderator" => Some(Self::Moderator),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Roles allowed to manage billing settings and receive billing alerts.
    pub fn is_admin(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

// key: organization-directory -> role lookups for alerts and escalation
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn members_with_role(&self, organization_id: i32, roles: &[MemberRole]) -> Result<Vec<i32>>;

    async fn admins(&self, organization_id: i32) -> Result<Vec<i32>> {
        self.members_with_role(organization_id, &[MemberRole::Owner, MemberRole::Admin])
            .await
    }

    async fn supervisors(&self, organization_id: i32) -> Result<Vec<i32>> {
        self.members_with_role(organization_id, &[MemberRole::Supervisor])
            .await
    }
}

#[derive(Clone)]
pub struct PgOrganizationDirectory {
    pool: PgPool,
}

impl PgOrganizationDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationDirectory for PgOrganizationDirectory {
    async fn members_with_role(&self, organization_id: i32, roles: &[MemberRole]) -> Result<Vec<i32>> {
        let roles: Vec<String> = roles.iter().map(|role| role.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT user_id FROM organization_members \
             WHERE organization_id = $1 AND role = ANY($2) ORDER BY user_id",
        )
        .bind(organization_id)
        .bind(roles)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("user_id")).collect())
    }
}

/// Directory held in memory, for tests and single-node runs.
#[derive(Default)]
pub struct StaticOrganizationDirectory {
    members: DashMap<(i32, i32), MemberRole>,
}

impl StaticOrganizationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(self, organization_id: i32, user_id: i32, role: MemberRole) -> Self {
        self.set_role(organization_id, user_id, role);
        self
    }

    pub fn set_role(&self, organization_id: i32, user_id: i32, role: MemberRole) {
        self.members.insert((organization_id, user_id), role);
    }
}

#[async_trait]
impl OrganizationDirectory for StaticOrganizationDirectory {
    async fn members_with_role(&self, organization_id: i32, roles: &[MemberRole]) -> Result<Vec<i32>> {
        let mut members: Vec<i32> = self
            .members
            .iter()
            .filter(|entry| entry.key().0 == organization_id && roles.contains(entry.value()))
            .map(|entry| entry.key().1)
            .collect();
        members.sort_unstable();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_filters_by_org_and_role() {
        let directory = StaticOrganizationDirectory::new()
            .with_member(1, 10, MemberRole::Owner)
            .with_member(1, 11, MemberRole::Supervisor)
            .with_member(1, 12, MemberRole::Moderator)
            .with_member(2, 20, MemberRole::Admin);

        assert_eq!(directory.admins(1).await.unwrap(), vec![10]);
        assert_eq!(directory.supervisors(1).await.unwrap(), vec![11]);
        assert_eq!(directory.admins(2).await.unwrap(), vec![20]);
        assert!(directory.supervisors(3).await.unwrap().is_empty());
    }
}

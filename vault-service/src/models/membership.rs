//! Org- and project-level memberships.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

/// Role held at a scope. The same ladder applies to orgs and projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub const ALL: &'static [Role] = &[Role::Owner, Role::Admin, Role::Member];
    pub const MANAGERS: &'static [Role] = &[Role::Owner, Role::Admin];
    pub const OWNER_ONLY: &'static [Role] = &[Role::Owner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Admin => "ADMIN",
            Role::Member => "MEMBER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OWNER" => Ok(Role::Owner),
            "ADMIN" => Ok(Role::Admin),
            "MEMBER" => Ok(Role::Member),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The org or project a membership applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Org(Uuid),
    Project(Uuid),
}

impl Scope {
    pub fn id(&self) -> Uuid {
        match self {
            Scope::Org(id) | Scope::Project(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Org(_) => "org",
            Scope::Project(_) => "project",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OrgMembership {
    pub org_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OrgMembership {
    pub fn new(org_id: Uuid, user_id: Uuid, role: Role, is_active: bool) -> Self {
        let now = Utc::now();
        Self {
            org_id,
            user_id,
            role,
            is_active,
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProjectMembership {
    pub project_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ProjectMembership {
    pub fn new(project_id: Uuid, user_id: Uuid, role: Role) -> Self {
        let now = Utc::now();
        Self {
            project_id,
            user_id,
            role,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Scope-agnostic view of a membership row, as seen by authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Uuid,
    pub scope: Scope,
    pub role: Role,
}

impl From<&OrgMembership> for Membership {
    fn from(m: &OrgMembership) -> Self {
        Self {
            user_id: m.user_id,
            scope: Scope::Org(m.org_id),
            role: m.role,
        }
    }
}

impl From<&ProjectMembership> for Membership {
    fn from(m: &ProjectMembership) -> Self {
        Self {
            user_id: m.user_id,
            scope: Scope::Project(m.project_id),
            role: m.role,
        }
    }
}

/// Member listing row joined with the user profile.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct MemberDetails {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_codes_round_trip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), *role);
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn scope_serializes_with_kind_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(Scope::Project(id)).unwrap();
        assert_eq!(json["kind"], "project");
        assert_eq!(json["id"], id.to_string());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Role;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Project {
    pub fn new(org_id: Uuid, name: String, slug: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4(),
            org_id,
            name,
            slug,
            description,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Project listing row for one user: their role plus counts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProjectSummary {
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub secret_count: i64,
    pub member_count: i64,
    pub updated_utc: DateTime<Utc>,
}

/// A project as seen by one member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDetails {
    #[serde(flatten)]
    pub project: Project,
    pub role: Role,
}

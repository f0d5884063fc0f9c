use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{MemberDetails, Role};

/// Tenant root aggregate.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub org_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            org_id: Uuid::new_v4(),
            name,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// One of the caller's orgs, as shown in their org switcher.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct OrgSummary {
    pub org_id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub is_active: bool,
    pub joined_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrgDetails {
    pub org: Organization,
    pub role: Role,
    pub members: Vec<MemberDetails>,
}

//! Users as provisioned from an upstream identity provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, name: Option<String>, image: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            email,
            name,
            image,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Identity already verified by the OAuth handshake upstream.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VerifiedIdentity {
    #[validate(length(min = 1, max = 50))]
    pub provider: String,
    #[validate(length(min = 1, max = 255))]
    pub provider_account_id: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 255))]
    pub name: Option<String>,
    #[validate(url)]
    pub image: Option<String>,
}

//! Single-use org invitations. Only the SHA-256 of the token is stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Invitation {
    pub invitation_id: Uuid,
    pub org_id: Uuid,
    pub token_hash: String,
    pub invited_by: Uuid,
    pub expiry_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl Invitation {
    pub fn new(
        org_id: Uuid,
        token_hash: String,
        invited_by: Uuid,
        expiry_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            invitation_id: Uuid::new_v4(),
            org_id,
            token_hash,
            invited_by,
            expiry_utc,
            created_utc: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }
}

/// Returned exactly once to the inviter; the raw token is not recoverable later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedInvitation {
    pub invitation_id: Uuid,
    pub org_id: Uuid,
    pub token: String,
    pub expiry_utc: DateTime<Utc>,
}

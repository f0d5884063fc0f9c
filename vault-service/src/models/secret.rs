//! Secrets and their per-environment encrypted values.
//!
//! Stored rows only ever hold ciphertext. The `*View` types carry decrypted
//! plaintext and exist only for the duration of a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: &'static [Environment] = &[
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "DEVELOPMENT",
            Environment::Staging => "STAGING",
            Environment::Production => "PRODUCTION",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVELOPMENT" => Ok(Environment::Development),
            "STAGING" => Ok(Environment::Staging),
            "PRODUCTION" => Ok(Environment::Production),
            other => Err(UnknownVariant {
                kind: "environment",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub secret_id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Secret {
    pub fn new(project_id: Uuid, key: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            secret_id: Uuid::new_v4(),
            project_id,
            key,
            description,
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SecretValue {
    pub value_id: Uuid,
    pub secret_id: Uuid,
    #[sqlx(try_from = "String")]
    pub environment: Environment,
    pub ciphertext: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SecretValue {
    pub fn new(secret_id: Uuid, environment: Environment, ciphertext: String) -> Self {
        let now = Utc::now();
        Self {
            value_id: Uuid::new_v4(),
            secret_id,
            environment,
            ciphertext,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// A superseded ciphertext, appended whenever a value is overwritten.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct SecretValueHistory {
    pub history_id: Uuid,
    pub value_id: Uuid,
    pub ciphertext: String,
    pub changed_by: Option<Uuid>,
    pub changed_utc: DateTime<Utc>,
}

/// Freshly encrypted value on its way into storage.
#[derive(Debug, Clone)]
pub struct EncryptedValue {
    pub environment: Environment,
    pub ciphertext: String,
}

/// A secret with all of its stored (encrypted) values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRecord {
    pub secret: Secret,
    pub values: Vec<SecretValue>,
}

/// A current value together with its change history, newest first.
#[derive(Debug, Clone)]
pub struct ValueHistory {
    pub value: SecretValue,
    pub history: Vec<SecretValueHistory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretValueView {
    pub value_id: Uuid,
    pub environment: Environment,
    pub value: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretView {
    pub secret_id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub values: Vec<SecretValueView>,
}

impl SecretView {
    pub fn value_for(&self, environment: Environment) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.environment == environment)
            .map(|v| v.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntryView {
    pub history_id: Uuid,
    pub value: String,
    pub changed_by: Option<Uuid>,
    pub changed_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueHistoryView {
    pub environment: Environment,
    pub current: String,
    pub updated_utc: DateTime<Utc>,
    pub history: Vec<HistoryEntryView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretHistoryView {
    pub secret_id: Uuid,
    pub key: String,
    pub environments: Vec<ValueHistoryView>,
}

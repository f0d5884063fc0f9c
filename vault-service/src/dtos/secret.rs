use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One environment's plaintext. Fields are optional so that malformed
/// entries in an update can be skipped instead of failing the request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretValueInput {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl SecretValueInput {
    pub fn new(environment: &str, value: &str) -> Self {
        Self {
            environment: Some(environment.to_string()),
            value: Some(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateSecretRequest {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub values: Vec<SecretValueInput>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateSecretRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub values: Vec<SecretValueInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSecretResponse {
    pub secret_id: Uuid,
    pub values_removed: u64,
}

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{OrgSummary, ProjectSummary, User};

/// Returned once per provisioning; only the token's hash is stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionIdentityResponse {
    pub user: User,
    pub api_token: String,
}

/// The caller and every org and project they belong to.
#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user: User,
    pub orgs: Vec<OrgSummary>,
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(url, length(max = 2048))]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenValidationResponse {
    pub valid: bool,
    pub user: User,
}

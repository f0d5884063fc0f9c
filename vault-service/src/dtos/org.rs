use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateOrgRequest {
    #[validate(length(
        min = 3,
        max = 50,
        message = "Organization name must be between 3 and 50 characters"
    ))]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateOrgRequest {
    #[validate(length(
        min = 3,
        max = 50,
        message = "Organization name must be between 3 and 50 characters"
    ))]
    pub name: String,
}

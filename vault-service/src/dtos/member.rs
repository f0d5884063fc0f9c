use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::Role;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeRoleRequest {
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferOwnershipRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddProjectMemberRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AcceptInvitationRequest {
    #[validate(length(min = 1, message = "Invitation token is required"))]
    pub token: String,
}

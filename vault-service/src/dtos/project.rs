use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct CreateProjectRequest {
    /// Defaults to the caller's active org.
    #[serde(default)]
    pub org_id: Option<Uuid>,
    #[validate(length(
        min = 2,
        max = 100,
        message = "Project name must be between 2 and 100 characters"
    ))]
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
}

/// Partial update; an empty description clears it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    #[validate(length(
        min = 2,
        max = 100,
        message = "Project name must be between 2 and 100 characters"
    ))]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,
}

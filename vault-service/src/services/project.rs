//! Projects within an org.

use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::audit::{AuditEvent, RequestContext};
use super::cache::{self, Ttl};
use super::error::ServiceError;
use super::rate_limit::OperationClass;
use super::ServiceContext;
use crate::dtos::project::{CreateProjectRequest, UpdateProjectRequest};
use crate::models::{AuditAction, Project, ProjectDetails, ProjectSummary, Role, Scope};

const SLUG_MIN: usize = 3;
const SLUG_MAX: usize = 100;

/// Lowercase, with every run of non-alphanumerics collapsed into one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// `^[a-z0-9]+(?:-[a-z0-9]+)*$`, 3 to 100 characters.
fn validate_slug(slug: &str) -> Result<(), ServiceError> {
    let well_formed = !slug.is_empty()
        && slug
            .split('-')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    if !well_formed {
        return Err(ServiceError::invalid(
            "slug",
            "Slug may only contain lowercase letters, digits and single hyphens",
        ));
    }
    if !(SLUG_MIN..=SLUG_MAX).contains(&slug.len()) {
        return Err(ServiceError::invalid(
            "slug",
            format!("Slug must be between {} and {} characters", SLUG_MIN, SLUG_MAX),
        ));
    }
    Ok(())
}

fn clean_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

#[derive(Clone)]
pub struct ProjectService {
    ctx: ServiceContext,
}

impl ProjectService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, request, rctx), fields(user_id = %actor, org_id = %org_id))]
    pub async fn create_project(
        &self,
        actor: Uuid,
        org_id: Uuid,
        mut request: CreateProjectRequest,
        rctx: &RequestContext,
    ) -> Result<Project, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Org(org_id), Role::MANAGERS)
            .await?;

        request.name = request.name.trim().to_string();
        request.validate()?;
        let slug = match request.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(slug) => slug.to_string(),
            None => slugify(&request.name),
        };
        validate_slug(&slug)?;

        let project = Project::new(
            org_id,
            request.name,
            slug,
            clean_description(request.description),
        );
        let project = self.ctx.store.create_project(&project, actor).await?;

        self.ctx.invalidate_user_views(&[actor]).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::CreateProject,
                    "project",
                    format!("Created project {}", project.name),
                )
                .org(org_id)
                .project(project.project_id)
                .metadata(json!({ "name": project.name, "slug": project.slug })),
                rctx,
            )
            .await;

        info!(project_id = %project.project_id, "Project created");
        Ok(project)
    }

    pub async fn list_projects(&self, actor: Uuid) -> Result<Vec<ProjectSummary>, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        let store = self.ctx.store.clone();
        self.ctx
            .cache
            .get_or_compute(
                &cache::user_projects_key(actor),
                Ttl::Short,
                move || async move { store.list_projects_for_user(actor).await },
            )
            .await
    }

    pub async fn get_project(
        &self,
        actor: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectDetails, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        let membership = self
            .ctx
            .authz
            .require_member(actor, Scope::Project(project_id))
            .await?;
        let project = self.load(project_id).await?;
        Ok(ProjectDetails {
            project,
            role: membership.role,
        })
    }

    #[instrument(skip(self, request, rctx), fields(user_id = %actor, project_id = %project_id))]
    pub async fn update_project(
        &self,
        actor: Uuid,
        project_id: Uuid,
        request: UpdateProjectRequest,
        rctx: &RequestContext,
    ) -> Result<Project, ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Project(project_id), Role::MANAGERS)
            .await?;

        let request = UpdateProjectRequest {
            name: request.name.map(|n| n.trim().to_string()),
            ..request
        };
        request.validate()?;

        let mut project = self.load(project_id).await?;
        let mut changed = Vec::new();
        if let Some(name) = request.name {
            project.name = name;
            changed.push("name");
        }
        if let Some(slug) = request.slug {
            let slug = slug.trim().to_string();
            validate_slug(&slug)?;
            project.slug = slug;
            changed.push("slug");
        }
        if let Some(description) = request.description {
            project.description = clean_description(Some(description));
            changed.push("description");
        }

        let project = self.ctx.store.update_project(&project).await?;

        self.ctx.refresh_project(project_id, &[]).await;
        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::UpdateProject,
                    "project",
                    format!("Updated project {}", project.name),
                )
                .org(project.org_id)
                .project(project_id)
                .metadata(json!({ "changed": changed })),
                rctx,
            )
            .await;

        Ok(project)
    }

    #[instrument(skip(self, rctx), fields(user_id = %actor, project_id = %project_id))]
    pub async fn delete_project(
        &self,
        actor: Uuid,
        project_id: Uuid,
        rctx: &RequestContext,
    ) -> Result<(), ServiceError> {
        self.ctx.limiter.check(actor, OperationClass::Org)?;
        self.ctx
            .authz
            .require_role(actor, Scope::Project(project_id), Role::OWNER_ONLY)
            .await?;

        let project = self.load(project_id).await?;
        let former_members = self.ctx.store.delete_project(project_id).await?;

        let mut keys = vec![cache::project_secrets_key(project_id)];
        keys.extend(former_members.iter().map(|u| cache::user_projects_key(*u)));
        self.ctx.cache.invalidate(&keys).await;

        self.ctx
            .audit
            .record(
                actor,
                AuditEvent::new(
                    AuditAction::DeleteProject,
                    "project",
                    format!("Deleted project {}", project.name),
                )
                .org(project.org_id)
                .metadata(json!({
                    "project_id": project_id,
                    "name": project.name,
                    "slug": project.slug,
                })),
                rctx,
            )
            .await;

        info!("Project deleted");
        Ok(())
    }

    async fn load(&self, project_id: Uuid) -> Result<Project, ServiceError> {
        self.ctx
            .store
            .find_project(project_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Project"))
    }
}

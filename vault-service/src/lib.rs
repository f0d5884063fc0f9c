pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::VaultConfig;
use crate::services::{
    ActorRateLimiter, AuditArchive, AuditLogService, CacheBackend, CacheLayer, CryptoEngine,
    IdentityService, MembershipService, OrgService, ProjectService, SecretVault, ServiceContext,
    VaultStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: VaultConfig,
    pub store: Arc<dyn VaultStore>,
    pub cache: Arc<dyn CacheBackend>,
    pub identity: IdentityService,
    pub orgs: OrgService,
    pub projects: ProjectService,
    pub members: MembershipService,
    pub vault: SecretVault,
    pub audit_logs: AuditLogService,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire every service over the given collaborators. Fails if the
    /// encryption master secret is unusable.
    pub fn new(
        config: VaultConfig,
        store: Arc<dyn VaultStore>,
        cache: Arc<dyn CacheBackend>,
        archive: Arc<dyn AuditArchive>,
    ) -> Result<Self, AppError> {
        let crypto = CryptoEngine::new(&config.security.encryption_key)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}", e)))?;

        let ctx = ServiceContext::new(
            store.clone(),
            CacheLayer::new(cache.clone(), config.cache),
            ActorRateLimiter::new(&config.rate_limit),
        );
        let ip_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        );

        Ok(Self {
            identity: IdentityService::new(ctx.clone()),
            orgs: OrgService::new(ctx.clone()),
            projects: ProjectService::new(ctx.clone()),
            members: MembershipService::new(ctx.clone(), config.invitation_ttl_hours),
            vault: SecretVault::new(ctx.clone(), Arc::new(crypto)),
            audit_logs: AuditLogService::new(ctx, archive),
            ip_rate_limiter,
            config,
            store,
            cache,
        })
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(middleware::admin::ADMIN_API_KEY_HEADER),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route(
            "/internal/identities",
            post(handlers::identity::provision_identity),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let api_routes = Router::new()
        // Account
        .route(
            "/me",
            get(handlers::identity::get_profile)
                .patch(handlers::identity::update_profile)
                .delete(handlers::identity::delete_account),
        )
        .route("/auth/validate", post(handlers::identity::validate_token))
        // Organizations
        .route(
            "/orgs",
            get(handlers::org::list_orgs).post(handlers::org::create_org),
        )
        .route(
            "/orgs/:org_id",
            get(handlers::org::get_org)
                .patch(handlers::org::update_org)
                .delete(handlers::org::delete_org),
        )
        .route(
            "/orgs/:org_id/activate",
            post(handlers::org::switch_active_org),
        )
        .route(
            "/orgs/:org_id/members",
            get(handlers::member::list_org_members),
        )
        .route(
            "/orgs/:org_id/members/:user_id",
            patch(handlers::member::change_org_member_role)
                .delete(handlers::member::remove_org_member),
        )
        .route(
            "/orgs/:org_id/transfer-ownership",
            post(handlers::member::transfer_org_ownership),
        )
        .route(
            "/orgs/:org_id/invitations",
            post(handlers::member::create_invite),
        )
        .route(
            "/orgs/:org_id/audit-logs",
            get(handlers::audit::list_audit_logs).delete(handlers::audit::purge_audit_logs),
        )
        .route("/invitations/accept", post(handlers::member::accept_invite))
        // Projects
        .route(
            "/projects",
            get(handlers::project::list_projects).post(handlers::project::create_project),
        )
        .route(
            "/projects/:project_id",
            get(handlers::project::get_project)
                .patch(handlers::project::update_project)
                .delete(handlers::project::delete_project),
        )
        .route(
            "/projects/:project_id/members",
            get(handlers::member::list_project_members)
                .post(handlers::member::add_project_member),
        )
        .route(
            "/projects/:project_id/members/:user_id",
            patch(handlers::member::change_project_member_role)
                .delete(handlers::member::remove_project_member),
        )
        .route(
            "/projects/:project_id/transfer-ownership",
            post(handlers::member::transfer_project_ownership),
        )
        // Secrets
        .route(
            "/projects/:project_id/secrets",
            get(handlers::secret::list_secrets).post(handlers::secret::create_secret),
        )
        .route(
            "/projects/:project_id/secrets/:secret_id",
            patch(handlers::secret::update_secret).delete(handlers::secret::delete_secret),
        )
        .route(
            "/projects/:project_id/secrets/:secret_id/history",
            get(handlers::secret::secret_history),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let ip_limiter = state.ip_rate_limiter.clone();
    let cors = cors_layer(&state.config.security.allowed_origins);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(internal_routes)
        .merge(api_routes)
        .with_state(state)
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

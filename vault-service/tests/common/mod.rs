//! Test helpers for vault-service integration tests.
//!
//! `TestApp::spawn()` serves the full router over the in-memory store, the
//! mock cache and an in-memory archive on an ephemeral port.

#![allow(dead_code)]

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

use vault_service::{
    build_router,
    config::{
        CacheConfig, DatabaseConfig, Environment, RateLimitConfig, RedisConfig, SecurityConfig,
        VaultConfig,
    },
    services::{InMemoryStore, MemoryArchive, MockCache},
    AppState,
};

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";
pub const TEST_ENCRYPTION_KEY: &str = "test-master-secret";

pub fn test_config() -> VaultConfig {
    let rate_limit = RateLimitConfig {
        global_ip_limit: 100_000,
        ..RateLimitConfig::default()
    };

    VaultConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "vault-service".to_string(),
        service_version: "test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
            tx_timeout_seconds: 5,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: SecretString::new(TEST_ADMIN_API_KEY.to_string()),
            encryption_key: SecretString::new(TEST_ENCRYPTION_KEY.to_string()),
        },
        cache: CacheConfig::default(),
        invitation_ttl_hours: 12,
        audit_archive_dir: PathBuf::from("unused"),
        rate_limit,
    }
}

/// A provisioned user and their bearer token.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub user_id: Uuid,
    pub email: String,
    pub token: String,
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<MockCache>,
    pub archive: Arc<MemoryArchive>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: VaultConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MockCache::new());
        let archive = Arc::new(MemoryArchive::new());
        Self::spawn_over(config, store, cache, archive).await
    }

    /// Serve a second app over existing collaborators, e.g. with another key.
    pub async fn spawn_over(
        config: VaultConfig,
        store: Arc<InMemoryStore>,
        cache: Arc<MockCache>,
        archive: Arc<MemoryArchive>,
    ) -> Self {
        let state = AppState::new(config, store.clone(), cache.clone(), archive.clone())
            .expect("Failed to build app state");
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server failed");
        });

        Self {
            address: format!("http://{}", addr),
            client: reqwest::Client::new(),
            state,
            store,
            cache,
            archive,
        }
    }

    pub fn request(&self, method: Method, user: &TestUser, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.address, path))
            .bearer_auth(&user.token)
    }

    pub async fn get(&self, user: &TestUser, path: &str) -> Response {
        self.request(Method::GET, user, path)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post(&self, user: &TestUser, path: &str, body: Value) -> Response {
        self.request(Method::POST, user, path)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn patch(&self, user: &TestUser, path: &str, body: Value) -> Response {
        self.request(Method::PATCH, user, path)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, user: &TestUser, path: &str) -> Response {
        self.request(Method::DELETE, user, path)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Provision a user through the internal identity endpoint.
    pub async fn provision(&self, handle: &str) -> TestUser {
        let email = format!("{}@example.com", handle);
        let response = self
            .client
            .post(format!("{}/internal/identities", self.address))
            .header("x-admin-api-key", TEST_ADMIN_API_KEY)
            .json(&json!({
                "provider": "github",
                "provider_account_id": format!("gh-{}", handle),
                "email": email,
                "name": handle,
            }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: Value = response.json().await.unwrap();
        TestUser {
            user_id: body["user"]["user_id"].as_str().unwrap().parse().unwrap(),
            email,
            token: body["api_token"].as_str().unwrap().to_string(),
        }
    }

    pub async fn create_org(&self, owner: &TestUser, name: &str) -> Uuid {
        let response = self.post(owner, "/orgs", json!({ "name": name })).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        body["org_id"].as_str().unwrap().parse().unwrap()
    }

    /// Invite `invitee` to `org_id` and accept; returns the accept response.
    pub async fn invite_and_accept(
        &self,
        inviter: &TestUser,
        org_id: Uuid,
        invitee: &TestUser,
    ) -> Response {
        let token = self.invite(inviter, org_id).await;
        self.post(invitee, "/invitations/accept", json!({ "token": token }))
            .await
    }

    pub async fn invite(&self, inviter: &TestUser, org_id: Uuid) -> String {
        let response = self
            .request(Method::POST, inviter, &format!("/orgs/{}/invitations", org_id))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn create_project(&self, user: &TestUser, org_id: Uuid, name: &str) -> Uuid {
        let response = self
            .post(user, "/projects", json!({ "org_id": org_id, "name": name }))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        body["project_id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn add_project_member(
        &self,
        actor: &TestUser,
        project_id: Uuid,
        user: &TestUser,
        role: &str,
    ) {
        let response = self
            .post(
                actor,
                &format!("/projects/{}/members", project_id),
                json!({ "user_id": user.user_id, "role": role }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    pub async fn set_org_role(&self, actor: &TestUser, org_id: Uuid, user: &TestUser, role: &str) {
        let response = self
            .patch(
                actor,
                &format!("/orgs/{}/members/{}", org_id, user.user_id),
                json!({ "role": role }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

pub async fn error_kind(response: Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

pub fn fresh_cache() -> Arc<MockCache> {
    Arc::new(MockCache::new())
}

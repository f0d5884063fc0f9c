mod common;

use chrono::{Duration, Utc};
use common::{error_kind, TestApp, TestUser};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;
use vault_service::models::AuditAction;

/// Alice owns an org with one project, one secret and Bob as a member.
async fn busy_org(app: &TestApp) -> (TestUser, TestUser, Uuid, Uuid) {
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, org_id, &bob).await;
    let project_id = app.create_project(&alice, org_id, "infra").await;
    app.post(
        &alice,
        &format!("/projects/{}/secrets", project_id),
        json!({ "key": "TOKEN", "values": [{ "environment": "STAGING", "value": "t" }] }),
    )
    .await;
    (alice, bob, org_id, project_id)
}

async fn audit_page(app: &TestApp, user: &TestUser, org_id: Uuid, query: &str) -> Value {
    let response = app
        .get(user, &format!("/orgs/{}/audit-logs{}", org_id, query))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn mutations_are_recorded_with_request_context() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;

    let response = app
        .request(Method::POST, &alice, "/orgs")
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
        .header("user-agent", "vault-cli/1.0")
        .header("x-request-id", "req-audit-1")
        .json(&json!({ "name": "Acme" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let entries = app.store.audit_entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.action, AuditAction::CreateOrg);
    assert_eq!(entry.user_id, alice.user_id);
    assert_eq!(entry.ip_address, "203.0.113.7");
    assert_eq!(entry.user_agent, "vault-cli/1.0");
    assert_eq!(entry.metadata["request_id"], "req-audit-1");
}

#[tokio::test]
async fn oversized_forwarded_header_still_records_peer_address() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let response = app
        .request(Method::PATCH, &alice, &format!("/orgs/{}", org_id))
        .header("x-forwarded-for", "9".repeat(200))
        .header("user-agent", "a".repeat(4096))
        .json(&json!({ "name": "Acme Corp" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let entries = app.store.audit_entries();
    let entry = entries
        .iter()
        .find(|e| e.action == AuditAction::UpdateOrg)
        .expect("update audited");
    assert_eq!(entry.ip_address, "127.0.0.1");
    assert!(entry.user_agent.len() <= 512);
}

#[tokio::test]
async fn listing_filters_and_paginates() {
    let app = TestApp::spawn().await;
    let (alice, bob, org_id, project_id) = busy_org(&app).await;

    let page = audit_page(&app, &alice, org_id, "").await;
    let total = page["pagination"]["total_items"].as_i64().unwrap();
    assert!(total >= 5);
    assert_eq!(page["entries"][0]["action"], "CREATE.SECRET");

    let page = audit_page(&app, &alice, org_id, "?action=ACCEPT.ORG_INVITE").await;
    assert_eq!(page["pagination"]["total_items"], 1);
    assert_eq!(page["entries"][0]["user_id"], bob.user_id.to_string());

    let page = audit_page(&app, &alice, org_id, &format!("?project_id={}", project_id)).await;
    assert_eq!(page["pagination"]["total_items"], 2);

    let page = audit_page(&app, &alice, org_id, "?page=2&limit=2").await;
    assert_eq!(page["entries"].as_array().unwrap().len(), 2);
    assert_eq!(page["pagination"]["has_prev"], true);

    let actions: Vec<&str> = page["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert!(actions.contains(&"CREATE.PROJECT"));
}

#[tokio::test]
async fn listing_validates_query_and_role() {
    let app = TestApp::spawn().await;
    let (alice, bob, org_id, _) = busy_org(&app).await;

    for query in ["?action=update secret", "?limit=0", "?limit=101", "?page=0"] {
        let response = app
            .get(&alice, &format!("/orgs/{}/audit-logs{}", org_id, query))
            .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{query}");
        assert_eq!(error_kind(response).await, "validation_error");
    }

    let response = app.get(&bob, &format!("/orgs/{}/audit-logs", org_id)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn new_entries_invalidate_cached_pages() {
    let app = TestApp::spawn().await;
    let (alice, _, org_id, _) = busy_org(&app).await;

    let before = audit_page(&app, &alice, org_id, "").await["pagination"]["total_items"]
        .as_i64()
        .unwrap();
    app.patch(&alice, &format!("/orgs/{}", org_id), json!({ "name": "Acme Corp" }))
        .await;
    let after = audit_page(&app, &alice, org_id, "").await["pagination"]["total_items"]
        .as_i64()
        .unwrap();

    assert_eq!(after, before + 1);
}

async fn purge(app: &TestApp, user: &TestUser, org_id: Uuid, body: Value) -> reqwest::Response {
    app.request(Method::DELETE, user, &format!("/orgs/{}/audit-logs", org_id))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn purge_archives_then_deletes_and_logs_itself() {
    let app = TestApp::spawn().await;
    let (alice, _, org_id, _) = busy_org(&app).await;
    let before = app.store.audit_entries().len();

    let cutoff = Utc::now() + Duration::seconds(1);
    let response = purge(&app, &alice, org_id, json!({ "older_than": cutoff })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["purged"], before);
    assert_eq!(body["archive"], "batch-1");

    let batches = app.archive.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, org_id);
    assert_eq!(batches[0].1.len(), before);

    let remaining = app.store.audit_entries();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action, AuditAction::PurgeAuditLog);
    assert_eq!(remaining[0].metadata["count"], before);
    assert_eq!(remaining[0].metadata["archive"], "batch-1");
}

#[tokio::test]
async fn purge_is_owner_only_and_needs_a_filter() {
    let app = TestApp::spawn().await;
    let (alice, bob, org_id, _) = busy_org(&app).await;
    app.set_org_role(&alice, org_id, &bob, "ADMIN").await;

    let response = purge(&app, &bob, org_id, json!({ "older_than": Utc::now() })).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = purge(&app, &alice, org_id, json!({})).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let long_ago = Utc::now() - Duration::days(365);
    let response = purge(&app, &alice, org_id, json!({ "older_than": long_ago })).await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["purged"], 0);
    assert!(app.archive.batches().is_empty());
}

#[tokio::test]
async fn purge_aborts_when_archive_fails() {
    let app = TestApp::spawn().await;
    let (alice, _, org_id, _) = busy_org(&app).await;
    let before = app.store.audit_entries();
    app.archive.set_failing(true);

    let response = purge(&app, &alice, org_id, json!({ "older_than": Utc::now() })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.store.audit_entries(), before);
}

#[tokio::test]
async fn purge_aborts_when_it_cannot_log_itself() {
    let app = TestApp::spawn().await;
    let (alice, _, org_id, _) = busy_org(&app).await;
    let before = app.store.audit_entries();
    app.store.fail_audit_writes(true);

    let response = purge(&app, &alice, org_id, json!({ "older_than": Utc::now() })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.store.audit_entries(), before);
}

#[tokio::test]
async fn failed_audit_writes_do_not_fail_the_operation() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    app.store.fail_audit_writes(true);

    let response = app.post(&alice, "/orgs", json!({ "name": "Acme" })).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(app.store.audit_entries().is_empty());
}

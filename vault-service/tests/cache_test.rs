mod common;

use common::TestApp;
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn cached_secret_lists_hold_ciphertext_only() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;
    let project_id = app.create_project(&alice, org_id, "infra").await;
    let path = format!("/projects/{}/secrets", project_id);

    app.post(
        &alice,
        &path,
        json!({
            "key": "DB_PASSWORD",
            "values": [{ "environment": "PRODUCTION", "value": "hunter2-plaintext" }],
        }),
    )
    .await;
    let response = app.get(&alice, &path).await;
    assert_eq!(response.status(), StatusCode::OK);

    let key = format!("project:secrets:{}", project_id);
    let raw = app.cache.raw(&key).expect("secret list should be cached");
    assert!(raw.contains("DB_PASSWORD"));
    assert!(!raw.contains("hunter2-plaintext"));
}

#[tokio::test]
async fn writes_invalidate_cached_reads() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;
    let project_id = app.create_project(&alice, org_id, "infra").await;
    let path = format!("/projects/{}/secrets", project_id);

    let secrets: Vec<Value> = app.get(&alice, &path).await.json().await.unwrap();
    assert!(secrets.is_empty());

    let created: Value = app
        .post(
            &alice,
            &path,
            json!({ "key": "TOKEN", "values": [{ "environment": "STAGING", "value": "one" }] }),
        )
        .await
        .json()
        .await
        .unwrap();
    let secrets: Vec<Value> = app.get(&alice, &path).await.json().await.unwrap();
    assert_eq!(secrets.len(), 1);

    app.patch(
        &alice,
        &format!("{}/{}", path, created["secret_id"].as_str().unwrap()),
        json!({ "values": [{ "environment": "STAGING", "value": "two" }] }),
    )
    .await;
    let secrets: Vec<Value> = app.get(&alice, &path).await.json().await.unwrap();
    assert_eq!(secrets[0]["values"][0]["value"], "two");

    // Project summaries embed the secret count and must follow suit.
    let projects: Vec<Value> = app.get(&alice, "/projects").await.json().await.unwrap();
    assert_eq!(projects[0]["secret_count"], 1);
}

#[tokio::test]
async fn unavailable_cache_reads_through() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;

    app.cache.set_unavailable(true);

    let project_id = app.create_project(&alice, org_id, "infra").await;
    let response = app
        .post(
            &alice,
            &format!("/projects/{}/secrets", project_id),
            json!({ "key": "TOKEN", "values": [{ "environment": "STAGING", "value": "v" }] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let secrets: Vec<Value> = app
        .get(&alice, &format!("/projects/{}/secrets", project_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(secrets.len(), 1);

    let orgs: Vec<Value> = app.get(&alice, "/orgs").await.json().await.unwrap();
    assert_eq!(orgs.len(), 1);
    assert!(app.cache.keys().is_empty());
}

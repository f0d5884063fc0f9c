mod common;

use common::{error_kind, test_config, TestApp, TestUser};
use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::{json, Value};
use uuid::Uuid;

struct Fixture {
    app: TestApp,
    owner: TestUser,
    member: TestUser,
    admin: TestUser,
    project_id: Uuid,
}

/// Alice owns org and project; Bob is a project MEMBER, Carol a project ADMIN.
async fn fixture() -> Fixture {
    let app = TestApp::spawn().await;
    let owner = app.provision("alice").await;
    let member = app.provision("bob").await;
    let admin = app.provision("carol").await;

    let org_id = app.create_org(&owner, "Acme").await;
    app.invite_and_accept(&owner, org_id, &member).await;
    app.invite_and_accept(&owner, org_id, &admin).await;

    let project_id = app.create_project(&owner, org_id, "infra").await;
    app.add_project_member(&owner, project_id, &member, "MEMBER").await;
    app.add_project_member(&owner, project_id, &admin, "ADMIN").await;

    Fixture {
        app,
        owner,
        member,
        admin,
        project_id,
    }
}

async fn create_api_key(f: &Fixture) -> Uuid {
    let response = f
        .app
        .post(
            &f.owner,
            &format!("/projects/{}/secrets", f.project_id),
            json!({
                "key": "api key",
                "values": [{ "environment": "PRODUCTION", "value": "abc123" }],
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["key"], "API_KEY");
    body["secret_id"].as_str().unwrap().parse().unwrap()
}

fn production_value(secrets: &[Value]) -> String {
    secrets[0]["values"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["environment"] == "PRODUCTION")
        .map(|v| v["value"].as_str().unwrap().to_string())
        .unwrap()
}

#[tokio::test]
async fn member_reads_admin_writes() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;
    let secrets_path = format!("/projects/{}/secrets", f.project_id);
    let secret_path = format!("{}/{}", secrets_path, secret_id);

    let secrets: Vec<Value> = f.app.get(&f.member, &secrets_path).await.json().await.unwrap();
    assert_eq!(production_value(&secrets), "abc123");

    let response = f
        .app
        .patch(
            &f.member,
            &secret_path,
            json!({ "values": [{ "environment": "PRODUCTION", "value": "hacked" }] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let before = f.app.store.ciphertexts(secret_id);
    let response = f
        .app
        .patch(
            &f.admin,
            &secret_path,
            json!({ "values": [{ "environment": "PRODUCTION", "value": "xyz789" }] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let after = f.app.store.ciphertexts(secret_id);
    assert_ne!(before, after);

    let secrets: Vec<Value> = f.app.get(&f.member, &secrets_path).await.json().await.unwrap();
    assert_eq!(production_value(&secrets), "xyz789");
}

#[tokio::test]
async fn identical_plaintext_encrypts_differently() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;
    let secret_path = format!("/projects/{}/secrets/{}", f.project_id, secret_id);

    let before = f.app.store.ciphertexts(secret_id);
    f.app
        .patch(
            &f.owner,
            &secret_path,
            json!({ "values": [{ "environment": "PRODUCTION", "value": "abc123" }] }),
        )
        .await;
    let after = f.app.store.ciphertexts(secret_id);

    assert_eq!(before.len(), 1);
    assert_eq!(after.len(), 1);
    assert_ne!(before[0], after[0]);
    assert!(!after[0].contains("abc123"));
}

#[tokio::test]
async fn update_upserts_per_environment_and_skips_malformed_entries() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;
    let secret_path = format!("/projects/{}/secrets/{}", f.project_id, secret_id);

    let body = json!({
        "description": "Payment gateway key",
        "values": [
            { "environment": "production", "value": "v2" },
            { "environment": "STAGING", "value": "s1" },
            { "environment": "QA", "value": "ignored" },
            { "environment": "DEVELOPMENT" },
        ],
    });
    let response = f.app.patch(&f.owner, &secret_path, body.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(f.app.store.value_rows(secret_id), 2);

    // Replaying the same update touches the same rows.
    let response = f.app.patch(&f.owner, &secret_path, body).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(f.app.store.value_rows(secret_id), 2);

    let view: Value = response.json().await.unwrap();
    assert_eq!(view["description"], "Payment gateway key");

    let response = f
        .app
        .patch(&f.owner, &secret_path, json!({ "description": "" }))
        .await;
    let view: Value = response.json().await.unwrap();
    assert!(view["description"].is_null());
}

#[tokio::test]
async fn duplicate_key_conflicts_after_normalization() {
    let f = fixture().await;
    create_api_key(&f).await;

    let response = f
        .app
        .post(
            &f.owner,
            &format!("/projects/{}/secrets", f.project_id),
            json!({ "key": "Api-Key", "values": [] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let f = fixture().await;
    let secrets_path = format!("/projects/{}/secrets", f.project_id);

    for body in [
        json!({ "key": "!!!", "values": [] }),
        json!({ "key": "TOKEN", "values": [{ "environment": "QA", "value": "x" }] }),
        json!({ "key": "TOKEN", "values": [{ "environment": "STAGING", "value": "" }] }),
        json!({
            "key": "TOKEN",
            "values": [
                { "environment": "STAGING", "value": "a" },
                { "environment": "staging", "value": "b" },
            ],
        }),
    ] {
        let response = f.app.post(&f.owner, &secrets_path, body).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_kind(response).await, "validation_error");
    }
}

#[tokio::test]
async fn secret_addressed_through_wrong_project_is_a_scope_mismatch() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;

    let org_id = f.app.state.orgs.active_org(f.owner.user_id).await.unwrap();
    let other_project = f.app.create_project(&f.owner, org_id, "other").await;

    let response = f
        .app
        .delete(
            &f.owner,
            &format!("/projects/{}/secrets/{}", other_project, secret_id),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(response).await, "scope_mismatch");
    assert_eq!(f.app.store.value_rows(secret_id), 1);
}

#[tokio::test]
async fn history_lists_superseded_values_newest_first() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;
    let secret_path = format!("/projects/{}/secrets/{}", f.project_id, secret_id);

    for value in ["v2", "v3"] {
        f.app
            .patch(
                &f.owner,
                &secret_path,
                json!({ "values": [{ "environment": "PRODUCTION", "value": value }] }),
            )
            .await;
    }

    let response = f.app.get(&f.member, &format!("{}/history", secret_path)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let history: Value = response.json().await.unwrap();
    assert_eq!(history["key"], "API_KEY");

    let production = &history["environments"][0];
    assert_eq!(production["environment"], "PRODUCTION");
    assert_eq!(production["current"], "v3");
    let previous: Vec<&str> = production["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["value"].as_str().unwrap())
        .collect();
    assert_eq!(previous, vec!["v2", "abc123"]);
}

#[tokio::test]
async fn delete_removes_values() {
    let f = fixture().await;
    let secret_id = create_api_key(&f).await;
    let secret_path = format!("/projects/{}/secrets/{}", f.project_id, secret_id);

    let response = f.app.delete(&f.member, &secret_path).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = f.app.delete(&f.admin, &secret_path).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["values_removed"], 1);
    assert_eq!(f.app.store.value_rows(secret_id), 0);

    let response = f.app.delete(&f.admin, &secret_path).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tampered_key_fails_integrity() {
    let f = fixture().await;
    create_api_key(&f).await;

    let mut config = test_config();
    config.security.encryption_key = SecretString::new("a-different-master-secret".to_string());
    let other = TestApp::spawn_over(
        config,
        f.app.store.clone(),
        common::fresh_cache(),
        f.app.archive.clone(),
    )
    .await;

    let response = other
        .get(&f.member, &format!("/projects/{}/secrets", f.project_id))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert!(!body.to_string().contains("abc123"));
}

mod common;

use common::{error_kind, TestApp};
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn project_names_are_unique_per_org() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let first_org = app.create_org(&alice, "Acme").await;

    let response = app
        .post(&alice, "/projects", json!({ "org_id": first_org, "name": "infra" }))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let project: Value = response.json().await.unwrap();
    assert_eq!(project["slug"], "infra");

    let response = app
        .post(&alice, "/projects", json!({ "org_id": first_org, "name": "infra" }))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let second_org = app.create_org(&alice, "Globex").await;
    let response = app
        .post(&alice, "/projects", json!({ "org_id": second_org, "name": "infra" }))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn project_defaults_to_active_org() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let response = app
        .post(&alice, "/projects", json!({ "name": "Payments API" }))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let project: Value = response.json().await.unwrap();
    assert_eq!(project["org_id"], org_id.to_string());
    assert_eq!(project["slug"], "payments-api");
}

#[tokio::test]
async fn invalid_slug_is_rejected() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let response = app
        .post(
            &alice,
            "/projects",
            json!({ "org_id": org_id, "name": "infra", "slug": "Not A Slug!" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_kind(response).await, "validation_error");
}

#[tokio::test]
async fn members_cannot_create_projects() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, org_id, &bob).await;

    let response = app
        .post(&bob, "/projects", json!({ "org_id": org_id, "name": "infra" }))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn project_listing_follows_membership() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, org_id, &bob).await;
    let project_id = app.create_project(&alice, org_id, "infra").await;

    let listed: Vec<Value> = app.get(&bob, "/projects").await.json().await.unwrap();
    assert!(listed.is_empty());

    app.add_project_member(&alice, project_id, &bob, "MEMBER").await;

    let listed: Vec<Value> = app.get(&bob, "/projects").await.json().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["role"], "MEMBER");
    assert_eq!(listed[0]["member_count"], 2);

    let response = app
        .patch(
            &alice,
            &format!("/projects/{}", project_id),
            json!({ "description": "Terraform state" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let details: Value = app
        .get(&bob, &format!("/projects/{}", project_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["description"], "Terraform state");
    assert_eq!(details["role"], "MEMBER");

    let response = app.delete(&alice, &format!("/projects/{}", project_id)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let listed: Vec<Value> = app.get(&bob, "/projects").await.json().await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn outsiders_cannot_join_projects() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let mallory = app.provision("mallory").await;
    let org_id = app.create_org(&alice, "Acme").await;
    let project_id = app.create_project(&alice, org_id, "infra").await;

    let response = app
        .post(
            &alice,
            &format!("/projects/{}/members", project_id),
            json!({ "user_id": mallory.user_id }),
        )
        .await;
    assert!(response.status().is_client_error());
}

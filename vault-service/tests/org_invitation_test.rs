mod common;

use chrono::{Duration, Utc};
use common::{error_kind, TestApp};
use reqwest::StatusCode;
use serde_json::{json, Value};
use vault_service::models::Invitation;
use vault_service::services::{hash_token, VaultStore};

async fn active_orgs(app: &TestApp, user: &common::TestUser) -> Vec<Value> {
    let orgs: Vec<Value> = app.get(user, "/orgs").await.json().await.unwrap();
    orgs.into_iter().filter(|o| o["is_active"] == true).collect()
}

#[tokio::test]
async fn creator_owns_org_and_invitee_joins_as_member() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;

    let org_id = app.create_org(&alice, "Acme").await;

    let response = app.invite_and_accept(&alice, org_id, &bob).await;
    assert_eq!(response.status(), StatusCode::OK);
    let membership: Value = response.json().await.unwrap();
    assert_eq!(membership["role"], "MEMBER");
    assert_eq!(membership["is_active"], true);

    let members: Vec<Value> = app
        .get(&alice, &format!("/orgs/{}/members", org_id))
        .await
        .json()
        .await
        .unwrap();
    let role_of = |email: &str| {
        members
            .iter()
            .find(|m| m["email"] == email)
            .map(|m| m["role"].clone())
            .unwrap()
    };
    assert_eq!(role_of(&alice.email), "OWNER");
    assert_eq!(role_of(&bob.email), "MEMBER");

    assert_eq!(active_orgs(&app, &alice).await.len(), 1);
    assert_eq!(active_orgs(&app, &bob).await.len(), 1);
}

#[tokio::test]
async fn joining_a_second_org_moves_the_active_flag() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;

    let own_org = app.create_org(&bob, "Bob Co").await;
    let acme = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, acme, &bob).await;

    let active = active_orgs(&app, &bob).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["org_id"], acme.to_string());

    let response = app
        .post(&bob, &format!("/orgs/{}/activate", own_org), json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let active = active_orgs(&app, &bob).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["org_id"], own_org.to_string());
}

#[tokio::test]
async fn invitation_is_single_use() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let carol = app.provision("carol").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let token = app.invite(&alice, org_id).await;
    let first = app
        .post(&bob, "/invitations/accept", json!({ "token": token }))
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .post(&carol, "/invitations/accept", json!({ "token": token }))
        .await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn existing_member_cannot_accept_and_token_is_consumed() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let token = app.invite(&alice, org_id).await;
    let response = app
        .post(&alice, "/invitations/accept", json!({ "token": token }))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .post(&bob, "/invitations/accept", json!({ "token": token }))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_invitation_is_gone() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;

    let invitation = Invitation::new(
        org_id,
        hash_token("stale-token"),
        alice.user_id,
        Utc::now() - Duration::hours(1),
    );
    app.store.insert_invitation(&invitation).await.unwrap();

    let response = app
        .post(&bob, "/invitations/accept", json!({ "token": "stale-token" }))
        .await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(error_kind(response).await, "gone");
}

#[tokio::test]
async fn members_cannot_invite_and_outsiders_see_forbidden() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let mallory = app.provision("mallory").await;
    let org_id = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, org_id, &bob).await;

    let response = app
        .request(reqwest::Method::POST, &bob, &format!("/orgs/{}/invitations", org_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let member_body: Value = response.json().await.unwrap();

    let response = app.get(&mallory, &format!("/orgs/{}", org_id)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let outsider_body: Value = response.json().await.unwrap();

    // Same message whether the caller is a low-role member or a stranger.
    assert_eq!(member_body["message"], outsider_body["message"]);
}

#[tokio::test]
async fn owner_renames_and_deletes_org() {
    let app = TestApp::spawn().await;
    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let org_id = app.create_org(&alice, "Acme").await;
    app.invite_and_accept(&alice, org_id, &bob).await;

    let response = app
        .patch(&alice, &format!("/orgs/{}", org_id), json!({ "name": "Acme Corp" }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let details: Value = app
        .get(&bob, &format!("/orgs/{}", org_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["org"]["name"], "Acme Corp");

    let response = app.delete(&bob, &format!("/orgs/{}", org_id)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.delete(&alice, &format!("/orgs/{}", org_id)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let orgs: Vec<Value> = app.get(&bob, "/orgs").await.json().await.unwrap();
    assert!(orgs.is_empty());
}

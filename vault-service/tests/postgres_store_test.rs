//! Store contract checks against a real PostgreSQL. Run with
//! `TEST_DATABASE_URL=... cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vault_service::config::DatabaseConfig;
use vault_service::db::{create_pool, run_migrations};
use vault_service::models::{Organization, Role, Scope, VerifiedIdentity};
use vault_service::services::{PgStore, ServiceError, VaultStore};

async fn store() -> Arc<PgStore> {
    let url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/vault_test".to_string());
    let config = DatabaseConfig {
        url,
        max_connections: 10,
        min_connections: 1,
        tx_timeout_seconds: 5,
    };
    let pool = create_pool(&config).await.expect("Failed to connect");
    run_migrations(&pool).await.expect("Failed to migrate");
    Arc::new(PgStore::new(pool, Duration::from_secs(5)))
}

async fn user(store: &PgStore) -> Uuid {
    let handle = Uuid::new_v4().simple().to_string();
    store
        .upsert_identity(
            &VerifiedIdentity {
                provider: "github".to_string(),
                provider_account_id: handle.clone(),
                email: format!("{}@example.com", handle),
                name: None,
                image: None,
            },
            &handle,
        )
        .await
        .unwrap()
        .user_id
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn concurrent_owner_removals_leave_one_owner() {
    let store = store().await;
    let alice = user(&store).await;
    let bob = user(&store).await;

    let org = Organization::new("Race Co".to_string());
    store.create_org(&org, alice).await.unwrap();
    let scope = Scope::Org(org.org_id);

    // Bob joins and is promoted to OWNER through the store directly.
    let invitation = vault_service::models::Invitation::new(
        org.org_id,
        Uuid::new_v4().to_string(),
        alice,
        chrono::Utc::now() + chrono::Duration::hours(1),
    );
    store.insert_invitation(&invitation).await.unwrap();
    store.accept_invitation(&invitation, bob).await.unwrap();
    store
        .change_role(scope, bob, Role::Owner, Role::Owner)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        store.remove_member(scope, alice, None),
        store.remove_member(scope, bob, None)
    );

    assert!(!(a.is_ok() && b.is_ok()), "both owners were removed");
    assert!(store.count_owners(scope).await.unwrap() >= 1);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn admin_cannot_demote_owner_promoted_concurrently() {
    let store = store().await;
    let alice = user(&store).await;
    let bob = user(&store).await;
    let carol = user(&store).await;

    let org = Organization::new("Hierarchy Co".to_string());
    store.create_org(&org, alice).await.unwrap();
    let scope = Scope::Org(org.org_id);
    for member in [bob, carol] {
        let invitation = vault_service::models::Invitation::new(
            org.org_id,
            Uuid::new_v4().to_string(),
            alice,
            chrono::Utc::now() + chrono::Duration::hours(1),
        );
        store.insert_invitation(&invitation).await.unwrap();
        store.accept_invitation(&invitation, member).await.unwrap();
    }
    store
        .change_role(scope, carol, Role::Admin, Role::Owner)
        .await
        .unwrap();

    // Bob became OWNER after Carol's authorization read saw him as MEMBER.
    store
        .change_role(scope, bob, Role::Owner, Role::Owner)
        .await
        .unwrap();

    let demoted = store.change_role(scope, bob, Role::Member, Role::Admin).await;
    assert!(matches!(demoted, Err(ServiceError::Forbidden(_))));
    let removed = store.remove_member(scope, bob, Some(Role::Admin)).await;
    assert!(matches!(removed, Err(ServiceError::Forbidden(_))));

    let bob_row = store.find_membership(bob, scope).await.unwrap().unwrap();
    assert_eq!(bob_row.role, Role::Owner);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn invitation_accept_is_single_use() {
    let store = store().await;
    let alice = user(&store).await;
    let bob = user(&store).await;
    let carol = user(&store).await;

    let org = Organization::new("Invite Co".to_string());
    store.create_org(&org, alice).await.unwrap();

    let invitation = vault_service::models::Invitation::new(
        org.org_id,
        Uuid::new_v4().to_string(),
        alice,
        chrono::Utc::now() + chrono::Duration::hours(1),
    );
    store.insert_invitation(&invitation).await.unwrap();

    let membership = store.accept_invitation(&invitation, bob).await.unwrap();
    assert_eq!(membership.role, Role::Member);
    assert!(membership.is_active);

    let second = store.accept_invitation(&invitation, carol).await;
    assert!(matches!(second, Err(ServiceError::NotFound(_))));
}

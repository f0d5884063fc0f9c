mod common;

use common::{error_kind, test_config, TestApp};
use reqwest::StatusCode;
use vault_service::config::ClassLimit;

#[tokio::test]
async fn audit_reads_are_throttled_per_actor() {
    let mut config = test_config();
    config.rate_limit.audit = ClassLimit::new(2, 3600);
    let app = TestApp::spawn_with(config).await;

    let alice = app.provision("alice").await;
    let bob = app.provision("bob").await;
    let alice_org = app.create_org(&alice, "Acme").await;
    let bob_org = app.create_org(&bob, "Globex").await;

    let path = format!("/orgs/{}/audit-logs", alice_org);
    for _ in 0..2 {
        let response = app.get(&alice, &path).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.get(&alice, &path).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .expect("retry-after header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(error_kind(response).await, "throttled");

    // Another actor has their own budget.
    let response = app
        .get(&bob, &format!("/orgs/{}/audit-logs", bob_org))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Other operation classes are unaffected.
    let response = app.get(&alice, "/orgs").await;
    assert_eq!(response.status(), StatusCode::OK);
}

//! End-to-end tests of the paywall over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{funded_ledger, TestNode, PAYER, PRICE, RECEIVER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use x402_node::config::StoreDriver;
use x402_node::ledger::DEFAULT_RENT_EXEMPTION_LAMPORTS;
use x402_node::{AllowAll, Error, HostBudgetPolicy, Network, NodeEvent};

#[tokio::test]
async fn test_healthz() {
    let node = TestNode::start().await.unwrap();

    let response = node.http().get(node.url("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({ "status": "ok" })
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_challenge_shape() {
    let node = TestNode::start().await.unwrap();

    let response = node.http().get(node.url("/api/data")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["amount"], json!(PRICE));
    assert_eq!(body["receiverAddress"], json!(RECEIVER));
    assert_eq!(body["network"], json!("devnet"));
    assert_eq!(body["mint"], Value::Null);
    assert!(body["reference"].as_str().is_some_and(|r| !r.is_empty()));
    assert!(body["expiresAt"].is_string());

    // Each challenge gets its own reference
    let first = node.challenge().await.unwrap();
    let second = node.challenge().await.unwrap();
    assert_ne!(first.reference, second.reference);
    assert_eq!(first.network, Network::Devnet);

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_manual_payment_then_cached_resubmission() {
    let node = TestNode::start().await.unwrap();
    let requirements = node.challenge().await.unwrap();
    let sig = node.pay(PRICE, &requirements.reference).await.unwrap();

    let response = node.redeem(&sig, &requirements.reference).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"], json!("Secret resource for paid users"));
    assert_eq!(body["paid"], json!(true));
    assert_eq!(body["reference"], json!(requirements.reference));
    assert_eq!(body["txSig"], json!(sig));

    // Resubmission is served from the store without another ledger lookup
    let fetches = node.ledger().transaction_fetches();
    let again = node.redeem(&sig, &requirements.reference).await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["txSig"], json!(sig));
    assert_eq!(node.ledger().transaction_fetches(), fetches);

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_payment_client_full_flow() {
    let mut node = TestNode::start().await.unwrap();
    let mut events = node.events().unwrap();
    let client = node.payment_client(Arc::new(AllowAll));

    let outcome = client.fetch(&node.url("/api/data")).await.unwrap();
    assert_eq!(outcome.status, 200);
    assert!(outcome.paid);
    let body: Value = serde_json::from_str(&outcome.body).unwrap();
    assert_eq!(body["paid"], json!(true));
    assert_eq!(body["txSig"], json!(outcome.tx_sig.clone().unwrap()));

    // The receiver started empty, so the client topped up rent exemption
    assert_eq!(
        node.ledger().balance(RECEIVER),
        PRICE + DEFAULT_RENT_EXEMPTION_LAMPORTS
    );

    let consumed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let NodeEvent::PaymentConsumed { payer, .. } = events.recv().await.unwrap() {
                break payer;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(consumed, PAYER);

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_policy_denial_pays_nothing() {
    let node = TestNode::start().await.unwrap();
    let policy = HostBudgetPolicy {
        max_lamports_per_task: 1_000_000,
        whitelist_hosts: vec!["example.com".to_string()],
    };
    let client = node.payment_client(Arc::new(policy));

    let result = client.fetch(&node.url("/api/data")).await;
    assert!(matches!(result, Err(Error::PolicyDenied(_))));
    assert_eq!(node.ledger().transaction_count(), 0);

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_replay_across_references_rejected() {
    let node = TestNode::start().await.unwrap();
    let first = node.challenge().await.unwrap();
    let second = node.challenge().await.unwrap();
    let sig = node.pay(PRICE, &first.reference).await.unwrap();

    let ok = node.redeem(&sig, &first.reference).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let replay = node.redeem(&sig, &second.reference).await.unwrap();
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        replay.json::<Value>().await.unwrap(),
        json!({ "error": "Transaction already used (replay attack)" })
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_rejections() {
    let node = TestNode::start().await.unwrap();

    let malformed = node
        .http()
        .get(node.url("/api/data"))
        .header("X-Payment", "not base64 json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        malformed.json::<Value>().await.unwrap(),
        json!({ "error": "Invalid payment header format" })
    );

    let unknown = node.redeem("sig", "no-such-reference").await.unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        unknown.json::<Value>().await.unwrap(),
        json!({ "error": "Invalid or expired reference" })
    );

    let requirements = node.challenge().await.unwrap();
    let low = node.pay(PRICE - 1, &requirements.reference).await.unwrap();
    let underpaid = node.redeem(&low, &requirements.reference).await.unwrap();
    assert_eq!(underpaid.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = underpaid.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Amount mismatch"));

    let no_memo = node.pay(PRICE, "some other memo").await.unwrap();
    let missing = node.redeem(&no_memo, &requirements.reference).await.unwrap();
    assert_eq!(missing.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(
        missing.json::<Value>().await.unwrap(),
        json!({ "error": "Memo with reference not found" })
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_expired_reference_rejected() {
    let node = TestNode::start().await.unwrap();
    let requirements = node.challenge().await.unwrap();
    let sig = node.pay(PRICE, &requirements.reference).await.unwrap();

    node.clock().advance(chrono::Duration::minutes(6));
    let response = node.redeem(&sig, &requirements.reference).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({ "error": "Invalid or expired reference" })
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_challenges_rate_limited() {
    let node = TestNode::start_with(funded_ledger(), |config| {
        config.rate_limit.max_requests = 2;
    })
    .await
    .unwrap();

    node.challenge().await.unwrap();
    node.challenge().await.unwrap();

    let limited = node.http().get(node.url("/api/data")).send().await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key(reqwest::header::RETRY_AFTER));
    let body: Value = limited.json().await.unwrap();
    assert!(body["retryAfter"].as_u64().is_some_and(|s| s > 0 && s <= 60));

    // A new window admits the client again
    node.clock().advance(chrono::Duration::seconds(61));
    node.challenge().await.unwrap();

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_rotating_forwarded_for_still_rate_limited() {
    let node = TestNode::start_with(funded_ledger(), |config| {
        config.rate_limit.max_requests = 2;
    })
    .await
    .unwrap();

    let mut statuses = Vec::new();
    for i in 0..5 {
        let response = node
            .http()
            .get(node.url("/api/data"))
            .header("x-forwarded-for", format!("198.51.100.{i}"))
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_trusted_proxy_limits_per_forwarded_client() {
    let node = TestNode::start_with(funded_ledger(), |config| {
        config.rate_limit.max_requests = 1;
        config.rate_limit.trust_forwarded_for = true;
    })
    .await
    .unwrap();

    let get = |client: &'static str| {
        node.http()
            .get(node.url("/api/data"))
            .header("x-forwarded-for", client)
            .send()
    };
    assert_eq!(
        get("198.51.100.1").await.unwrap().status(),
        StatusCode::PAYMENT_REQUIRED
    );
    assert_eq!(
        get("198.51.100.1").await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        get("198.51.100.2").await.unwrap().status(),
        StatusCode::PAYMENT_REQUIRED
    );

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_empty_payment_header_gets_challenge() {
    let node = TestNode::start().await.unwrap();

    let response = node
        .http()
        .get(node.url("/api/data"))
        .header("X-Payment", "")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json().await.unwrap();
    assert!(body["reference"].as_str().is_some());

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_verify_endpoint() {
    let node = TestNode::start().await.unwrap();
    let verify_url = node.url("/api/verify");

    let unknown = node
        .http()
        .post(&verify_url)
        .json(&json!({ "txSig": "sig", "reference": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        unknown.json::<Value>().await.unwrap(),
        json!({ "ok": false, "reason": "Reference not found" })
    );

    let invalid = node
        .http()
        .post(&verify_url)
        .json(&json!({ "reference": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let requirements = node.challenge().await.unwrap();
    let rejected = node
        .http()
        .post(&verify_url)
        .json(&json!({ "txSig": "never-submitted", "reference": requirements.reference }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::OK);
    assert_eq!(
        rejected.json::<Value>().await.unwrap(),
        json!({ "ok": false, "reason": "Transaction not found or not confirmed" })
    );

    let sig = node.pay(PRICE, &requirements.reference).await.unwrap();
    let verified = node
        .http()
        .post(&verify_url)
        .json(&json!({ "txSig": sig, "reference": requirements.reference }))
        .send()
        .await
        .unwrap();
    assert_eq!(verified.status(), StatusCode::OK);
    assert_eq!(
        verified.json::<Value>().await.unwrap(),
        json!({ "ok": true, "txSig": sig, "payer": PAYER, "amountLamports": PRICE })
    );

    // Verification alone does not consume; the proof still unlocks the resource
    let released = node.redeem(&sig, &requirements.reference).await.unwrap();
    assert_eq!(released.status(), StatusCode::OK);

    node.teardown().await.unwrap();
}

#[tokio::test]
async fn test_disk_store_survives_restart() {
    let data = tempfile::TempDir::new().unwrap();
    let ledger = funded_ledger();
    let root = data.path().to_path_buf();

    let node = TestNode::start_with(ledger.clone(), |config| {
        config.store.driver = StoreDriver::Disk;
        config.store.path = Some(root.clone());
    })
    .await
    .unwrap();
    let requirements = node.challenge().await.unwrap();
    let sig = node.pay(PRICE, &requirements.reference).await.unwrap();
    assert_eq!(
        node.redeem(&sig, &requirements.reference)
            .await
            .unwrap()
            .status(),
        StatusCode::OK
    );
    node.teardown().await.unwrap();

    let restarted = TestNode::start_with(ledger, |config| {
        config.store.driver = StoreDriver::Disk;
        config.store.path = Some(root.clone());
    })
    .await
    .unwrap();
    let cached = restarted
        .redeem(&sig, &requirements.reference)
        .await
        .unwrap();
    assert_eq!(cached.status(), StatusCode::OK);
    let body: Value = cached.json().await.unwrap();
    assert_eq!(body["txSig"], json!(sig));

    restarted.teardown().await.unwrap();
}

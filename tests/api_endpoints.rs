//! Integration tests for the PinWallet API endpoints
//!
//! These drive the real router over an in-memory ledger and check status
//! codes, JSON shapes and that credentials never leak into responses.

use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use pinwallet::api::{build_api_router, WalletService};
use pinwallet::config::{Config, PinConfig};
use pinwallet::engine::TransferEngine;
use pinwallet::ledger::{WalletId, WalletStatus};
use pinwallet::persistence::InMemoryPersistence;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

fn test_service() -> WalletService {
    let mut config = Config::default();
    config.pin = PinConfig {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    };
    let engine = TransferEngine::from_config(&config, Arc::new(InMemoryPersistence::new()))
        .expect("Failed to build engine");
    WalletService::new(Arc::new(engine))
}

fn test_server(service: &WalletService) -> TestServer {
    TestServer::new(build_api_router(service.clone())).expect("Failed to create test server")
}

/// Server whose every request arrives from `peer`.
fn server_from(service: &WalletService, peer: [u8; 4]) -> TestServer {
    let app = build_api_router(service.clone()).layer(MockConnectInfo(SocketAddr::from((
        peer, 40_000,
    ))));
    TestServer::new(app).expect("Failed to create test server")
}

fn forwarded(value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-forwarded-for"),
        HeaderValue::from_str(value).unwrap(),
    )
}

fn retry_after_secs(response: &axum_test::TestResponse) -> u64 {
    response
        .header("retry-after")
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

async fn create_wallet(server: &TestServer, owner_id: i64) -> i64 {
    let response = server
        .post("/api/v1/wallets")
        .json(&json!({ "owner_id": owner_id, "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 201);
    response.json::<Value>()["id"].as_i64().unwrap()
}

async fn deposit(server: &TestServer, id: i64, amount: &str) {
    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", id))
        .json(&json!({ "amount": amount, "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_system_endpoints() {
    let service = test_service();
    let server = test_server(&service);

    let response = server.get("/api/v1/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());

    let response = server.get("/api/v1/stats").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert!(json["total_requests"].as_u64().unwrap() >= 1);
    assert!(json["uptime_seconds"].is_number());
    assert!(json["tracked_rate_windows"].is_number());
}

#[tokio::test]
async fn test_wallet_lifecycle_hides_credentials() {
    let service = test_service();
    let server = test_server(&service);

    let response = server
        .post("/api/v1/wallets")
        .json(&json!({ "owner_id": 42, "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 201);
    assert!(!response.text().contains("pin"));
    let json: Value = response.json();
    assert_eq!(json["owner_id"], 42);
    assert_eq!(json["balance"], "0.00");
    assert_eq!(json["status"], "active");
    let id = json["id"].as_i64().unwrap();

    let response = server.get(&format!("/api/v1/wallets/{}", id)).await;
    assert_eq!(response.status_code(), 200);
    assert!(!response.text().contains("argon2"));

    let response = server
        .post("/api/v1/wallets")
        .json(&json!({ "owner_id": 42, "pin": "12" }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(
        response.json::<Value>()["error"],
        "PIN must be exactly 4 digits"
    );

    let response = server.get("/api/v1/wallets").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["count"], 1);
    assert_eq!(json["wallets"][0]["id"], id);

    let response = server.get("/api/v1/wallets?limit=5000").await;
    assert_eq!(response.json::<Value>()["limit"], 100);

    let response = server.delete(&format!("/api/v1/wallets/{}", id)).await;
    assert_eq!(response.status_code(), 200);

    let response = server.get(&format!("/api/v1/wallets/{}", id)).await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_deposit_validation() {
    let service = test_service();
    let server = test_server(&service);
    let id = create_wallet(&server, 1).await;

    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", id))
        .json(&json!({ "amount": "50", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["balance"], "50.00");

    // numeric JSON amounts are accepted too
    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", id))
        .json(&json!({ "amount": 0.25, "pin": "1234" }))
        .await;
    assert_eq!(response.json::<Value>()["balance"], "50.25");

    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", id))
        .json(&json!({ "amount": "-5", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert!(response.json::<Value>()["error"].is_string());

    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", id))
        .json(&json!({ "amount": "5", "pin": "4321" }))
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .post("/api/v1/wallets/999/deposit")
        .json(&json!({ "amount": "5", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 404);

    let response = server.get(&format!("/api/v1/wallets/{}", id)).await;
    assert_eq!(response.json::<Value>()["balance"], "50.25");
}

#[tokio::test]
async fn test_transfer_endpoints() {
    let service = test_service();
    let server = test_server(&service);
    let a = create_wallet(&server, 1).await;
    let b = create_wallet(&server, 2).await;
    deposit(&server, a, "100").await;

    let response = server
        .post("/api/v1/transfer")
        .json(&json!({ "from_wallet_id": a, "to_wallet_id": b, "amount": "40", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["from"]["balance"], "60.00");
    assert_eq!(json["to"]["balance"], "40.00");
    assert_eq!(json["transfer"]["amount"], "40.00");
    assert_eq!(json["transfer"]["from_wallet_id"], a);

    let response = server
        .post("/api/v1/transfer")
        .json(&json!({ "from_wallet_id": a, "to_wallet_id": b, "amount": "1000", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 409);
    assert!(response.json::<Value>()["error"]
        .as_str()
        .unwrap()
        .starts_with("Insufficient funds"));

    let response = server
        .post("/api/v1/transfer")
        .json(&json!({ "from_wallet_id": a, "to_wallet_id": a, "amount": "1", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get(&format!("/api/v1/wallets/{}/transfers", a))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["count"], 2);
    assert_eq!(json["transfers"][0]["to_wallet_id"], b);
    assert!(json["transfers"][1]["from_wallet_id"].is_null());
}

#[tokio::test]
async fn test_batch_transfer_is_all_or_nothing() {
    let service = test_service();
    let server = test_server(&service);
    let a = create_wallet(&server, 1).await;
    let b = create_wallet(&server, 2).await;
    let c = create_wallet(&server, 3).await;
    deposit(&server, a, "100").await;

    let response = server
        .post("/api/v1/transfer/batch")
        .json(&json!({
            "from_wallet_id": a,
            "transfers": [
                { "to_wallet_id": b, "amount": "10" },
                { "to_wallet_id": 777, "amount": "20" }
            ],
            "pin": "1234"
        }))
        .await;
    assert_eq!(response.status_code(), 404);
    let response = server.get(&format!("/api/v1/wallets/{}", a)).await;
    assert_eq!(response.json::<Value>()["balance"], "100.00");
    let response = server.get(&format!("/api/v1/wallets/{}", b)).await;
    assert_eq!(response.json::<Value>()["balance"], "0.00");

    let response = server
        .post("/api/v1/transfer/batch")
        .json(&json!({
            "from_wallet_id": a,
            "transfers": [
                { "to_wallet_id": b, "amount": "10" },
                { "to_wallet_id": c, "amount": "20" }
            ],
            "pin": "1234"
        }))
        .await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["from"]["balance"], "70.00");
    assert_eq!(json["total"], "30.00");
    assert_eq!(json["credited"].as_array().unwrap().len(), 2);

    let response = server
        .post("/api/v1/transfer/batch")
        .json(&json!({ "from_wallet_id": a, "transfers": [], "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_inactive_wallet_is_forbidden() {
    let service = test_service();
    let server = test_server(&service);
    let a = create_wallet(&server, 1).await;
    service
        .engine
        .ledger()
        .set_status(WalletId(a), WalletStatus::Frozen)
        .unwrap();

    let response = server
        .post(&format!("/api/v1/wallets/{}/deposit", a))
        .json(&json!({ "amount": "5", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 403);
    assert_eq!(response.json::<Value>()["error"], format!("Wallet {} is frozen", a));
}

#[tokio::test]
async fn test_pin_attempts_are_rate_limited_per_peer() {
    let service = test_service();
    let server = server_from(&service, [203, 0, 113, 50]);
    let id = create_wallet(&server, 1).await;
    let path = format!("/api/v1/wallets/{}/verify-pin", id);

    let response = server.post(&path).json(&json!({ "pin": "1234" })).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["valid"], true);

    for _ in 0..4 {
        let response = server.post(&path).json(&json!({ "pin": "0000" })).await;
        assert_eq!(response.status_code(), 401);
    }

    let response = server.post(&path).json(&json!({ "pin": "1234" })).await;
    assert_eq!(response.status_code(), 429);
    let retry_after = retry_after_secs(&response);
    assert!((59..=60).contains(&retry_after));

    // a different peer still gets through
    let other = server_from(&service, [198, 51, 100, 7]);
    let response = other.post(&path).json(&json!({ "pin": "1234" })).await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_forwarded_header_from_untrusted_peer_is_ignored() {
    let service = test_service();
    let server = server_from(&service, [198, 51, 100, 20]);
    let id = create_wallet(&server, 1).await;
    let path = format!("/api/v1/wallets/{}/verify-pin", id);

    for i in 0..5 {
        let (name, value) = forwarded(&format!("192.0.2.{}", i));
        let response = server
            .post(&path)
            .add_header(name, value)
            .json(&json!({ "pin": "0000" }))
            .await;
        assert_eq!(response.status_code(), 401);
    }

    let (name, value) = forwarded("192.0.2.99");
    let response = server
        .post(&path)
        .add_header(name, value)
        .json(&json!({ "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 429);
}

#[tokio::test]
async fn test_trusted_proxy_forwards_client_identity() {
    let service = test_service().with_trusted_proxies(vec!["10.0.0.1".parse().unwrap()]);
    let server = server_from(&service, [10, 0, 0, 1]);
    let id = create_wallet(&server, 1).await;
    let path = format!("/api/v1/wallets/{}/verify-pin", id);

    for _ in 0..5 {
        // the leftmost hop is client-written and must not help
        let (name, value) = forwarded("192.0.2.1, 203.0.113.8");
        let response = server
            .post(&path)
            .add_header(name, value)
            .json(&json!({ "pin": "0000" }))
            .await;
        assert_eq!(response.status_code(), 401);
    }
    let (name, value) = forwarded("192.0.2.2, 203.0.113.8");
    let response = server
        .post(&path)
        .add_header(name, value)
        .json(&json!({ "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 429);

    let (name, value) = forwarded("203.0.113.9");
    let response = server
        .post(&path)
        .add_header(name, value)
        .json(&json!({ "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_transfer_limit_is_reachable() {
    let service = test_service();
    let server = server_from(&service, [203, 0, 113, 60]);
    let a = create_wallet(&server, 1).await;
    let b = create_wallet(&server, 2).await;
    deposit(&server, a, "100").await;

    for _ in 0..10 {
        let response = server
            .post("/api/v1/transfer")
            .json(&json!({ "from_wallet_id": a, "to_wallet_id": b, "amount": "1", "pin": "1234" }))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    let response = server
        .post("/api/v1/transfer")
        .json(&json!({ "from_wallet_id": a, "to_wallet_id": b, "amount": "1", "pin": "1234" }))
        .await;
    assert_eq!(response.status_code(), 429);
    assert!(response.json::<Value>()["error"]
        .as_str()
        .unwrap()
        .contains("transfer"));

    let response = server.get(&format!("/api/v1/wallets/{}", b)).await;
    assert_eq!(response.json::<Value>()["balance"], "10.00");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let service = test_service();
    let server = test_server(&service);

    let response = server
        .post("/api/v1/transfer")
        .json(&json!({ "from_wallet_id": 1 }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert!(response.json::<Value>()["error"].is_string());
}

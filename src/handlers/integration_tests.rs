use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::executions::intake;
use super::forward::relay;
use crate::app_state::AppState;
use crate::auth::{hash_token, TokenAuthenticator};
use crate::billing::ledger::Ledger;
use crate::billing::rules::{BillingRule, RuleOp};
use crate::billing::settlement::NodeExecutionRecord;
use crate::registry::RouteRegistry;
use crate::storage::memory::MemoryStorage;
use crate::storage::models::{AccountQuota, ContentKind, ForwardingAddress, ForwardingRoute};
use crate::storage::Storage;
use crate::upstream::Forwarder;

struct Harness {
    state: AppState,
    storage: Arc<MemoryStorage>,
    route_id: Uuid,
    account_id: Uuid,
    settlement_rx: mpsc::Receiver<NodeExecutionRecord>,
}

/// One registered route `vision -> {downstream}` with a priced
/// `analyze` sub path (0.01 per page) and one funded account.
async fn harness(downstream: &str) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let account_id = Uuid::new_v4();
    let route_id = Uuid::new_v4();

    storage
        .add_access_token(&hash_token("tok-test"), account_id, true)
        .await;
    storage
        .add_route(ForwardingRoute {
            id: route_id,
            path_prefix: "vision".into(),
            downstream_address: downstream.to_string(),
            extra_headers: vec![("x-api-version".into(), "2".into())],
            description: String::new(),
        })
        .await;
    storage
        .add_address(ForwardingAddress {
            id: Uuid::new_v4(),
            forwarding_id: route_id,
            sub_path: "analyze".into(),
            enabled_models: vec![],
            active: true,
            content_kind: ContentKind::Json,
            billing_rules: vec![BillingRule {
                remark: "per page".into(),
                field_path: "pages".into(),
                operator: RuleOp::Mul,
                benchmark: Value::Null,
                price: dec!(0.01),
                children: vec![],
            }],
            description: String::new(),
        })
        .await;
    storage
        .set_account_quota(AccountQuota {
            account_id,
            used_quota: dec!(0),
            total_quota: dec!(10),
        })
        .await;

    let (settlement_tx, settlement_rx) = mpsc::channel(1);
    let state = AppState {
        registry: RouteRegistry::new(storage.clone(), Duration::from_secs(600)),
        authenticator: TokenAuthenticator::new(storage.clone(), Duration::from_secs(60)),
        ledger: Arc::new(Ledger::new(storage.clone(), dec!(15))),
        forwarder: Forwarder::new().unwrap(),
        settlement_tx,
    };

    Harness {
        state,
        storage,
        route_id,
        account_id,
        settlement_rx,
    }
}

fn auth_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-test"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

async fn body_bytes(
    response: hyper::Response<http_body_util::combinators::BoxBody<Bytes, hyper::Error>>,
) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn relay_charges_patches_and_stamps_cors() {
    let mut server = mockito::Server::new_async().await;
    let h = harness(&format!("{}/api", server.url())).await;

    let mock = server
        .mock("POST", "/api/analyze")
        .match_header("cookie", "x-token=tok-test;")
        .match_header("accept-encoding", "identity")
        .match_header("x-api-version", "2")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"result":"ok"}"#)
        .create_async()
        .await;

    let response = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &auth_headers(),
        Bytes::from(r#"{"pages": 20}"#),
        &h.state,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    assert_eq!(response.headers().get("x-accel-redirect").unwrap(), "");

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body,
        json!({"result": "ok", "metadata": {"usage": {"total_price": 0.2}}})
    );

    let quota = h.storage.account_quota(h.account_id).await.unwrap().unwrap();
    assert_eq!(quota.used_quota, dec!(0.2));

    let audit = h.storage.settlement_records().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].account_id, h.account_id);
    assert_eq!(audit[0].forwarding_id, h.route_id);
    assert_eq!(audit[0].amount, dec!(0.2));

    mock.assert_async().await;
}

#[tokio::test]
async fn insufficient_balance_blocks_before_dispatch() {
    let mut server = mockito::Server::new_async().await;
    let h = harness(&format!("{}/api", server.url())).await;
    h.storage
        .set_account_quota(AccountQuota {
            account_id: h.account_id,
            used_quota: dec!(9.95),
            total_quota: dec!(10),
        })
        .await;

    let mock = server
        .mock("POST", "/api/analyze")
        .expect(0)
        .create_async()
        .await;

    let err = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &auth_headers(),
        Bytes::from(r#"{"pages": 20}"#),
        &h.state,
    )
    .await
    .unwrap_err();

    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.to_string(), "Insufficient balance");

    let quota = h.storage.account_quota(h.account_id).await.unwrap().unwrap();
    assert_eq!(quota.used_quota, dec!(9.95));
    assert!(h.storage.settlement_records().await.is_empty());

    mock.assert_async().await;
}

#[tokio::test]
async fn unknown_route_and_sub_path_are_not_found() {
    let h = harness("http://unreachable.invalid").await;

    let route_miss = relay(
        Method::POST,
        "/nope/analyze",
        None,
        &auth_headers(),
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap_err();
    assert_eq!(route_miss.status(), StatusCode::NOT_FOUND);

    let address_miss = relay(
        Method::POST,
        "/vision/unpriced",
        None,
        &auth_headers(),
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap_err();
    assert_eq!(address_miss.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_methods_are_rejected_before_auth() {
    let h = harness("http://unreachable.invalid").await;

    let err = relay(
        Method::PATCH,
        "/vision/analyze",
        None,
        &HeaderMap::new(),
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap_err();
    assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn missing_or_unknown_tokens_are_unauthorized() {
    let h = harness("http://unreachable.invalid").await;

    let missing = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &HeaderMap::new(),
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap_err();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
    let unknown = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &headers,
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap_err();
    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn get_relays_query_without_body_and_passes_non_json_through() {
    let mut server = mockito::Server::new_async().await;
    let h = harness(&format!("{}/api", server.url())).await;

    let mock = server
        .mock("GET", "/api/analyze?pages=3")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("listing")
        .create_async()
        .await;

    let response = relay(
        Method::GET,
        "/vision/analyze",
        Some("pages=3"),
        &auth_headers(),
        Bytes::new(),
        &h.state,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, Bytes::from("listing"));

    // Query-only pricing: 3 pages at 0.01.
    let quota = h.storage.account_quota(h.account_id).await.unwrap().unwrap();
    assert_eq!(quota.used_quota, dec!(0.03));

    mock.assert_async().await;
}

#[tokio::test]
async fn zero_cost_relay_skips_the_ledger_but_still_patches() {
    let mut server = mockito::Server::new_async().await;
    let h = harness(&format!("{}/api", server.url())).await;

    let mock = server
        .mock("POST", "/api/analyze")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"result":"ok"}"#)
        .create_async()
        .await;

    // No `pages` field resolves, so the rule contributes nothing.
    let response = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &auth_headers(),
        Bytes::from("{}"),
        &h.state,
    )
    .await
    .unwrap();

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["metadata"]["usage"]["total_price"], json!(0));

    let quota = h.storage.account_quota(h.account_id).await.unwrap().unwrap();
    assert_eq!(quota.used_quota, dec!(0));
    assert!(h.storage.settlement_records().await.is_empty());

    mock.assert_async().await;
}

#[tokio::test]
async fn upstream_status_and_headers_are_echoed() {
    let mut server = mockito::Server::new_async().await;
    let h = harness(&format!("{}/api", server.url())).await;

    let mock = server
        .mock("POST", "/api/analyze")
        .with_status(503)
        .with_header("retry-after", "30")
        .with_body(r#"{"error":"downstream overloaded"}"#)
        .create_async()
        .await;

    let response = relay(
        Method::POST,
        "/vision/analyze",
        None,
        &auth_headers(),
        Bytes::from("{}"),
        &h.state,
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("retry-after").unwrap(), "30");

    mock.assert_async().await;
}

#[tokio::test]
async fn execution_intake_acknowledges_queues_and_backpressures() {
    let mut h = harness("http://unreachable.invalid").await;

    let record = json!({
        "id": "exec-1",
        "node_type": "llm",
        "created_by": Uuid::new_v4(),
        "created_by_role": "account",
        "outputs": {"usage": {"total_price": "1"}}
    });
    let body = Bytes::from(record.to_string());

    let accepted = intake(&body, &h.state);
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    // Queue capacity is 1 and nothing consumes it in this harness.
    let saturated = intake(&body, &h.state);
    assert_eq!(saturated.status(), StatusCode::SERVICE_UNAVAILABLE);

    let queued = h.settlement_rx.try_recv().unwrap();
    assert_eq!(queued.id, "exec-1");
    assert_eq!(queued.node_type, "llm");

    drop(h.settlement_rx);
    let closed = intake(&body, &h.state);
    assert_eq!(closed.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn execution_intake_rejects_malformed_records() {
    let h = harness("http://unreachable.invalid").await;

    let response = intake(&Bytes::from("{not json"), &h.state);
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing_fields = intake(&Bytes::from(r#"{"id": "x"}"#), &h.state);
    assert_eq!(missing_fields.status(), StatusCode::BAD_REQUEST);
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use points_market::{
    AppState,
    accrual::{AccrualError, AccrualOutcome, AccrualProvider, OrderAccrual, ProviderStatus},
    auth::TokenSigner,
    cooldown::CooldownGate,
    init_router,
    reconcile::{Reconciler, ReconcilerConfig, ReconcilerWorkers},
    store::{MemoryStore, OrderStore},
    types::OrderStatus,
};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Scores every order at 500 points.
struct GenerousProvider;

#[async_trait]
impl AccrualProvider for GenerousProvider {
    async fn fetch(&self, number: &str) -> Result<AccrualOutcome, AccrualError> {
        Ok(AccrualOutcome::Ready(OrderAccrual {
            order: number.to_string(),
            status: ProviderStatus::Processed,
            accrual: Some(Decimal::from(500)),
        }))
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    workers: ReconcilerWorkers,
}

fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let (reconciler, workers) = Reconciler::start(
        Arc::new(GenerousProvider),
        store.clone(),
        Arc::new(CooldownGate::new(Duration::from_secs(60))),
        ReconcilerConfig::default(),
    );
    let router = init_router(AppState {
        users: store.clone(),
        orders: store.clone(),
        ledger: store.clone(),
        reconciler: reconciler.clone(),
        signer: TokenSigner::new("test-secret"),
    });
    TestApp {
        router,
        store,
        reconciler,
        workers,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let auth = resp
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, auth, body)
}

fn post_json(uri: &str, body: Value, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn post_text(uri: &str, body: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "text/plain");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, auth: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, auth)
        .body(Body::empty())
        .unwrap()
}

async fn register(router: &Router, login: &str) -> String {
    let (status, auth, _) = send(
        router,
        post_json("/api/user/register", json!({"login": login, "password": "pw"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    auth.expect("register hands back a token")
}

async fn wait_for_status(store: &MemoryStore, number: &str, status: OrderStatus) {
    for _ in 0..100 {
        if let Some(order) = store.find_order(number).await.unwrap() {
            if order.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("order {number} never reached {status}");
}

#[tokio::test]
async fn register_and_login() {
    let t = app();

    register(&t.router, "alice").await;
    let (status, _, body) = send(
        &t.router,
        post_json("/api/user/register", json!({"login": "alice", "password": "x"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "LOGIN_TAKEN");

    let (status, _, _) = send(
        &t.router,
        post_json("/api/user/login", json!({"login": "alice", "password": "wrong"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, auth, body) = send(
        &t.router,
        post_json("/api/user/login", json!({"login": "alice", "password": "pw"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(auth.unwrap().starts_with("Bearer alice:"));
    assert_eq!(body["login"], "alice");

    let (status, _, _) = send(&t.router, post_json("/api/user/login", json!({"login": 1}), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let t = app();
    let (status, _, _) = send(&t.router, post_text("/api/user/orders", "79927398713", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = TokenSigner::new("not-the-secret").issue("alice");
    let (status, _, body) = send(&t.router, get("/api/user/balance", &format!("Bearer {forged}"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn upload_reconcile_and_withdraw() {
    let t = app();
    let alice = register(&t.router, "alice").await;
    let bob = register(&t.router, "bob").await;

    let (status, _, _) = send(&t.router, post_text("/api/user/orders", "", Some(&alice))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&t.router, post_text("/api/user/orders", "79927398710", Some(&alice))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let overlong = "1111111111111111111111111111111111111111117";
    let (status, _, _) = send(&t.router, post_text("/api/user/orders", overlong, Some(&alice))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _, _) = send(&t.router, post_text("/api/user/orders", "79927398713", Some(&alice))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _, _) = send(&t.router, post_text("/api/user/orders", "79927398713", Some(&alice))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, body) = send(&t.router, post_text("/api/user/orders", "79927398713", Some(&bob))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ORDER_CONFLICT");

    wait_for_status(&t.store, "79927398713", OrderStatus::Processed).await;

    let (status, _, body) = send(&t.router, get("/api/user/orders", &alice)).await;
    assert_eq!(status, StatusCode::OK);
    let orders = body.as_array().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["number"], "79927398713");
    assert_eq!(orders[0]["status"], "PROCESSED");
    assert_eq!(orders[0]["accrual"].as_f64(), Some(500.0));

    let (status, _, body) = send(&t.router, get("/api/user/balance", &alice)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"].as_f64(), Some(500.0));
    assert_eq!(body["withdrawn"].as_f64(), Some(0.0));

    let (status, _, body) = send(
        &t.router,
        post_json("/api/user/balance/withdraw", json!({"order": "2377225624", "sum": 600}), Some(&alice)),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "INSUFFICIENT_FUNDS");

    let (status, _, _) = send(
        &t.router,
        post_json("/api/user/balance/withdraw", json!({"order": "2377225621", "sum": 10}), Some(&alice)),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _, body) = send(
        &t.router,
        post_json("/api/user/balance/withdraw", json!({"order": "2377225624", "sum": 0.001}), Some(&alice)),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "BAD_SUM");

    let (status, _, _) = send(
        &t.router,
        post_json("/api/user/balance/withdraw", json!({"order": "2377225624", "sum": 500}), Some(&alice)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = send(&t.router, get("/api/user/balance", &alice)).await;
    assert_eq!(body["current"].as_f64(), Some(0.0));
    assert_eq!(body["withdrawn"].as_f64(), Some(500.0));

    let (status, _, body) = send(&t.router, get("/api/user/withdrawals", &alice)).await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["order"], "2377225624");
    assert_eq!(list[0]["sum"].as_f64(), Some(500.0));

    let (status, _, body) = send(&t.router, get("/api/user/withdrawals", &bob)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
    let (status, _, _) = send(&t.router, get("/api/user/orders", &bob)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    t.reconciler.shutdown();
    t.workers.join().await;
}

#[tokio::test]
async fn listing_redispatches_pending_orders() {
    let t = app();
    let alice = register(&t.router, "alice").await;

    // inserted behind the reconciler's back, so only the listing can pick it up
    t.store
        .insert_order_if_absent(&points_market::types::Order::new("12345678903", "alice", chrono::Utc::now()))
        .await
        .unwrap();

    let (status, _, body) = send(&t.router, get("/api/user/orders", &alice)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "NEW");
    assert!(body[0].get("accrual").is_none());

    wait_for_status(&t.store, "12345678903", OrderStatus::Processed).await;

    t.reconciler.shutdown();
    t.workers.join().await;
}

#[tokio::test]
async fn errors_carry_the_request_id() {
    let t = app();
    let resp = t
        .router
        .clone()
        .oneshot(post_text("/api/user/orders", "79927398713", None))
        .await
        .unwrap();
    let header_id = resp.headers().get("x-request-id").unwrap().to_str().unwrap().to_string();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], header_id.as_str());
    assert_eq!(body["code"], "UNAUTHORIZED");
}

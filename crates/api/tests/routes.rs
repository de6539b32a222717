//! Router tests against in-memory collaborators and a mocked Crypto Pay API.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use tunnelshop_api::{create_router, AppState, Config};
use tunnelshop_billing::panel::{PanelFault, REFUSED_MESSAGE};
use tunnelshop_billing::providers::{webhook_signature, CryptoBotConfig, CryptoBotProvider, SIGNATURE_HEADER};
use tunnelshop_billing::{
    BillingConfig, BillingService, InMemoryPanel, LedgerStore, LocalHostLocks, LogNotifier, MemoryLedgerStore,
    PaymentState, ProviderRegistry, RetryPolicy,
};

const TOKEN: &str = "internal-token-0123456789";
const BOT_TOKEN: &str = "1234:AAAtoken";

struct TestApp {
    router: Router,
    store: Arc<MemoryLedgerStore>,
    panel: Arc<InMemoryPanel>,
}

impl TestApp {
    fn new(server: &mockito::ServerGuard) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let panel = Arc::new(InMemoryPanel::new());
        panel.add_host("nl-1", 443).unwrap();

        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(
            CryptoBotProvider::new(
                CryptoBotConfig {
                    token: BOT_TOKEN.into(),
                    api_base: server.url(),
                },
                Duration::from_secs(2),
            )
            .unwrap(),
        ));

        let billing = BillingService::new(
            BillingConfig::default(),
            store.clone(),
            panel.clone(),
            Arc::new(LocalHostLocks::new()),
            Arc::new(LogNotifier),
            providers,
            RetryPolicy::immediate(2),
        );
        let config = Config {
            database_url: "postgres://unused".into(),
            bind_address: "127.0.0.1:0".into(),
            internal_api_token: TOKEN.into(),
            db_max_connections: 1,
            allowed_origins: Vec::new(),
        };

        Self {
            router: create_router(AppState::new(billing, config)),
            store,
            panel,
        }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_with(method, uri, body, Some(TOKEN)).await
    }

    async fn call_with(&self, method: &str, uri: &str, body: Option<Value>, token: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        read(response).await
    }

    async fn webhook(&self, body: &[u8], signature: &str) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/cryptobot")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_vec()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap().status()
    }

    /// Host nl-1, a one-month plan at 300.00 and user 42.
    async fn seed(&self) -> i64 {
        let (status, _) = self
            .call(
                "POST",
                "/admin/hosts",
                Some(json!({
                    "name": "nl-1",
                    "base_url": "https://nl-1.example.com:2053",
                    "username": "admin",
                    "password": "secret",
                    "inbound_id": 1
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, plan) = self
            .call(
                "POST",
                "/admin/plans",
                Some(json!({"host_name": "nl-1", "name": "1 month", "months": 1, "price_minor": 30000})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = self
            .call("POST", "/users", Some(json!({"user_id": 42, "username": "alice"})))
            .await;
        assert_eq!(status, StatusCode::OK);

        plan["id"].as_i64().unwrap()
    }

    async fn wait_for_state(&self, payment_id: &str, state: PaymentState) {
        for _ in 0..100 {
            let payment = self.store.get_payment(payment_id).await.unwrap();
            if payment.is_some_and(|p| p.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("payment {payment_id} never reached {state:?}");
    }
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn mock_invoice(server: &mut mockito::ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/createInvoice")
        .match_header("crypto-pay-api-token", BOT_TOKEN)
        .with_status(200)
        .with_body(
            r#"{"ok":true,"result":{"invoice_id":555,"status":"active","currency_type":"fiat",
                "fiat":"RUB","amount":"300.00","bot_invoice_url":"https://t.me/CryptoBot?start=IV555"}}"#,
        )
        .create_async()
        .await
}

fn paid_update(update_type: &str) -> Vec<u8> {
    json!({
        "update_id": 1,
        "update_type": update_type,
        "request_date": "2026-03-01T12:00:00.000Z",
        "payload": {
            "invoice_id": 555,
            "status": "paid",
            "currency_type": "fiat",
            "fiat": "RUB",
            "amount": "300.00"
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn test_health_is_public() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);

    let (status, body) = app.call_with("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_internal_routes_require_token() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);
    let body = json!({"user_id": 1, "username": "x"});

    let (status, _) = app.call_with("POST", "/users", Some(body.clone()), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call_with("POST", "/users", Some(body.clone()), Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call_with("DELETE", "/admin/plans/1", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, user) = app.call("POST", "/users", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["id"], 1);
}

#[tokio::test]
async fn test_checkout_then_signed_webhook_provisions_key() {
    let mut server = mockito::Server::new_async().await;
    let invoice = mock_invoice(&mut server).await;
    let app = TestApp::new(&server);
    let plan_id = app.seed().await;

    let (status, checkout) = app
        .call(
            "POST",
            "/checkout",
            Some(json!({"user_id": 42, "plan_id": plan_id, "method": "cryptobot"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(checkout["payment_id"], "555");
    assert_eq!(checkout["amount_minor"], 30000);
    assert_eq!(checkout["pay_url"], "https://t.me/CryptoBot?start=IV555");
    invoice.assert_async().await;

    let body = paid_update("invoice_paid");
    let status = app.webhook(&body, &webhook_signature(BOT_TOKEN, &body)).await;
    assert_eq!(status, StatusCode::OK);
    app.wait_for_state("555", PaymentState::Fulfilled).await;

    // A redelivered webhook is acknowledged and changes nothing.
    let status = app.webhook(&body, &webhook_signature(BOT_TOKEN, &body)).await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.store.list_transactions(42).await.unwrap().len(), 1);

    let credential = app.store.list_user_credentials(42).await.unwrap().pop().unwrap();
    let (status, uri) = app
        .call("GET", &format!("/credentials/{}/uri?user_id=42", credential.id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(uri["uri"].as_str().unwrap().starts_with("vless://"));

    // Someone else's key is invisible.
    let (status, _) = app
        .call("GET", &format!("/credentials/{}/uri?user_id=7", credential.id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, reply) = app
        .call("POST", "/actions", Some(json!({"user_id": 42, "action": "check:555"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["reply"], "check");
    assert_eq!(reply["check"]["check"], "unchanged");

    let (status, profile) = app.call("GET", "/users/42", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["total_spent_minor"], 30000);
    assert_eq!(profile["purchases"], 1);
    assert_eq!(profile["credentials"][0]["active"], true);
    assert_eq!(profile["credentials"][0]["label"], "user42@nl-1.bot");

    let (status, _) = app.call("GET", "/users/7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = app.call("GET", "/admin/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["users"], 1);
    assert_eq!(stats["active_credentials"], 1);
    assert_eq!(stats["revenue_minor"], 30000);
}

#[tokio::test]
async fn test_forged_webhook_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    mock_invoice(&mut server).await;
    let app = TestApp::new(&server);
    let plan_id = app.seed().await;
    app.call(
        "POST",
        "/checkout",
        Some(json!({"user_id": 42, "plan_id": plan_id, "method": "cryptobot"})),
    )
    .await;

    let body = paid_update("invoice_paid");
    let status = app.webhook(&body, &webhook_signature("other:token", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let payment = app.store.get_payment("555").await.unwrap().unwrap();
    assert_eq!(payment.state, PaymentState::Pending);
}

#[tokio::test]
async fn test_unrelated_update_is_acknowledged() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);

    let body = paid_update("invoice_created");
    let status = app.webhook(&body, &webhook_signature(BOT_TOKEN, &body)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unconfigured_rail_webhook_is_rejected() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);

    let (status, _) = app
        .call_with("POST", "/webhooks/yookassa?token=abc", Some(json!({})), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_rejections() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);
    let plan_id = app.seed().await;

    let (status, _) = app
        .call(
            "POST",
            "/checkout",
            Some(json!({"user_id": 42, "plan_id": 999, "method": "cryptobot"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .call(
            "POST",
            "/checkout",
            Some(json!({"user_id": 42, "plan_id": plan_id, "method": "yookassa"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not available"));

    let (status, _) = app
        .call("POST", "/actions", Some(json!({"user_id": 42, "action": "fly:me"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_trial_runs_once() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);
    app.seed().await;

    let (status, observation) = app.call("POST", "/trial", Some(json!({"user_id": 42}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(observation["status"], "fulfilled");

    let (status, _) = app.call("POST", "/trial", Some(json!({"user_id": 42}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_provisioning_failure_reply_hides_panel_message() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);
    app.seed().await;
    app.panel.inject("nl-1", &[PanelFault::Refused]).unwrap();

    let (status, observation) = app.call("POST", "/trial", Some(json!({"user_id": 42}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(observation, json!({"status": "deferred"}));
    assert!(!observation.to_string().contains(REFUSED_MESSAGE));

    // The detail is kept for operators.
    let payments = app.store.all_payments().unwrap();
    let trial = payments.iter().find(|p| p.user_id == 42).unwrap();
    assert!(trial.last_error.as_deref().unwrap().contains(REFUSED_MESSAGE));
}

#[tokio::test]
async fn test_operator_catalog_management() {
    let server = mockito::Server::new_async().await;
    let app = TestApp::new(&server);

    let (status, host) = app
        .call(
            "POST",
            "/admin/hosts",
            Some(json!({
                "name": "de-1",
                "base_url": "https://de-1.example.com:2053",
                "username": "admin",
                "password": "hunter2",
                "inbound_id": 3
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(host["name"], "de-1");
    assert!(host.get("password").is_none());

    let (_, plan) = app
        .call(
            "POST",
            "/admin/plans",
            Some(json!({"host_name": "de-1", "name": "3 months", "months": 3, "price_minor": 80000})),
        )
        .await;
    let plan_id = plan["id"].as_i64().unwrap();

    let (status, successor) = app
        .call(
            "PUT",
            &format!("/admin/plans/{plan_id}"),
            Some(json!({"name": "3 months", "price_minor": 75000})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(successor["price_minor"], 75000);
    assert_ne!(successor["id"], plan["id"]);

    let (status, plans) = app.call("GET", "/hosts/de-1/plans", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans.as_array().unwrap().len(), 1);

    let (status, _) = app
        .call("DELETE", &format!("/admin/plans/{}", successor["id"]), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.call("POST", "/admin/hosts/de-1/deactivate", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.call("POST", "/admin/payments/nope/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

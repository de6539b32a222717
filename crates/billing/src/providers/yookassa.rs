//! YooKassa (bank card / SBP).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{decode_metadata, CreatedInvoice, PaymentProvider, ProviderStatus, WebhookEvent, WebhookRequest};
use crate::config::env_opt;
use crate::error::{BillingError, BillingResult};
use crate::models::{format_minor, parse_minor, CompletionPayload, InvoiceMetadata, PaymentMethod};

const DEFAULT_API_BASE: &str = "https://api.yookassa.ru";
/// Metadata key under which the typed invoice metadata travels.
const METADATA_KEY: &str = "order";

#[derive(Clone)]
pub struct YooKassaConfig {
    pub shop_id: String,
    pub secret_key: String,
    /// Shared secret expected in the webhook URL's `token` parameter.
    pub webhook_token: Option<String>,
    pub return_url: String,
    pub api_base: String,
}

impl std::fmt::Debug for YooKassaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YooKassaConfig")
            .field("shop_id", &self.shop_id)
            .field("return_url", &self.return_url)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl YooKassaConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            shop_id: env_opt("YOOKASSA_SHOP_ID")?,
            secret_key: env_opt("YOOKASSA_SECRET_KEY")?,
            webhook_token: env_opt("YOOKASSA_WEBHOOK_TOKEN"),
            return_url: env_opt("YOOKASSA_RETURN_URL").unwrap_or_else(|| "https://t.me".into()),
            api_base: env_opt("YOOKASSA_API_URL").unwrap_or_else(|| DEFAULT_API_BASE.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Amount {
    value: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YooPayment {
    id: String,
    status: String,
    amount: Amount,
    #[serde(default)]
    metadata: HashMap<String, String>,
    confirmation: Option<Confirmation>,
}

impl YooPayment {
    fn provider_status(&self) -> ProviderStatus {
        match self.status.as_str() {
            "succeeded" => {
                let paid = (self.amount.currency == "RUB")
                    .then(|| parse_minor(&self.amount.value))
                    .flatten();
                ProviderStatus::Completed(CompletionPayload {
                    paid_amount_minor: paid,
                    metadata: decode_metadata(self.metadata.get(METADATA_KEY).map(String::as_str)),
                })
            }
            "canceled" => ProviderStatus::Failed,
            // pending, waiting_for_capture
            _ => ProviderStatus::Pending,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Notification {
    event: String,
    object: NotificationObject,
}

#[derive(Debug, Deserialize)]
struct NotificationObject {
    id: String,
}

pub struct YooKassaProvider {
    http: reqwest::Client,
    config: YooKassaConfig,
}

impl YooKassaProvider {
    pub fn new(config: YooKassaConfig, timeout: Duration) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Provider(format!("failed to build YooKassa client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v3/{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn fetch(&self, id: &str) -> BillingResult<Option<YooPayment>> {
        let response = self
            .http
            .get(self.url(&format!("payments/{id}")))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

#[async_trait]
impl PaymentProvider for YooKassaProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::YooKassa
    }

    async fn create_invoice(
        &self,
        amount_minor: i64,
        description: &str,
        metadata: &InvoiceMetadata,
    ) -> BillingResult<CreatedInvoice> {
        let body = serde_json::json!({
            "amount": {"value": format_minor(amount_minor), "currency": "RUB"},
            "capture": true,
            "confirmation": {"type": "redirect", "return_url": self.config.return_url},
            "description": description,
            "metadata": {METADATA_KEY: serde_json::to_string(metadata)?},
        });

        let payment: YooPayment = self
            .http
            .post(self.url("payments"))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let pay_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| BillingError::Provider("YooKassa returned no confirmation URL".into()))?;

        tracing::info!(
            payment_id = %payment.id,
            user_id = metadata.user_id,
            amount = %format_minor(amount_minor),
            "YooKassa payment created"
        );
        Ok(CreatedInvoice {
            payment_id: payment.id,
            pay_url,
        })
    }

    async fn get_statuses(&self, ids: &[String]) -> BillingResult<HashMap<String, ProviderStatus>> {
        let mut statuses = HashMap::with_capacity(ids.len());
        let mut last_error = None;
        for id in ids {
            match self.fetch(id).await {
                Ok(Some(payment)) => {
                    statuses.insert(payment.id.clone(), payment.provider_status());
                }
                Ok(None) => tracing::warn!(payment_id = %id, "YooKassa does not know this payment"),
                Err(e) => {
                    tracing::warn!(payment_id = %id, error = %e, "YooKassa status query failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if statuses.is_empty() => Err(e),
            _ => Ok(statuses),
        }
    }

    async fn verify_webhook(&self, request: &WebhookRequest<'_>) -> BillingResult<Option<WebhookEvent>> {
        let expected = self
            .config
            .webhook_token
            .as_deref()
            .ok_or_else(|| BillingError::InvalidWebhook("webhook token not configured".into()))?;
        let presented = request.query_token.unwrap_or_default();
        if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            tracing::warn!("YooKassa webhook with bad token");
            return Err(BillingError::InvalidWebhook("bad token".into()));
        }

        let notification: Notification = serde_json::from_slice(request.body)
            .map_err(|e| BillingError::InvalidWebhook(format!("malformed body: {e}")))?;
        if notification.event != "payment.succeeded" && notification.event != "payment.canceled" {
            tracing::debug!(event = %notification.event, "Ignoring YooKassa event");
            return Ok(None);
        }

        // The body is only a hint; the API is the authority on status.
        let id = notification.object.id;
        let status = self
            .fetch(&id)
            .await?
            .ok_or_else(|| BillingError::InvalidWebhook(format!("unknown payment {id}")))?
            .provider_status();
        Ok(Some(WebhookEvent {
            payment_id: id,
            status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PurchaseIntent;
    use mockito::Matcher;
    use reqwest::header::HeaderMap;

    fn provider(server: &mockito::ServerGuard) -> YooKassaProvider {
        YooKassaProvider::new(
            YooKassaConfig {
                shop_id: "12345".into(),
                secret_key: "test_secret".into(),
                webhook_token: Some("hook-token".into()),
                return_url: "https://t.me/shop_bot".into(),
                api_base: server.url(),
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn metadata() -> InvoiceMetadata {
        InvoiceMetadata {
            user_id: 42,
            plan_id: Some(3),
            host_name: "nl-1".into(),
            months: 1,
            duration_days: 30,
            price_minor: 30_000,
            method: PaymentMethod::YooKassa,
            intent: PurchaseIntent::Purchase,
        }
    }

    fn payment_body(status: &str) -> String {
        serde_json::json!({
            "id": "2d8e-yk",
            "status": status,
            "paid": status == "succeeded",
            "amount": {"value": "300.00", "currency": "RUB"},
            "metadata": {"order": serde_json::to_string(&metadata()).unwrap()}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_create_invoice_sends_typed_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v3/payments")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .match_header("idempotence-key", Matcher::Any)
            .match_body(Matcher::PartialJson(serde_json::json!({
                "amount": {"value": "300.00", "currency": "RUB"},
                "capture": true
            })))
            .with_status(200)
            .with_body(
                r#"{"id":"2d8e-yk","status":"pending","amount":{"value":"300.00","currency":"RUB"},
                    "confirmation":{"type":"redirect","confirmation_url":"https://yoomoney.ru/checkout/x"}}"#,
            )
            .create_async()
            .await;

        let invoice = provider(&server)
            .create_invoice(30_000, "VPN, 1 month", &metadata())
            .await
            .unwrap();
        assert_eq!(invoice.payment_id, "2d8e-yk");
        assert_eq!(invoice.pay_url, "https://yoomoney.ru/checkout/x");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/payments/2d8e-yk")
            .with_status(200)
            .with_body(payment_body("succeeded"))
            .create_async()
            .await;

        let statuses = provider(&server)
            .get_statuses(&["2d8e-yk".to_string()])
            .await
            .unwrap();
        match statuses.get("2d8e-yk") {
            Some(ProviderStatus::Completed(payload)) => {
                assert_eq!(payload.paid_amount_minor, Some(30_000));
                assert_eq!(payload.metadata, Some(metadata()));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_token() {
        let server = mockito::Server::new_async().await;
        let headers = HeaderMap::new();
        let err = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: Some("wrong"),
                body: br#"{"event":"payment.succeeded","object":{"id":"2d8e-yk"}}"#,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidWebhook(_)));
    }

    #[tokio::test]
    async fn test_webhook_confirms_status_with_api() {
        let mut server = mockito::Server::new_async().await;
        // The notification claims success but the API says otherwise.
        server
            .mock("GET", "/v3/payments/2d8e-yk")
            .with_status(200)
            .with_body(payment_body("waiting_for_capture"))
            .create_async()
            .await;
        let headers = HeaderMap::new();
        let event = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: Some("hook-token"),
                body: br#"{"type":"notification","event":"payment.succeeded","object":{"id":"2d8e-yk"}}"#,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, ProviderStatus::Pending);
    }

    #[tokio::test]
    async fn test_webhook_ignores_other_events() {
        let server = mockito::Server::new_async().await;
        let headers = HeaderMap::new();
        let event = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: Some("hook-token"),
                body: br#"{"event":"refund.succeeded","object":{"id":"r-1"}}"#,
            })
            .await
            .unwrap();
        assert_eq!(event, None);
    }
}

//! CryptoBot (Crypto Pay API).
//!
//! Invoices are denominated in fiat RUB; the payer picks the asset.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{decode_metadata, CreatedInvoice, PaymentProvider, ProviderStatus, WebhookEvent, WebhookRequest};
use crate::config::env_opt;
use crate::error::{BillingError, BillingResult};
use crate::models::{format_minor, parse_minor, CompletionPayload, InvoiceMetadata, PaymentMethod};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://pay.crypt.bot/api";
pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";
const INVOICE_TTL_SECS: u64 = 3600;

#[derive(Clone)]
pub struct CryptoBotConfig {
    pub token: String,
    pub api_base: String,
}

impl std::fmt::Debug for CryptoBotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBotConfig")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl CryptoBotConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            token: env_opt("CRYPTOBOT_TOKEN")?,
            api_base: env_opt("CRYPTOBOT_API_URL").unwrap_or_else(|| DEFAULT_API_BASE.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    invoice_id: i64,
    status: String,
    #[serde(default)]
    currency_type: Option<String>,
    #[serde(default)]
    fiat: Option<String>,
    amount: String,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

impl Invoice {
    fn provider_status(&self) -> ProviderStatus {
        match self.status.as_str() {
            "paid" => {
                let rub = self.currency_type.as_deref() == Some("fiat") && self.fiat.as_deref() == Some("RUB");
                ProviderStatus::Completed(CompletionPayload {
                    paid_amount_minor: rub.then(|| parse_minor(&self.amount)).flatten(),
                    metadata: decode_metadata(self.payload.as_deref()),
                })
            }
            "expired" => ProviderStatus::Expired,
            _ => ProviderStatus::Pending,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvoicePage {
    items: Vec<Invoice>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_type: String,
    payload: Invoice,
}

/// hex(HMAC-SHA256(key = SHA256(token), body)).
pub fn webhook_signature(token: &str, body: &[u8]) -> String {
    let secret = Sha256::digest(token.as_bytes());
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(&secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct CryptoBotProvider {
    http: reqwest::Client,
    config: CryptoBotConfig,
}

impl CryptoBotProvider {
    pub fn new(config: CryptoBotConfig, timeout: Duration) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Provider(format!("failed to build CryptoBot client: {e}")))?;
        Ok(Self { http, config })
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> BillingResult<T> {
        let response: ApiResponse<T> = request
            .header("Crypto-Pay-API-Token", &self.config.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match response.result {
            Some(result) if response.ok => Ok(result),
            _ => Err(BillingError::Provider(format!(
                "Crypto Pay API error: {}",
                response.error.map(|e| e.to_string()).unwrap_or_default()
            ))),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl PaymentProvider for CryptoBotProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::CryptoBot
    }

    async fn create_invoice(
        &self,
        amount_minor: i64,
        description: &str,
        metadata: &InvoiceMetadata,
    ) -> BillingResult<CreatedInvoice> {
        let body = serde_json::json!({
            "currency_type": "fiat",
            "fiat": "RUB",
            "amount": format_minor(amount_minor),
            "description": description,
            "payload": serde_json::to_string(metadata)?,
            "expires_in": INVOICE_TTL_SECS,
        });
        let invoice: Invoice = self
            .call(self.http.post(self.url("createInvoice")).json(&body))
            .await?;

        let pay_url = invoice
            .bot_invoice_url
            .or(invoice.pay_url)
            .ok_or_else(|| BillingError::Provider("CryptoBot returned no pay URL".into()))?;

        tracing::info!(
            payment_id = invoice.invoice_id,
            user_id = metadata.user_id,
            amount = %format_minor(amount_minor),
            "CryptoBot invoice created"
        );
        Ok(CreatedInvoice {
            payment_id: invoice.invoice_id.to_string(),
            pay_url,
        })
    }

    async fn get_statuses(&self, ids: &[String]) -> BillingResult<HashMap<String, ProviderStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let page: InvoicePage = self
            .call(
                self.http
                    .get(self.url("getInvoices"))
                    .query(&[("invoice_ids", ids.join(",")), ("count", ids.len().to_string())]),
            )
            .await?;
        Ok(page
            .items
            .into_iter()
            .map(|invoice| (invoice.invoice_id.to_string(), invoice.provider_status()))
            .collect())
    }

    async fn verify_webhook(&self, request: &WebhookRequest<'_>) -> BillingResult<Option<WebhookEvent>> {
        let presented = request
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BillingError::InvalidWebhook("missing signature".into()))?;
        let presented = hex::decode(presented.trim())
            .map_err(|_| BillingError::InvalidWebhook("signature is not hex".into()))?;

        let secret = Sha256::digest(self.config.token.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|_| BillingError::InvalidWebhook("bad signing key".into()))?;
        mac.update(request.body);
        if mac.verify_slice(&presented).is_err() {
            tracing::warn!("CryptoBot webhook signature mismatch");
            return Err(BillingError::InvalidWebhook("signature mismatch".into()));
        }

        let update: Update = serde_json::from_slice(request.body)
            .map_err(|e| BillingError::InvalidWebhook(format!("malformed body: {e}")))?;
        if update.update_type != "invoice_paid" {
            tracing::debug!(update_type = %update.update_type, "Ignoring CryptoBot update");
            return Ok(None);
        }
        Ok(Some(WebhookEvent {
            payment_id: update.payload.invoice_id.to_string(),
            status: update.payload.provider_status(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PurchaseIntent;
    use mockito::Matcher;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn provider(server: &mockito::ServerGuard) -> CryptoBotProvider {
        CryptoBotProvider::new(
            CryptoBotConfig {
                token: "1234:AAAtoken".into(),
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
            months: 3,
            duration_days: 90,
            price_minor: 80_000,
            method: PaymentMethod::CryptoBot,
            intent: PurchaseIntent::Purchase,
        }
    }

    fn paid_update() -> Vec<u8> {
        serde_json::json!({
            "update_id": 1,
            "update_type": "invoice_paid",
            "request_date": "2025-03-01T12:00:00.000Z",
            "payload": {
                "invoice_id": 555,
                "status": "paid",
                "currency_type": "fiat",
                "fiat": "RUB",
                "amount": "800",
                "payload": serde_json::to_string(&metadata()).unwrap()
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_batch_status_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/getInvoices")
            .match_header("crypto-pay-api-token", "1234:AAAtoken")
            .match_query(Matcher::UrlEncoded("invoice_ids".into(), "555,556,557".into()))
            .with_status(200)
            .with_body(
                r#"{"ok":true,"result":{"items":[
                    {"invoice_id":555,"status":"paid","currency_type":"fiat","fiat":"RUB","amount":"800.00"},
                    {"invoice_id":556,"status":"active","currency_type":"fiat","fiat":"RUB","amount":"300"},
                    {"invoice_id":557,"status":"expired","currency_type":"fiat","fiat":"RUB","amount":"300"}
                ]}}"#,
            )
            .create_async()
            .await;

        let ids = vec!["555".to_string(), "556".to_string(), "557".to_string()];
        let statuses = provider(&server).get_statuses(&ids).await.unwrap();
        mock.assert_async().await;

        assert!(matches!(
            statuses.get("555"),
            Some(ProviderStatus::Completed(CompletionPayload { paid_amount_minor: Some(80_000), .. }))
        ));
        assert_eq!(statuses.get("556"), Some(&ProviderStatus::Pending));
        assert_eq!(statuses.get("557"), Some(&ProviderStatus::Expired));
    }

    #[tokio::test]
    async fn test_create_invoice() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/createInvoice")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "currency_type": "fiat",
                "fiat": "RUB",
                "amount": "800.00"
            })))
            .with_status(200)
            .with_body(
                r#"{"ok":true,"result":{"invoice_id":555,"status":"active","currency_type":"fiat",
                    "fiat":"RUB","amount":"800","bot_invoice_url":"https://t.me/CryptoBot?start=IV555"}}"#,
            )
            .create_async()
            .await;

        let invoice = provider(&server)
            .create_invoice(80_000, "VPN, 3 months", &metadata())
            .await
            .unwrap();
        assert_eq!(invoice.payment_id, "555");
        assert_eq!(invoice.pay_url, "https://t.me/CryptoBot?start=IV555");
    }

    #[tokio::test]
    async fn test_webhook_signature_verified() {
        let server = mockito::Server::new_async().await;
        let body = paid_update();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&webhook_signature("1234:AAAtoken", &body)).unwrap(),
        );

        let event = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: None,
                body: &body,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payment_id, "555");
        match event.status {
            ProviderStatus::Completed(payload) => assert_eq!(payload.metadata, Some(metadata())),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_webhook_tampered_body_rejected() {
        let server = mockito::Server::new_async().await;
        let body = paid_update();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&webhook_signature("1234:AAAtoken", &body)).unwrap(),
        );
        let mut tampered = body.clone();
        if let Some(byte) = tampered.iter_mut().find(|b| **b == b'8') {
            *byte = b'1';
        }

        let err = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: None,
                body: &tampered,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidWebhook(_)));
    }

    #[tokio::test]
    async fn test_webhook_without_signature_rejected() {
        let server = mockito::Server::new_async().await;
        let headers = HeaderMap::new();
        let body = paid_update();
        let err = provider(&server)
            .verify_webhook(&WebhookRequest {
                headers: &headers,
                query_token: None,
                body: &body,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidWebhook(_)));
    }
}

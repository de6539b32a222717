//! User and operator notifications
//!
//! Delivery is best effort: failures are logged and never fail the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{format_minor, PaymentMethod, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    KeyProvisioned {
        host_name: String,
        expires_at: OffsetDateTime,
        uri: Option<String>,
        renewed: bool,
    },
    /// Generic text; details go to the operator only.
    ProvisioningDelayed { payment_id: String },
    PurchaseCompleted {
        user_id: UserId,
        username: String,
        amount_minor: i64,
        method: PaymentMethod,
        host_name: String,
        months: i32,
    },
    FulfillmentFailed {
        payment_id: String,
        user_id: UserId,
        error: String,
        parked: bool,
    },
    HostUnreachable { host_name: String, error: String },
}

impl Notice {
    /// HTML-formatted message body.
    pub fn render(&self) -> String {
        match self {
            Notice::KeyProvisioned {
                host_name,
                expires_at,
                uri,
                renewed,
            } => {
                let headline = if *renewed { "Key renewed" } else { "Key ready" };
                let expires = expires_at.format(&Rfc3339).unwrap_or_else(|_| expires_at.to_string());
                let mut text = format!(
                    "✅ <b>{headline}</b>\nServer: {}\nValid until: {expires}",
                    escape_html(host_name)
                );
                if let Some(uri) = uri {
                    text.push_str(&format!("\n\n<code>{}</code>", escape_html(uri)));
                }
                text
            }
            Notice::ProvisioningDelayed { .. } => "Payment received. Setting up your key is \
                taking longer than usual; support has been notified and will follow up."
                .to_string(),
            Notice::PurchaseCompleted {
                user_id,
                username,
                amount_minor,
                method,
                host_name,
                months,
            } => format!(
                "💰 New purchase\nUser: {} ({user_id})\nAmount: {} RUB via {method}\nServer: {}, {months} mo",
                escape_html(username),
                format_minor(*amount_minor),
                escape_html(host_name)
            ),
            Notice::FulfillmentFailed {
                payment_id,
                user_id,
                error,
                parked,
            } => format!(
                "⚠️ Fulfillment {} for payment <code>{}</code> (user {user_id})\n{}",
                if *parked { "failed" } else { "deferred" },
                escape_html(payment_id),
                escape_html(error)
            ),
            Notice::HostUnreachable { host_name, error } => format!(
                "🔌 Panel {} rejected our credentials or is unreachable\n{}",
                escape_html(host_name),
                escape_html(error)
            ),
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: UserId, notice: &Notice);
    async fn notify_operator(&self, notice: &Notice);
}

/// Writes notices to the log; used when no bot token is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, user_id: UserId, notice: &Notice) {
        tracing::info!(user_id, notice = ?notice, "User notification");
    }

    async fn notify_operator(&self, notice: &Notice) {
        tracing::warn!(notice = ?notice, "Operator notification");
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    admin_chat_id: Option<i64>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, admin_chat_id: Option<i64>, timeout: Duration) -> BillingResult<Self> {
        Self::with_api_base("https://api.telegram.org".into(), bot_token, admin_chat_id, timeout)
    }

    pub fn with_api_base(
        api_base: String,
        bot_token: String,
        admin_chat_id: Option<i64>,
        timeout: Duration,
    ) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Provider(format!("failed to build bot client: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token,
            admin_chat_id,
        })
    }

    async fn send(&self, chat_id: i64, text: &str) -> BillingResult<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        self.http
            .post(url)
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_user(&self, user_id: UserId, notice: &Notice) {
        if let Err(e) = self.send(user_id, &notice.render()).await {
            tracing::warn!(user_id, error = %e, "Failed to deliver user notification");
        }
    }

    async fn notify_operator(&self, notice: &Notice) {
        let Some(chat_id) = self.admin_chat_id else {
            tracing::warn!(notice = ?notice, "No operator chat configured");
            return;
        };
        if let Err(e) = self.send(chat_id, &notice.render()).await {
            tracing::warn!(error = %e, "Failed to deliver operator notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_render_escapes_html() {
        let notice = Notice::FulfillmentFailed {
            payment_id: "p<1>".into(),
            user_id: 5,
            error: "a & b".into(),
            parked: true,
        };
        let text = notice.render();
        assert!(text.contains("p&lt;1&gt;"));
        assert!(text.contains("a &amp; b"));
        assert!(text.contains("failed"));
    }

    #[test]
    fn test_delay_notice_is_generic() {
        let text = Notice::ProvisioningDelayed {
            payment_id: "secret-id".into(),
        }
        .render();
        assert!(!text.contains("secret-id"));
    }

    #[test]
    fn test_key_notice_includes_uri() {
        let text = Notice::KeyProvisioned {
            host_name: "nl-1".into(),
            expires_at: datetime!(2025-04-01 00:00 UTC),
            uri: Some("vless://abc@nl:443?x=1&y=2#nl".into()),
            renewed: true,
        }
        .render();
        assert!(text.starts_with("✅ <b>Key renewed</b>"));
        assert!(text.contains("2025-04-01T00:00:00Z"));
        assert!(text.contains("x=1&amp;y=2"));
    }

    #[tokio::test]
    async fn test_telegram_send_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "chat_id": 77,
                "parse_mode": "HTML"
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{}}"#)
            .create_async()
            .await;

        let notifier =
            TelegramNotifier::with_api_base(server.url(), "TOKEN".into(), Some(77), Duration::from_secs(2))
                .unwrap();
        notifier
            .notify_operator(&Notice::HostUnreachable {
                host_name: "nl-1".into(),
                error: "timeout".into(),
            })
            .await;
        mock.assert_async().await;
    }
}

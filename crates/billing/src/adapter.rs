//! Remote credential store adapter
//!
//! Owns the read-modify-write protocol against a host's listener. Under the
//! host write lease it reads the client once to fix a target (client id and
//! expiry), hands that target to an [`IntentJournal`], then writes the target
//! and reads it back. Retries, and later attempts resuming a journaled
//! target, re-read the panel and write the same target; they never compute a
//! new one, so a write whose response was lost is not applied twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::expiry::{extend_expiry, from_millis, to_millis};
use crate::host_lock::HostWriteLock;
use crate::models::{Host, ProvisionCheckpoint};
use crate::panel::{connection_uri, ClientEntry, PanelClient};

/// Outcome of a successful provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKey {
    pub remote_id: String,
    pub label: String,
    pub expires_at: OffsetDateTime,
    /// `None` when the listener is not a reality listener.
    pub uri: Option<String>,
    /// True when this call planned a new client entry.
    pub created: bool,
}

/// Durable record of a write target, taken before the write is sent.
#[async_trait]
pub trait IntentJournal: Send + Sync {
    async fn record_intent(&self, intent: &ProvisionCheckpoint) -> BillingResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_retries,
        }
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // 2^n * (base / 2): base, 2*base, 4*base, ...
        let half = (self.base_delay.as_millis() / 2).max(1) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(half)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

fn should_retry(host: &Host, label: &str, e: &BillingError) -> bool {
    let retry = e.is_retryable();
    if retry {
        tracing::warn!(host = %host.name, label = %label, error = %e, "Retrying panel call");
    }
    retry
}

pub struct CredentialStoreAdapter {
    panel: Arc<dyn PanelClient>,
    locks: Arc<dyn HostWriteLock>,
    retry: RetryPolicy,
}

impl CredentialStoreAdapter {
    pub fn new(panel: Arc<dyn PanelClient>, locks: Arc<dyn HostWriteLock>, retry: RetryPolicy) -> Self {
        Self { panel, locks, retry }
    }

    /// Create the client `label` on `host`, or extend it by `duration_days`.
    ///
    /// With `planned` set, the journaled target of an earlier attempt is
    /// written as is. Otherwise a new target is computed and passed to
    /// `journal` before anything is written.
    pub async fn provision_or_renew(
        &self,
        host: &Host,
        label: &str,
        duration_days: i32,
        planned: Option<&ProvisionCheckpoint>,
        journal: &dyn IntentJournal,
    ) -> BillingResult<ProvisionedKey> {
        let _lease = self.locks.acquire(&host.name).await?;

        let (target, created) = match planned {
            Some(target) => {
                tracing::info!(
                    host = %host.name,
                    label = %label,
                    remote_id = %target.remote_id,
                    "Resuming journaled panel write"
                );
                (target.clone(), false)
            }
            None => {
                let (target, created) = RetryIf::spawn(
                    self.retry.strategy(),
                    || self.plan_once(host, label, duration_days),
                    |e: &BillingError| should_retry(host, label, e),
                )
                .await?;
                journal.record_intent(&target).await?;
                (target, created)
            }
        };

        let uri = RetryIf::spawn(
            self.retry.strategy(),
            || self.apply_once(host, &target),
            |e: &BillingError| should_retry(host, label, e),
        )
        .await?;

        tracing::info!(
            host = %host.name,
            label = %label,
            remote_id = %target.remote_id,
            expires_at = %target.expires_at,
            created,
            "Panel client provisioned"
        );
        Ok(ProvisionedKey {
            remote_id: target.remote_id,
            label: target.label,
            expires_at: target.expires_at,
            uri,
            created,
        })
    }

    /// Read the client once and fix the target of the write.
    async fn plan_once(
        &self,
        host: &Host,
        label: &str,
        duration_days: i32,
    ) -> BillingResult<(ProvisionCheckpoint, bool)> {
        let session = self.panel.login(host).await?;
        let settings = self.panel.get_inbound(host, &session).await?.client_settings()?;

        let now = OffsetDateTime::now_utc();
        let (remote_id, expires_at, created) = match settings.find(label) {
            Some(client) => (
                client.id.clone(),
                extend_expiry(from_millis(client.expiry_time), now, duration_days),
                false,
            ),
            None => (Uuid::new_v4().to_string(), extend_expiry(None, now, duration_days), true),
        };
        let target = ProvisionCheckpoint {
            remote_id,
            label: label.to_string(),
            expires_at,
            confirmed: false,
        };
        Ok((target, created))
    }

    /// Bring the panel to `target`. A client already holding the target id
    /// and expiry means an earlier write landed; nothing is written then.
    async fn apply_once(&self, host: &Host, target: &ProvisionCheckpoint) -> BillingResult<Option<String>> {
        let label = target.label.as_str();
        let expiry_ms = to_millis(target.expires_at);

        let session = self.panel.login(host).await?;
        let mut inbound = self.panel.get_inbound(host, &session).await?;
        let mut settings = inbound.client_settings()?;

        let write = match settings.find_mut(label) {
            Some(client) if client.id != target.remote_id => {
                return Err(BillingError::Conflict {
                    host: host.name.clone(),
                    detail: format!("client {label} has id {}, expected {}", client.id, target.remote_id),
                })
            }
            Some(client) if client.expiry_time >= expiry_ms => false,
            Some(client) => {
                client.expiry_time = expiry_ms;
                client.enable = true;
                true
            }
            None => {
                settings
                    .clients
                    .push(ClientEntry::with_id(label, &target.remote_id, expiry_ms));
                true
            }
        };

        if !write {
            tracing::info!(host = %host.name, label = %label, "Panel already holds the journaled write");
            return Ok(connection_uri(&host.base_url, &inbound, &target.remote_id, &host.name));
        }

        inbound.set_client_settings(&settings)?;
        self.panel.update_inbound(host, &session, &inbound).await?;

        // Verify: a write lost to a concurrent writer is a conflict.
        let written = self.panel.get_inbound(host, &session).await?.client_settings()?;
        match written.find(label) {
            Some(client) if client.id == target.remote_id && client.expiry_time == expiry_ms => {}
            Some(_) => {
                return Err(BillingError::Conflict {
                    host: host.name.clone(),
                    detail: format!("client {label} changed underneath the write"),
                })
            }
            None => {
                return Err(BillingError::Conflict {
                    host: host.name.clone(),
                    detail: format!("client {label} missing after write"),
                })
            }
        }

        Ok(connection_uri(&host.base_url, &inbound, &target.remote_id, &host.name))
    }

    /// Delete client `label` from `host`. Returns false if it was not there.
    pub async fn remove(&self, host: &Host, label: &str) -> BillingResult<bool> {
        let _lease = self.locks.acquire(&host.name).await?;

        RetryIf::spawn(
            self.retry.strategy(),
            || self.remove_once(host, label),
            BillingError::is_retryable,
        )
        .await
    }

    async fn remove_once(&self, host: &Host, label: &str) -> BillingResult<bool> {
        let session = self.panel.login(host).await?;
        let mut inbound = self.panel.get_inbound(host, &session).await?;
        let mut settings = inbound.client_settings()?;
        if !settings.remove(label) {
            return Ok(false);
        }
        inbound.set_client_settings(&settings)?;
        self.panel.update_inbound(host, &session, &inbound).await?;

        let written = self.panel.get_inbound(host, &session).await?.client_settings()?;
        if written.find(label).is_some() {
            return Err(BillingError::Conflict {
                host: host.name.clone(),
                detail: format!("client {label} still present after removal"),
            });
        }
        Ok(true)
    }

    /// Fresh connection URI for an existing client; never cached.
    pub async fn connection_uri(&self, host: &Host, label: &str) -> BillingResult<Option<String>> {
        let session = self.panel.login(host).await?;
        let inbound = self.panel.get_inbound(host, &session).await?;
        let settings = inbound.client_settings()?;
        let client = settings
            .find(label)
            .ok_or_else(|| BillingError::not_found("client", format!("{}/{label}", host.name)))?;
        Ok(connection_uri(&host.base_url, &inbound, &client.id, &host.name))
    }
}

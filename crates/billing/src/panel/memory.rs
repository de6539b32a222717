//! In-process panel double.
//!
//! Behaves like a single listener per host with last-writer-wins updates.
//! An optional delay between read and write widens the race window so lost
//! updates show up reliably when callers skip the host write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::inbound::{Inbound, InboundSettings};
use super::{PanelClient, PanelSession};
use crate::error::{BillingError, BillingResult};
use crate::models::Host;

/// Failure injected into the next call against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelFault {
    Timeout,
    BadCredentials,
    /// The next update is silently dropped, as if a concurrent writer won.
    LostWrite,
    /// The next update is applied but its response times out.
    LandedTimeout,
    /// The next update is refused with a panel error message.
    Refused,
}

/// Message returned with [`PanelFault::Refused`].
pub const REFUSED_MESSAGE: &str = "inbound 1 is locked by another admin session";

#[derive(Default)]
pub struct InMemoryPanel {
    inbounds: Mutex<HashMap<String, Inbound>>,
    faults: Mutex<HashMap<String, Vec<PanelFault>>>,
    read_delay: Option<Duration>,
    writes: AtomicUsize,
}

impl InMemoryPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_delay(delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::default()
        }
    }

    fn inbounds(&self) -> BillingResult<MutexGuard<'_, HashMap<String, Inbound>>> {
        self.inbounds
            .lock()
            .map_err(|_| BillingError::TransientNetwork("panel state poisoned".into()))
    }

    /// Register a reality listener for `host_name` with no clients.
    pub fn add_host(&self, host_name: &str, port: u16) -> BillingResult<()> {
        let inbound = Inbound {
            id: 1,
            remark: host_name.to_string(),
            enable: true,
            port,
            protocol: "vless".into(),
            settings: r#"{"clients":[],"decryption":"none","fallbacks":[]}"#.into(),
            stream_settings: serde_json::json!({
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "serverNames": ["www.example.org"],
                    "shortIds": ["6ba85179e30d4fc2"],
                    "settings": {"publicKey": "Z84J2IelR9ch3k8VtlVhhs5ycBUlXA7wHBWcBrjqnAw", "fingerprint": "chrome"}
                }
            })
            .to_string(),
            extra: Default::default(),
        };
        self.inbounds()?.insert(host_name.to_string(), inbound);
        Ok(())
    }

    /// Queue faults for upcoming calls against `host_name`, in order.
    pub fn inject(&self, host_name: &str, faults: &[PanelFault]) -> BillingResult<()> {
        let mut map = self
            .faults
            .lock()
            .map_err(|_| BillingError::TransientNetwork("panel state poisoned".into()))?;
        map.entry(host_name.to_string())
            .or_default()
            .extend(faults.iter().copied());
        Ok(())
    }

    fn take_fault(&self, host_name: &str, wanted: &[PanelFault]) -> Option<PanelFault> {
        let mut map = self.faults.lock().ok()?;
        let queue = map.get_mut(host_name)?;
        let pos = queue.iter().position(|f| wanted.contains(f))?;
        Some(queue.remove(pos))
    }

    pub fn settings(&self, host_name: &str) -> BillingResult<InboundSettings> {
        self.inbounds()?
            .get(host_name)
            .ok_or_else(|| BillingError::not_found("inbound", host_name))?
            .client_settings()
    }

    /// Number of successful update calls across all hosts.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PanelClient for InMemoryPanel {
    async fn login(&self, host: &Host) -> BillingResult<PanelSession> {
        match self.take_fault(&host.name, &[PanelFault::Timeout, PanelFault::BadCredentials]) {
            Some(PanelFault::Timeout) => {
                return Err(BillingError::TransientNetwork("operation timed out".into()))
            }
            Some(_) => {
                return Err(BillingError::Authentication {
                    target: host.name.clone(),
                })
            }
            None => {}
        }
        Ok(PanelSession {
            cookie: format!("session={}", host.name),
        })
    }

    async fn get_inbound(&self, host: &Host, _session: &PanelSession) -> BillingResult<Inbound> {
        let inbound = self
            .inbounds()?
            .get(&host.name)
            .cloned()
            .ok_or_else(|| BillingError::not_found("inbound", format!("{}#{}", host.name, host.inbound_id)))?;
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(inbound)
    }

    async fn update_inbound(
        &self,
        host: &Host,
        _session: &PanelSession,
        inbound: &Inbound,
    ) -> BillingResult<()> {
        let fault = self.take_fault(
            &host.name,
            &[PanelFault::LostWrite, PanelFault::LandedTimeout, PanelFault::Refused],
        );
        match fault {
            Some(PanelFault::LostWrite) => return Ok(()),
            Some(PanelFault::Refused) => {
                return Err(BillingError::Provider(format!(
                    "panel {} rejected inbound update: {REFUSED_MESSAGE}",
                    host.name
                )))
            }
            _ => {}
        }
        let mut inbounds = self.inbounds()?;
        if !inbounds.contains_key(&host.name) {
            return Err(BillingError::not_found("inbound", &host.name));
        }
        inbounds.insert(host.name.clone(), inbound.for_update());
        self.writes.fetch_add(1, Ordering::SeqCst);
        if fault == Some(PanelFault::LandedTimeout) {
            return Err(BillingError::TransientNetwork("operation timed out".into()));
        }
        Ok(())
    }
}

//! HTTP client for the panel API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;

use super::inbound::{Inbound, PanelEnvelope};
use super::{PanelClient, PanelSession};
use crate::error::{BillingError, BillingResult};
use crate::models::Host;

#[derive(Clone)]
pub struct XuiPanelClient {
    http: reqwest::Client,
}

impl XuiPanelClient {
    pub fn new(timeout: Duration) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BillingError::Provider(format!("failed to build panel client: {e}")))?;
        Ok(Self { http })
    }

    fn endpoint(host: &Host, path: &str) -> String {
        format!("{}/{}", host.base_url.trim_end_matches('/'), path)
    }
}

/// `name=value` pairs of every `Set-Cookie` header, joined for a `Cookie` header.
fn session_cookie(headers: &reqwest::header::HeaderMap) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl PanelClient for XuiPanelClient {
    async fn login(&self, host: &Host) -> BillingResult<PanelSession> {
        let response = self
            .http
            .post(Self::endpoint(host, "login"))
            .form(&[("username", host.username.as_str()), ("password", host.password.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BillingError::Authentication {
                target: host.name.clone(),
            });
        }
        let response = response.error_for_status()?;
        let cookie = session_cookie(response.headers());
        let envelope: PanelEnvelope<serde_json::Value> = response.json().await?;

        if !envelope.success {
            tracing::warn!(host = %host.name, msg = %envelope.msg, "Panel rejected login");
            return Err(BillingError::Authentication {
                target: host.name.clone(),
            });
        }
        if cookie.is_empty() {
            return Err(BillingError::Provider(format!(
                "panel {} accepted login but issued no session cookie",
                host.name
            )));
        }
        Ok(PanelSession { cookie })
    }

    async fn get_inbound(&self, host: &Host, session: &PanelSession) -> BillingResult<Inbound> {
        let path = format!("panel/api/inbounds/get/{}", host.inbound_id);
        let response = self
            .http
            .get(Self::endpoint(host, &path))
            .header(COOKIE, &session.cookie)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(BillingError::not_found(
                "inbound",
                format!("{}#{}", host.name, host.inbound_id),
            ));
        }
        let envelope: PanelEnvelope<Inbound> = response.error_for_status()?.json().await?;
        match envelope.obj {
            Some(inbound) if envelope.success => Ok(inbound),
            _ => Err(BillingError::not_found(
                "inbound",
                format!("{}#{}", host.name, host.inbound_id),
            )),
        }
    }

    async fn update_inbound(
        &self,
        host: &Host,
        session: &PanelSession,
        inbound: &Inbound,
    ) -> BillingResult<()> {
        let path = format!("panel/api/inbounds/update/{}", inbound.id);
        let envelope: PanelEnvelope<serde_json::Value> = self
            .http
            .post(Self::endpoint(host, &path))
            .header(COOKIE, &session.cookie)
            .json(&inbound.for_update())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !envelope.success {
            return Err(BillingError::Provider(format!(
                "panel {} rejected inbound update: {}",
                host.name, envelope.msg
            )));
        }
        Ok(())
    }
}

//! Remote access-control panel (3x-ui compatible).

mod inbound;
mod memory;
mod uri;
mod xui;

pub use inbound::{
    ClientEntry, Inbound, InboundSettings, PanelEnvelope, RealityClientSettings, RealitySettings,
    StreamSettings, VISION_FLOW,
};
pub use memory::{InMemoryPanel, PanelFault, REFUSED_MESSAGE};
pub use uri::connection_uri;
pub use xui::XuiPanelClient;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::models::Host;

/// Authenticated panel session. Opaque outside the client that issued it.
#[derive(Clone)]
pub struct PanelSession {
    pub(crate) cookie: String,
}

impl std::fmt::Debug for PanelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PanelSession([redacted])")
    }
}

/// The three panel calls the engine needs. Implementations hold no
/// per-host state beyond what the session carries.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn login(&self, host: &Host) -> BillingResult<PanelSession>;
    async fn get_inbound(&self, host: &Host, session: &PanelSession) -> BillingResult<Inbound>;
    async fn update_inbound(
        &self,
        host: &Host,
        session: &PanelSession,
        inbound: &Inbound,
    ) -> BillingResult<()>;
}

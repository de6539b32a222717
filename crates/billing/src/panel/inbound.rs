//! Panel listener ("inbound") wire types.
//!
//! The panel nests JSON documents inside string fields (`settings`,
//! `streamSettings`). Unknown fields are carried through untouched so a
//! write-back never drops configuration we do not model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const VISION_FLOW: &str = "xtls-rprx-vision";

/// Standard panel response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    pub obj: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: i32,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub enable: bool,
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    pub settings: String,
    #[serde(default)]
    pub stream_settings: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    pub fn client_settings(&self) -> BillingResult<InboundSettings> {
        serde_json::from_str(&self.settings).map_err(|e| {
            BillingError::Provider(format!("inbound {} has unreadable settings: {e}", self.id))
        })
    }

    pub fn set_client_settings(&mut self, settings: &InboundSettings) -> BillingResult<()> {
        self.settings = serde_json::to_string(settings)?;
        Ok(())
    }

    pub fn stream(&self) -> Option<StreamSettings> {
        if self.stream_settings.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.stream_settings).ok()
    }

    /// Body for the update call. Traffic counters are owned by the panel and
    /// must not be written back from a possibly stale read.
    pub fn for_update(&self) -> Inbound {
        let mut copy = self.clone();
        copy.extra.remove("clientStats");
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundSettings {
    pub fn find(&self, label: &str) -> Option<&ClientEntry> {
        self.clients.iter().find(|c| c.email == label)
    }

    pub fn find_mut(&mut self, label: &str) -> Option<&mut ClientEntry> {
        self.clients.iter_mut().find(|c| c.email == label)
    }

    pub fn remove(&mut self, label: &str) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c.email != label);
        self.clients.len() != before
    }
}

/// One client of a listener. `email` is the label the panel keys clients by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub flow: String,
    /// Unix millis; `0` means no expiry.
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientEntry {
    pub fn new(label: &str, expiry_time: i64) -> Self {
        Self::with_id(label, &Uuid::new_v4().to_string(), expiry_time)
    }

    /// Entry for a client id chosen before the write.
    pub fn with_id(label: &str, id: &str, expiry_time: i64) -> Self {
        let sub_id: String = id.chars().filter(|c| *c != '-').take(16).collect();
        let mut extra = Map::new();
        extra.insert("limitIp".into(), Value::from(0));
        extra.insert("totalGB".into(), Value::from(0));
        extra.insert("tgId".into(), Value::from(""));
        extra.insert("subId".into(), Value::from(sub_id));
        Self {
            id: id.to_string(),
            email: label.to_string(),
            enable: true,
            flow: VISION_FLOW.to_string(),
            expiry_time,
            extra,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub security: String,
    pub reality_settings: Option<RealitySettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub short_ids: Vec<String>,
    pub settings: Option<RealityClientSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityClientSettings {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_inbound() -> Inbound {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "remark": "nl-1",
            "enable": true,
            "port": 443,
            "protocol": "vless",
            "settings": "{\"clients\":[{\"id\":\"11111111-1111-1111-1111-111111111111\",\"email\":\"user1@nl-1.bot\",\"enable\":true,\"flow\":\"xtls-rprx-vision\",\"expiryTime\":1700000000000,\"limitIp\":2,\"totalGB\":0}],\"decryption\":\"none\",\"fallbacks\":[]}",
            "streamSettings": "{\"network\":\"tcp\",\"security\":\"reality\",\"realitySettings\":{\"serverNames\":[\"www.example.org\"],\"shortIds\":[\"ab12\"],\"settings\":{\"publicKey\":\"PUBKEY\",\"fingerprint\":\"chrome\"}}}",
            "sniffing": "{}",
            "clientStats": [{"email": "user1@nl-1.bot", "up": 10, "down": 20}]
        }))
        .unwrap()
    }

    #[test]
    fn test_settings_preserve_unknown_fields() {
        let mut inbound = sample_inbound();
        let mut settings = inbound.client_settings().unwrap();
        assert_eq!(settings.clients.len(), 1);
        settings.clients.push(ClientEntry::new("user2@nl-1.bot", 5));
        inbound.set_client_settings(&settings).unwrap();

        let reparsed: Value = serde_json::from_str(&inbound.settings).unwrap();
        assert_eq!(reparsed["decryption"], "none");
        assert_eq!(reparsed["clients"][0]["limitIp"], 2);
        assert_eq!(reparsed["clients"][1]["flow"], VISION_FLOW);
    }

    #[test]
    fn test_update_body_drops_traffic_stats() {
        let inbound = sample_inbound();
        assert!(inbound.extra.contains_key("clientStats"));
        let body = serde_json::to_value(inbound.for_update()).unwrap();
        assert!(body.get("clientStats").is_none());
        assert_eq!(body["sniffing"], "{}");
        assert!(body.get("streamSettings").is_some());
    }

    #[test]
    fn test_stream_settings_parse() {
        let stream = sample_inbound().stream().unwrap();
        let reality = stream.reality_settings.unwrap();
        assert_eq!(reality.short_ids, vec!["ab12"]);
        assert_eq!(reality.settings.unwrap().public_key, "PUBKEY");
    }
}

//! `vless://` connection URIs for reality listeners.

use url::Url;

use super::inbound::{Inbound, VISION_FLOW};

/// Build the client connection URI, or `None` when the listener lacks the
/// reality parameters a client needs.
pub fn connection_uri(base_url: &str, inbound: &Inbound, client_id: &str, remark: &str) -> Option<String> {
    let stream = inbound.stream()?;
    let reality = stream.reality_settings?;
    let keys = reality.settings?;
    let server_name = reality.server_names.first()?;
    let short_id = reality.short_ids.first()?;
    if keys.public_key.is_empty() {
        return None;
    }

    let panel = Url::parse(base_url).ok()?;
    let hostname = panel.host_str()?;

    let mut uri = Url::parse(&format!("vless://{client_id}@{hostname}:{}", inbound.port)).ok()?;
    uri.query_pairs_mut()
        .append_pair("type", "tcp")
        .append_pair("security", "reality")
        .append_pair("pbk", &keys.public_key)
        .append_pair("fp", &keys.fingerprint)
        .append_pair("sni", server_name)
        .append_pair("sid", short_id)
        .append_pair("spx", "/")
        .append_pair("flow", VISION_FLOW);
    uri.set_fragment(Some(remark));
    Some(uri.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::inbound::Inbound;

    fn inbound(stream: serde_json::Value) -> Inbound {
        Inbound {
            id: 1,
            remark: String::new(),
            enable: true,
            port: 8443,
            protocol: "vless".into(),
            settings: "{\"clients\":[]}".into(),
            stream_settings: stream.to_string(),
            extra: Default::default(),
        }
    }

    #[test]
    fn test_builds_reality_uri() {
        let inbound = inbound(serde_json::json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "serverNames": ["www.example.org", "alt.example.org"],
                "shortIds": ["ab12", "cd34"],
                "settings": {"publicKey": "PUBKEY_x-1", "fingerprint": "chrome"}
            }
        }));
        let uri = connection_uri("https://panel.nl.example.com:54321/secret", &inbound, "uuid-1", "nl-1")
            .unwrap();
        assert_eq!(
            uri,
            "vless://uuid-1@panel.nl.example.com:8443?type=tcp&security=reality&pbk=PUBKEY_x-1\
             &fp=chrome&sni=www.example.org&sid=ab12&spx=%2F&flow=xtls-rprx-vision#nl-1"
        );
    }

    #[test]
    fn test_missing_reality_params_yield_none() {
        let inbound = inbound(serde_json::json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {"serverNames": [], "shortIds": ["ab12"], "settings": {"publicKey": "K"}}
        }));
        assert_eq!(connection_uri("https://nl.example.com", &inbound, "id", "nl"), None);
    }
}

//! `streamSettings` construction, shared across vmess/vless/trojan.
//!
//! Every protocol-specific parser folds its scattered query/json fields
//! into a `StreamParams`, then hands it to `build_stream_settings` to
//! render the JSON fragment the engine expects.

use serde_json::{Value, json};

#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    pub network: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    pub fingerprint: Option<String>,
    pub security: Option<String>,
    pub allow_insecure: Option<bool>,
    pub service_name: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub spider_x: Option<String>,
    /// Default for the ws Host header and the tls serverName when neither is set.
    pub fallback_host: String,
}

/// Renders `streamSettings`; `network: none` is treated as `tcp`.
pub fn build_stream_settings(params: &StreamParams) -> Value {
    let network = params
        .network
        .as_deref()
        .map(|n| if n == "none" { "tcp" } else { n })
        .unwrap_or("tcp");

    let mut settings = json!({ "network": network });
    let obj = settings.as_object_mut().expect("object literal");

    match network {
        "ws" => {
            let host_header = params
                .host
                .clone()
                .or_else(|| params.sni.clone())
                .unwrap_or_else(|| params.fallback_host.clone());
            obj.insert(
                "wsSettings".to_string(),
                json!({
                    "path": params.path.clone().unwrap_or_default(),
                    "headers": { "Host": host_header },
                }),
            );
        }
        "grpc" => {
            obj.insert(
                "grpcSettings".to_string(),
                json!({ "serviceName": params.service_name.clone().unwrap_or_default() }),
            );
        }
        _ => {}
    }

    if let Some(security) = params.security.as_deref() {
        if security == "tls" || security == "reality" {
            obj.insert("security".to_string(), json!(security));

            let server_name = params
                .sni
                .clone()
                .unwrap_or_else(|| params.fallback_host.clone());

            let mut tls_obj = serde_json::Map::new();
            tls_obj.insert("serverName".to_string(), json!(server_name));
            if let Some(alpn) = &params.alpn {
                tls_obj.insert("alpn".to_string(), json!(alpn));
            }
            if let Some(fp) = &params.fingerprint {
                tls_obj.insert("fingerprint".to_string(), json!(fp));
            }
            if let Some(insecure) = params.allow_insecure {
                tls_obj.insert("allowInsecure".to_string(), json!(insecure));
            }

            if security == "reality" {
                tls_obj.insert(
                    "publicKey".to_string(),
                    json!(params.public_key.clone().unwrap_or_default()),
                );
                tls_obj.insert(
                    "shortId".to_string(),
                    json!(params.short_id.clone().unwrap_or_default()),
                );
                tls_obj.insert(
                    "spiderX".to_string(),
                    json!(params.spider_x.clone().unwrap_or_else(|| "/".to_string())),
                );
                obj.insert("realitySettings".to_string(), Value::Object(tls_obj));
            } else {
                obj.insert("tlsSettings".to_string(), Value::Object(tls_obj));
            }
        }
    }

    settings
}

//! `vmess://` URI parsing: the base64 payload carries a JSON object.

use serde_json::{Value, json};

use crate::core::error::ProxyParsingError;
use crate::core::model::{Outbound, Protocol};
use crate::parser::decode_base64_flexible;
use crate::parser::stream_settings::{StreamParams, build_stream_settings};
use crate::parser::tag::sanitize_tag;

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|x| x.as_str()).map(str::to_string)
}

/// vmess's `port`/`aid` fields often show up as strings in links exported by various generators.
fn number_field(v: &Value, key: &str) -> Option<u64> {
    let field = v.get(key)?;
    field.as_u64().or_else(|| field.as_str()?.parse().ok())
}

pub fn parse(line_no: usize, body: &str) -> Result<Outbound, ProxyParsingError> {
    let decoded = decode_base64_flexible(body)
        .map_err(|_| ProxyParsingError::new(line_no, "invalid vmess base64 payload"))?;
    let v: Value = serde_json::from_str(&decoded)
        .map_err(|_| ProxyParsingError::new(line_no, "invalid vmess json payload"))?;

    let host = str_field(&v, "add")
        .ok_or_else(|| ProxyParsingError::new(line_no, "vmess missing 'add'"))?;
    let port = number_field(&v, "port")
        .ok_or_else(|| ProxyParsingError::new(line_no, "vmess missing 'port'"))? as u16;
    let uuid =
        str_field(&v, "id").ok_or_else(|| ProxyParsingError::new(line_no, "vmess missing 'id'"))?;

    let aid = number_field(&v, "aid").unwrap_or(0);
    let security = str_field(&v, "scy").unwrap_or_else(|| "auto".to_string());

    let params = StreamParams {
        network: str_field(&v, "net"),
        path: str_field(&v, "path"),
        host: str_field(&v, "host"),
        sni: str_field(&v, "sni"),
        alpn: str_field(&v, "alpn").map(|a| a.split(',').map(str::to_string).collect()),
        fingerprint: str_field(&v, "fp"),
        security: str_field(&v, "tls").map(|t| if t.is_empty() { "none".to_string() } else { t }),
        allow_insecure: None,
        service_name: str_field(&v, "serviceName"),
        public_key: None,
        short_id: None,
        spider_x: None,
        fallback_host: host.clone(),
    };
    let stream_settings = build_stream_settings(&params);

    let raw_tag = str_field(&v, "ps").unwrap_or_default();
    let tag = sanitize_tag(&raw_tag, "vmess");

    let engine_config = json!({
        "tag": tag,
        "protocol": "vmess",
        "settings": {
            "vnext": [{
                "address": host,
                "port": port,
                "users": [{
                    "id": uuid,
                    "alterId": aid,
                    "security": security,
                }]
            }]
        },
        "streamSettings": stream_settings,
    });

    Ok(Outbound {
        uri: format!("vmess://{body}"),
        tag,
        protocol: Protocol::Vmess,
        host,
        port,
        engine_config,
    })
}

//! `vless://` URI parsing: standard URL syntax, with a manual fallback for unbracketed IPv6.

use serde_json::json;

use crate::core::error::ProxyParsingError;
use crate::core::model::{Outbound, Protocol};
use crate::parser::authority::parse_authority;
use crate::parser::stream_settings::{StreamParams, build_stream_settings};
use crate::parser::tag::sanitize_tag;

pub fn parse(line_no: usize, line: &str) -> Result<Outbound, ProxyParsingError> {
    let authority = parse_authority(line_no, line, "vless://")?;

    let uuid = authority.userinfo.clone();
    if uuid.is_empty() {
        return Err(ProxyParsingError::new(line_no, "vless missing user id"));
    }

    let query = &authority.query;
    let flow = query.get("flow").cloned().unwrap_or_default();

    let security = query.get("security").cloned();
    let params = StreamParams {
        network: query.get("type").cloned(),
        path: query.get("path").cloned(),
        host: query.get("host").cloned(),
        sni: query.get("sni").cloned(),
        alpn: query.get("alpn").map(|a| a.split(',').map(str::to_string).collect()),
        fingerprint: query.get("fp").cloned(),
        security: security.clone().map(|s| if s == "xtls" { "tls".to_string() } else { s }),
        allow_insecure: query.get("allowInsecure").map(|v| v == "1" || v == "true"),
        service_name: query.get("serviceName").cloned(),
        public_key: query.get("pbk").cloned(),
        short_id: query.get("sid").cloned(),
        spider_x: query.get("spx").cloned(),
        fallback_host: authority.host.clone(),
    };
    let stream_settings = build_stream_settings(&params);

    let tag = sanitize_tag(&authority.fragment, "vless");

    let engine_config = json!({
        "tag": tag,
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": authority.host,
                "port": authority.port,
                "users": [{
                    "id": uuid,
                    "encryption": "none",
                    "flow": flow,
                }]
            }]
        },
        "streamSettings": stream_settings,
    });

    Ok(Outbound {
        uri: line.to_string(),
        tag,
        protocol: Protocol::Vless,
        host: authority.host,
        port: authority.port,
        engine_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_vless_uri() {
        let uri = "vless://11111111-1111-1111-1111-111111111111@1.2.3.4:443?type=tcp&security=tls&sni=example.com#My%20Node";
        let outbound = parse(1, uri).unwrap();
        assert_eq!(outbound.host, "1.2.3.4");
        assert_eq!(outbound.port, 443);
        assert_eq!(outbound.tag, "My_Node");
        assert_eq!(outbound.engine_config["streamSettings"]["security"], "tls");
    }

    #[test]
    fn handles_unbracketed_ipv6_authority() {
        let uri = "vless://uuid@2001:db8::1:443?type=tcp#v6";
        let outbound = parse(1, uri).unwrap();
        assert_eq!(outbound.host, "2001:db8::1");
        assert_eq!(outbound.port, 443);
    }

    #[test]
    fn grpc_transport_carries_service_name() {
        let uri = "vless://uuid@1.2.3.4:443?type=grpc&serviceName=svc#g";
        let outbound = parse(1, uri).unwrap();
        assert_eq!(outbound.engine_config["streamSettings"]["grpcSettings"]["serviceName"], "svc");
    }

    #[test]
    fn missing_user_id_is_rejected() {
        let uri = "vless://@1.2.3.4:443";
        assert!(parse(1, uri).is_err());
    }
}

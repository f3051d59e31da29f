//! `trojan://` URI parsing: same grammar as vless, with `password` in the userinfo slot.

use serde_json::json;

use crate::core::error::ProxyParsingError;
use crate::core::model::{Outbound, Protocol};
use crate::parser::authority::parse_authority;
use crate::parser::stream_settings::{StreamParams, build_stream_settings};
use crate::parser::tag::sanitize_tag;

pub fn parse(line_no: usize, line: &str) -> Result<Outbound, ProxyParsingError> {
    let authority = parse_authority(line_no, line, "trojan://")?;

    let password = authority.userinfo.clone();
    if password.is_empty() {
        return Err(ProxyParsingError::new(line_no, "trojan missing password"));
    }

    let query = &authority.query;
    let params = StreamParams {
        network: query.get("type").cloned(),
        path: query.get("path").cloned(),
        host: query.get("host").cloned(),
        sni: query.get("sni").cloned(),
        alpn: query.get("alpn").map(|a| a.split(',').map(str::to_string).collect()),
        fingerprint: query.get("fp").cloned(),
        // trojan implies TLS unless the query explicitly turns it off
        security: Some(query.get("security").cloned().unwrap_or_else(|| "tls".to_string())),
        allow_insecure: query.get("allowInsecure").map(|v| v == "1" || v == "true"),
        service_name: query.get("serviceName").cloned(),
        public_key: query.get("pbk").cloned(),
        short_id: query.get("sid").cloned(),
        spider_x: query.get("spx").cloned(),
        fallback_host: authority.host.clone(),
    };
    let stream_settings = build_stream_settings(&params);

    let tag = sanitize_tag(&authority.fragment, "trojan");

    let engine_config = json!({
        "tag": tag,
        "protocol": "trojan",
        "settings": {
            "servers": [{
                "address": authority.host,
                "port": authority.port,
                "password": password,
            }]
        },
        "streamSettings": stream_settings,
    });

    Ok(Outbound {
        uri: line.to_string(),
        tag,
        protocol: Protocol::Trojan,
        host: authority.host,
        port: authority.port,
        engine_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_trojan_uri() {
        let uri = "trojan://s3cr3t@1.2.3.4:443?sni=example.com#Node%201";
        let outbound = parse(1, uri).unwrap();
        assert_eq!(outbound.host, "1.2.3.4");
        assert_eq!(outbound.port, 443);
        assert_eq!(outbound.tag, "Node_1");
        assert_eq!(outbound.engine_config["settings"]["servers"][0]["password"], "s3cr3t");
        assert_eq!(outbound.engine_config["streamSettings"]["security"], "tls");
    }

    #[test]
    fn missing_password_is_rejected() {
        assert!(parse(1, "trojan://@1.2.3.4:443").is_err());
    }

    #[test]
    fn handles_unbracketed_ipv6_authority() {
        let uri = "trojan://pw@2001:db8::2:8443#v6";
        let outbound = parse(1, uri).unwrap();
        assert_eq!(outbound.host, "2001:db8::2");
        assert_eq!(outbound.port, 8443);
    }
}

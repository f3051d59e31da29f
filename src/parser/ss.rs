//! `ss://` Shadowsocks URI parsing.

use serde_json::json;

use crate::core::error::ProxyParsingError;
use crate::core::model::{Outbound, Protocol};
use crate::parser::decode_base64_flexible;
use crate::parser::tag::sanitize_tag;

pub fn parse(line_no: usize, line: &str) -> Result<Outbound, ProxyParsingError> {
    let body = line
        .strip_prefix("ss://")
        .ok_or_else(|| ProxyParsingError::new(line_no, "missing ss:// prefix"))?;

    let (body, fragment) = match body.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (body, None),
    };

    // New-style: base64(method:password)@host:port ; also tolerate a fully
    // base64-encoded authority (old-style) as a fallback.
    let (method, password, host, port) = if let Some((userinfo, hostport)) = body.rsplit_once('@')
    {
        let decoded_user = decode_base64_flexible(userinfo)
            .unwrap_or_else(|_| userinfo.to_string());
        let (method, password) = decoded_user
            .split_once(':')
            .ok_or_else(|| ProxyParsingError::new(line_no, "malformed ss method:password"))?;
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| ProxyParsingError::new(line_no, "malformed ss host:port"))?;
        let port: u16 = port
            .trim_end_matches('/')
            .parse()
            .map_err(|_| ProxyParsingError::new(line_no, "invalid ss port"))?;
        (method.to_string(), password.to_string(), host.to_string(), port)
    } else {
        let decoded = decode_base64_flexible(body)
            .map_err(|_| ProxyParsingError::new(line_no, "invalid ss base64 authority"))?;
        let (auth, addr) = decoded
            .rsplit_once('@')
            .ok_or_else(|| ProxyParsingError::new(line_no, "malformed ss authority"))?;
        let (method, password) = auth
            .split_once(':')
            .ok_or_else(|| ProxyParsingError::new(line_no, "malformed ss method:password"))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ProxyParsingError::new(line_no, "malformed ss host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyParsingError::new(line_no, "invalid ss port"))?;
        (method.to_string(), password.to_string(), host.to_string(), port)
    };

    let raw_tag = fragment
        .map(|f| {
            percent_encoding::percent_decode_str(f)
                .decode_utf8_lossy()
                .into_owned()
        })
        .unwrap_or_default();
    let tag = sanitize_tag(&raw_tag, "ss");

    let engine_config = json!({
        "tag": tag,
        "protocol": "shadowsocks",
        "settings": {
            "servers": [{
                "address": host,
                "port": port,
                "method": method,
                "password": password,
            }]
        }
    });

    Ok(Outbound {
        uri: line.to_string(),
        tag,
        protocol: Protocol::Shadowsocks,
        host,
        port,
        engine_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn parses_new_style_ss_uri() {
        let userinfo = URL_SAFE_NO_PAD.encode(b"aes-256-gcm:secret");
        let uri = format!("ss://{userinfo}@1.2.3.4:8388#My%20Node");
        let outbound = parse(1, &uri).unwrap();
        assert_eq!(outbound.host, "1.2.3.4");
        assert_eq!(outbound.port, 8388);
        assert_eq!(outbound.tag, "My_Node");
        assert_eq!(outbound.engine_config["settings"]["servers"][0]["method"], "aes-256-gcm");
    }

    #[test]
    fn parses_old_style_fully_encoded_ss_uri() {
        let encoded = URL_SAFE_NO_PAD.encode(b"aes-128-gcm:pw@5.6.7.8:1234");
        let uri = format!("ss://{encoded}#legacy");
        let outbound = parse(1, &uri).unwrap();
        assert_eq!(outbound.host, "5.6.7.8");
        assert_eq!(outbound.port, 1234);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse(1, "vmess://abc").is_err());
    }

    #[test]
    fn bad_line_carries_its_line_number() {
        let err = parse(7, "ss://not-base64-and-no-at-sign").unwrap_err();
        assert_eq!(err.line, 7);
    }
}

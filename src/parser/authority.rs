//! Shared vless/trojan authority parsing: `user@host:port?query#fragment`.
//!
//! `url::Url` rejects an authority whose host is an unbracketed IPv6 address
//! (RFC 3986 requires brackets), so this tries standard URL syntax first and
//! falls back to a manual rsplit on failure.

use std::collections::HashMap;

use crate::core::error::ProxyParsingError;

pub struct Authority {
    pub userinfo: String,
    pub host: String,
    pub port: u16,
    pub query: HashMap<String, String>,
    pub fragment: String,
}

pub fn parse_authority(
    line_no: usize,
    line: &str,
    prefix: &str,
) -> Result<Authority, ProxyParsingError> {
    if let Ok(url) = url::Url::parse(line) {
        if let Some(host) = url.host_str() {
            let port = url
                .port()
                .ok_or_else(|| ProxyParsingError::new(line_no, "missing port"))?;
            let query = url.query_pairs().into_owned().collect();
            let fragment = url
                .fragment()
                .map(|f| {
                    percent_encoding::percent_decode_str(f)
                        .decode_utf8_lossy()
                        .into_owned()
                })
                .unwrap_or_default();
            return Ok(Authority {
                userinfo: url.username().to_string(),
                host: host.to_string(),
                port,
                query,
                fragment,
            });
        }
    }

    // Manual fallback for unbracketed IPv6 authorities, e.g.
    // `vless://uuid@2001:db8::1:443?type=tcp#tag`.
    let body = line
        .strip_prefix(prefix)
        .ok_or_else(|| ProxyParsingError::new(line_no, "unrecognized scheme"))?;

    let (body, fragment) = match body.split_once('#') {
        Some((b, f)) => (
            b,
            percent_encoding::percent_decode_str(f)
                .decode_utf8_lossy()
                .into_owned(),
        ),
        None => (body, String::new()),
    };
    let (body, query_str) = match body.split_once('?') {
        Some((b, q)) => (b, q),
        None => (body, ""),
    };

    let (userinfo, hostport) = body
        .rsplit_once('@')
        .ok_or_else(|| ProxyParsingError::new(line_no, "missing userinfo"))?;
    let (host, port_str) = hostport
        .rsplit_once(':')
        .ok_or_else(|| ProxyParsingError::new(line_no, "missing port"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| ProxyParsingError::new(line_no, "invalid port"))?;

    let query = query_str
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            (
                k.to_string(),
                percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned(),
            )
        })
        .collect();

    Ok(Authority {
        userinfo: userinfo.to_string(),
        host: host.to_string(),
        port,
        query,
        fragment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_authority_via_url_crate() {
        let a = parse_authority(1, "vless://uuid@1.2.3.4:443?flow=xtls#tag", "vless://").unwrap();
        assert_eq!(a.host, "1.2.3.4");
        assert_eq!(a.port, 443);
        assert_eq!(a.query.get("flow").unwrap(), "xtls");
        assert_eq!(a.fragment, "tag");
    }

    #[test]
    fn falls_back_for_unbracketed_ipv6() {
        let a = parse_authority(1, "vless://uuid@2001:db8::1:443?type=tcp#v6", "vless://").unwrap();
        assert_eq!(a.host, "2001:db8::1");
        assert_eq!(a.port, 443);
        assert_eq!(a.query.get("type").unwrap(), "tcp");
        assert_eq!(a.fragment, "v6");
    }
}

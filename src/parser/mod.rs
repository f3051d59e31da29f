//! URI parser: turns heterogeneous proxy URIs into normalized `Outbound`s.
//!
//! Takes a block of text (one URI per line; lines starting with `#` or `//`
//! are comments) and parses each line independently. A single bad line
//! never aborts the rest of the batch.

pub mod authority;
pub mod ss;
pub mod stream_settings;
pub mod tag;
pub mod trojan;
pub mod vless;
pub mod vmess;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};

use crate::core::error::ProxyParsingError;
use crate::core::model::Outbound;

/// Heuristic base64 decode tolerant of standard/URL-safe alphabets and missing padding.
pub fn decode_base64_flexible(input: &str) -> Result<String, ()> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    for engine in [&URL_SAFE_NO_PAD, &URL_SAFE] as [&base64::engine::GeneralPurpose; 2] {
        if let Ok(bytes) = engine.decode(&clean) {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    if let Ok(bytes) = STANDARD.decode(&clean) {
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    // tolerate missing '=' padding on standard alphabet too
    let mut padded = clean.clone();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD
        .decode(&padded)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|_| ())
}

/// Noise markers commonly found in subscription-provider tags (ads, traffic
/// notices, expiry reminders). Not part of any protocol, but the Source
/// Loader uses these to drop entries that clearly aren't proxy nodes.
const NOISE_TAG_MARKERS: &[&str] = &[
    "expire", "过期", "剩余流量", "官网", "订阅", "流量", "更新", "客服", "广告", "群",
];

pub fn is_noise_tag(tag: &str) -> bool {
    NOISE_TAG_MARKERS.iter().any(|marker| tag.contains(marker))
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//")
}

/// Parses a batch, returning one result per line in input order. Failed
/// lines are left as errors for the caller to report however it likes.
pub fn parse_batch(text: &str) -> Vec<Result<Outbound, ProxyParsingError>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !is_comment_or_blank(line))
        .map(|(idx, line)| parse_line(idx + 1, line.trim()))
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Result<Outbound, ProxyParsingError> {
    let scheme = line
        .split_once("://")
        .map(|(s, _)| s)
        .ok_or_else(|| ProxyParsingError::new(line_no, "no scheme separator"))?;

    match scheme {
        "ss" => ss::parse(line_no, line),
        "vmess" => {
            let body = line.strip_prefix("vmess://").unwrap_or(line);
            vmess::parse(line_no, body)
        }
        "vless" => vless::parse(line_no, line),
        "trojan" => trojan::parse(line_no, line),
        other => Err(ProxyParsingError::new(line_no, format!("unsupported scheme: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# a comment\n\n// another comment\nss://invalid";
        let results = parse_batch(text);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn one_bad_line_does_not_abort_the_batch() {
        let text = "not-a-uri\nvless://uuid@1.2.3.4:443?type=tcp#ok";
        let results = parse_batch(text);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn is_noise_tag_flags_subscription_markers() {
        assert!(is_noise_tag("expire 2024-01-01"));
        assert!(is_noise_tag("官网 update"));
        assert!(!is_noise_tag("US Node 1"));
    }

    #[test]
    fn base64_flexible_tolerates_missing_padding() {
        let decoded = decode_base64_flexible("aGVsbG8").unwrap();
        assert_eq!(decoded, "hello");
    }
}

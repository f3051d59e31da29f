//! Tag sanitization: strip anything outside `[A-Za-z0-9._ -]`, collapse
//! whitespace to underscores, truncate to 48 chars, and fall back to the
//! protocol name when the result is empty.

const MAX_TAG_LEN: usize = 48;

pub fn sanitize_tag(raw: &str, fallback_scheme: &str) -> String {
    let stripped: String = raw
        .chars()
        .map(|c| {
            if c.is_whitespace() {
                ' '
            } else if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '\0'
            }
        })
        .filter(|&c| c != '\0')
        .collect();

    let collapsed = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    let truncated: String = collapsed.chars().take(MAX_TAG_LEN).collect();

    if truncated.is_empty() {
        fallback_scheme.to_string()
    } else {
        truncated
    }
}

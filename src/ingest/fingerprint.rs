use sha2::{Digest, Sha256};
use url::Url;

/// Stable identity for an entry across fetches and across feeds.
///
/// Prefers the feed-supplied guid; entries without one fall back to the
/// normalized link and title, so the same article syndicated by two feeds
/// (or re-served with a tracking fragment) resolves to one fingerprint.
pub fn fingerprint(guid: Option<&str>, url: Option<&str>, title: &str) -> String {
    if let Some(guid) = guid {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return hex_digest(trimmed.as_bytes());
        }
    }

    // Normalized title cannot contain '\n' (whitespace is collapsed to
    // single spaces), so the separator is unambiguous.
    let input = format!(
        "{}\n{}",
        url.map(normalize_url).unwrap_or_default(),
        normalize_title(title)
    );
    hex_digest(input.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("{:x}", hash)
}

/// Drop the fragment and any trailing slashes; unparseable input is used
/// as-is (trimmed) so the fingerprint stays deterministic either way.
fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

fn normalize_title(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

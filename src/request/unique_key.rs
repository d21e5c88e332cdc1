//! Request identity computation
//!
//! Deduplication of requests is driven by a canonical unique key: a
//! normalized form of the URL, optionally extended with the method and a
//! payload hash. Two requests with the same key are considered the same
//! request by the queue.

use log::warn;
use sha2::{Digest, Sha256};
use url::Url;

use super::Method;

/// Length of the payload hash prefix mixed into extended unique keys.
const PAYLOAD_HASH_LENGTH: usize = 8;

/// Compute the canonical unique key for a request.
///
/// The default key is the normalized URL, regardless of method. When
/// `use_extended_unique_key` is set, the method and a short hash of the
/// payload are mixed in so that requests differing only in method or payload
/// get distinct keys.
#[must_use]
pub fn compute_unique_key(
    url: &str,
    method: Method,
    payload: Option<&[u8]>,
    keep_url_fragment: bool,
    use_extended_unique_key: bool,
) -> String {
    let normalized_url = match normalize_url(url, keep_url_fragment) {
        Ok(normalized) => normalized,
        Err(e) => {
            warn!("Failed to normalize URL {url}: {e}");
            url.trim().to_string()
        }
    };

    if use_extended_unique_key {
        let payload_hash = match payload {
            Some(data) if !data.is_empty() => compute_short_hash(data),
            _ => String::new(),
        };
        return format!("{}({payload_hash}):{normalized_url}", method.as_str());
    }

    normalized_url
}

/// Normalize a URL so that functionally identical URLs compare equal.
///
/// Lowercases the whole URL, strips the trailing slash from the path, removes
/// `utm_*` tracking parameters, sorts the remaining query pairs by key and
/// drops the fragment unless `keep_url_fragment` is set.
pub fn normalize_url(url: &str, keep_url_fragment: bool) -> Result<String, url::ParseError> {
    let mut parsed = Url::parse(url.trim())?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        parsed.set_query(Some(&query));
    }

    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);

    if !keep_url_fragment {
        parsed.set_fragment(None);
    }

    Ok(parsed.to_string().to_lowercase())
}

/// Hexadecimal SHA-256 prefix of the given data.
#[must_use]
pub fn compute_short_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..PAYLOAD_HASH_LENGTH].to_string()
}

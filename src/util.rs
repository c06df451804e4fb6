use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;

use crate::error::{Error, Result};

/// Header name → value pairs supplied by the host for WebSocket and HTTP
/// requests.
pub type HeadersMap = HashMap<String, String>;

pub(crate) fn to_header_map(headers: &HeadersMap) -> Result<HeaderMap> {
    let mut result = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|err| Error::configuration(format!("invalid header name {name:?}: {err}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|err| Error::configuration(format!("invalid header value: {err}")))?;
        result.insert(name, value);
    }
    Ok(result)
}

fn rand_from(n: usize, charset: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

pub(crate) fn rand_string(n: usize) -> String {
    rand_from(n, b"abcdefghijklmnopqrstuvwxyz0123456789")
}

pub(crate) fn rand_digits(n: usize) -> String {
    rand_from(n, b"0123456789")
}

/// Via branch in the RFC 3261 magic-cookie form used by the Arlo backend.
pub(crate) fn gen_branch() -> String {
    format!("z9hG4bK{}", rand_digits(7))
}

/// The backend rejects offers carrying IPv6 (`:`) or mDNS (`.local`)
/// candidates.
pub(crate) fn is_valid_candidate(candidate: &str) -> bool {
    !candidate.contains(':') && !candidate.contains(".local")
}

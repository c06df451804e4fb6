//! RFC 2617 Digest proxy authentication as the Arlo SIP gateway speaks it:
//! MD5 only, `qop=auth` only.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

pub(crate) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

fn md5_chain(parts: &[&str]) -> String {
    md5_hex(parts.join(":").as_bytes())
}

/// Parameters of a `Digest …` challenge or authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub mode: String,
    pub params: HashMap<String, String>,
}

/// Split `k1=v1, k2="v2", …` on commas that are not inside quotes.
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

impl AuthHeader {
    /// Parse a `Proxy-Authenticate` / `WWW-Authenticate` value.
    pub fn parse(header: &str) -> Result<Self> {
        let rest = header
            .strip_prefix("Digest")
            .ok_or_else(|| Error::auth("unsupported header mode, expected Digest"))?;

        let mut params = HashMap::new();
        for kv in split_params(rest) {
            let kv = kv.trim();
            if kv.is_empty() {
                continue;
            }
            let (key, value) = kv
                .split_once('=')
                .ok_or_else(|| Error::auth(format!("could not parse header param {kv:?}")))?;
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            params.insert(key.trim().to_string(), value.to_string());
        }

        match params.get("algorithm").map(String::as_str) {
            Some("MD5") => {}
            other => {
                return Err(Error::auth(format!(
                    "unsupported digest algorithm {other:?}"
                )));
            }
        }

        Ok(Self {
            mode: "Digest".into(),
            params,
        })
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::auth(format!("no {key} found in auth header params")))
    }

    /// Compute and store the `response` parameter for `method` with the
    /// account password. All of `username`, `realm`, `uri`, `nonce`,
    /// `cnonce` and `nc` must already be filled in.
    pub fn update_response(&mut self, method: &str, password: &str) -> Result<()> {
        match self.params.get("algorithm").map(String::as_str) {
            Some("MD5") => {}
            other => {
                return Err(Error::auth(format!(
                    "cannot compute response digest with algorithm {other:?}"
                )));
            }
        }
        match self.params.get("qop").map(String::as_str) {
            Some("auth") => {}
            other => {
                return Err(Error::auth(format!(
                    "cannot compute response digest with qop {other:?}"
                )));
            }
        }

        let ha1 = md5_chain(&[self.require("username")?, self.require("realm")?, password]);
        let ha2 = md5_chain(&[method, self.require("uri")?]);
        let response = md5_chain(&[
            &ha1,
            self.require("nonce")?,
            self.require("nc")?,
            self.require("cnonce")?,
            self.require("qop")?,
            &ha2,
        ]);
        self.params.insert("response".into(), response);
        Ok(())
    }
}

impl fmt::Display for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(key, value)| match key.as_str() {
                "algorithm" | "qop" | "nc" => format!("{key}={value}"),
                _ => format!("{key}=\"{value}\""),
            })
            .collect();
        write!(f, "{} {}", self.mode, params.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = "Digest realm=\"arlo\", nonce=\"abc\", qop=\"auth\", algorithm=MD5";

    #[test]
    fn parses_quoted_and_bare_values() {
        let header = AuthHeader::parse(CHALLENGE).unwrap();
        assert_eq!(header.mode, "Digest");
        assert_eq!(header.params["realm"], "arlo");
        assert_eq!(header.params["nonce"], "abc");
        assert_eq!(header.params["qop"], "auth");
        assert_eq!(header.params["algorithm"], "MD5");
    }

    #[test]
    fn rejects_non_digest_and_non_md5() {
        assert!(AuthHeader::parse("Basic realm=\"x\"").is_err());
        assert!(AuthHeader::parse("Digest realm=\"x\", algorithm=SHA-256").is_err());
        assert!(AuthHeader::parse("Digest realm=\"x\"").is_err());
    }

    #[test]
    fn display_round_trips() {
        let mut header = AuthHeader::parse(CHALLENGE).unwrap();
        header.params.insert("username".into(), "4321".into());
        header.params.insert("nc".into(), "00000001".into());
        let reparsed = AuthHeader::parse(&header.to_string()).unwrap();
        assert_eq!(reparsed, header);
    }

    #[test]
    fn quoting_rules_per_parameter() {
        let header = AuthHeader {
            mode: "Digest".into(),
            params: HashMap::from([
                ("algorithm".to_string(), "MD5".to_string()),
                ("qop".to_string(), "auth".to_string()),
                ("nc".to_string(), "00000001".to_string()),
                ("realm".to_string(), "arlo".to_string()),
            ]),
        };
        let serialized = header.to_string();
        assert!(serialized.contains("algorithm=MD5"));
        assert!(serialized.contains("qop=auth"));
        assert!(serialized.contains("nc=00000001"));
        assert!(serialized.contains("realm=\"arlo\""));
        assert!(!serialized.contains("algorithm=\"MD5\""));
    }

    #[test]
    fn response_digest_matches_rfc2617_chain() {
        let mut header = AuthHeader::parse(CHALLENGE).unwrap();
        header.params.insert("username".into(), "1234".into());
        header
            .params
            .insert("uri".into(), "sip:callee@example.arlo".into());
        header.params.insert("cnonce".into(), "deadbeef0123".into());
        header.params.insert("nc".into(), "00000001".into());
        header.update_response("INVITE", "hunter2").unwrap();

        let ha1 = md5_hex(b"1234:arlo:hunter2");
        let ha2 = md5_hex(b"INVITE:sip:callee@example.arlo");
        let expected = md5_hex(format!("{ha1}:abc:00000001:deadbeef0123:auth:{ha2}").as_bytes());
        assert_eq!(header.params["response"], expected);
    }

    #[test]
    fn missing_params_are_reported() {
        let mut header = AuthHeader::parse(CHALLENGE).unwrap();
        let err = header.update_response("INVITE", "pw").unwrap_err();
        assert!(err.to_string().contains("username"));
    }
}

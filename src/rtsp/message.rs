//! Minimal RTSP/1.0 message codec.
//!
//! Both the camera-local proxy and the republisher need to read, edit and
//! re-emit RTSP messages without disturbing anything they do not touch, so
//! headers keep their original order and spelling and lookups are
//! case-insensitive.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtspParseError {
    /// The bytes are not an RTSP message (e.g. `$`-interleaved RTP/RTCP);
    /// callers forward them untouched.
    #[error("not an RTSP packet")]
    NotRtsp,

    #[error("malformed RTSP message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

fn split_head(input: &str) -> (&str, &str) {
    if let Some(pos) = input.find("\r\n\r\n") {
        (&input[..pos], &input[pos + 4..])
    } else if let Some(pos) = input.find("\n\n") {
        (&input[..pos], &input[pos + 2..])
    } else {
        (input, "")
    }
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Vec<(String, String)>, RtspParseError> {
    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspParseError::Malformed(format!("header line {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn take_body(headers: &[(String, String)], rest: &str) -> String {
    let declared = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());
    match declared {
        Some(len) if len <= rest.len() => rest[..len].to_string(),
        _ => rest.to_string(),
    }
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn header_set(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers
        .iter_mut()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

fn header_rename(headers: &mut [(String, String)], from_exact: &str, to: &str) {
    for (name, _) in headers.iter_mut() {
        if name == from_exact {
            *name = to.to_string();
        }
    }
}

fn write_headers(f: &mut fmt::Formatter<'_>, headers: &[(String, String)]) -> fmt::Result {
    for (name, value) in headers {
        write!(f, "{name}: {value}\r\n")?;
    }
    Ok(())
}

impl RtspRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: "RTSP/1.0".into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn parse(input: &[u8]) -> Result<Self, RtspParseError> {
        let text = std::str::from_utf8(input)
            .map_err(|_| RtspParseError::Malformed("request is not UTF-8".into()))?;
        let (head, rest) = split_head(text);
        let mut lines = head.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| RtspParseError::Malformed("empty request".into()))?
            .trim_end_matches('\r');

        let mut tokens = request_line.split_whitespace();
        let (method, uri, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(uri), Some(version)) if version.starts_with("RTSP/") => {
                (method, uri, version)
            }
            _ => {
                return Err(RtspParseError::Malformed(format!(
                    "request line {request_line:?}"
                )));
            }
        };

        let headers = parse_headers(lines)?;
        let body = take_body(&headers, rest);
        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        header_set(&mut self.headers, name, value.into());
    }

    /// Rename headers whose spelling matches `from_exact` byte-for-byte.
    pub fn rename_header(&mut self, from_exact: &str, to: &str) {
        header_rename(&mut self.headers, from_exact, to);
    }
}

impl fmt::Display for RtspRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers(f, &self.headers)?;
        write!(f, "\r\n{}", self.body)
    }
}

impl RtspResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "RTSP/1.0".into(),
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn parse(input: &[u8]) -> Result<Self, RtspParseError> {
        let text = std::str::from_utf8(input).map_err(|_| RtspParseError::NotRtsp)?;
        if !text.starts_with("RTSP/") {
            return Err(RtspParseError::NotRtsp);
        }

        let (head, rest) = split_head(text);
        let mut lines = head.lines();
        let status_line = lines
            .next()
            .ok_or(RtspParseError::NotRtsp)?
            .trim_end_matches('\r');

        let mut tokens = status_line.splitn(3, ' ');
        let version = tokens.next().unwrap_or_default();
        let status = tokens
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| RtspParseError::Malformed(format!("status line {status_line:?}")))?;
        let reason = tokens.next().unwrap_or_default();

        let headers = parse_headers(lines)?;
        let body = take_body(&headers, rest);
        Ok(Self {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        header_set(&mut self.headers, name, value.into());
    }

    pub fn rename_header(&mut self, from_exact: &str, to: &str) {
        header_rename(&mut self.headers, from_exact, to);
    }
}

impl fmt::Display for RtspResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status, self.reason)?;
        write_headers(f, &self.headers)?;
        write!(f, "\r\n{}", self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_headers_and_body() {
        let raw = b"DESCRIBE rtsp://localhost:8554/cam RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n";
        let request = RtspRequest::parse(raw).unwrap();
        assert_eq!(request.method, "DESCRIBE");
        assert_eq!(request.uri, "rtsp://localhost:8554/cam");
        assert_eq!(request.header("cseq"), Some("2"));
        assert_eq!(request.header("CSEQ"), Some("2"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn parses_response_and_respects_content_length() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 4\r\n\r\nv=0\ngarbage";
        let response = RtspResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.body, "v=0\n");
    }

    #[test]
    fn interleaved_bytes_are_not_rtsp() {
        let frame = [b'$', 0, 0, 12, 0x80, 0x60, 0, 1];
        assert_eq!(RtspResponse::parse(&frame), Err(RtspParseError::NotRtsp));
    }

    #[test]
    fn malformed_request_is_an_error() {
        assert!(matches!(
            RtspRequest::parse(b"garbage\r\n\r\n"),
            Err(RtspParseError::Malformed(_))
        ));
    }

    #[test]
    fn serialization_round_trips_header_spelling() {
        let raw = b"RTSP/1.0 200 OK\r\nCseq: 4\r\nRtp-Info: url=trackID=0\r\n\r\n";
        let mut response = RtspResponse::parse(raw).unwrap();
        assert!(response.to_string().contains("Cseq: 4"));

        response.rename_header("Cseq", "CSeq");
        response.rename_header("Rtp-Info", "RTP-Info");
        let text = response.to_string();
        assert!(text.contains("CSeq: 4"));
        assert!(text.contains("RTP-Info: url=trackID=0"));
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut request = RtspRequest::new("DESCRIBE", "rtsp://cam/live");
        request.set_header("Nonce", "42");
        request.set_header("nonce", "43");
        assert_eq!(request.header("Nonce"), Some("43"));
        assert_eq!(
            request.to_string().matches("once:").count(),
            1,
            "replaced in place, not appended"
        );
    }
}

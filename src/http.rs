//! Single-shot HTTP GET used by hosts to fetch STUN/TURN/SIP credentials
//! from the Arlo cloud with a fixed set of session headers.

use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::util::{to_header_map, HeadersMap};

pub struct HttpClient {
    headers: HeadersMap,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(headers: HeadersMap) -> Result<Self> {
        let client = reqwest::Client::builder().use_rustls_tls().build()?;
        Ok(Self { headers, client })
    }

    /// GET `url` with the configured headers; anything but 200 is an error.
    pub async fn get(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .headers(to_header_map(&self.headers)?)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Error::protocol(format!(
                "unexpected status code from request: {}",
                response.status().as_u16()
            )));
        }

        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf).await;
            let response = format!(
                "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = conn.write_all(response.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn get_returns_body_on_200() {
        let port = serve_once("HTTP/1.1 200 OK", "{\"ok\":true}").await;
        let mut headers = HeadersMap::new();
        headers.insert("X-Session".into(), "abc".into());
        let client = HttpClient::new(headers).unwrap();
        let body = client
            .get(&format!("http://127.0.0.1:{port}/creds"))
            .await
            .unwrap();
        assert_eq!(body, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn get_rejects_non_200() {
        let port = serve_once("HTTP/1.1 403 Forbidden", "").await;
        let client = HttpClient::new(HeadersMap::new()).unwrap();
        let err = client
            .get(&format!("http://127.0.0.1:{port}/creds"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}

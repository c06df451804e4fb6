//! Long-lived Server-Sent-Events consumer with a pull-style API.
//!
//! The Arlo cloud pushes device events over `text/event-stream`; hosts call
//! [`SseClient::next`] to pull the data field of each event. The connection
//! is re-created with the original headers whenever it drops, until
//! [`SseClient::close`] cancels the run loop.

use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::util::{to_header_map, HeadersMap};

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Incremental `text/event-stream` decoder. Feeding bytes yields the data
/// payloads of any events completed by those bytes.
#[derive(Default)]
pub(crate) struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                // Blank line dispatches the accumulated event.
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments, ids and event names are irrelevant to the Arlo feed.
        }
        events
    }
}

pub struct SseClient {
    id: String,
    url: String,
    headers: HeadersMap,
    client: reqwest::Client,
    events: Mutex<UnboundedReceiver<String>>,
    sender: Mutex<Option<UnboundedSender<String>>>,
    cancel: CancellationToken,
}

impl SseClient {
    pub fn new(url: impl Into<String>, headers: HeadersMap) -> Result<Self> {
        let client = reqwest::Client::builder().use_rustls_tls().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            headers,
            client,
            events: Mutex::new(rx),
            sender: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the run loop. Events become available through [`next`].
    ///
    /// [`next`]: SseClient::next
    pub async fn start(&self) -> Result<()> {
        let tx = self
            .sender
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::error::Error::configuration("sse client already started"))?;
        let header_map = to_header_map(&self.headers)?;

        let id = self.id.clone();
        let url = self.url.clone();
        let client = self.client.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            'run: loop {
                info!(id = %id, url = %url, "sse client connecting");
                let response = tokio::select! {
                    _ = cancel.cancelled() => break 'run,
                    result = client.get(&url).headers(header_map.clone()).send() => result,
                };

                match response {
                    Ok(response) => {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        if !content_type.starts_with("text/event-stream") {
                            warn!(id = %id, content_type, "unexpected sse content type");
                        } else {
                            let mut stream = response.bytes_stream();
                            let mut decoder = SseDecoder::default();
                            loop {
                                let chunk = tokio::select! {
                                    _ = cancel.cancelled() => break 'run,
                                    chunk = stream.next() => chunk,
                                };
                                let chunk = match chunk {
                                    Some(Ok(chunk)) => chunk,
                                    Some(Err(err)) => {
                                        warn!(id = %id, error = %err, "sse stream error");
                                        break;
                                    }
                                    None => {
                                        debug!(id = %id, "sse stream ended");
                                        break;
                                    }
                                };
                                for data in decoder.feed(&chunk) {
                                    if cancel.is_cancelled() {
                                        break 'run;
                                    }
                                    if tx.send(data).is_err() {
                                        break 'run;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => warn!(id = %id, error = %err, "sse connect failed"),
                }

                if cancel.is_cancelled() {
                    break;
                }
                info!(id = %id, "sse client restarting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            info!(id = %id, "sse client exited");
            // tx drops here, closing the channel so next() observes the end
            // of the stream.
        });

        Ok(())
    }

    /// Pull the next event's data field; `None` once the client has shut
    /// down and all buffered events were consumed.
    pub async fn next(&self) -> Option<String> {
        self.events.lock().await.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn decoder_handles_split_and_multiline_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\n").is_empty());
        assert_eq!(decoder.feed(b"\n"), vec!["hello".to_string()]);

        let events = decoder.feed(b": comment\ndata: a\ndata: b\n\nretry: 5\n\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn decoder_accepts_crlf() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b"data: x\r\n\r\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn delivers_events_and_closes_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf).await;
            conn.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: hello\n\n",
            )
            .await
            .unwrap();
            // Hold the connection open until the client cancels.
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });

        let client = SseClient::new(
            format!("http://127.0.0.1:{port}/events"),
            HeadersMap::new(),
        )
        .unwrap();
        client.start().await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("event before timeout");
        assert_eq!(event.as_deref(), Some("hello"));

        client.close();
        let end = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("stream end before timeout");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let client = SseClient::new("http://127.0.0.1:9/events", HeadersMap::new()).unwrap();
        client.start().await.unwrap();
        assert!(client.start().await.is_err());
        client.close();
    }
}

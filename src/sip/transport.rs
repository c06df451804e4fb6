//! Signaling transport seam.
//!
//! The dialog FSM only needs ordered text frames; production traffic rides a
//! `sip`-subprotocol WebSocket, tests script the exchange in memory.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderValue, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::SipInfo;
use crate::error::{Error, Result};
use crate::util::to_header_map;

#[async_trait]
pub trait SignalingTransport: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    async fn recv(&mut self) -> Result<String>;
    async fn close(&mut self) -> Result<()>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport carrying serialized SIP messages.
pub struct WsSignaling {
    stream: WsStream,
}

impl WsSignaling {
    pub async fn connect(info: &SipInfo) -> Result<Self> {
        let mut request = info.websocket_uri.as_str().into_client_request()?;
        {
            let headers = request.headers_mut();
            for (name, value) in to_header_map(&info.websocket_headers)?.iter() {
                headers.insert(name.clone(), value.clone());
            }
            headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("sip"));
            if !info.websocket_origin.is_empty() {
                let origin = HeaderValue::try_from(info.websocket_origin.as_str())
                    .map_err(|err| Error::configuration(format!("invalid origin: {err}")))?;
                headers.insert(ORIGIN, origin);
            }
        }

        let (stream, response) = connect_async(request).await?;
        debug!(status = %response.status(), "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map_err(|_| Error::protocol("binary frame is not UTF-8"));
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    return Err(Error::RemoteClosed);
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(Error::RemoteClosed),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // AlreadyClosed is the expected outcome when the peer hung up first.
        match self.stream.close(None).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed)
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

//! Camera-local streaming proxy.
//!
//! Accepts a single plaintext RTSP client on an ephemeral loopback port and
//! relays it to the base station's TLS endpoint on :554, fixing up the three
//! things the two ends disagree on: URL authority, header casing, and the
//! Arlo `Nonce` request counter.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rtsp::message::{RtspParseError, RtspRequest, RtspResponse};
use crate::tls::insecure_client_config;

const CLIENT_BUFFER_LEN: usize = 4096;
const BACKEND_BUFFER_LEN: usize = 40960;
const BACKEND_TLS_PORT: u16 = 554;

pub struct LocalStreamProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    basestation_hostname: String,
    basestation_ip: String,
    connector: TlsConnector,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// State shared by the two relay pumps of one proxied connection.
struct RelayState {
    basestation_hostname: String,
    listener_port: u16,
    /// Arlo's per-session request counter: captured from backend replies,
    /// incremented on every outbound client request.
    nonce: AtomicU64,
}

impl LocalStreamProxy {
    pub fn new(
        basestation_hostname: impl Into<String>,
        basestation_ip: impl Into<String>,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<Self> {
        let config = insecure_client_config(cert_pem, key_pem)?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                basestation_hostname: basestation_hostname.into(),
                basestation_ip: basestation_ip.into(),
                connector: TlsConnector::from(config),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind the loopback listener and return its port. A single client
    /// connection is accepted; the proxy ends with it.
    pub async fn start(&self) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        info!(port, "local stream proxy listening");

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let client = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((client, _)) => client,
                    Err(err) => {
                        info!(error = %err, "error accepting connection");
                        return;
                    }
                },
            };

            if let Err(err) = handle_client(&inner, client, port).await {
                info!(error = %err, "local stream proxy session ended");
            }
        });
        self.inner.tasks.lock().await.push(task);

        Ok(port)
    }

    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

async fn handle_client(inner: &ProxyInner, client: TcpStream, listener_port: u16) -> Result<()> {
    let backend =
        TcpStream::connect((inner.basestation_ip.as_str(), BACKEND_TLS_PORT)).await?;

    let server_name = match inner.basestation_ip.parse::<IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip),
        Err(_) => ServerName::try_from(inner.basestation_ip.as_str())
            .map_err(|err| Error::tls(format!("invalid backend name: {err}")))?,
    };
    let backend = inner.connector.connect(server_name, backend).await?;

    info!(
        backend = %format!("{}:{}", inner.basestation_ip, BACKEND_TLS_PORT),
        "proxying local stream"
    );

    let state = RelayState {
        basestation_hostname: inner.basestation_hostname.clone(),
        listener_port,
        nonce: AtomicU64::new(0),
    };

    let (backend_read, backend_write) = tokio::io::split(backend);
    let (client_read, client_write) = client.into_split();

    // Either direction failing tears the whole session down; dropping the
    // halves on return closes both sockets.
    tokio::select! {
        _ = relay_backend_to_client(backend_read, client_write, &state) => {}
        _ = relay_client_to_backend(client_read, backend_write, &state) => {}
        _ = inner.shutdown.cancelled() => {}
    }

    Ok(())
}

async fn relay_backend_to_client<R, W>(mut backend: R, mut client: W, state: &RelayState)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BACKEND_BUFFER_LEN];
    loop {
        let n = match backend.read(&mut buffer).await {
            Ok(0) => {
                debug!("backend closed the stream");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                info!(error = %err, "error reading from backend");
                break;
            }
        };

        if n == BACKEND_BUFFER_LEN {
            warn!("local stream buffer may be too small");
        }

        let mut response = match RtspResponse::parse(&buffer[..n]) {
            Ok(response) => response,
            Err(RtspParseError::NotRtsp) => {
                // Interleaved RTP/RTCP: pass through untouched.
                if let Err(err) = client.write_all(&buffer[..n]).await {
                    info!(error = %err, "error writing to client");
                    break;
                }
                continue;
            }
            Err(err) => {
                info!(error = %err, "error parsing rtsp response");
                break;
            }
        };

        if let Some(value) = response.header("Nonce") {
            match value.trim().parse::<u64>() {
                Ok(nonce) => state.nonce.store(nonce, Ordering::SeqCst),
                Err(err) => {
                    info!(error = %err, "error parsing nonce");
                    break;
                }
            }
        }

        // The camera emits nonstandard casing the client rejects.
        response.rename_header("Cseq", "CSeq");
        response.rename_header("Rtp-Info", "RTP-Info");

        let text = response.to_string();
        debug!(message = %text, "incoming rtsp");
        if let Err(err) = client.write_all(text.as_bytes()).await {
            info!(error = %err, "error writing to client");
            break;
        }
    }
}

async fn relay_client_to_backend<R, W>(mut client: R, mut backend: W, state: &RelayState)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CLIENT_BUFFER_LEN];
    loop {
        let n = match client.read(&mut buffer).await {
            Ok(0) => {
                debug!("client closed the stream");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                info!(error = %err, "error reading from client");
                break;
            }
        };

        let mut request = match RtspRequest::parse(&buffer[..n]) {
            Ok(request) => request,
            Err(err) => {
                info!(error = %err, "error parsing rtsp request");
                break;
            }
        };

        if state.nonce.load(Ordering::SeqCst) != 0 {
            let next = state.nonce.fetch_add(1, Ordering::SeqCst) + 1;
            request.set_header("Nonce", next.to_string());
        }

        request.rename_header("Cseq", "CSeq");

        let text = request.to_string().replace(
            &format!("rtsp://localhost:{}", state.listener_port),
            &format!("rtsp://{}", state.basestation_hostname),
        );
        debug!(message = %text, "outgoing rtsp");
        if let Err(err) = backend.write_all(text.as_bytes()).await {
            info!(error = %err, "error writing to backend");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn state() -> Arc<RelayState> {
        Arc::new(RelayState {
            basestation_hostname: "basestation.arlo".into(),
            listener_port: 8554,
            nonce: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn nonce_propagates_from_backend_to_client_requests() {
        let state = state();

        // Backend -> client leg captures the nonce.
        let (mut backend_side, backend_read) = duplex(4096);
        let (client_write, mut client_side) = duplex(4096);
        let pump_state = state.clone();
        let down = tokio::spawn(async move {
            relay_backend_to_client(backend_read, client_write, &pump_state).await;
        });

        backend_side
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nNonce: 42\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client_side.read(&mut buf).await.unwrap();
        let forwarded = String::from_utf8_lossy(&buf[..n]);
        assert!(forwarded.contains("Nonce: 42"));
        assert_eq!(state.nonce.load(Ordering::SeqCst), 42);

        // Client -> backend leg stamps nonce+1 and rewrites the authority.
        let (mut client_in, client_read) = duplex(4096);
        let (backend_write, mut backend_out) = duplex(4096);
        let pump_state = state.clone();
        let up = tokio::spawn(async move {
            relay_client_to_backend(client_read, backend_write, &pump_state).await;
        });

        client_in
            .write_all(b"DESCRIBE rtsp://localhost:8554/foo RTSP/1.0\r\nCseq: 4\r\n\r\n")
            .await
            .unwrap();

        let n = backend_out.read(&mut buf).await.unwrap();
        let forwarded = String::from_utf8_lossy(&buf[..n]);
        assert!(forwarded.starts_with("DESCRIBE rtsp://basestation.arlo/foo RTSP/1.0\r\n"));
        assert!(forwarded.contains("CSeq: 4"));
        assert!(!forwarded.contains("Cseq:"));
        assert!(forwarded.contains("Nonce: 43"));
        assert_eq!(state.nonce.load(Ordering::SeqCst), 43);

        drop(backend_side);
        drop(client_in);
        down.await.unwrap();
        up.await.unwrap();
    }

    #[tokio::test]
    async fn requests_without_prior_nonce_are_not_stamped() {
        let state = state();
        let (mut client_in, client_read) = duplex(4096);
        let (backend_write, mut backend_out) = duplex(4096);
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            relay_client_to_backend(client_read, backend_write, &pump_state).await;
        });

        client_in
            .write_all(b"OPTIONS rtsp://localhost:8554/foo RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = backend_out.read(&mut buf).await.unwrap();
        let forwarded = String::from_utf8_lossy(&buf[..n]);
        assert!(!forwarded.contains("Nonce"));

        drop(client_in);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_frames_pass_through_verbatim() {
        let state = state();
        let (mut backend_side, backend_read) = duplex(4096);
        let (client_write, mut client_side) = duplex(4096);
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            relay_backend_to_client(backend_read, client_write, &pump_state).await;
        });

        let frame = [b'$', 0, 0, 4, 0xde, 0xad, 0xbe, 0xef];
        backend_side.write_all(&frame).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = client_side.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &frame);

        drop(backend_side);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn rtp_info_casing_is_normalized() {
        let state = state();
        let (mut backend_side, backend_read) = duplex(4096);
        let (client_write, mut client_side) = duplex(4096);
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            relay_backend_to_client(backend_read, client_write, &pump_state).await;
        });

        backend_side
            .write_all(b"RTSP/1.0 200 OK\r\nCseq: 5\r\nRtp-Info: url=trackID=0\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = client_side.read(&mut buf).await.unwrap();
        let forwarded = String::from_utf8_lossy(&buf[..n]);
        assert!(forwarded.contains("CSeq: 5"));
        assert!(forwarded.contains("RTP-Info: url=trackID=0"));

        drop(backend_side);
        pump.await.unwrap();
    }
}

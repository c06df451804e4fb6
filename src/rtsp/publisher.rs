//! On-demand RTSP republisher.
//!
//! Two outside processes (typically ffmpeg) push Opus and H.264 RTP onto the
//! publisher's loopback UDP ports; RTSP clients on `localhost:<rtsp_port>`
//! get the pair back as a single session with one audio and one video track.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::rtp;
use webrtc::util::Unmarshal;

use crate::error::Result;
use crate::rtsp::message::{RtspRequest, RtspResponse};
use crate::util::rand_digits;
use crate::webrtc::UDP_PACKET_SIZE;

const AUDIO_CONTROL: &str = "trackID=0";
const VIDEO_CONTROL: &str = "trackID=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn label(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio:opus",
            TrackKind::Video => "video:h264",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Subscriber {
    audio: Option<SocketAddr>,
    video: Option<SocketAddr>,
    playing: bool,
}

struct StreamState {
    sdp: String,
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

pub struct RtspPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    requested_port: u16,
    rtsp_port: AtomicU16,
    audio_port: AtomicU16,
    video_port: AtomicU16,
    stream: RwLock<Option<Arc<StreamState>>>,
    start_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtspPublisher {
    /// `rtsp_port` 0 picks an ephemeral port, available from
    /// [`rtsp_port`](Self::rtsp_port) after `start`.
    pub fn new(rtsp_port: u16) -> Self {
        let (start_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PublisherInner {
                requested_port: rtsp_port,
                rtsp_port: AtomicU16::new(0),
                audio_port: AtomicU16::new(0),
                video_port: AtomicU16::new(0),
                stream: RwLock::new(None),
                start_tx,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let audio_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let video_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let audio_port = audio_socket.local_addr()?.port();
        let video_port = video_socket.local_addr()?.port();
        self.inner.audio_port.store(audio_port, Ordering::SeqCst);
        self.inner.video_port.store(video_port, Ordering::SeqCst);

        let listener = TcpListener::bind(("localhost", self.inner.requested_port)).await?;
        let rtsp_port = listener.local_addr()?.port();
        self.inner.rtsp_port.store(rtsp_port, Ordering::SeqCst);

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(spawn_accept_loop(self.inner.clone(), listener));
        tasks.push(spawn_ingress_pump(
            self.inner.clone(),
            TrackKind::Audio,
            audio_socket,
        ));
        tasks.push(spawn_ingress_pump(
            self.inner.clone(),
            TrackKind::Video,
            video_socket,
        ));
        drop(tasks);

        let stream = Arc::new(StreamState {
            sdp: session_sdp(),
            subscribers: RwLock::new(HashMap::new()),
        });
        *self.inner.stream.write().await = Some(stream);

        // Barrier: the ingress pumps only start reading once the stream is
        // in place.
        let _ = self.inner.start_tx.send(true);

        info!(
            rtsp_port,
            audio_port, video_port, "rtsp republisher started"
        );
        Ok(())
    }

    pub fn rtsp_port(&self) -> u16 {
        self.inner.rtsp_port.load(Ordering::SeqCst)
    }

    /// UDP port expecting Opus RTP.
    pub fn audio_port(&self) -> u16 {
        self.inner.audio_port.load(Ordering::SeqCst)
    }

    /// UDP port expecting H.264 RTP.
    pub fn video_port(&self) -> u16 {
        self.inner.video_port.load(Ordering::SeqCst)
    }

    /// Idempotent. The ingress pumps (and their sockets) are stopped before
    /// the stream state goes away, so a datagram racing shutdown is dropped
    /// instead of hitting a closed stream.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        *self.inner.stream.write().await = None;
    }
}

fn session_sdp() -> String {
    [
        "v=0",
        "o=- 0 0 IN IP4 127.0.0.1",
        "s=arlo-rtc",
        "t=0 0",
        "m=audio 0 RTP/AVP 96",
        "a=rtpmap:96 opus/48000/2",
        "a=control:trackID=0",
        "m=video 0 RTP/AVP 97",
        "a=rtpmap:97 H264/90000",
        "a=fmtp:97 packetization-mode=1",
        "a=control:trackID=1",
        "",
    ]
    .join("\r\n")
}

fn spawn_accept_loop(inner: Arc<PublisherInner>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!(%peer, "rtsp client connected");
                        conn
                    }
                    Err(err) => {
                        warn!(error = %err, "rtsp accept error");
                        continue;
                    }
                },
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(&inner, conn).await {
                    debug!(error = %err, "rtsp client session ended");
                }
            });
        }
    })
}

fn spawn_ingress_pump(
    inner: Arc<PublisherInner>,
    kind: TrackKind,
    socket: UdpSocket,
) -> JoinHandle<()> {
    let mut started = inner.start_tx.subscribe();
    tokio::spawn(async move {
        // Wait for the start barrier so datagrams never race the stream
        // installation.
        while !*started.borrow() {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                changed = started.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        info!(
            kind = kind.label(),
            port = socket.local_addr().map(|a| a.port()).unwrap_or(0),
            "rtp listener ready"
        );

        let mut buffer = vec![0u8; UDP_PACKET_SIZE];
        loop {
            let n = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((n, _)) => n,
                    Err(err) => {
                        debug!(kind = kind.label(), error = %err, "rtp listener closed");
                        return;
                    }
                },
            };

            let mut raw = &buffer[..n];
            if let Err(err) = rtp::packet::Packet::unmarshal(&mut raw) {
                warn!(kind = kind.label(), error = %err, "error unmarshaling rtp packet");
                continue;
            }

            let stream = inner.stream.read().await.clone();
            let Some(stream) = stream else {
                continue;
            };

            let subscribers = stream.subscribers.read().await;
            for subscriber in subscribers.values() {
                if !subscriber.playing {
                    continue;
                }
                let target = match kind {
                    TrackKind::Audio => subscriber.audio,
                    TrackKind::Video => subscriber.video,
                };
                if let Some(target) = target {
                    if let Err(err) = socket.send_to(&buffer[..n], target).await {
                        debug!(kind = kind.label(), %target, error = %err, "rtp forward failed");
                    }
                }
            }
        }
    })
}

async fn serve_connection(inner: &PublisherInner, mut conn: TcpStream) -> Result<()> {
    let peer_ip = conn.peer_addr()?.ip();
    let mut session: Option<String> = None;
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = vec![0u8; 4096];

    'serve: loop {
        let n = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            read = conn.read(&mut buffer) => read?,
        };
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buffer[..n]);

        while let Some(raw) = next_message(&mut pending) {
            let request = match RtspRequest::parse(&raw) {
                Ok(request) => request,
                Err(err) => {
                    debug!(error = %err, "dropping unparseable rtsp request");
                    continue;
                }
            };

            let (response, teardown) =
                process_request(inner, peer_ip, &mut session, &request).await;
            conn.write_all(response.to_string().as_bytes()).await?;
            if teardown {
                break 'serve;
            }
        }
    }

    // Forget this client's subscription when the connection goes away.
    if let Some(session_id) = session {
        if let Some(stream) = inner.stream.read().await.clone() {
            stream.subscribers.write().await.remove(&session_id);
        }
    }
    Ok(())
}

/// Pop the next complete RTSP message (or skip an interleaved frame) from
/// the accumulation buffer.
fn next_message(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if pending.first() == Some(&b'$') {
            // Interleaved binary frame: 4-byte header carries the length.
            if pending.len() < 4 {
                return None;
            }
            let len = u16::from_be_bytes([pending[2], pending[3]]) as usize;
            if pending.len() < 4 + len {
                return None;
            }
            pending.drain(..4 + len);
            continue;
        }

        let pos = pending
            .windows(4)
            .position(|window| window == b"\r\n\r\n")?;
        let message: Vec<u8> = pending.drain(..pos + 4).collect();
        return Some(message);
    }
}

async fn process_request(
    inner: &PublisherInner,
    peer_ip: IpAddr,
    session: &mut Option<String>,
    request: &RtspRequest,
) -> (RtspResponse, bool) {
    let cseq = request.header("CSeq").unwrap_or("0").to_string();
    let stream = inner.stream.read().await.clone();

    let mut teardown = false;
    let mut response = match request.method.as_str() {
        "OPTIONS" => {
            let mut response = RtspResponse::new(200, "OK");
            response.set_header("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN");
            response
        }
        "DESCRIBE" => match stream {
            None => RtspResponse::new(404, "Not Found"),
            Some(stream) => {
                let mut response = RtspResponse::new(200, "OK");
                response.set_header("Content-Type", "application/sdp");
                response.set_header("Content-Base", request.uri.clone());
                response.set_header("Content-Length", stream.sdp.len().to_string());
                response.body = stream.sdp.clone();
                response
            }
        },
        "SETUP" => match stream {
            None => RtspResponse::new(404, "Not Found"),
            Some(stream) => setup_track(stream, peer_ip, session, request).await,
        },
        "PLAY" => {
            if let (Some(stream), Some(session_id)) = (stream, session.as_ref()) {
                if let Some(subscriber) =
                    stream.subscribers.write().await.get_mut(session_id)
                {
                    subscriber.playing = true;
                }
            }
            let mut response = RtspResponse::new(200, "OK");
            if let Some(session_id) = session.as_ref() {
                response.set_header("Session", session_id.clone());
            }
            response
        }
        "TEARDOWN" => {
            if let Some(session_id) = session.take() {
                if let Some(stream) = inner.stream.read().await.clone() {
                    stream.subscribers.write().await.remove(&session_id);
                }
            }
            teardown = true;
            RtspResponse::new(200, "OK")
        }
        _ => RtspResponse::new(405, "Method Not Allowed"),
    };

    response.set_header("CSeq", cseq);
    (response, teardown)
}

async fn setup_track(
    stream: Arc<StreamState>,
    peer_ip: IpAddr,
    session: &mut Option<String>,
    request: &RtspRequest,
) -> RtspResponse {
    let kind = if request.uri.contains(VIDEO_CONTROL) {
        TrackKind::Video
    } else if request.uri.contains(AUDIO_CONTROL) {
        TrackKind::Audio
    } else {
        return RtspResponse::new(404, "Not Found");
    };

    let transport = request.header("Transport").unwrap_or_default();
    let Some(client_port) = parse_client_port(transport) else {
        return RtspResponse::new(400, "Bad Request");
    };

    let session_id = session.get_or_insert_with(|| rand_digits(8)).clone();
    let target = SocketAddr::new(peer_ip, client_port);

    {
        let mut subscribers = stream.subscribers.write().await;
        let subscriber = subscribers.entry(session_id.clone()).or_default();
        match kind {
            TrackKind::Audio => subscriber.audio = Some(target),
            TrackKind::Video => subscriber.video = Some(target),
        }
    }

    let mut response = RtspResponse::new(200, "OK");
    response.set_header(
        "Transport",
        format!("{transport};server_port=0-0;source=127.0.0.1"),
    );
    response.set_header("Session", session_id);
    response
}

fn parse_client_port(transport: &str) -> Option<u16> {
    let ports = transport
        .split(';')
        .find_map(|param| param.trim().strip_prefix("client_port="))?;
    let rtp_port = ports.split('-').next()?;
    rtp_port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn request(conn: &mut TcpStream, text: String) -> RtspResponse {
        conn.write_all(text.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = conn.read(&mut buf).await.unwrap();
        RtspResponse::parse(&buf[..n]).unwrap()
    }

    #[test]
    fn client_port_parsing() {
        assert_eq!(
            parse_client_port("RTP/AVP;unicast;client_port=5000-5001"),
            Some(5000)
        );
        assert_eq!(parse_client_port("RTP/AVP;unicast"), None);
    }

    #[test]
    fn next_message_skips_interleaved_frames() {
        let mut pending = Vec::new();
        pending.extend_from_slice(&[b'$', 0, 0, 2, 1, 2]);
        pending.extend_from_slice(b"OPTIONS rtsp://x RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let message = next_message(&mut pending).unwrap();
        assert!(message.starts_with(b"OPTIONS"));
        assert!(pending.is_empty());
        assert_eq!(next_message(&mut pending), None);
    }

    #[tokio::test]
    async fn describe_is_404_until_stream_is_installed() {
        let publisher = RtspPublisher::new(0);
        let request = RtspRequest::parse(
            b"DESCRIBE rtsp://localhost:0/ RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        )
        .unwrap();
        let (response, _) = process_request(
            &publisher.inner,
            "127.0.0.1".parse().unwrap(),
            &mut None,
            &request,
        )
        .await;
        assert_eq!(response.status, 404);
        assert_eq!(response.header("CSeq"), Some("1"));
    }

    #[tokio::test]
    async fn full_session_delivers_rtp_to_subscriber() {
        let publisher = RtspPublisher::new(0);
        publisher.start().await.unwrap();
        let rtsp_port = publisher.rtsp_port();
        assert_ne!(rtsp_port, 0);
        assert_ne!(publisher.audio_port(), 0);
        assert_ne!(publisher.video_port(), 0);

        // Where the republished audio should land.
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_port = receiver.local_addr().unwrap().port();

        let mut conn = TcpStream::connect(("127.0.0.1", rtsp_port)).await.unwrap();
        let base = format!("rtsp://localhost:{rtsp_port}");

        let options = request(
            &mut conn,
            format!("OPTIONS {base}/ RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
        )
        .await;
        assert_eq!(options.status, 200);
        assert!(options.header("Public").unwrap().contains("DESCRIBE"));

        let describe = request(
            &mut conn,
            format!("DESCRIBE {base}/ RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
        )
        .await;
        assert_eq!(describe.status, 200);
        assert!(describe.body.contains("m=audio"));
        assert!(describe.body.contains("opus/48000/2"));
        assert!(describe.body.contains("m=video"));
        assert!(describe.body.contains("H264/90000"));

        let setup = request(
            &mut conn,
            format!(
                "SETUP {base}/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port={receiver_port}-{}\r\n\r\n",
                receiver_port + 1
            ),
        )
        .await;
        assert_eq!(setup.status, 200);
        let session = setup.header("Session").unwrap().to_string();

        let play = request(
            &mut conn,
            format!("PLAY {base}/ RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n"),
        )
        .await;
        assert_eq!(play.status, 200);

        // A minimal valid RTP packet (version 2, payload type 96).
        let packet = [
            0x80u8, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xaa,
        ];
        let pusher = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // The subscriber registry is shared state; retry a few sends in case
        // the PLAY response raced the first datagram.
        let mut received = None;
        let mut buf = vec![0u8; 256];
        for _ in 0..10 {
            pusher
                .send_to(&packet, ("127.0.0.1", publisher.audio_port()))
                .await
                .unwrap();
            match tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buf))
                .await
            {
                Ok(Ok((n, _))) => {
                    received = Some(buf[..n].to_vec());
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(received.as_deref(), Some(&packet[..]));

        let teardown = request(
            &mut conn,
            format!("TEARDOWN {base}/ RTSP/1.0\r\nCSeq: 5\r\nSession: {session}\r\n\r\n"),
        )
        .await;
        assert_eq!(teardown.status, 200);

        publisher.close().await;
        publisher.close().await;
    }
}

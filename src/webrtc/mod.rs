//! Peer-connection lifecycle and RTP ingress.
//!
//! The manager owns one peer connection and, in full (media-owning) mode,
//! one loopback UDP socket that an external encoder pushes RTP into. Each
//! datagram is parsed, its marker bit rewritten, and forwarded onto the
//! outbound audio track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::util::Unmarshal;

pub use webrtc::api::media_engine::{
    MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
};

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::util::rand_string;

/// Largest RTP datagram the external encoder is expected to emit.
pub(crate) const UDP_PACKET_SIZE: usize = 1200;

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Rewrites RTP marker bits so only the first forwarded packet carries one.
/// The encoder marks every packet, which the Arlo backend rejects as bursty.
pub(crate) struct MarkerGate {
    first: bool,
}

impl MarkerGate {
    pub(crate) fn new() -> Self {
        Self { first: true }
    }

    pub(crate) fn stamp(&mut self, header: &mut rtp::header::Header) {
        header.marker = self.first;
        self.first = false;
    }
}

/// Handle to a peer connection; clones share the same connection.
#[derive(Clone)]
pub struct WebRtcManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    name: &'static str,
    pc: Arc<RTCPeerConnection>,
    audio_rtp: Mutex<Option<Arc<UdpSocket>>>,
    candidates: Mutex<mpsc::UnboundedReceiver<RTCIceCandidate>>,
    gather_done: watch::Receiver<bool>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    created_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcManager {
    pub async fn new(ice_servers: Vec<IceServer>) -> Result<Self> {
        Self::with_name(ice_servers, "WebRtcManager").await
    }

    pub(crate) async fn with_name(
        ice_servers: Vec<IceServer>,
        name: &'static str,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.into_iter().map(Into::into).collect(),
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::Balanced,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ice_candidate_pool_size: 0,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                let _ = candidate_tx.send(candidate);
            }
            Box::pin(async {})
        }));

        let (gather_tx, gather_rx) = watch::channel(false);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            if state == RTCIceGathererState::Complete {
                let _ = gather_tx.send(true);
            }
            Box::pin(async {})
        }));

        // We never expect useful media back from the camera; drain whatever
        // it sends so the transport does not back up.
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            debug!(
                mime = %track.codec().capability.mime_type,
                "draining remote track"
            );
            Box::pin(async move { while track.read_rtp().await.is_ok() {} })
        }));

        let manager = Self {
            inner: Arc::new(ManagerInner {
                name,
                pc,
                audio_rtp: Mutex::new(None),
                candidates: Mutex::new(candidate_rx),
                gather_done: gather_rx,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                created_at: Instant::now(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let fallback = manager.clone();
        manager.on_disconnected(move || {
            let manager = fallback.clone();
            tokio::spawn(async move { manager.close().await });
        });

        Ok(manager)
    }

    /// Replace the connection-state hook; `hook` fires on `Disconnected`.
    ///
    /// The dialog FSM installs its own hook so a dying peer connection tears
    /// the whole dialog down; the hook must tolerate firing after close.
    pub fn on_disconnected<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = self.inner.name;
        let created_at = self.inner.created_at;
        self.inner
            .pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(name, %state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Disconnected => hook(),
                    RTCPeerConnectionState::Connected => {
                        debug!(name, elapsed = ?created_at.elapsed(), "peer connected");
                    }
                    _ => {}
                }
                Box::pin(async {})
            }));
    }

    /// Open the loopback UDP ingress for outbound audio and attach a local
    /// track with the given MIME (`MIME_TYPE_OPUS`, `MIME_TYPE_PCMA`,
    /// `MIME_TYPE_PCMU` or `MIME_TYPE_H264`). Returns the UDP port the
    /// encoder should target.
    pub async fn initialize_audio_rtp_listener(&self, mime_type: &str) -> Result<u16> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let port = socket.local_addr()?.port();

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            rand_string(15),
            rand_string(15),
        ));
        let sender = self
            .inner
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let mut tasks = self.inner.tasks.lock().await;

        // RTCP must be read for the interceptors (NACK and friends) to run.
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        }));

        tasks.push(spawn_rtp_pump(self.inner.clone(), socket.clone(), track));
        drop(tasks);

        *self.inner.audio_rtp.lock().await = Some(socket);
        info!(port, "created audio rtp listener at udp://127.0.0.1");
        Ok(port)
    }

    pub(crate) async fn has_audio_rtp_listener(&self) -> bool {
        self.inner.audio_rtp.lock().await.is_some()
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.inner.pc.create_offer(None).await?)
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.inner.pc.create_answer(None).await?)
    }

    pub async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.inner.pc.set_local_description(desc).await?)
    }

    pub async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.inner.pc.set_remote_description(desc).await?)
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.inner.pc.add_ice_candidate(candidate).await?)
    }

    /// The gathered local description, once candidates are in.
    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.inner.pc.local_description().await
    }

    /// Next queued ICE candidate, or [`Error::EndOfCandidates`] once
    /// gathering has completed and the queue is drained. Queued candidates
    /// always win over the completion sentinel.
    pub async fn next_ice_candidate(&self) -> Result<RTCIceCandidate> {
        let mut candidates = self.inner.candidates.lock().await;
        let mut done = self.inner.gather_done.clone();

        loop {
            match candidates.try_recv() {
                Ok(candidate) => return Ok(candidate),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(Error::EndOfCandidates);
                }
            }
            if *done.borrow() {
                return Err(Error::EndOfCandidates);
            }

            tokio::select! {
                maybe = candidates.recv() => {
                    return maybe.ok_or(Error::EndOfCandidates);
                }
                changed = done.changed() => {
                    if changed.is_err() {
                        return Err(Error::EndOfCandidates);
                    }
                    // Loop to drain anything queued before the sentinel.
                }
            }
        }
    }

    /// Idempotent; only the first call has side effects.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        if let Err(err) = self.inner.pc.close().await {
            debug!(error = %err, "peer connection close");
        }
        *self.inner.audio_rtp.lock().await = None;

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        debug!(
            name = self.inner.name,
            elapsed = ?self.inner.created_at.elapsed(),
            "webrtc manager closed"
        );
    }
}

fn spawn_rtp_pump(
    inner: Arc<ManagerInner>,
    socket: Arc<UdpSocket>,
    track: Arc<TrackLocalStaticRTP>,
) -> JoinHandle<()> {
    let mut gather_done = inner.gather_done.clone();
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        // Hold RTP until ICE gathering wraps up; earlier packets would be
        // dropped by the transport anyway.
        while !*gather_done.borrow() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = gather_done.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let mut marker = MarkerGate::new();
        let mut buffer = vec![0u8; UDP_PACKET_SIZE];
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = socket.recv(&mut buffer) => match result {
                    Ok(n) => n,
                    Err(err) => {
                        info!(error = %err, "error during audio track read");
                        return;
                    }
                },
            };

            let mut raw = &buffer[..n];
            let mut packet = match rtp::packet::Packet::unmarshal(&mut raw) {
                Ok(packet) => packet,
                Err(err) => {
                    info!(error = %err, "error unmarshaling rtp packet");
                    continue;
                }
            };

            marker.stamp(&mut packet.header);

            if let Err(err) = track.write_rtp(&packet).await {
                if err != webrtc::Error::ErrClosedPipe {
                    info!(error = %err, "error writing to audio track");
                }
                return;
            }
        }
    })
}

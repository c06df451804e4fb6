//! SIP-over-WSS dialog state machine.
//!
//! Drives INVITE → 100/407/200 → ACK against the Arlo gateway, issues the
//! in-dialog `startTalk` / `stopTalk` / `keepAlive` MESSAGEs, and tears the
//! call down with a BYE synthesized from the stored 200 OK. Responses are
//! matched positionally, exactly as the gateway emits them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rsip::prelude::UntypedHeader;
use rsip::{SipMessage, StatusCode};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::auth::AuthHeader;
use crate::config::{IceServer, SipInfo, KEEPALIVE_PERIOD};
use crate::error::{Error, Result};
use crate::sip::message::{self, MessageFactory};
use crate::sip::transport::{SignalingTransport, WsSignaling};
use crate::webrtc::WebRtcManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Idle,
    Connecting,
    InviteSent,
    Authenticating,
    Confirmed,
    KeepAlive,
    Closed,
}

/// Handle to one push-to-talk dialog; clones share the dialog.
#[derive(Clone)]
pub struct SipDialog {
    inner: Arc<DialogInner>,
}

struct DialogInner {
    info: SipInfo,
    webrtc: WebRtcManager,
    factory: MessageFactory,
    io_timeout: Duration,
    keepalive_status: StatusCode,
    transport: Mutex<Option<Box<dyn SignalingTransport>>>,
    invite_response: Mutex<Option<rsip::Response>>,
    state: std::sync::Mutex<DialogState>,
    closed: AtomicBool,
}

impl SipDialog {
    /// Build a dialog with its own WebRTC manager.
    pub async fn new(ice_servers: Vec<IceServer>, info: SipInfo) -> Result<Self> {
        let webrtc = WebRtcManager::with_name(ice_servers, "SipWebRtcManager").await?;
        Self::with_manager(webrtc, info)
    }

    /// Wrap an existing manager (the host usually created it first to learn
    /// the audio RTP port).
    pub fn with_manager(webrtc: WebRtcManager, info: SipInfo) -> Result<Self> {
        let factory = MessageFactory::new(&info)?;
        let keepalive_status = StatusCode::try_from(info.keepalive_status())
            .map_err(|err| Error::configuration(format!("invalid keepalive status: {err}")))?;
        let io_timeout = info.timeout();

        let dialog = Self {
            inner: Arc::new(DialogInner {
                info,
                webrtc,
                factory,
                io_timeout,
                keepalive_status,
                transport: Mutex::new(None),
                invite_response: Mutex::new(None),
                state: std::sync::Mutex::new(DialogState::Idle),
                closed: AtomicBool::new(false),
            }),
        };

        // The peer connection going away must end the whole dialog, even if
        // the dialog is already closing; close() is idempotent either way.
        let weak = Arc::downgrade(&dialog.inner);
        dialog.inner.webrtc.on_disconnected(move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move { DialogInner::close(&inner).await });
            }
        });

        Ok(dialog)
    }

    pub fn webrtc(&self) -> &WebRtcManager {
        &self.inner.webrtc
    }

    /// See [`WebRtcManager::initialize_audio_rtp_listener`].
    pub async fn initialize_audio_rtp_listener(&self, mime_type: &str) -> Result<u16> {
        self.inner.webrtc.initialize_audio_rtp_listener(mime_type).await
    }

    pub fn state(&self) -> DialogState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the dialog over a WebSocket built from the configuration.
    /// Returns the (repaired) remote SDP answer.
    pub async fn start(&self) -> Result<String> {
        self.preflight().await?;
        self.set_state(DialogState::Connecting);
        let result = async {
            let transport = WsSignaling::connect(&self.inner.info)
                .await
                .map_err(|err| Error::protocol(format!("could not connect websocket: {err}")))?;
            *self.inner.transport.lock().await = Some(Box::new(transport));
            self.run_handshake().await
        }
        .await;

        match result {
            Ok(sdp) => Ok(sdp),
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    /// Run the dialog over a caller-supplied transport.
    pub async fn start_with_transport(
        &self,
        transport: Box<dyn SignalingTransport>,
    ) -> Result<String> {
        self.preflight().await?;
        self.set_state(DialogState::Connecting);
        *self.inner.transport.lock().await = Some(transport);
        match self.run_handshake().await {
            Ok(sdp) => Ok(sdp),
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    async fn preflight(&self) -> Result<()> {
        if !self.inner.info.signaling_only() && !self.inner.webrtc.has_audio_rtp_listener().await {
            return Err(Error::configuration("audio rtp listener not initialized"));
        }
        Ok(())
    }

    async fn run_handshake(&self) -> Result<String> {
        let inner = &self.inner;

        let local_sdp = match &inner.info.sdp {
            Some(sdp) => sdp.clone(),
            None => self.make_local_sdp().await?,
        };

        let mut invite = inner.factory.invite(&local_sdp);
        self.set_state(DialogState::InviteSent);
        self.write_request(&invite).await?;

        let trying = self.read_response("100 trying").await?;
        verify_status(&trying, StatusCode::Trying)?;

        let mut invite_response = self.read_response("invite response").await?;

        if invite_response.status_code == StatusCode::ProxyAuthenticationRequired {
            self.set_state(DialogState::Authenticating);
            // The 407 closes this transaction; ACK it before retrying.
            self.write_request(&inner.factory.ack_for(&invite_response)?).await?;

            let challenge = proxy_authenticate_value(&invite_response)?;
            let mut auth = AuthHeader::parse(&challenge)?;
            message::fill_challenge(&mut auth, &inner.factory);
            auth.update_response("INVITE", &inner.info.password)?;

            message::set_proxy_authorization(&mut invite, auth.to_string());
            message::refresh_branch(&mut invite)?;
            message::bump_cseq(&mut invite)?;

            self.set_state(DialogState::InviteSent);
            self.write_request(&invite).await?;

            let trying = self.read_response("100 trying").await?;
            verify_status(&trying, StatusCode::Trying)?;
            invite_response = self.read_response("invite response").await?;
        }

        verify_status(&invite_response, StatusCode::OK)?;
        *inner.invite_response.lock().await = Some(invite_response.clone());

        let content_type = content_type_of(&invite_response);
        if content_type.as_deref() != Some("application/sdp") {
            return Err(Error::protocol(format!(
                "unexpected invite response content type {content_type:?}"
            )));
        }

        let remote_sdp = String::from_utf8_lossy(&invite_response.body).into_owned();
        let remote_sdp = message::repair_remote_sdp(&remote_sdp);

        if !inner.info.signaling_only() {
            let answer = RTCSessionDescription::answer(remote_sdp.clone())?;
            inner.webrtc.set_remote_description(answer).await?;
        }

        self.write_request(&inner.factory.ack_for(&invite_response)?).await?;
        self.set_state(DialogState::Confirmed);

        // startTalk and keepAlive go out back to back; their 202s come back
        // in send order.
        if !inner.info.signaling_only() {
            let start_talk = inner
                .factory
                .message(&format!("deviceId:{};startTalk", inner.info.device_id));
            self.write_request(&start_talk).await?;
        }
        self.write_request(&inner.factory.message("keepAlive")).await?;

        if !inner.info.signaling_only() {
            let response = self.read_response("startTalk response").await?;
            verify_status(&response, StatusCode::Accepted)?;
        }
        let response = self.read_response("keepAlive response").await?;
        verify_status(&response, inner.keepalive_status.clone())?;

        self.set_state(DialogState::KeepAlive);
        self.spawn_keepalive();

        if !inner.info.signaling_only() {
            info!("started sip push to talk");
        }

        Ok(remote_sdp)
    }

    async fn make_local_sdp(&self) -> Result<String> {
        let inner = &self.inner;
        let offer = inner.webrtc.create_offer().await?;
        inner.webrtc.set_local_description(offer).await?;

        // Drain trickle candidates so the offer we send is final.
        loop {
            match inner.webrtc.next_ice_candidate().await {
                Ok(_) => continue,
                Err(Error::EndOfCandidates) => break,
                Err(err) => return Err(err),
            }
        }

        let local = inner
            .webrtc
            .local_description()
            .await
            .ok_or_else(|| Error::protocol("local description missing after gathering"))?;
        Ok(message::filter_candidates(&local.sdp))
    }

    /// Enable the camera's speaker path.
    pub async fn start_talk(&self) -> Result<()> {
        let payload = format!("deviceId:{};startTalk", self.inner.info.device_id);
        self.exchange_message(&payload, StatusCode::Accepted, "startTalk response")
            .await
    }

    /// Disable the camera's speaker path.
    pub async fn stop_talk(&self) -> Result<()> {
        let payload = format!("deviceId:{};stopTalk", self.inner.info.device_id);
        self.exchange_message(&payload, StatusCode::Accepted, "stopTalk response")
            .await
    }

    /// Idempotent: sends the BYE (if a 200 OK was stored), closes the
    /// WebSocket and the embedded WebRTC manager. Safe to call from any
    /// task, including the peer-connection state callback.
    pub async fn close(&self) {
        DialogInner::close(&self.inner).await;
    }

    fn set_state(&self, state: DialogState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn spawn_keepalive(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_PERIOD).await;

                let Some(inner) = weak.upgrade() else { return };
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }

                let dialog = SipDialog { inner };
                let expected = dialog.inner.keepalive_status.clone();
                if let Err(err) = dialog
                    .exchange_message("keepAlive", expected, "keepAlive response")
                    .await
                {
                    info!(error = %err, "keepalive failed, closing dialog");
                    dialog.close().await;
                    return;
                }
            }
        });
    }

    /// One MESSAGE round trip, holding the transport for the whole exchange
    /// so concurrent callers cannot interleave request/response pairs.
    async fn exchange_message(
        &self,
        payload: &str,
        expected: StatusCode,
        what: &'static str,
    ) -> Result<()> {
        let request = self.inner.factory.message(payload);
        let serialized = message::quote_display(&request.to_string());

        let mut guard = self.inner.transport.lock().await;
        let transport = guard.as_mut().ok_or(Error::RemoteClosed)?;

        debug!(message = %serialized, "sending sip message");
        timeout(self.inner.io_timeout, transport.send(serialized))
            .await
            .map_err(|_| Error::Timeout("websocket write"))??;

        let frame = timeout(self.inner.io_timeout, transport.recv())
            .await
            .map_err(|_| Error::Timeout(what))??;
        drop(guard);

        debug!(message = %frame, "got sip response");
        let response = parse_response(&frame, what)?;
        verify_status(&response, expected)
    }

    async fn write_request(&self, request: &rsip::Request) -> Result<()> {
        let serialized = message::quote_display(&request.to_string());
        debug!(message = %serialized, "sending sip message");

        let mut guard = self.inner.transport.lock().await;
        let transport = guard.as_mut().ok_or(Error::RemoteClosed)?;
        timeout(self.inner.io_timeout, transport.send(serialized))
            .await
            .map_err(|_| Error::Timeout("websocket write"))??;
        Ok(())
    }

    async fn read_response(&self, what: &'static str) -> Result<rsip::Response> {
        let mut guard = self.inner.transport.lock().await;
        let transport = guard.as_mut().ok_or(Error::RemoteClosed)?;
        let frame = timeout(self.inner.io_timeout, transport.recv())
            .await
            .map_err(|_| Error::Timeout(what))??;
        drop(guard);

        debug!(message = %frame, "got sip response");
        parse_response(&frame, what)
    }
}

impl DialogInner {
    async fn close(inner: &Arc<Self>) {
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *inner.state.lock().unwrap_or_else(|e| e.into_inner()) = DialogState::Closed;

        // Hold the invite-response lock for the whole teardown so a racing
        // success path cannot store a response we would never BYE.
        let invite_response = inner.invite_response.lock().await;
        let mut transport_guard = inner.transport.lock().await;

        if let Some(transport) = transport_guard.as_mut() {
            if let Some(response) = invite_response.as_ref() {
                match inner.factory.bye_for(response) {
                    Ok(bye) => {
                        let serialized = message::quote_display(&bye.to_string());
                        debug!(message = %serialized, "sending bye");
                        match timeout(inner.io_timeout, transport.send(serialized)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => debug!(error = %err, "bye write failed"),
                            Err(_) => debug!("bye write timed out"),
                        }
                    }
                    Err(err) => debug!(error = %err, "could not synthesize bye"),
                }
            }
            let _ = transport.close().await;
        }
        *transport_guard = None;
        drop(transport_guard);
        drop(invite_response);

        inner.webrtc.close().await;
        info!("sip dialog closed");
    }
}

fn parse_response(frame: &str, what: &'static str) -> Result<rsip::Response> {
    match SipMessage::try_from(frame).map_err(Error::protocol)? {
        SipMessage::Response(response) => Ok(response),
        SipMessage::Request(request) => Err(Error::protocol(format!(
            "expected {what}, got {} request",
            request.method
        ))),
    }
}

fn verify_status(response: &rsip::Response, expected: StatusCode) -> Result<()> {
    if response.status_code != expected {
        return Err(Error::protocol(format!(
            "did not receive {expected}, got {}",
            response.status_code
        )));
    }
    Ok(())
}

fn content_type_of(response: &rsip::Response) -> Option<String> {
    response.headers.iter().find_map(|header| match header {
        rsip::Header::ContentType(value) => Some(value.value().trim().to_string()),
        _ => None,
    })
}

fn proxy_authenticate_value(response: &rsip::Response) -> Result<String> {
    response
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::ProxyAuthenticate(value) => Some(value.value().to_string()),
            _ => None,
        })
        .ok_or_else(|| Error::protocol("missing Proxy-Authenticate header in 407 response"))
}

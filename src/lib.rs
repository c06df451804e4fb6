//! Signaling and media-plane glue for Arlo cameras and base stations.
//! This crate drives a WebRTC peer connection over the Arlo SIP/WebSocket
//! gateway (push-to-talk), bridges RTP produced by an external encoder onto
//! the negotiated tracks, and ships two RTSP helpers: a camera-local
//! RTSP-over-TLS proxy and an on-demand republisher for Opus/H.264 feeds.

mod util;

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod rtsp;
pub mod sip;
pub mod sse;
pub mod tls;
pub mod webrtc;

pub use config::{IceServer, SipInfo};
pub use error::{Error, Result};
pub use http::HttpClient;
pub use logging::TcpLogSink;
pub use rtsp::{LocalStreamProxy, RtspPublisher};
pub use sip::{DialogState, SignalingTransport, SipDialog};
pub use sse::SseClient;
pub use tls::verify_cert_hostname;
pub use util::HeadersMap;
pub use webrtc::WebRtcManager;

#[cfg(test)]
mod tests {
    use super::sip::{SignalingTransport, SipDialog};
    use super::webrtc::{WebRtcManager, MIME_TYPE_OPUS};
    use super::{HeadersMap, Result, SipInfo};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    /// Plays the gateway side of a full-mode call: answers the INVITE with a
    /// real SDP answer produced by a second peer connection, and 202s every
    /// MESSAGE.
    struct CameraTransport {
        answerer: WebRtcManager,
        sent: Arc<Mutex<Vec<String>>>,
        queue: VecDeque<String>,
    }

    fn response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "SIP/2.0 {status}\r\n\
             Via: SIP/2.0/WSS abc.invalid;branch=z9hG4bK7654321\r\n\
             From: \"WebRTC-UDP\" <sip:1234@example.arlo>;tag=fromtag\r\n\
             To: <sip:callee@example.arlo>;tag=totag\r\n\
             Call-ID: full-mode-call\r\n\
             CSeq: 1 INVITE\r\n\
             {extra_headers}\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[async_trait]
    impl SignalingTransport for CameraTransport {
        async fn send(&mut self, frame: String) -> Result<()> {
            self.sent.lock().unwrap().push(frame.clone());

            if frame.starts_with("INVITE ") {
                let offer_sdp = frame.split("\r\n\r\n").nth(1).unwrap_or_default();
                let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
                self.answerer.set_remote_description(offer).await?;
                let answer = self.answerer.create_answer().await?;
                self.answerer.set_local_description(answer.clone()).await?;

                self.queue.push_back(response("100 Trying", "", ""));
                self.queue.push_back(response(
                    "200 OK",
                    "Content-Type: application/sdp\r\n",
                    &answer.sdp,
                ));
            } else if frame.starts_with("MESSAGE ") {
                self.queue.push_back(response("202 Accepted", "", ""));
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<String> {
            self.queue.pop_front().ok_or(super::Error::RemoteClosed)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_mode_call_negotiates_and_tears_down() {
        let caller = WebRtcManager::new(Vec::new()).await.unwrap();
        let port = caller
            .initialize_audio_rtp_listener(MIME_TYPE_OPUS)
            .await
            .unwrap();
        assert_ne!(port, 0);

        // The "camera" also carries an audio track so its answer comes back
        // sendrecv, the shape the real gateway produces after repair.
        let answerer = WebRtcManager::new(Vec::new()).await.unwrap();
        answerer
            .initialize_audio_rtp_listener(MIME_TYPE_OPUS)
            .await
            .unwrap();

        let dialog = SipDialog::with_manager(
            caller,
            SipInfo {
                device_id: "ABCD1234".into(),
                caller_uri: "sip:1234@example.arlo".into(),
                callee_uri: "sip:callee@example.arlo".into(),
                password: "hunter2".into(),
                user_agent: "arlo-rtc".into(),
                websocket_uri: "wss://example.arlo/ws".into(),
                websocket_origin: String::new(),
                websocket_headers: HeadersMap::new(),
                sdp: None,
                timeout_secs: 30,
                keepalive_status: 0,
            },
        )
        .unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Box::new(CameraTransport {
            answerer: answerer.clone(),
            sent: sent.clone(),
            queue: VecDeque::new(),
        });

        let remote_sdp = dialog.start_with_transport(transport).await.unwrap();
        assert!(remote_sdp.contains("m=audio"));
        assert!(remote_sdp.contains("a=sendrecv"));

        let frames = sent.lock().unwrap().clone();
        // Full mode: INVITE, ACK, startTalk, keepAlive.
        assert_eq!(frames.len(), 4);
        assert!(frames[0].starts_with("INVITE "));
        assert!(frames[1].starts_with("ACK "));
        assert!(frames[2].ends_with("deviceId:ABCD1234;startTalk"));
        assert!(frames[3].ends_with("keepAlive"));

        // The offer on the wire must not leak IPv6 or mDNS candidates.
        for line in frames[0].lines() {
            if let Some(value) = line.strip_prefix("a=candidate:") {
                assert!(!value.contains(':'), "ipv6 candidate leaked: {line}");
                assert!(!value.contains(".local"), "mdns candidate leaked: {line}");
            }
        }

        dialog.close().await;
        let frames = sent.lock().unwrap().clone();
        assert!(frames.iter().any(|frame| frame.starts_with("BYE ")));

        answerer.close().await;
    }
}

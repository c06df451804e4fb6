use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::util::HeadersMap;

/// Socket read/write deadline applied to every exchange on the dialog.
pub const DEFAULT_SIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between in-dialog `keepAlive` messages.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Status the backend answers MESSAGE keepalives with. Some deployments
/// reply 200 instead, hence [`SipInfo::keepalive_status`].
pub const DEFAULT_KEEPALIVE_STATUS: u16 = 202;

/// Immutable per-call configuration for the SIP/WSS dialog.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SipInfo {
    /// Arlo device id to call.
    pub device_id: String,

    pub caller_uri: String,
    pub callee_uri: String,
    pub password: String,
    pub user_agent: String,

    pub websocket_uri: String,
    pub websocket_origin: String,
    pub websocket_headers: HeadersMap,

    /// Pre-formed SDP offer. When set, the caller manages the media traffic
    /// itself and this dialog is used for signaling only.
    pub sdp: Option<String>,

    /// Per-read/write deadline in seconds; 0 selects the 5 s default.
    pub timeout_secs: u64,

    /// Expected status for `keepAlive` responses; 0 selects 202 Accepted.
    pub keepalive_status: u16,
}

impl SipInfo {
    pub fn signaling_only(&self) -> bool {
        self.sdp.is_some()
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            DEFAULT_SIP_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    pub fn keepalive_status(&self) -> u16 {
        if self.keepalive_status == 0 {
            DEFAULT_KEEPALIVE_STATUS
        } else {
            self.keepalive_status
        }
    }
}

/// STUN/TURN server entry handed to the WebRTC manager.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SipInfo {
        SipInfo {
            device_id: "ABCD1234".into(),
            caller_uri: "sip:caller@example.arlo".into(),
            callee_uri: "sip:callee@example.arlo".into(),
            password: "secret".into(),
            user_agent: "arlo-rtc".into(),
            websocket_uri: "wss://example.arlo/ws".into(),
            websocket_origin: "https://example.arlo".into(),
            websocket_headers: HeadersMap::new(),
            sdp: None,
            timeout_secs: 0,
            keepalive_status: 0,
        }
    }

    #[test]
    fn defaults_kick_in_for_zero_values() {
        let info = info();
        assert_eq!(info.timeout(), DEFAULT_SIP_TIMEOUT);
        assert_eq!(info.keepalive_status(), 202);
        assert!(!info.signaling_only());
    }

    #[test]
    fn signaling_only_follows_sdp() {
        let mut info = info();
        info.sdp = Some("v=0\r\n".into());
        info.keepalive_status = 200;
        assert!(info.signaling_only());
        assert_eq!(info.keepalive_status(), 200);
    }
}

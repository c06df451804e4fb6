use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("digest auth error: {0}")]
    Auth(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("peer closed the connection")]
    RemoteClosed,

    #[error("no more ICE candidates")]
    EndOfCandidates,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tls error: {0}")]
    Tls(String),
}

impl Error {
    pub fn protocol<E: std::fmt::Display>(err: E) -> Self {
        Self::Protocol(err.to_string())
    }

    pub fn auth<E: std::fmt::Display>(err: E) -> Self {
        Self::Auth(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn tls<E: std::fmt::Display>(err: E) -> Self {
        Self::Tls(err.to_string())
    }
}

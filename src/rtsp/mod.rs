pub mod message;
pub mod proxy;
pub mod publisher;

pub use message::{RtspParseError, RtspRequest, RtspResponse};
pub use proxy::LocalStreamProxy;
pub use publisher::RtspPublisher;

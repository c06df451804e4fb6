mod dialog;
pub(crate) mod message;
mod transport;

pub use dialog::{DialogState, SipDialog};
pub use transport::{SignalingTransport, WsSignaling};

//! ISO 15765-2 transport: PCI framing ([`frame`]) and the send/receive link
//! state machine ([`link`]) that implements [`crate::transport::Transport`].

pub mod frame;
pub mod link;

pub use frame::{Frame, FlowStatus};
pub use link::{FramePort, IsoTpLink, LinkConfig};

use thiserror::Error as ThisError;

/// Errors originating in the ISO-TP layer, distinct from the UDS-level
/// [`crate::error::Error`] that wraps them for client/server callers.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("frame: {0}")]
    Frame(#[from] frame::Error),

    #[error("link: {0}")]
    Link(#[from] link::Error),
}

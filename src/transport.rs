//! The abstract transport port used by both [`crate::client::Client`] and
//! [`crate::server::Server`].
//!
//! A concrete CAN/ISO-TP-kernel-socket binding is outside this crate's scope;
//! implementors provide the five operations below and this crate's ISO-TP
//! engine drives them.

use bitflags::bitflags;

use crate::error::Error;

/// Target-address type of a diagnostic SDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// One-to-one addressing.
    Physical,
    /// One-to-many addressing; payloads are constrained to a single frame
    /// (≤ 7 bytes of application data) and responses are unreliable.
    Functional,
}

/// Descriptor accompanying a diagnostic SDU as it crosses the transport port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SduInfo {
    pub address_type: AddressType,
    pub source_address: u32,
    pub target_address: u32,
}

impl SduInfo {
    pub fn physical(source_address: u32, target_address: u32) -> Self {
        SduInfo {
            address_type: AddressType::Physical,
            source_address,
            target_address,
        }
    }

    pub fn functional(source_address: u32, target_address: u32) -> Self {
        SduInfo {
            address_type: AddressType::Functional,
            source_address,
            target_address,
        }
    }

    pub fn is_functional(&self) -> bool {
        self.address_type == AddressType::Functional
    }
}

bitflags! {
    /// Status bitmask returned by [`Transport::poll`].
    pub struct PortStatus: u32 {
        const IDLE = 0b0000_0001;
        const SEND_IN_PROGRESS = 0b0000_0010;
        const RECV_IN_PROGRESS = 0b0000_0100;
        const ERR = 0b0000_1000;
    }
}

/// The five-operation contract a transport port must provide.
///
/// ## How can I implement `Transport`?
///
/// Types that are [`Transport`] own their send/receive buffers and lend them
/// out by reference for the duration of a single operation
/// (`get_send_buf`/`peek` until the next state transition or `ack_recv`);
/// concurrent borrows are not permitted by the single-threaded polling model
/// this crate assumes (spec.md §5).
pub trait Transport {
    /// Advance engine timers and I/O, returning the current status bitmask.
    fn poll(&mut self) -> Result<PortStatus, Error>;

    /// Enqueue `len` bytes of `buf` (previously filled via [`get_send_buf`])
    /// for transmission to `sdu`. Returns the number of bytes accepted.
    /// Functional sends longer than 7 bytes are rejected.
    fn send(&mut self, len: usize, sdu: SduInfo) -> Result<usize, Error>;

    /// Non-destructive lookahead at the next received SDU. Returns the
    /// length of the available payload, or `0` if none is ready.
    fn peek(&mut self) -> Result<(usize, SduInfo), Error>;

    /// Borrow the bytes peeked by the most recent [`peek`] call.
    fn peek_buf(&self) -> &[u8];

    /// Release the currently peeked SDU, freeing the receive slot for a new one.
    fn ack_recv(&mut self);

    /// Borrow the outgoing buffer to be filled before [`send`]; returns its capacity.
    fn get_send_buf(&mut self) -> &mut [u8];

    /// Maximum SDU size this port's receive buffer can hold.
    fn mtu(&self) -> usize;
}

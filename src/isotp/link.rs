//! The per-direction ISO-TP send/receive state machine (spec.md §3, §4.1).
//!
//! Grounded on `examples/other_examples/4acbe978_I-CAN-hack-automotive__src-isotp-mod.rs.rs`'s
//! send/recv frame handlers, reworked from its async-stream-over-a-CAN-adapter design into the
//! synchronous `poll()`-driven state machine the spec demands, and cross-checked against
//! spec.md's literal PCI byte layouts and timer names (`N_As`/`N_Bs`/`N_Cr`).

use log::{debug, trace, warn};

use super::frame::{self, Frame, FlowStatus};
use crate::time::{time_after_or_eq, Clock, Millis};
use crate::transport::{AddressType, PortStatus, SduInfo, Transport};

use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    #[error("a send is already in progress")]
    InProgress,
    #[error("payload of {len} bytes overflows the {cap}-byte link buffer")]
    Overflow { len: usize, cap: usize },
    #[error("functional sends are limited to 7 bytes, got {0}")]
    FunctionalTooLong(usize),
    #[error("N_Bs timeout waiting for flow control")]
    TimeoutBs,
    #[error("N_Cr timeout waiting for a consecutive frame")]
    TimeoutCr,
    #[error("consecutive frame sequence number mismatch: expected {want}, got {got}")]
    WrongSn { want: u8, got: u8 },
    #[error("peer signalled flow control overflow")]
    FlowControlOverflow,
    #[error("exceeded the maximum number of flow control WAIT frames")]
    TooManyWaitFrames,
    #[error("frame: {0}")]
    Frame(#[from] frame::Error),
    #[error("CAN shim error: {0}")]
    Shim(String),
}

/// The abstract CAN-frame shim an [`IsoTpLink`] drives. Out of this crate's
/// scope is any concrete binding (raw socket, ISO-TP kernel socket, mock);
/// this is the seam such a binding implements (spec.md §1, §4.1 "N_As").
pub trait FramePort {
    /// Write one up-to-8-byte CAN frame. The engine treats this as a
    /// synchronous success/failure — N_As is the shim's problem, not the
    /// engine's.
    fn write_frame(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Non-blocking read of the next inbound CAN frame, if any.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Idle,
    InProgress,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Idle,
    InProgress,
    Full,
}

/// Sentinel for "no block-size limit" (an FC `BS == 0`), spec.md §3.
const INVALID_BS: u32 = u32::MAX;

struct SendSide {
    state: SendState,
    buf: Vec<u8>,
    size: usize,
    offset: usize,
    sn: u8,
    bs_remain: u32,
    st_min_us: u32,
    separation_deadline: Millis,
    bs_timeout_deadline: Millis,
    wait_frames: u32,
}

impl SendSide {
    fn new(cap: usize) -> Self {
        SendSide {
            state: SendState::Idle,
            buf: vec![0u8; cap],
            size: 0,
            offset: 0,
            sn: 1,
            bs_remain: INVALID_BS,
            st_min_us: 0,
            separation_deadline: 0,
            bs_timeout_deadline: 0,
            wait_frames: 0,
        }
    }
}

struct RecvSide {
    state: RecvState,
    buf: Vec<u8>,
    size: usize,
    offset: usize,
    expected_sn: u8,
    bs_count: u32,
    cr_timeout_deadline: Millis,
}

impl RecvSide {
    fn new(cap: usize) -> Self {
        RecvSide {
            state: RecvState::Idle,
            buf: vec![0u8; cap],
            size: 0,
            offset: 0,
            expected_sn: 1,
            bs_count: 0,
            cr_timeout_deadline: 0,
        }
    }
}

/// Tunable defaults for the block-size/separation-time/timeout policy a
/// [`IsoTpLink`] advertises and enforces (spec.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub default_block_size: u8,
    pub default_st_min_us: u32,
    pub bs_timeout_ms: u32,
    pub cr_timeout_ms: u32,
    pub max_wait_frames: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            default_block_size: 0,
            default_st_min_us: 0,
            bs_timeout_ms: 1000,
            cr_timeout_ms: 1000,
            max_wait_frames: 10,
        }
    }
}

/// A bound physical (or functional) ISO-TP link: one send state machine, one
/// receive state machine, driving CAN traffic through a [`FramePort`] shim
/// and a millisecond [`Clock`].
///
/// `IsoTpLink` itself implements [`Transport`] — the UDS client/server code
/// against the transport port, never against ISO-TP frames directly.
pub struct IsoTpLink<F, C> {
    frames: F,
    clock: C,
    cfg: LinkConfig,
    send: SendSide,
    recv: RecvSide,
    sdu: SduInfo,
}

impl<F: FramePort, C: Clock> IsoTpLink<F, C> {
    pub fn new(frames: F, clock: C, sdu: SduInfo, buf_cap: usize, cfg: LinkConfig) -> Self {
        IsoTpLink {
            frames,
            clock,
            cfg,
            send: SendSide::new(buf_cap),
            recv: RecvSide::new(buf_cap),
            sdu,
        }
    }

    fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    fn handle_inbound(&mut self, raw: &[u8]) -> Result<(), Error> {
        match frame::decode(raw)? {
            Frame::Single(data) => self.on_sf(data),
            Frame::First { dl, data } => self.on_ff(dl, data),
            Frame::Consecutive { sn, data } => self.on_cf(sn, data),
            Frame::FlowControl { status, bs, st_min_us } => self.on_fc(status, bs, st_min_us),
        }
    }

    fn on_sf(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.recv.state != RecvState::Idle {
            warn!("isotp: unexpected SF while receive busy, dropping");
            return Ok(());
        }
        self.recv.buf[..data.len()].copy_from_slice(data);
        self.recv.size = data.len();
        self.recv.offset = data.len();
        self.recv.state = RecvState::Full;
        debug!("isotp: RX SF, {} bytes", data.len());
        Ok(())
    }

    fn on_ff(&mut self, dl: usize, data: &[u8]) -> Result<(), Error> {
        if dl > self.recv.buf.len() {
            let mut fc = [0u8; 3];
            frame::encode_flow_control(FlowStatus::Overflow, 0, 0, &mut fc)?;
            self.frames.write_frame(&fc)?;
            warn!("isotp: RX FF DL {} exceeds buffer {}, overflow", dl, self.recv.buf.len());
            return Ok(());
        }
        let n = data.len().min(dl);
        self.recv.buf[..n].copy_from_slice(&data[..n]);
        self.recv.offset = n;
        self.recv.size = dl;
        self.recv.state = RecvState::InProgress;
        self.recv.expected_sn = 1;
        self.recv.bs_count = self.cfg.default_block_size as u32;
        self.recv.cr_timeout_deadline = self.now() + self.cfg.cr_timeout_ms;

        let mut fc = [0u8; 3];
        frame::encode_flow_control(
            FlowStatus::Continue,
            self.cfg.default_block_size,
            self.cfg.default_st_min_us,
            &mut fc,
        )?;
        self.frames.write_frame(&fc)?;
        debug!("isotp: RX FF, DL {}", dl);
        Ok(())
    }

    fn on_cf(&mut self, sn: u8, data: &[u8]) -> Result<(), Error> {
        if self.recv.state != RecvState::InProgress {
            warn!("isotp: unexpected CF, not receiving, dropping");
            return Ok(());
        }
        if sn != self.recv.expected_sn {
            warn!("isotp: wrong SN: expected {}, got {}", self.recv.expected_sn, sn);
            self.recv.state = RecvState::Idle;
            return Err(Error::WrongSn { want: self.recv.expected_sn, got: sn });
        }
        let remaining = self.recv.size - self.recv.offset;
        let n = data.len().min(remaining);
        let off = self.recv.offset;
        self.recv.buf[off..off + n].copy_from_slice(&data[..n]);
        self.recv.offset += n;
        self.recv.expected_sn = if self.recv.expected_sn == 0x0F { 0 } else { self.recv.expected_sn + 1 };
        self.recv.cr_timeout_deadline = self.now() + self.cfg.cr_timeout_ms;

        if self.recv.offset >= self.recv.size {
            self.recv.state = RecvState::Full;
            debug!("isotp: RX complete, {} bytes", self.recv.size);
            return Ok(());
        }

        if self.cfg.default_block_size != 0 {
            self.recv.bs_count -= 1;
            if self.recv.bs_count == 0 {
                self.recv.bs_count = self.cfg.default_block_size as u32;
                let mut fc = [0u8; 3];
                frame::encode_flow_control(
                    FlowStatus::Continue,
                    self.cfg.default_block_size,
                    self.cfg.default_st_min_us,
                    &mut fc,
                )?;
                self.frames.write_frame(&fc)?;
            }
        }
        Ok(())
    }

    fn on_fc(&mut self, status: FlowStatus, bs: u8, st_min_us: u32) -> Result<(), Error> {
        if self.send.state != SendState::InProgress {
            trace!("isotp: FC received with no send in progress, ignoring");
            return Ok(());
        }
        match status {
            FlowStatus::Overflow => {
                self.send.state = SendState::Error;
                Err(Error::FlowControlOverflow)
            }
            FlowStatus::Wait => {
                self.send.wait_frames += 1;
                if self.send.wait_frames > self.cfg.max_wait_frames {
                    self.send.state = SendState::Error;
                    return Err(Error::TooManyWaitFrames);
                }
                self.send.bs_timeout_deadline = self.now() + self.cfg.bs_timeout_ms;
                Ok(())
            }
            FlowStatus::Continue => {
                self.send.bs_remain = if bs == 0 { INVALID_BS } else { bs as u32 };
                self.send.st_min_us = st_min_us.max(self.cfg.default_st_min_us);
                self.send.wait_frames = 0;
                self.send.separation_deadline = self.now();
                self.send.bs_timeout_deadline = self.now() + self.cfg.bs_timeout_ms;
                Ok(())
            }
        }
    }

    fn drive_send(&mut self) -> Result<(), Error> {
        if self.send.state != SendState::InProgress {
            return Ok(());
        }
        if time_after_or_eq(self.now(), self.send.bs_timeout_deadline) {
            self.send.state = SendState::Error;
            return Err(Error::TimeoutBs);
        }
        let can_send_on_block = self.send.bs_remain == INVALID_BS || self.send.bs_remain > 0;
        let can_send_on_timing =
            self.send.st_min_us == 0 || time_after_or_eq(self.now() * 1000, self.send.separation_deadline * 1000);
        if !(can_send_on_block && can_send_on_timing) {
            return Ok(());
        }

        let remaining = self.send.size - self.send.offset;
        let n = remaining.min(frame::MAX_CF_PAYLOAD);
        let mut out = [0u8; 8];
        let off = self.send.offset;
        frame::encode_consecutive(self.send.sn, &self.send.buf[off..off + n], &mut out)?;
        self.frames.write_frame(&out[..1 + n])?;

        self.send.offset += n;
        if self.send.bs_remain != INVALID_BS {
            self.send.bs_remain -= 1;
        }
        self.send.sn = if self.send.sn == 0x0F { 0 } else { self.send.sn + 1 };
        self.send.bs_timeout_deadline = self.now() + self.cfg.bs_timeout_ms;
        self.send.separation_deadline = self.now() + self.send.st_min_us / 1000;
        debug!("isotp: TX CF, offset {}/{}", self.send.offset, self.send.size);

        if self.send.offset >= self.send.size {
            self.send.state = SendState::Idle;
            debug!("isotp: TX complete, {} bytes", self.send.size);
        }
        Ok(())
    }
}

impl<F: FramePort, C: Clock> Transport for IsoTpLink<F, C> {
    fn poll(&mut self) -> Result<PortStatus, crate::error::Error> {
        if self.recv.state == RecvState::InProgress
            && time_after_or_eq(self.now(), self.recv.cr_timeout_deadline)
        {
            warn!("isotp: N_Cr timeout");
            self.recv.state = RecvState::Idle;
        }

        self.drive_send()
            .map_err(|e| crate::error::Error::Transport(e.to_string()))?;

        while let Some(raw) = self
            .frames
            .read_frame()
            .map_err(|e| crate::error::Error::Transport(e.to_string()))?
        {
            if self.sdu.is_functional() && self.recv.state != RecvState::Idle {
                warn!("isotp: dropping functional frame, physical link busy");
                continue;
            }
            if let Err(e) = self.handle_inbound(&raw) {
                debug!("isotp: inbound frame error: {}", e);
            }
        }

        let mut status = PortStatus::empty();
        if self.send.state == SendState::Idle {
            status |= PortStatus::IDLE;
        }
        if self.send.state == SendState::InProgress {
            status |= PortStatus::SEND_IN_PROGRESS;
        }
        if self.send.state == SendState::Error {
            status |= PortStatus::ERR;
        }
        if self.recv.state == RecvState::InProgress {
            status |= PortStatus::RECV_IN_PROGRESS;
        }
        Ok(status)
    }

    fn send(&mut self, len: usize, sdu: SduInfo) -> Result<usize, crate::error::Error> {
        if self.send.state == SendState::InProgress {
            return Err(crate::error::Error::Transport(Error::InProgress.to_string()));
        }
        if len > self.send.buf.len() {
            return Err(crate::error::Error::Transport(
                Error::Overflow { len, cap: self.send.buf.len() }.to_string(),
            ));
        }
        if sdu.address_type == AddressType::Functional && len > frame::MAX_SF_PAYLOAD {
            return Err(crate::error::Error::Transport(
                Error::FunctionalTooLong(len).to_string(),
            ));
        }

        if len <= frame::MAX_SF_PAYLOAD {
            let mut out = [0u8; 8];
            let n = frame::encode_single(&self.send.buf[..len], &mut out)
                .map_err(|e| crate::error::Error::Transport(e.to_string()))?;
            self.frames
                .write_frame(&out[..n])
                .map_err(|e| crate::error::Error::Transport(e.to_string()))?;
            debug!("isotp: TX SF, {} bytes", len);
            return Ok(len);
        }

        let mut out = [0u8; 8];
        let n = frame::encode_first(len, &self.send.buf[..frame::FF_PAYLOAD_LEN], &mut out)
            .map_err(|e| crate::error::Error::Transport(e.to_string()))?;
        self.frames
            .write_frame(&out[..n])
            .map_err(|e| crate::error::Error::Transport(e.to_string()))?;

        self.send.size = len;
        self.send.offset = frame::FF_PAYLOAD_LEN;
        self.send.sn = 1;
        self.send.bs_remain = INVALID_BS;
        self.send.st_min_us = 0;
        self.send.wait_frames = 0;
        self.send.state = SendState::InProgress;
        self.send.bs_timeout_deadline = self.now() + self.cfg.bs_timeout_ms;
        self.send.separation_deadline = self.now();
        debug!("isotp: TX FF, total {} bytes", len);
        Ok(0)
    }

    fn peek(&mut self) -> Result<(usize, SduInfo), crate::error::Error> {
        if self.recv.state == RecvState::Full {
            Ok((self.recv.size, self.sdu))
        } else {
            Ok((0, self.sdu))
        }
    }

    fn peek_buf(&self) -> &[u8] {
        &self.recv.buf[..self.recv.size]
    }

    fn ack_recv(&mut self) {
        self.recv.state = RecvState::Idle;
        self.recv.offset = 0;
        self.recv.size = 0;
    }

    fn get_send_buf(&mut self) -> &mut [u8] {
        &mut self.send.buf
    }

    fn mtu(&self) -> usize {
        self.send.buf.len()
    }
}

//! ISO 15765-2 PCI (protocol control information) encode/decode.
//!
//! Grounded on `examples/other_examples/4acbe978_I-CAN-hack-automotive__src-isotp-mod.rs.rs`'s
//! `FrameType` taxonomy and frame builders, reworked from its byte-vector/async shape into the
//! fixed-buffer encode/decode functions the synchronous [`super::link::Link`] state machine calls.

use thiserror::Error as ThisError;

/// Maximum payload of a Single Frame / a functional-addressed send.
pub const MAX_SF_PAYLOAD: usize = 7;
/// Payload bytes carried by a First Frame.
pub const FF_PAYLOAD_LEN: usize = 6;
/// Maximum payload bytes carried by a Consecutive Frame.
pub const MAX_CF_PAYLOAD: usize = 7;
/// Minimum total length that must use a First Frame rather than a Single Frame.
pub const MIN_FF_DL: usize = 8;

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    #[error("malformed PCI byte")]
    Malformed,
    #[error("single frame length {0} out of range 1..=7")]
    BadSfLen(usize),
    #[error("first frame DL {0} out of range (must be >= 8)")]
    BadFfDl(usize),
    #[error("buffer of {have} bytes too small to hold {need}")]
    BufferTooSmall { need: usize, have: usize },
}

/// Flow status carried in the low nibble of a Flow Control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Continue = 0,
    Wait = 1,
    Overflow = 2,
}

impl FlowStatus {
    fn from_nibble(n: u8) -> Result<Self, Error> {
        match n {
            0 => Ok(FlowStatus::Continue),
            1 => Ok(FlowStatus::Wait),
            2 => Ok(FlowStatus::Overflow),
            _ => Err(Error::Malformed),
        }
    }
}

/// A decoded ISO-TP frame, borrowing its payload from the raw CAN frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Single(&'a [u8]),
    First { dl: usize, data: &'a [u8] },
    Consecutive { sn: u8, data: &'a [u8] },
    FlowControl { status: FlowStatus, bs: u8, st_min_us: u32 },
}

/// Decode the STmin byte of a Flow Control frame into microseconds.
///
/// `0x00..=0x7F` is 0..127 ms; `0xF1..=0xF9` is 100..900 µs; any other byte is
/// ISO-SAE-reserved and is treated as 0 (spec.md §4.1 "Timers and policy").
pub fn decode_st_min_us(byte: u8) -> u32 {
    match byte {
        0x00..=0x7F => byte as u32 * 1000,
        0xF1..=0xF9 => (byte as u32 - 0xF0) * 100,
        _ => 0,
    }
}

/// Encode a separation time in microseconds back into an STmin byte, rounding
/// down to the nearest representable step.
pub fn encode_st_min_us(us: u32) -> u8 {
    if us == 0 {
        0x00
    } else if us < 1000 {
        let step = (us / 100).clamp(1, 9) as u8;
        0xF0 + step
    } else {
        (us / 1000).min(0x7F) as u8
    }
}

/// Decode a raw CAN frame payload into its ISO-TP meaning.
pub fn decode(raw: &[u8]) -> Result<Frame<'_>, Error> {
    let pci = *raw.first().ok_or(Error::Malformed)?;
    match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if len == 0 || len > MAX_SF_PAYLOAD || 1 + len > raw.len() {
                return Err(Error::BadSfLen(len));
            }
            Ok(Frame::Single(&raw[1..1 + len]))
        }
        0x1 => {
            if raw.len() < 2 {
                return Err(Error::Malformed);
            }
            let dl = (((pci & 0x0F) as usize) << 8) | raw[1] as usize;
            if dl < MIN_FF_DL {
                return Err(Error::BadFfDl(dl));
            }
            Ok(Frame::First { dl, data: &raw[2..] })
        }
        0x2 => {
            let sn = pci & 0x0F;
            Ok(Frame::Consecutive { sn, data: raw.get(1..).unwrap_or(&[]) })
        }
        0x3 => {
            let status = FlowStatus::from_nibble(pci & 0x0F)?;
            let bs = raw.get(1).copied().unwrap_or(0);
            let st_min = raw.get(2).copied().unwrap_or(0);
            Ok(Frame::FlowControl { status, bs, st_min_us: decode_st_min_us(st_min) })
        }
        _ => Err(Error::Malformed),
    }
}

/// Encode a Single Frame, returning the number of bytes written.
pub fn encode_single(payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if payload.is_empty() || payload.len() > MAX_SF_PAYLOAD {
        return Err(Error::BadSfLen(payload.len()));
    }
    let need = 1 + payload.len();
    if out.len() < need {
        return Err(Error::BufferTooSmall { need, have: out.len() });
    }
    out[0] = payload.len() as u8;
    out[1..need].copy_from_slice(payload);
    Ok(need)
}

/// Encode a First Frame. `payload` must be exactly [`FF_PAYLOAD_LEN`] bytes.
pub fn encode_first(dl: usize, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if dl < MIN_FF_DL {
        return Err(Error::BadFfDl(dl));
    }
    let need = 2 + payload.len();
    if out.len() < need {
        return Err(Error::BufferTooSmall { need, have: out.len() });
    }
    out[0] = 0x10 | ((dl >> 8) & 0x0F) as u8;
    out[1] = (dl & 0xFF) as u8;
    out[2..need].copy_from_slice(payload);
    Ok(need)
}

/// Encode a Consecutive Frame with sequence number `sn` (masked to 4 bits).
pub fn encode_consecutive(sn: u8, payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let need = 1 + payload.len();
    if out.len() < need {
        return Err(Error::BufferTooSmall { need, have: out.len() });
    }
    out[0] = 0x20 | (sn & 0x0F);
    out[1..need].copy_from_slice(payload);
    Ok(need)
}

/// Encode a Flow Control frame.
pub fn encode_flow_control(
    status: FlowStatus,
    bs: u8,
    st_min_us: u32,
    out: &mut [u8],
) -> Result<usize, Error> {
    if out.len() < 3 {
        return Err(Error::BufferTooSmall { need: 3, have: out.len() });
    }
    out[0] = 0x30 | (status as u8);
    out[1] = bs;
    out[2] = encode_st_min_us(st_min_us);
    Ok(3)
}

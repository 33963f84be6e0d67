//! The event surface the application's handler is driven through.
//!
//! The original C core (`original_source/iso14229.c`) dispatches a single
//! function pointer tagged with an enum and a `void*` payload; grounded on
//! that shape but expressed the strongly typed way, following the teacher's
//! `Field` trait precedent of one variant per concrete payload. Handlers
//! return `Result<(), Nrc>` — the zero NRC ("positive response") is folded
//! into `Ok(())`, any other byte is the rejection the server wires back as
//! `7F SID NRC`.

use crate::error::Nrc;

pub type HandlerResult = Result<(), Nrc>;

/// A bounded append into a response buffer, handed to handlers that produce
/// variable-length output (RDBI, ReadMemoryByAddress, RoutineControl,
/// TransferData). Mirrors the original's `safe_copy`: appending more than
/// the remaining capacity is a `ResponseTooLong` rejection rather than a
/// buffer overrun.
pub struct Copier<'a> {
    buf: &'a mut [u8],
    offset: &'a mut usize,
}

impl<'a> Copier<'a> {
    pub fn new(buf: &'a mut [u8], offset: &'a mut usize) -> Self {
        Copier { buf, offset }
    }

    /// Append `data`, returning `Err(Nrc::ResponseTooLong)` if it would
    /// overflow the buffer. On success advances the write cursor.
    pub fn copy(&mut self, data: &[u8]) -> HandlerResult {
        let remaining = self.buf.len() - *self.offset;
        if data.len() > remaining {
            return Err(Nrc::ResponseTooLong);
        }
        let start = *self.offset;
        self.buf[start..start + data.len()].copy_from_slice(data);
        *self.offset += data.len();
        Ok(())
    }

    pub fn written(&self) -> usize {
        *self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecAccessRequestSeedArgs {
    pub level: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct SecAccessValidateKeyArgs<'a> {
    pub level: u8,
    pub key: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct WriteDataByIdentArgs<'a> {
    pub did: u16,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct RoutineCtrlArgs<'a> {
    pub sub_function: u8,
    pub routine_id: u16,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct TransferDataArgs<'a> {
    pub block_sequence_counter: u8,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct ErrArgs<'a> {
    pub message: &'a str,
}

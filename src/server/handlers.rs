//! Per-service request handlers, dispatched from [`super::Server::poll`].
//!
//! Grounded one-for-one on `examples/original_source/iso14229.c`'s
//! `_0x10_DiagnosticSessionControl` .. `_0x85_ControlDTCSetting` family;
//! each handler here takes the place of one of those C functions, writing
//! into the same positive-response layout and returning the same NRC the
//! original returns on rejection.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::constant::Sid;
use crate::error::Nrc;
use crate::event::{
    Copier, RoutineCtrlArgs, SecAccessRequestSeedArgs, SecAccessValidateKeyArgs,
    TransferDataArgs, WriteDataByIdentArgs,
};

use super::{Server, TransferDirection};
use crate::transport::Transport;

/// Outcome of a handler: `Ok(n)` is a positive response of `n` payload bytes
/// (appended after the echoed SID/sub-function), `Err(nrc)` is a rejection.
pub type HandlerOutcome = Result<usize, Nrc>;

impl<T: Transport> Server<T> {
    pub(super) fn dispatch(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.is_empty() {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sid = req[0];
        debug!("uds server: dispatch sid 0x{:02X}, {} bytes", sid, req.len());
        match Sid::from(sid) {
            Sid::DiagnosticSessionControl => self.h_diagnostic_session_control(req),
            Sid::EcuReset => self.h_ecu_reset(req),
            Sid::ReadDataByIdentifier => self.h_read_data_by_identifier(req),
            Sid::ReadMemoryByAddress => self.h_read_memory_by_address(req),
            Sid::SecurityAccess => self.h_security_access(req),
            Sid::CommunicationControl => self.h_communication_control(req),
            Sid::WriteDataByIdentifier => self.h_write_data_by_identifier(req),
            Sid::RoutineControl => self.h_routine_control(req),
            Sid::RequestDownload => self.h_request_download_upload(req, TransferDirection::Download),
            Sid::RequestUpload => self.h_request_download_upload(req, TransferDirection::Upload),
            Sid::TransferData => self.h_transfer_data(req),
            Sid::RequestTransferExit => self.h_request_transfer_exit(req),
            Sid::RequestFileTransfer => self.h_request_file_transfer(req),
            Sid::TesterPresent => self.h_tester_present(req),
            Sid::ControlDtcSetting => self.h_control_dtc_setting(req),
            Sid::NegativeResponse => Err(Nrc::ServiceNotSupported),
        }
        .or_else(|nrc| {
            if let Sid::NegativeResponse = Sid::from(sid) {
                self.dispatch_custom(sid, req)
            } else {
                Err(nrc)
            }
        })
    }

    fn dispatch_custom(&mut self, sid: u8, req: &[u8]) -> HandlerOutcome {
        match (self.custom_handler)(sid, &req[1.min(req.len())..]) {
            Ok(n) => Ok(n),
            Err(nrc) => Err(nrc),
        }
    }

    fn h_diagnostic_session_control(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let session_type = req[1] & 0x4F;
        (self.event_handler.diag_session_control)(session_type)?;

        self.session_type = session_type;
        if session_type != 0x01 {
            self.s3_deadline = self.now() + self.config.s3_ms;
            info!("uds server: session -> 0x{:02X}, S3 armed", session_type);
        } else {
            info!("uds server: session -> default");
        }

        let buf = &mut self.send_buf;
        buf[1] = session_type;
        buf[2..4].copy_from_slice(&(self.config.p2_ms as u16).to_be_bytes());
        buf[4..6].copy_from_slice(&((self.config.p2_star_ms / 10) as u16).to_be_bytes());
        Ok(5)
    }

    fn h_ecu_reset(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let reset_type = req[1] & 0x3F;
        (self.event_handler.ecu_reset)(reset_type)?;

        self.reset_scheduled = Some(reset_type);
        self.reset_deadline = self.now() + self.config.power_down_time_ms;
        self.not_ready_to_receive = true;
        info!(
            "uds server: scheduled reset type 0x{:02X} in {} ms",
            reset_type, self.config.power_down_time_ms
        );

        self.send_buf[1] = reset_type;
        const ENABLE_RAPID_POWER_SHUT_DOWN: u8 = 0x04;
        if reset_type == ENABLE_RAPID_POWER_SHUT_DOWN {
            let seconds = (self.config.power_down_time_ms / 1000).min(255) as u8;
            self.send_buf[2] = seconds;
            return Ok(2);
        }
        Ok(1)
    }

    fn h_read_data_by_identifier(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 3 || (req.len() - 1) % 2 != 0 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let mut offset = 1usize;
        for chunk in req[1..].chunks(2) {
            let did = BigEndian::read_u16(chunk);
            let before = offset;
            {
                let mut copier = Copier::new(&mut self.send_buf, &mut offset);
                copier.copy(&did.to_be_bytes())?;
                (self.event_handler.read_data_by_identifier)(did, &mut copier)?;
            }
            if offset == before + 2 {
                warn!("uds server: RDBI handler for DID 0x{:04X} wrote zero bytes", did);
                return Err(Nrc::GeneralReject);
            }
        }
        Ok(offset - 1)
    }

    /// Decodes the ALFI nibble pair shared by 0x23/0x34/0x35:
    /// high nibble = size-field byte count, low nibble = address-field byte
    /// count, each in `1..=8` (generalizing the original's `sizeof(size_t)`).
    pub(super) fn decode_address_and_length(buf: &[u8]) -> Result<(u64, u64, usize), Nrc> {
        if buf.is_empty() {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let alfi = buf[0];
        let addr_bytes = (alfi & 0x0F) as usize;
        let size_bytes = (alfi >> 4) as usize;
        if addr_bytes == 0 || addr_bytes > 8 || size_bytes == 0 || size_bytes > 8 {
            return Err(Nrc::RequestOutOfRange);
        }
        if buf.len() < 1 + addr_bytes + size_bytes {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let address = read_be_uint(&buf[1..1 + addr_bytes]);
        let size = read_be_uint(&buf[1 + addr_bytes..1 + addr_bytes + size_bytes]);
        Ok((address, size, 1 + addr_bytes + size_bytes))
    }

    fn h_read_memory_by_address(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let (address, size, _) = Self::decode_address_and_length(&req[1..])?;
        let mut offset = 1usize;
        let mut copier = Copier::new(&mut self.send_buf, &mut offset);
        (self.event_handler.read_memory_by_address)(address, size, &mut copier)?;
        Ok(offset - 1)
    }

    fn h_security_access(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub_function = req[1];
        if security_level_is_reserved(sub_function) {
            return Err(Nrc::RequestOutOfRange);
        }
        if !self.security_boot_delay_elapsed() {
            return Err(Nrc::RequiredTimeDelayNotExpired);
        }
        if !self.security_fail_delay_elapsed() {
            return Err(Nrc::ExceedNumberOfAttempts);
        }

        self.send_buf[1] = sub_function;
        if sub_function % 2 == 1 {
            let level = sub_function;
            if self.security_level >= level {
                self.send_buf[2] = 0;
                self.send_buf[3] = 0;
                return Ok(3);
            }
            let mut offset = 2usize;
            {
                let mut copier = Copier::new(&mut self.send_buf, &mut offset);
                (self.event_handler.security_access_request_seed)(
                    SecAccessRequestSeedArgs { level },
                    &mut copier,
                )?;
            }
            Ok(offset - 1)
        } else {
            let level = sub_function - 1;
            let key = &req[2..];
            match (self.event_handler.security_access_validate_key)(SecAccessValidateKeyArgs { level, key }) {
                Ok(()) => {
                    self.security_level = level;
                    info!("uds server: security level 0x{:02X} unlocked", level);
                    Ok(1)
                }
                Err(nrc) => {
                    self.security_fail_deadline = self.now() + self.config.sec_access_fail_delay_ms;
                    warn!("uds server: security key rejected, fail delay armed");
                    Err(nrc)
                }
            }
        }
    }

    fn h_communication_control(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 3 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let control_type = req[1] & 0x7F;
        let communication_type = req[2];
        (self.event_handler.communication_control)(control_type, communication_type)?;
        self.send_buf[1] = control_type;
        Ok(1)
    }

    fn h_write_data_by_identifier(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 3 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let did = BigEndian::read_u16(&req[1..3]);
        (self.event_handler.write_data_by_identifier)(WriteDataByIdentArgs { did, data: &req[3..] })?;
        BigEndian::write_u16(&mut self.send_buf[1..3], did);
        Ok(2)
    }

    fn h_routine_control(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub_function = req[1];
        const START: u8 = 0x01;
        const STOP: u8 = 0x02;
        const REQUEST_RESULTS: u8 = 0x03;
        if !matches!(sub_function, START | STOP | REQUEST_RESULTS) {
            return Err(Nrc::RequestOutOfRange);
        }
        let routine_id = BigEndian::read_u16(&req[2..4]);
        let mut offset = 4usize;
        {
            let mut copier = Copier::new(&mut self.send_buf, &mut offset);
            (self.event_handler.routine_control)(
                RoutineCtrlArgs { sub_function, routine_id, data: &req[4..] },
                &mut copier,
            )?;
        }
        self.send_buf[1] = sub_function;
        BigEndian::write_u16(&mut self.send_buf[2..4], routine_id);
        Ok(offset - 1)
    }

    fn h_request_download_upload(&mut self, req: &[u8], direction: TransferDirection) -> HandlerOutcome {
        if self.transfer.is_some() {
            return Err(Nrc::ConditionsNotCorrect);
        }
        if req.len() < 3 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let dfi = req[1];
        let (address, size, _) = Self::decode_address_and_length(&req[2..])?;

        let mtu = self.mtu as u64;
        let mut max_block_length = mtu;
        match direction {
            TransferDirection::Download => {
                (self.event_handler.request_download)(dfi, address, size, &mut max_block_length)?
            }
            TransferDirection::Upload => {
                (self.event_handler.request_upload)(dfi, address, size, &mut max_block_length)?
            }
        }
        max_block_length = max_block_length.min(mtu);
        if max_block_length < 3 {
            return Err(Nrc::RequestOutOfRange);
        }

        self.transfer = Some(super::Transfer {
            direction,
            block_sequence_counter: 1,
            byte_counter: 0,
            total_bytes: size,
            max_block_length,
        });
        info!(
            "uds server: transfer started ({:?}), address=0x{:X} size={} max_block={}",
            direction, address, size, max_block_length
        );

        // lengthFormatIdentifier is the fixed width of the size field, not the
        // minimal byte count (spec.md §4.3 "0x34/0x35": `sizeof(size_t) << 4`).
        const SIZE_T_BYTES: usize = std::mem::size_of::<u64>();
        self.send_buf[1] = (SIZE_T_BYTES as u8) << 4;
        let be = max_block_length.to_be_bytes();
        self.send_buf[2..2 + SIZE_T_BYTES].copy_from_slice(&be);
        Ok(1 + SIZE_T_BYTES)
    }

    fn h_transfer_data(&mut self, req: &[u8]) -> HandlerOutcome {
        let transfer = self.transfer.as_mut().ok_or(Nrc::UploadDownloadNotAccepted)?;
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let bsc = req[1];
        if bsc != transfer.block_sequence_counter {
            warn!(
                "uds server: transfer BSC mismatch, expected {}, got {}",
                transfer.block_sequence_counter, bsc
            );
            self.transfer = None;
            return Err(Nrc::RequestSequenceError);
        }

        let data = &req[2..];
        if transfer.byte_counter + data.len() as u64 > transfer.total_bytes {
            return Err(Nrc::TransferDataSuspended);
        }

        (self.event_handler.transfer_data)(TransferDataArgs { block_sequence_counter: bsc, data })?;

        let transfer = self.transfer.as_mut().expect("checked above");
        transfer.byte_counter += data.len() as u64;
        transfer.block_sequence_counter = transfer.block_sequence_counter.wrapping_add(1);
        self.send_buf[1] = bsc;
        Ok(1)
    }

    fn h_request_transfer_exit(&mut self, req: &[u8]) -> HandlerOutcome {
        if self.transfer.is_none() {
            return Err(Nrc::UploadDownloadNotAccepted);
        }
        let mut offset = 1usize;
        {
            let mut copier = Copier::new(&mut self.send_buf, &mut offset);
            (self.event_handler.request_transfer_exit)(&req[1..], &mut copier)?;
        }
        self.transfer = None;
        debug!("uds server: transfer exit, transfer state cleared");
        Ok(offset - 1)
    }

    fn h_request_file_transfer(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let mode_of_operation = req[1];
        let path_len = BigEndian::read_u16(&req[2..4]) as usize;
        if req.len() < 4 + path_len {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let path = std::str::from_utf8(&req[4..4 + path_len])
            .map_err(|_| Nrc::IncorrectMessageLengthOrInvalidFormat)?;
        let mut offset = 4 + path_len;

        let dfi = req.get(offset).copied();
        if dfi.is_some() {
            offset += 1;
        }

        let mut file_size_compressed = None;
        if let Some(&size_param_len) = req.get(offset) {
            let spl = size_param_len as usize;
            if spl > 0 && req.len() >= offset + 1 + 2 * spl {
                let u = read_be_uint(&req[offset + 1..offset + 1 + spl]);
                let c = read_be_uint(&req[offset + 1 + spl..offset + 1 + 2 * spl]);
                file_size_compressed = Some(c);
                self.transfer = Some(super::Transfer {
                    direction: TransferDirection::Download,
                    block_sequence_counter: 1,
                    byte_counter: 0,
                    total_bytes: u,
                    max_block_length: self.mtu as u64,
                });
            }
        }

        (self.event_handler.request_file_transfer)(mode_of_operation, path, dfi, file_size_compressed)?;
        self.send_buf[1] = mode_of_operation;
        Ok(1)
    }

    fn h_tester_present(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 || !matches!(req[1], 0x00 | 0x80) {
            return Err(Nrc::SubFunctionNotSupported);
        }
        self.s3_deadline = self.now() + self.config.s3_ms;
        self.send_buf[1] = req[1];
        Ok(1)
    }

    fn h_control_dtc_setting(&mut self, req: &[u8]) -> HandlerOutcome {
        if req.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let setting_type = req[1] & 0x3F;
        self.send_buf[1] = setting_type;
        Ok(1)
    }
}

/// ISO 14229-1's actual reserved `securityAccessType` range, `{0x00, 0x7F,
/// 0x43..=0x5E}`, diverging deliberately from `original_source/iso14229.c`'s
/// `UDSSecurityAccessLevelIsReserved` bit mask (see DESIGN.md).
fn security_level_is_reserved(level: u8) -> bool {
    level == 0x00 || level == 0x7F || (0x43..=0x5E).contains(&level)
}

fn read_be_uint(bytes: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in bytes {
        v = (v << 8) | b as u64;
    }
    v
}

//! The UDS tester-side request/response state machine (spec.md §4.2).
//!
//! Grounded on `examples/original_source/iso14229.c`'s client half
//! (`UDSClientInit`, `PollLowLevel`, `HandleServerResponse`, the
//! `UDSSend*`/`UDSUnpack*` builder family) reworked from its C state-machine
//! struct into a generic-over-transport `Client<T: Transport>`, in the shape
//! of the teacher's `PG<T: Transport>`/`OP<T: Transport>` connection types.

use byteorder::{BigEndian, ByteOrder};
use bitflags::bitflags;
use log::{debug, warn};

use crate::config::ClientConfig;
use crate::constant::{self, Sid};
use crate::error::{Error, Nrc};
use crate::time::{time_after_or_eq, Clock, Millis, MonotonicClock};
use crate::transport::{PortStatus, SduInfo, Transport};

bitflags! {
    /// Per-request option flags, snapshotted at send-start (spec.md §3
    /// "Recognised client option flags").
    pub struct ClientOptions: u32 {
        /// Sets the sub-function suppress bit; the client returns to IDLE
        /// right after the send completes, without awaiting a response.
        const SUPPRESS_POS_RESP = 0b0000_0001;
        /// Uses functional addressing; also returns to IDLE after send
        /// completes (no unicast response expected).
        const FUNCTIONAL = 0b0000_0010;
        /// Do not adopt the server's advertised P2/P2★ on a positive
        /// DiagnosticSessionControl response.
        const IGNORE_SRV_TIMINGS = 0b0000_0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Sending,
    AwaitSendComplete,
    AwaitResponse,
    ProcessResponse,
}

/// The event surfaced to the caller after a [`Client::poll`] tick.
#[derive(Debug)]
pub enum ClientEvent {
    /// Nothing of note happened this tick.
    Idle,
    /// The request has been fully handed off to the transport (emitted
    /// immediately for functional/suppressed requests instead of a response).
    SendComplete,
    /// A positive response was validated; `data` is the full response
    /// (including SID byte).
    ResponseReceived { data: Vec<u8> },
    /// The request failed terminally; the client has returned to IDLE.
    Err(Error),
}

/// The tester-side state machine. Generic over the [`Transport`] binding so
/// it can sit directly on an [`crate::isotp::IsoTpLink`] or a test mock.
pub struct Client<T: Transport> {
    transport: T,
    clock: MonotonicClock,
    state: State,
    request_sid: u8,
    request_subfn: u8,
    request_len: usize,
    options: ClientOptions,
    p2_ms: u32,
    p2_star_ms: u32,
    p2_deadline: Millis,
    ignore_server_timings: bool,
    sdu: SduInfo,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Client {
            transport,
            clock: MonotonicClock::new(),
            state: State::Idle,
            request_sid: 0,
            request_subfn: 0,
            request_len: 0,
            options: ClientOptions::empty(),
            p2_ms: config.p2_ms,
            p2_star_ms: config.p2_star_ms,
            p2_deadline: 0,
            ignore_server_timings: config.ignore_server_timings,
            sdu: SduInfo::physical(0, 0),
        }
    }

    /// Set the physical (or functional) addressing used by the next request.
    pub fn set_address(&mut self, sdu: SduInfo) {
        self.sdu = sdu;
    }

    fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    fn is_busy(&self) -> bool {
        self.state != State::Idle
    }

    /// Begin a request whose bytes have already been written into
    /// `self.transport.get_send_buf()[..len]`. `sid` and `sub_function`
    /// (byte 1, if the service has one) drive suppression and response
    /// validation.
    fn start_request(
        &mut self,
        sid: u8,
        sub_function: Option<u8>,
        len: usize,
        options: ClientOptions,
    ) -> Result<(), Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }

        self.options = options;
        if let Some(sf) = sub_function {
            if options.contains(ClientOptions::SUPPRESS_POS_RESP)
                && constant::sid_has_suppress_bit(sid)
            {
                let buf = self.transport.get_send_buf();
                buf[1] = sf | 0x80;
            }
        }

        let sdu = if options.contains(ClientOptions::FUNCTIONAL) {
            SduInfo::functional(self.sdu.source_address, self.sdu.target_address)
        } else {
            self.sdu
        };

        self.request_sid = sid;
        self.request_subfn = sub_function.unwrap_or(0);
        self.request_len = len;
        self.state = State::Sending;
        debug!("uds client: IDLE -> SENDING (sid 0x{:02X})", sid);

        self.transport
            .send(len, sdu)
            .map_err(|e| {
                self.state = State::Idle;
                e
            })?;
        self.state = State::AwaitSendComplete;
        Ok(())
    }

    /// Drive the state machine. Call at a cadence fine enough to meet P2
    /// (milliseconds). Returns the event, if any, that occurred this tick.
    pub fn poll(&mut self) -> Result<ClientEvent, Error> {
        let port_status = self.transport.poll()?;

        match self.state {
            State::Idle | State::Sending => Ok(ClientEvent::Idle),

            State::AwaitSendComplete => {
                if port_status.contains(PortStatus::ERR) {
                    self.state = State::Idle;
                    let err = Error::Transport("send failed".into());
                    warn!("uds client: send failed: {}", err);
                    return Ok(ClientEvent::Err(err));
                }
                if !port_status.contains(PortStatus::SEND_IN_PROGRESS) {
                    if self.options.contains(ClientOptions::SUPPRESS_POS_RESP)
                        || self.options.contains(ClientOptions::FUNCTIONAL)
                    {
                        self.state = State::Idle;
                        debug!("uds client: send complete, no response expected -> IDLE");
                        return Ok(ClientEvent::SendComplete);
                    }
                    self.state = State::AwaitResponse;
                    self.p2_deadline = self.now() + self.p2_ms;
                    debug!("uds client: AWAIT_SEND_COMPLETE -> AWAIT_RESPONSE");
                }
                Ok(ClientEvent::Idle)
            }

            State::AwaitResponse => {
                let (len, sdu) = self.transport.peek()?;
                if len == 0 {
                    if time_after_or_eq(self.now(), self.p2_deadline) {
                        self.state = State::Idle;
                        warn!("uds client: P2 timeout awaiting response to sid 0x{:02X}", self.request_sid);
                        return Ok(ClientEvent::Err(Error::Timeout));
                    }
                    return Ok(ClientEvent::Idle);
                }
                if sdu.is_functional() {
                    debug!("uds client: dropping functionally-addressed receive");
                    self.transport.ack_recv();
                    return Ok(ClientEvent::Idle);
                }
                self.state = State::ProcessResponse;
                self.handle_response()
            }

            State::ProcessResponse => self.handle_response(),
        }
    }

    fn handle_response(&mut self) -> Result<ClientEvent, Error> {
        let (len, _sdu) = self.transport.peek()?;
        let data = self.transport.peek_buf().to_vec();
        debug_assert_eq!(len, data.len());

        let result = self.validate_response(&data);
        match result {
            Ok(Some(())) => {
                // RCRRP: re-armed P2★ inside validate_response; stay waiting.
                self.transport.ack_recv();
                self.state = State::AwaitResponse;
                Ok(ClientEvent::Idle)
            }
            Ok(None) => {
                self.transport.ack_recv();
                self.state = State::Idle;
                debug!("uds client: response validated, -> IDLE");
                Ok(ClientEvent::ResponseReceived { data })
            }
            Err(e) => {
                self.transport.ack_recv();
                self.state = State::Idle;
                warn!("uds client: response error: {}", e);
                Ok(ClientEvent::Err(e))
            }
        }
    }

    /// Validates a received frame against the request in flight.
    ///
    /// Returns `Ok(Some(()))` if this was an RCRRP keep-alive (caller should
    /// keep waiting), `Ok(None)` if the response is positive and terminal,
    /// `Err` otherwise.
    fn validate_response(&mut self, data: &[u8]) -> Result<Option<()>, Error> {
        if data.is_empty() {
            return Err(Error::ResponseTooShort { got: 0 });
        }

        if data[0] == Sid::NegativeResponse as u8 {
            if data.len() < 3 {
                return Err(Error::ResponseTooShort { got: data.len() });
            }
            if data[1] != self.request_sid {
                return Err(Error::SidMismatch { want: self.request_sid, got: data[1] });
            }
            let nrc = Nrc::from(data[2]);
            if nrc.is_response_pending() {
                self.p2_deadline = self.now() + self.p2_star_ms;
                debug!("uds client: RCRRP, P2 re-armed to P2* ({} ms)", self.p2_star_ms);
                return Ok(Some(()));
            }
            return Err(Error::Negative(nrc));
        }

        let want_positive = Sid::from(self.request_sid).positive_response();
        if data[0] != want_positive {
            return Err(Error::SidMismatch { want: want_positive, got: data[0] });
        }

        if self.request_sid == Sid::EcuReset as u8 {
            if data.len() < 2 {
                return Err(Error::ResponseTooShort { got: data.len() });
            }
            if data[1] != self.request_subfn {
                return Err(Error::SubFunctionMismatch { want: self.request_subfn, got: data[1] });
            }
        }

        if self.request_sid == Sid::DiagnosticSessionControl as u8
            && !self.ignore_server_timings
            && data.len() >= 6
        {
            self.p2_ms = BigEndian::read_u16(&data[2..4]) as u32;
            self.p2_star_ms = BigEndian::read_u16(&data[4..6]) as u32 * 10;
            debug!(
                "uds client: adopted server timings p2={}ms p2*={}ms",
                self.p2_ms, self.p2_star_ms
            );
        }

        Ok(None)
    }

    // ---- per-service request builders ----

    pub fn diagnostic_session_control(&mut self, session_type: u8) -> Result<(), Error> {
        let buf = self.transport.get_send_buf();
        buf[0] = Sid::DiagnosticSessionControl as u8;
        buf[1] = session_type;
        self.start_request(Sid::DiagnosticSessionControl as u8, Some(session_type), 2, ClientOptions::empty())
    }

    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<(), Error> {
        let buf = self.transport.get_send_buf();
        buf[0] = Sid::EcuReset as u8;
        buf[1] = reset_type;
        self.start_request(Sid::EcuReset as u8, Some(reset_type), 2, ClientOptions::empty())
    }

    /// Encodes `22 DID_hi DID_lo …` for one or more DIDs.
    pub fn read_data_by_identifier(&mut self, dids: &[u16]) -> Result<(), Error> {
        if dids.is_empty() {
            return Err(Error::InvalidArgument("at least one DID is required".into()));
        }
        let need = 1 + dids.len() * 2;
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::ReadDataByIdentifier as u8;
            for (i, did) in dids.iter().enumerate() {
                BigEndian::write_u16(&mut buf[1 + i * 2..3 + i * 2], *did);
            }
        }
        self.start_request(Sid::ReadDataByIdentifier as u8, None, need, ClientOptions::empty())
    }

    /// Unpacks a positive `62 DID_hi DID_lo value[len] …` response, invoking
    /// `decode(did, value)` for each DID in request order.
    pub fn unpack_read_data_by_identifier(
        response: &[u8],
        dids: &[u16],
        mut decode: impl FnMut(u16, &[u8]) -> Result<usize, Error>,
    ) -> Result<(), Error> {
        let mut offset = 1usize;
        for want_did in dids {
            if offset + 2 > response.len() {
                return Err(Error::ResponseTooShort { got: response.len() });
            }
            let got_did = BigEndian::read_u16(&response[offset..offset + 2]);
            if got_did != *want_did {
                return Err(Error::DidMismatch { want: *want_did, got: got_did });
            }
            offset += 2;
            let consumed = decode(got_did, &response[offset..])?;
            offset += consumed;
        }
        Ok(())
    }

    /// `27 LV [data]`. Rejects reserved levels `{0x00, 0x7F, 0x43..=0x5E}`
    /// (ISO 14229-1's actual reserved range; see DESIGN.md for the documented
    /// divergence from the original's literal bit mask).
    pub fn security_access(&mut self, level: u8, data: &[u8]) -> Result<(), Error> {
        if level == 0x00 || level == 0x7F || (0x43..=0x5E).contains(&level) {
            return Err(Error::InvalidArgument(format!("reserved security level 0x{:02X}", level)));
        }
        let need = 2 + data.len();
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::SecurityAccess as u8;
            buf[1] = level;
            buf[2..need].copy_from_slice(data);
        }
        self.start_request(Sid::SecurityAccess as u8, Some(level), need, ClientOptions::empty())
    }

    pub fn communication_control(&mut self, control_type: u8, communication_type: u8) -> Result<(), Error> {
        let buf = self.transport.get_send_buf();
        buf[0] = Sid::CommunicationControl as u8;
        buf[1] = control_type;
        buf[2] = communication_type;
        self.start_request(Sid::CommunicationControl as u8, Some(control_type), 3, ClientOptions::empty())
    }

    pub fn write_data_by_identifier(&mut self, did: u16, data: &[u8]) -> Result<(), Error> {
        let need = 3 + data.len();
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::WriteDataByIdentifier as u8;
            BigEndian::write_u16(&mut buf[1..3], did);
            buf[3..need].copy_from_slice(data);
        }
        self.start_request(Sid::WriteDataByIdentifier as u8, None, need, ClientOptions::empty())
    }

    pub fn routine_control(&mut self, sub_function: u8, routine_id: u16, data: &[u8]) -> Result<(), Error> {
        let need = 4 + data.len();
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::RoutineControl as u8;
            buf[1] = sub_function;
            BigEndian::write_u16(&mut buf[2..4], routine_id);
            buf[4..need].copy_from_slice(data);
        }
        self.start_request(Sid::RoutineControl as u8, Some(sub_function), need, ClientOptions::empty())
    }

    fn alfi_byte_count(value: u64) -> u8 {
        if value == 0 {
            1
        } else {
            (8 - (value.leading_zeros() / 8)) as u8
        }
    }

    /// Shared encoder for `0x34`/`0x35`: `SID DFI ALFI addr_be size_be`.
    fn encode_download_upload(&mut self, sid: Sid, dfi: u8, address: u64, size: u64) -> Result<(), Error> {
        let addr_bytes = Self::alfi_byte_count(address);
        let size_bytes = Self::alfi_byte_count(size);
        let alfi = (size_bytes << 4) | addr_bytes;
        let need = 3 + addr_bytes as usize + size_bytes as usize;
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = sid as u8;
            buf[1] = dfi;
            buf[2] = alfi;
            let addr_be = address.to_be_bytes();
            buf[3..3 + addr_bytes as usize]
                .copy_from_slice(&addr_be[8 - addr_bytes as usize..]);
            let size_be = size.to_be_bytes();
            let off = 3 + addr_bytes as usize;
            buf[off..off + size_bytes as usize]
                .copy_from_slice(&size_be[8 - size_bytes as usize..]);
        }
        self.start_request(sid as u8, None, need, ClientOptions::empty())
    }

    pub fn request_download(&mut self, dfi: u8, address: u64, size: u64) -> Result<(), Error> {
        self.encode_download_upload(Sid::RequestDownload, dfi, address, size)
    }

    pub fn request_upload(&mut self, dfi: u8, address: u64, size: u64) -> Result<(), Error> {
        self.encode_download_upload(Sid::RequestUpload, dfi, address, size)
    }

    /// `36 BSC data`. `data.len()` must be ≤ `block_length - 2`, mirroring the
    /// original's `blockLength - 2` ceiling (2 bytes reserved for SID + BSC).
    pub fn transfer_data(&mut self, block_sequence_counter: u8, block_length: u16, data: &[u8]) -> Result<(), Error> {
        if data.len() + 2 > block_length as usize {
            return Err(Error::InvalidArgument(format!(
                "transfer data of {} bytes exceeds blockLength-2 ({})",
                data.len(),
                block_length.saturating_sub(2)
            )));
        }
        let need = 2 + data.len();
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::TransferData as u8;
            buf[1] = block_sequence_counter;
            buf[2..need].copy_from_slice(data);
        }
        self.start_request(Sid::TransferData as u8, None, need, ClientOptions::empty())
    }

    pub fn request_transfer_exit(&mut self) -> Result<(), Error> {
        let buf = self.transport.get_send_buf();
        buf[0] = Sid::RequestTransferExit as u8;
        self.start_request(Sid::RequestTransferExit as u8, None, 1, ClientOptions::empty())
    }

    /// `3E 00`, or `3E 80` when `options` carries `SUPPRESS_POS_RESP`.
    pub fn tester_present(&mut self) -> Result<(), Error> {
        self.tester_present_with_options(ClientOptions::empty())
    }

    pub fn tester_present_with_options(&mut self, options: ClientOptions) -> Result<(), Error> {
        let buf = self.transport.get_send_buf();
        buf[0] = Sid::TesterPresent as u8;
        buf[1] = 0x00;
        self.start_request(Sid::TesterPresent as u8, Some(0x00), 2, options)
    }

    /// `85 ST [data]`; rejects reserved setting types `{0x00, 0x7F, 0x03..=0x3F}`.
    pub fn control_dtc_setting(&mut self, setting_type: u8, data: &[u8]) -> Result<(), Error> {
        if setting_type == 0x00 || setting_type == 0x7F || (0x03..=0x3F).contains(&setting_type) {
            return Err(Error::InvalidArgument(format!("reserved DTC setting type 0x{:02X}", setting_type)));
        }
        let need = 2 + data.len();
        {
            let buf = self.transport.get_send_buf();
            if need > buf.len() {
                return Err(Error::BufferTooSmall { need, have: buf.len() });
            }
            buf[0] = Sid::ControlDtcSetting as u8;
            buf[1] = setting_type;
            buf[2..need].copy_from_slice(data);
        }
        self.start_request(Sid::ControlDtcSetting as u8, Some(setting_type), need, ClientOptions::empty())
    }

    /// `38 mode path_len_be path DFI? size params?`. `file_path` is encoded
    /// as UTF-8 and length-prefixed with a big-endian `u16`.
    pub fn request_file_transfer(
        &mut self,
        mode_of_operation: u8,
        file_path: &str,
        data_format_identifier: Option<u8>,
        file_size_uncompressed: Option<u64>,
        file_size_compressed: Option<u64>,
    ) -> Result<(), Error> {
        let path_bytes = file_path.as_bytes();
        let mut need = 1 + 1 + 2 + path_bytes.len();
        if data_format_identifier.is_some() {
            need += 1;
        }
        let size_param_len = match (file_size_uncompressed, file_size_compressed) {
            (Some(u), Some(_)) => Self::alfi_byte_count(u),
            _ => 0,
        };
        if size_param_len > 0 {
            need += 1 + 2 * size_param_len as usize;
        }

        let buf = self.transport.get_send_buf();
        if need > buf.len() {
            return Err(Error::BufferTooSmall { need, have: buf.len() });
        }
        let mut off = 0;
        buf[off] = Sid::RequestFileTransfer as u8;
        off += 1;
        buf[off] = mode_of_operation;
        off += 1;
        BigEndian::write_u16(&mut buf[off..off + 2], path_bytes.len() as u16);
        off += 2;
        buf[off..off + path_bytes.len()].copy_from_slice(path_bytes);
        off += path_bytes.len();
        if let Some(dfi) = data_format_identifier {
            buf[off] = dfi;
            off += 1;
        }
        if let (Some(u), Some(c)) = (file_size_uncompressed, file_size_compressed) {
            buf[off] = size_param_len;
            off += 1;
            let u_be = u.to_be_bytes();
            buf[off..off + size_param_len as usize]
                .copy_from_slice(&u_be[8 - size_param_len as usize..]);
            off += size_param_len as usize;
            let c_be = c.to_be_bytes();
            buf[off..off + size_param_len as usize]
                .copy_from_slice(&c_be[8 - size_param_len as usize..]);
            off += size_param_len as usize;
        }
        debug_assert_eq!(off, need);
        self.start_request(Sid::RequestFileTransfer as u8, None, need, ClientOptions::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alfi_byte_count_is_minimal() {
        assert_eq!(Client::<super::transport_tests::NullTransport>::alfi_byte_count(0), 1);
        assert_eq!(Client::<super::transport_tests::NullTransport>::alfi_byte_count(0xFF), 1);
        assert_eq!(Client::<super::transport_tests::NullTransport>::alfi_byte_count(0x100), 2);
        assert_eq!(Client::<super::transport_tests::NullTransport>::alfi_byte_count(0x0800_0000), 4);
    }

    #[test]
    fn security_access_rejects_reserved_levels() {
        let mut cl = Client::new(super::transport_tests::NullTransport::default(), ClientConfig::default());
        assert!(cl.security_access(0x00, &[]).is_err());
        assert!(cl.security_access(0x7F, &[]).is_err());
        assert!(cl.security_access(0x50, &[]).is_err());
        assert!(cl.security_access(0x01, &[]).is_ok());
    }

    #[test]
    fn control_dtc_setting_rejects_reserved_types() {
        let mut cl = Client::new(super::transport_tests::NullTransport::default(), ClientConfig::default());
        assert!(cl.control_dtc_setting(0x00, &[]).is_err());
        assert!(cl.control_dtc_setting(0x20, &[]).is_err());
        assert!(cl.control_dtc_setting(0x01, &[]).is_ok());
    }

    #[test]
    fn unpack_rdbi_walks_tuples_in_request_order() {
        let response = [0x62, 0xF1, 0x90, b'V', b'I', b'N'];
        let mut seen = Vec::new();
        Client::<super::transport_tests::NullTransport>::unpack_read_data_by_identifier(
            &response,
            &[0xF190],
            |did, value| {
                seen.push((did, value[..3].to_vec()));
                Ok(3)
            },
        )
        .unwrap();
        assert_eq!(seen, vec![(0xF190, b"VIN".to_vec())]);
    }

    #[test]
    fn unpack_rdbi_detects_did_mismatch() {
        let response = [0x62, 0xF1, 0x91, b'V'];
        let err = Client::<super::transport_tests::NullTransport>::unpack_read_data_by_identifier(
            &response,
            &[0xF190],
            |_, _| Ok(1),
        );
        assert!(matches!(err, Err(Error::DidMismatch { want: 0xF190, got: 0xF191 })));
    }
}

/// Test-only minimal [`Transport`] so unit tests above can construct a
/// [`Client`] without pulling in `tests/common`.
#[cfg(test)]
pub(crate) mod transport_tests {
    use super::*;

    pub struct NullTransport {
        buf: [u8; 4095],
    }

    impl Default for NullTransport {
        fn default() -> Self {
            NullTransport { buf: [0u8; 4095] }
        }
    }

    impl Transport for NullTransport {
        fn poll(&mut self) -> Result<PortStatus, Error> {
            Ok(PortStatus::IDLE)
        }
        fn send(&mut self, _len: usize, _sdu: SduInfo) -> Result<usize, Error> {
            Ok(0)
        }
        fn peek(&mut self) -> Result<(usize, SduInfo), Error> {
            Ok((0, SduInfo::physical(0, 0)))
        }
        fn peek_buf(&self) -> &[u8] {
            &[]
        }
        fn ack_recv(&mut self) {}
        fn get_send_buf(&mut self) -> &mut [u8] {
            &mut self.buf
        }
        fn mtu(&self) -> usize {
            self.buf.len()
        }
    }
}

//! The ECU-side dispatch and timing core (spec.md §4.3).
//!
//! Grounded on `examples/petar-dambovaliev-s7/src/client.rs`'s
//! generic-over-transport struct shape (reused here for the server side of
//! the same wire) and, for behaviour, on
//! `examples/original_source/iso14229.c`'s server half: `getServiceForSID`,
//! `evaluateServiceResponse`, `NegativeResponse`/`NoResponse`, `ResetTransfer`.
//! The poll-loop/timer sequencing in [`Server::poll`] is not present in the
//! filtered original source (header-only state machine); it follows spec.md
//! §4.3's five-step description directly.

pub mod handlers;

use log::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::constant::{self, Sid};
use crate::error::{Error, Nrc};
use crate::event::{
    ErrArgs, RoutineCtrlArgs, SecAccessRequestSeedArgs, SecAccessValidateKeyArgs, TransferDataArgs,
    WriteDataByIdentArgs,
};
use crate::time::{time_after_or_eq, Clock, Millis, MonotonicClock};
use crate::transport::{PortStatus, SduInfo, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    direction: TransferDirection,
    block_sequence_counter: u8,
    byte_counter: u64,
    total_bytes: u64,
    max_block_length: u64,
}

/// Application handlers, one per UDS service event (spec.md §6 "Event
/// callback"). Unset handlers default to returning `PositiveResponse`/`0`,
/// except where ISO 14229-1 demands a rejection by default (security access
/// validation, whose default is `InvalidKey`, and transfers, whose sizing
/// callback defaults to "no shrink").
pub struct EventHandlers {
    pub diag_session_control: Box<dyn FnMut(u8) -> Result<(), Nrc>>,
    pub ecu_reset: Box<dyn FnMut(u8) -> Result<(), Nrc>>,
    pub read_data_by_identifier: Box<dyn FnMut(u16, &mut crate::event::Copier) -> Result<(), Nrc>>,
    pub read_memory_by_address: Box<dyn FnMut(u64, u64, &mut crate::event::Copier) -> Result<(), Nrc>>,
    pub security_access_request_seed:
        Box<dyn FnMut(SecAccessRequestSeedArgs, &mut crate::event::Copier) -> Result<(), Nrc>>,
    pub security_access_validate_key: Box<dyn FnMut(SecAccessValidateKeyArgs) -> Result<(), Nrc>>,
    pub communication_control: Box<dyn FnMut(u8, u8) -> Result<(), Nrc>>,
    pub write_data_by_identifier: Box<dyn FnMut(WriteDataByIdentArgs) -> Result<(), Nrc>>,
    pub routine_control: Box<dyn FnMut(RoutineCtrlArgs, &mut crate::event::Copier) -> Result<(), Nrc>>,
    pub request_download: Box<dyn FnMut(u8, u64, u64, &mut u64) -> Result<(), Nrc>>,
    pub request_upload: Box<dyn FnMut(u8, u64, u64, &mut u64) -> Result<(), Nrc>>,
    pub transfer_data: Box<dyn FnMut(TransferDataArgs) -> Result<(), Nrc>>,
    pub request_transfer_exit: Box<dyn FnMut(&[u8], &mut crate::event::Copier) -> Result<(), Nrc>>,
    pub request_file_transfer: Box<dyn FnMut(u8, &str, Option<u8>, Option<u64>) -> Result<(), Nrc>>,
    pub custom_handler: Box<dyn FnMut(u8, &[u8]) -> Result<usize, Nrc>>,
    pub session_timeout: Box<dyn FnMut()>,
    pub do_scheduled_reset: Box<dyn FnMut(u8)>,
    pub err: Box<dyn FnMut(ErrArgs)>,
}

impl Default for EventHandlers {
    fn default() -> Self {
        EventHandlers {
            diag_session_control: Box::new(|_| Ok(())),
            ecu_reset: Box::new(|_| Ok(())),
            read_data_by_identifier: Box::new(|_, _| Ok(())),
            read_memory_by_address: Box::new(|_, _, _| Ok(())),
            security_access_request_seed: Box::new(|_, _| Ok(())),
            security_access_validate_key: Box::new(|_| Err(Nrc::InvalidKey)),
            communication_control: Box::new(|_, _| Ok(())),
            write_data_by_identifier: Box::new(|_| Ok(())),
            routine_control: Box::new(|_, _| Ok(())),
            request_download: Box::new(|_, _, _, _| Ok(())),
            request_upload: Box::new(|_, _, _, _| Ok(())),
            transfer_data: Box::new(|_| Ok(())),
            request_transfer_exit: Box::new(|_, _| Ok(())),
            request_file_transfer: Box::new(|_, _, _, _| Ok(())),
            custom_handler: Box::new(|_, _| Err(Nrc::ServiceNotSupported)),
            session_timeout: Box::new(|| {}),
            do_scheduled_reset: Box::new(|_| {}),
            err: Box::new(|_| {}),
        }
    }
}

/// Event surfaced to the caller after a [`Server::poll`] tick, for
/// observability beyond what the [`EventHandlers`] callbacks already cover.
#[derive(Debug)]
pub enum ServerEvent {
    Idle,
    Dispatched { sid: u8 },
    ResponseSent { len: usize },
    SessionTimeout,
    ScheduledReset { reset_type: u8 },
}

/// The ECU-side state machine. Generic over [`Transport`] like [`crate::client::Client`].
pub struct Server<T: Transport> {
    transport: T,
    clock: MonotonicClock,
    config: ServerConfig,
    event_handler: EventHandlers,
    mtu: usize,

    session_type: u8,
    security_level: u8,
    s3_deadline: Millis,
    security_boot_deadline: Millis,
    security_fail_deadline: Millis,

    reset_scheduled: Option<u8>,
    reset_deadline: Millis,
    not_ready_to_receive: bool,

    transfer: Option<Transfer>,

    request_in_progress: bool,
    rcrrp: bool,
    p2_deadline: Millis,
    pending_request: Vec<u8>,
    pending_sdu: SduInfo,
    send_buf: Vec<u8>,
    response_len: usize,
    response_is_positive: bool,
    suppress_response: bool,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig, event_handler: EventHandlers) -> Self {
        let mtu = transport.mtu();
        let now_clock = MonotonicClock::new();
        Server {
            transport,
            clock: now_clock,
            config,
            event_handler,
            mtu,
            session_type: 0x01,
            security_level: 0,
            s3_deadline: 0,
            security_boot_deadline: config.sec_access_boot_delay_ms,
            security_fail_deadline: 0,
            reset_scheduled: None,
            reset_deadline: 0,
            not_ready_to_receive: false,
            transfer: None,
            request_in_progress: false,
            rcrrp: false,
            p2_deadline: 0,
            pending_request: Vec::new(),
            pending_sdu: SduInfo::physical(0, 0),
            send_buf: vec![0u8; mtu.max(4095)],
            response_len: 0,
            response_is_positive: false,
            suppress_response: false,
        }
    }

    fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    fn security_boot_delay_elapsed(&self) -> bool {
        time_after_or_eq(self.now(), self.security_boot_deadline)
    }

    fn security_fail_delay_elapsed(&self) -> bool {
        time_after_or_eq(self.now(), self.security_fail_deadline)
    }

    /// Builds the full `SID|0x40 [subfn] payload` or `7F SID NRC` frame from
    /// a handler outcome, staging it in `self.send_buf` and recording
    /// suppression per spec.md §4.3 "Sub-function suppression".
    fn stage_response(&mut self, outcome: handlers::HandlerOutcome) {
        let req_sid = self.pending_request[0];
        let sub_function = self.pending_request.get(1).copied();
        self.suppress_response = false;

        match outcome {
            Ok(payload_len) => {
                self.response_is_positive = true;
                self.send_buf[0] = Sid::from(req_sid).positive_response();
                self.response_len = 1 + payload_len;
                self.rcrrp = false;

                if let Some(sf) = sub_function {
                    if constant::sid_has_suppress_bit(req_sid) && sf & 0x80 != 0 {
                        debug!("uds server: suppressing positive response to sid 0x{:02X}", req_sid);
                        self.suppress_response = true;
                    }
                }
            }
            Err(nrc) => {
                self.response_is_positive = false;
                self.send_buf[0] = Sid::NegativeResponse as u8;
                self.send_buf[1] = req_sid;
                self.send_buf[2] = nrc.as_u8();
                self.response_len = 3;

                if self.pending_sdu.is_functional()
                    && matches!(
                        nrc,
                        Nrc::ServiceNotSupported
                            | Nrc::SubFunctionNotSupported
                            | Nrc::ServiceNotSupportedInActiveSession
                            | Nrc::SubFunctionNotSupportedInActiveSession
                            | Nrc::RequestOutOfRange
                    )
                {
                    debug!("uds server: suppressing NRC {} for functional request", nrc);
                    self.suppress_response = true;
                }

                if nrc.is_response_pending() {
                    self.rcrrp = true;
                } else {
                    self.rcrrp = false;
                }
            }
        }
    }

    fn dispatch_and_stage(&mut self) {
        let req = self.pending_request.clone();
        let outcome = self.dispatch(&req);
        self.stage_response(outcome);
    }

    fn transmit_response(&mut self) -> Result<(), Error> {
        if !self.suppress_response {
            let buf = self.transport.get_send_buf();
            let len = self.response_len.min(buf.len());
            buf[..len].copy_from_slice(&self.send_buf[..len]);
            self.transport.send(len, self.pending_sdu)?;
            trace!("uds server: transmitted {} bytes (positive={})", len, self.response_is_positive);
        }

        if self.rcrrp {
            self.p2_deadline =
                self.now() + (self.config.p2_star_ms * constant::RCRRP_FRACTION_NUM) / constant::RCRRP_FRACTION_DEN;
        } else {
            self.p2_deadline = self.now() + self.config.p2_ms;
            self.request_in_progress = false;
        }
        Ok(())
    }

    /// Drive the state machine. Call at a cadence fine enough to meet P2.
    pub fn poll(&mut self) -> Result<ServerEvent, Error> {
        self.transport.poll()?;
        let now = self.now();
        let mut event = ServerEvent::Idle;

        if self.session_type != 0x01 && time_after_or_eq(now, self.s3_deadline) {
            (self.event_handler.session_timeout)();
            self.session_type = 0x01;
            info!("uds server: S3 expired, reverted to default session");
            event = ServerEvent::SessionTimeout;
        }

        if let Some(reset_type) = self.reset_scheduled {
            if time_after_or_eq(now, self.reset_deadline) {
                (self.event_handler.do_scheduled_reset)(reset_type);
                self.reset_scheduled = None;
                self.not_ready_to_receive = false;
                info!("uds server: executing scheduled reset type 0x{:02X}", reset_type);
                event = ServerEvent::ScheduledReset { reset_type };
            }
        }

        if !self.request_in_progress {
            let (len, sdu) = self.transport.peek()?;
            if len > 0 {
                self.pending_request = self.transport.peek_buf().to_vec();
                self.pending_sdu = sdu;
                self.transport.ack_recv();
                self.request_in_progress = true;
                self.p2_deadline = now + self.config.p2_ms;
                let sid = self.pending_request[0];
                debug!("uds server: accepted request sid 0x{:02X}", sid);
                self.dispatch_and_stage();
                event = ServerEvent::Dispatched { sid };
            }
        } else if self.rcrrp {
            trace!("uds server: re-dispatching pending RCRRP request");
            self.dispatch_and_stage();
        }

        if self.request_in_progress && time_after_or_eq(now, self.p2_deadline) {
            let len = self.response_len;
            self.transmit_response()?;
            event = ServerEvent::ResponseSent { len };
        }

        Ok(event)
    }
}

//! Service identifiers and the default timing/sizing constants ISO 14229-2
//! recommends for a tester/ECU pair.

/// UDS Service Identifier, the first byte of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Sid {
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    ReadDataByIdentifier = 0x22,
    ReadMemoryByAddress = 0x23,
    SecurityAccess = 0x27,
    CommunicationControl = 0x28,
    WriteDataByIdentifier = 0x2E,
    RoutineControl = 0x31,
    RequestDownload = 0x34,
    RequestUpload = 0x35,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    RequestFileTransfer = 0x38,
    TesterPresent = 0x3E,
    ControlDtcSetting = 0x85,
    NegativeResponse = 0x7F,
}

impl Sid {
    /// The byte value that marks a positive response to this service, i.e. `SID | 0x40`.
    pub fn positive_response(self) -> u8 {
        (self as u8).wrapping_add(0x40)
    }
}

impl From<u8> for Sid {
    fn from(b: u8) -> Self {
        match b {
            0x10 => Sid::DiagnosticSessionControl,
            0x11 => Sid::EcuReset,
            0x22 => Sid::ReadDataByIdentifier,
            0x23 => Sid::ReadMemoryByAddress,
            0x27 => Sid::SecurityAccess,
            0x28 => Sid::CommunicationControl,
            0x2E => Sid::WriteDataByIdentifier,
            0x31 => Sid::RoutineControl,
            0x34 => Sid::RequestDownload,
            0x35 => Sid::RequestUpload,
            0x36 => Sid::TransferData,
            0x37 => Sid::RequestTransferExit,
            0x38 => Sid::RequestFileTransfer,
            0x3E => Sid::TesterPresent,
            0x85 => Sid::ControlDtcSetting,
            _ => Sid::NegativeResponse,
        }
    }
}

/// Does this SID carry a sub-function byte whose bit 7 is the "suppress
/// positive response" flag? (spec.md §4.3, "Sub-function suppression")
pub fn sid_has_suppress_bit(sid: u8) -> bool {
    matches!(sid, 0x10 | 0x11 | 0x27 | 0x28 | 0x31 | 0x3E | 0x85)
}

/// Default P2 server-response timeout, milliseconds (ISO 14229-2 Table 4).
pub const DEFAULT_P2_MS: u32 = 50;
/// Default P2★ (post-RCRRP) server-response timeout, milliseconds.
pub const DEFAULT_P2_STAR_MS: u32 = 5000;
/// Default S3 session-inactivity timeout, milliseconds.
pub const DEFAULT_S3_MS: u32 = 5000;
/// RCRRP re-arm cadence is `RCRRP_FRACTION_NUM / RCRRP_FRACTION_DEN` of P2★
/// (ISO 14229-2 Table 4, footnote): `0.3 * p2_star_ms`.
pub const RCRRP_FRACTION_NUM: u32 = 3;
pub const RCRRP_FRACTION_DEN: u32 = 10;

/// Default power-down time the server schedules a deferred ECU reset at, ms.
pub const DEFAULT_POWER_DOWN_TIME_MS: u32 = 0;
/// Default security-access boot delay before the first 0x27 is accepted, ms.
pub const DEFAULT_SEC_ACCESS_BOOT_DELAY_MS: u32 = 0;
/// Default security-access auth-fail delay armed after a bad key, ms.
pub const DEFAULT_SEC_ACCESS_FAIL_DELAY_MS: u32 = 1000;

/// Maximum single-frame / functional-addressed payload, bytes.
pub const MAX_SF_LEN: usize = 7;
/// Default ISO-TP link buffer size; large enough for typical flashing blocks.
pub const DEFAULT_BUFFER_SIZE: usize = 4095;

pub const RCRRP: u8 = 0x78;

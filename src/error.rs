//! Error types: the ISO 14229-1 negative response code space, and the local
//! errors raised by client/server misuse, transport failure, and frame parsing.

use std::fmt;

use thiserror::Error as ThisError;

/// A Negative Response Code, as carried in byte 2 of a `7F SID NRC` response.
///
/// `0x00` doubles as "positive response" in dispatch tables; `0x78`
/// (`RequestCorrectlyReceivedResponsePending`) is the non-terminal keep-alive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Nrc {
    PositiveResponse = 0x00,
    GeneralReject = 0x10,
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLengthOrInvalidFormat = 0x13,
    ResponseTooLong = 0x14,
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    NoResponseFromSubnetComponent = 0x25,
    FailurePreventsExecutionOfRequestedAction = 0x26,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceedNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,
    UploadDownloadNotAccepted = 0x70,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    RequestCorrectlyReceivedResponsePending = 0x78,
    SubFunctionNotSupportedInActiveSession = 0x7E,
    ServiceNotSupportedInActiveSession = 0x7F,
    /// Any NRC byte this crate does not name explicitly (ISO 14229-1 reserves
    /// several ranges for future use or vehicle-manufacturer definition).
    Other(u8),
}

impl Nrc {
    pub fn as_u8(self) -> u8 {
        match self {
            Nrc::PositiveResponse => 0x00,
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Nrc::ResponseTooLong => 0x14,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestSequenceError => 0x24,
            Nrc::NoResponseFromSubnetComponent => 0x25,
            Nrc::FailurePreventsExecutionOfRequestedAction => 0x26,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceedNumberOfAttempts => 0x36,
            Nrc::RequiredTimeDelayNotExpired => 0x37,
            Nrc::UploadDownloadNotAccepted => 0x70,
            Nrc::TransferDataSuspended => 0x71,
            Nrc::GeneralProgrammingFailure => 0x72,
            Nrc::WrongBlockSequenceCounter => 0x73,
            Nrc::RequestCorrectlyReceivedResponsePending => 0x78,
            Nrc::SubFunctionNotSupportedInActiveSession => 0x7E,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::Other(b) => b,
        }
    }

    pub fn is_positive(self) -> bool {
        self.as_u8() == 0x00
    }

    pub fn is_response_pending(self) -> bool {
        self.as_u8() == 0x78
    }
}

impl From<u8> for Nrc {
    fn from(b: u8) -> Self {
        match b {
            0x00 => Nrc::PositiveResponse,
            0x10 => Nrc::GeneralReject,
            0x11 => Nrc::ServiceNotSupported,
            0x12 => Nrc::SubFunctionNotSupported,
            0x13 => Nrc::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Nrc::ResponseTooLong,
            0x21 => Nrc::BusyRepeatRequest,
            0x22 => Nrc::ConditionsNotCorrect,
            0x24 => Nrc::RequestSequenceError,
            0x25 => Nrc::NoResponseFromSubnetComponent,
            0x26 => Nrc::FailurePreventsExecutionOfRequestedAction,
            0x31 => Nrc::RequestOutOfRange,
            0x33 => Nrc::SecurityAccessDenied,
            0x35 => Nrc::InvalidKey,
            0x36 => Nrc::ExceedNumberOfAttempts,
            0x37 => Nrc::RequiredTimeDelayNotExpired,
            0x70 => Nrc::UploadDownloadNotAccepted,
            0x71 => Nrc::TransferDataSuspended,
            0x72 => Nrc::GeneralProgrammingFailure,
            0x73 => Nrc::WrongBlockSequenceCounter,
            0x78 => Nrc::RequestCorrectlyReceivedResponsePending,
            0x7E => Nrc::SubFunctionNotSupportedInActiveSession,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Other(other),
        }
    }
}

impl fmt::Display for Nrc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Nrc::PositiveResponse => "positiveResponse",
            Nrc::GeneralReject => "generalReject",
            Nrc::ServiceNotSupported => "serviceNotSupported",
            Nrc::SubFunctionNotSupported => "subFunctionNotSupported",
            Nrc::IncorrectMessageLengthOrInvalidFormat => "incorrectMessageLengthOrInvalidFormat",
            Nrc::ResponseTooLong => "responseTooLong",
            Nrc::BusyRepeatRequest => "busyRepeatRequest",
            Nrc::ConditionsNotCorrect => "conditionsNotCorrect",
            Nrc::RequestSequenceError => "requestSequenceError",
            Nrc::NoResponseFromSubnetComponent => "noResponseFromSubnetComponent",
            Nrc::FailurePreventsExecutionOfRequestedAction => {
                "failurePreventsExecutionOfRequestedAction"
            }
            Nrc::RequestOutOfRange => "requestOutOfRange",
            Nrc::SecurityAccessDenied => "securityAccessDenied",
            Nrc::InvalidKey => "invalidKey",
            Nrc::ExceedNumberOfAttempts => "exceedNumberOfAttempts",
            Nrc::RequiredTimeDelayNotExpired => "requiredTimeDelayNotExpired",
            Nrc::UploadDownloadNotAccepted => "uploadDownloadNotAccepted",
            Nrc::TransferDataSuspended => "transferDataSuspended",
            Nrc::GeneralProgrammingFailure => "generalProgrammingFailure",
            Nrc::WrongBlockSequenceCounter => "wrongBlockSequenceCounter",
            Nrc::RequestCorrectlyReceivedResponsePending => {
                "requestCorrectlyReceivedResponsePending"
            }
            Nrc::SubFunctionNotSupportedInActiveSession => {
                "subFunctionNotSupportedInActiveSession"
            }
            Nrc::ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            Nrc::Other(_) => "isoSaeReserved",
        };
        write!(f, "{} (0x{:02X})", name, self.as_u8())
    }
}

/// Errors surfaced across the client/server API boundary.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("negative response: {0}")]
    Negative(Nrc),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("client is busy with a prior request")]
    Busy,

    #[error("response too short ({got} bytes)")]
    ResponseTooShort { got: usize },

    #[error("response SID 0x{got:02X} does not match request SID 0x{want:02X}")]
    SidMismatch { want: u8, got: u8 },

    #[error("response sub-function 0x{got:02X} does not match request sub-function 0x{want:02X}")]
    SubFunctionMismatch { want: u8, got: u8 },

    #[error("unexpected DID 0x{got:04X}, expected 0x{want:04X}")]
    DidMismatch { want: u16, got: u16 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no transfer is active")]
    NoActiveTransfer,

    #[error("ISO-TP: {0}")]
    IsoTp(#[from] crate::isotp::Error),
}

impl Error {
    pub fn negative(nrc: impl Into<Nrc>) -> Self {
        Error::Negative(nrc.into())
    }
}

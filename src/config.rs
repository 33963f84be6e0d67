//! Construction-time configuration for [`crate::client::Client`] and
//! [`crate::server::Server`], grouped the way the teacher groups TCP connection
//! parameters in a plain, `Default`-able options struct.

use crate::constant;

/// Timing parameters for a UDS client session.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Maximum wait for a normal response, milliseconds.
    pub p2_ms: u32,
    /// Maximum wait for a response after an RCRRP keep-alive, milliseconds.
    pub p2_star_ms: u32,
    /// If set, a positive DiagnosticSessionControl response's advertised
    /// P2/P2★ values are not adopted.
    pub ignore_server_timings: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            p2_ms: constant::DEFAULT_P2_MS,
            p2_star_ms: constant::DEFAULT_P2_STAR_MS,
            ignore_server_timings: false,
        }
    }
}

impl ClientConfig {
    /// Clamps `p2_star_ms` up to `p2_ms` if the caller passed an inconsistent pair.
    pub fn new(p2_ms: u32, p2_star_ms: u32) -> Self {
        ClientConfig {
            p2_ms,
            p2_star_ms: p2_star_ms.max(p2_ms),
            ..Default::default()
        }
    }
}

/// Timing and policy parameters for a UDS server.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub p2_ms: u32,
    pub p2_star_ms: u32,
    /// Session-inactivity timeout; on expiry the server reverts to the default session.
    pub s3_ms: u32,
    /// Delay after server creation before the first SecurityAccess request is accepted.
    pub sec_access_boot_delay_ms: u32,
    /// Delay armed after an invalid SecurityAccess key, rejecting further attempts.
    pub sec_access_fail_delay_ms: u32,
    /// Default deferred-reset delay when a handler doesn't override it.
    pub power_down_time_ms: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            p2_ms: constant::DEFAULT_P2_MS,
            p2_star_ms: constant::DEFAULT_P2_STAR_MS,
            s3_ms: constant::DEFAULT_S3_MS,
            sec_access_boot_delay_ms: constant::DEFAULT_SEC_ACCESS_BOOT_DELAY_MS,
            sec_access_fail_delay_ms: constant::DEFAULT_SEC_ACCESS_FAIL_DELAY_MS,
            power_down_time_ms: constant::DEFAULT_POWER_DOWN_TIME_MS,
        }
    }
}

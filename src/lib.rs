//! This crate provides the UDS (ISO 14229-1) diagnostic service layer and the
//! ISO-TP (ISO 15765-2) transport that segments and reassembles diagnostic
//! messages over an 8-byte CAN frame substrate.
//!
//! Three pieces compose, leaves first:
//!
//! - [`isotp`] — the per-direction segmentation/reassembly state machine
//!   (Single/First/Consecutive/Flow-Control frames).
//! - [`client`] — the tester-side request/response state machine.
//! - [`server`] — the ECU-side dispatch and timing core.
//!
//! Both peers are driven by an abstract [`transport::Transport`] port; this
//! crate ships no concrete CAN socket binding. See `tests/common` for an
//! in-process mock used by this crate's own integration tests.
//!
//! # Examples
//! ```no_run
//! use udsisotp::{client::Client, config::ClientConfig, transport::Transport};
//!
//! fn send_tester_present<T: Transport>(transport: T) {
//!     let mut cl = Client::new(transport, ClientConfig::default());
//!     cl.tester_present().unwrap();
//!     loop {
//!         match cl.poll() {
//!             Ok(_) => {}
//!             Err(e) => {
//!                 println!("{}", e);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod config;
mod constant;
pub mod error;
pub mod event;
pub mod isotp;
pub mod server;
pub mod time;
pub mod transport;

pub use error::Error;

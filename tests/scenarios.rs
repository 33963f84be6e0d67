//! End-to-end client/server scenarios over the in-process [`common::MockPort`],
//! one test per literal scenario in spec.md §8. Structured the way
//! `examples/petar-dambovaliev-s7/tests/integration_test.rs` drives a real
//! peer end to end rather than exercising modules in isolation.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use udsisotp::client::{Client, ClientEvent, ClientOptions};
use udsisotp::config::{ClientConfig, ServerConfig};
use udsisotp::error::{Error, Nrc};
use udsisotp::server::{EventHandlers, Server, ServerEvent};
use udsisotp::transport::SduInfo;

use common::MockPort;

/// Drives `client` and `server` alternately until `until` returns `Some`, or
/// `max_ticks` elapses — this crate's timers are real-time (spec.md §5's
/// monotonic clock), so each tick sleeps briefly rather than spinning.
fn drive<T, F>(client: &mut Client<MockPort>, server: &mut Server<MockPort>, max_ticks: u32, mut until: F) -> T
where
    F: FnMut(&mut Client<MockPort>, &mut Server<MockPort>) -> Option<T>,
{
    for _ in 0..max_ticks {
        server.poll().expect("server poll");
        if let Some(v) = until(client, server) {
            return v;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("scenario did not converge within {} ticks", max_ticks);
}

/// Scenario 1: positive DiagnosticSessionControl, wire `10 01` -> `50 01 00 32 01 F4`.
#[test]
fn positive_diagnostic_session_control() {
    let (client_port, server_port) = MockPort::pair(4095);
    let mut client = Client::new(client_port, ClientConfig::default());
    let mut server = Server::new(server_port, ServerConfig::default(), EventHandlers::default());

    client.diagnostic_session_control(0x01).unwrap();

    let response = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { data } => Some(data),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });

    assert_eq!(response, vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]);
}

/// Scenario 2: negative SecurityAccess with a wrong key, `27 02 DE AD BE EF` -> `7F 27 35`.
#[test]
fn security_access_wrong_key_is_rejected() {
    let (client_port, server_port) = MockPort::pair(4095);
    let mut client = Client::new(client_port, ClientConfig::default());
    let mut server = Server::new(server_port, ServerConfig::default(), EventHandlers::default());

    // sub-function 0x02 is sendKey for level 1; the default security_access_validate_key
    // handler rejects with InvalidKey, matching the wire-level scenario exactly.
    client.security_access(0x02, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    let err = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::Err(e) => Some(e),
        ClientEvent::ResponseReceived { .. } => panic!("expected a negative response"),
        _ => None,
    });

    assert!(matches!(err, Error::Negative(Nrc::InvalidKey)));
}

/// Scenario 3: RDBI held with one RCRRP keep-alive before the positive response.
#[test]
fn rdbi_rcrrp_then_positive() {
    let (client_port, server_port) = MockPort::pair(4095);
    // Shrink P2*/RCRRP cadence so the test doesn't wait out the ISO default 5 s.
    let client_cfg = ClientConfig::new(5, 40);
    let server_cfg = ServerConfig { p2_ms: 5, p2_star_ms: 40, ..ServerConfig::default() };
    let mut client = Client::new(client_port, client_cfg);

    // The server re-dispatches the handler on every poll while RCRRP is
    // asserted (spec.md §4.3 step 4) — a real handler keeps returning RCRRP
    // for as long as its background work is unfinished, not just once, so
    // the test mirrors that by holding RCRRP for a fixed number of polls.
    const RCRRP_POLLS: u32 = 8;
    let calls = Rc::new(Cell::new(0u32));
    let calls_in_handler = calls.clone();
    let mut handlers = EventHandlers::default();
    handlers.read_data_by_identifier = Box::new(move |did, copier| {
        assert_eq!(did, 0xF190);
        let n = calls_in_handler.get();
        calls_in_handler.set(n + 1);
        if n < RCRRP_POLLS {
            return Err(Nrc::RequestCorrectlyReceivedResponsePending);
        }
        copier.copy(b"VIN")
    });
    let mut server = Server::new(server_port, server_cfg, handlers);

    client.read_data_by_identifier(&[0xF190]).unwrap();

    let response = drive(&mut client, &mut server, 2000, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { data } => Some(data),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });

    assert_eq!(response, vec![0x62, 0xF1, 0x90, b'V', b'I', b'N']);
    assert!(
        calls.get() > RCRRP_POLLS,
        "handler should have been re-dispatched across the RCRRP keep-alive window"
    );
}

/// Scenario 5: RequestDownload / TransferData / RequestTransferExit mini-protocol.
#[test]
fn transfer_data_enforces_block_sequence_counter() {
    let (client_port, server_port) = MockPort::pair(4095);
    let mut client = Client::new(client_port, ClientConfig::default());

    let mut handlers = EventHandlers::default();
    handlers.request_download = Box::new(|_dfi, _address, _size, max_block_length| {
        *max_block_length = 0x104; // 260: matches the literal scenario's maxNumberOfBlockLength
        Ok(())
    });
    let mut server = Server::new(server_port, ServerConfig::default(), handlers);

    client.request_download(0x00, 0x0800_0000, 254 * 8).unwrap();
    let resp = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { data } => Some(data),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });
    assert_eq!(resp[0], 0x74);
    let size_bytes = (resp[1] >> 4) as usize;
    let mut max_block_length: u64 = 0;
    for &b in &resp[2..2 + size_bytes] {
        max_block_length = (max_block_length << 8) | b as u64;
    }
    assert_eq!(max_block_length, 0x104);

    for bsc in 1u8..=8 {
        let block = vec![0xAAu8; 254];
        client.transfer_data(bsc, max_block_length as u16, &block).unwrap();
        let resp = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
            ClientEvent::ResponseReceived { data } => Some(data),
            ClientEvent::Err(e) => panic!("unexpected client error on block {}: {}", bsc, e),
            _ => None,
        });
        assert_eq!(resp, vec![0x76, bsc]);
    }

    client.request_transfer_exit().unwrap();
    let resp = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { data } => Some(data),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });
    assert_eq!(resp, vec![0x77]);

    // A fresh transfer that skips a block sequence number aborts with RequestSequenceError
    // and tears down the transfer state, matching the "cumulative bytes never exceed total,
    // BSC advances by 1" invariants from spec.md §9.
    client.request_download(0x00, 0x0800_0000, 254 * 2).unwrap();
    drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { .. } => Some(()),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });

    client.transfer_data(1, max_block_length as u16, &[0xAA; 254]).unwrap();
    let resp = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::ResponseReceived { data } => Some(data),
        ClientEvent::Err(e) => panic!("unexpected client error: {}", e),
        _ => None,
    });
    assert_eq!(resp, vec![0x76, 1]);

    // A second block that repeats BSC=1 instead of continuing at 2 is a sequence error.
    client.transfer_data(1, max_block_length as u16, &[0xBB]).unwrap();
    let err = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::Err(e) => Some(e),
        ClientEvent::ResponseReceived { .. } => panic!("expected a sequence error"),
        _ => None,
    });
    assert!(matches!(err, Error::Negative(Nrc::RequestSequenceError)));

    // The sequence error tears the transfer down: a further block rejects as no-active-transfer.
    client.transfer_data(1, max_block_length as u16, &[0xCC]).unwrap();
    let err = drive(&mut client, &mut server, 200, |client, _server| match client.poll().unwrap() {
        ClientEvent::Err(e) => Some(e),
        ClientEvent::ResponseReceived { .. } => panic!("expected rejection, transfer already torn down"),
        _ => None,
    });
    assert!(matches!(err, Error::Negative(Nrc::UploadDownloadNotAccepted)));
}

/// Scenario 6: functional-addressed, suppressed TesterPresent draws no response.
#[test]
fn functional_suppressed_tester_present_draws_no_response() {
    let (client_port, server_port) = MockPort::pair(4095);
    let mut client = Client::new(client_port, ClientConfig::default());
    client.set_address(SduInfo::functional(0x7DF, 0x7E0));
    let mut server = Server::new(server_port, ServerConfig::default(), EventHandlers::default());

    client
        .tester_present_with_options(ClientOptions::SUPPRESS_POS_RESP | ClientOptions::FUNCTIONAL)
        .unwrap();

    // The client returns to IDLE right after the send completes.
    let event = client.poll().unwrap();
    assert!(matches!(event, ClientEvent::SendComplete));

    // The server dispatches (and re-arms S3), but the wire-level send is
    // suppressed — the client, which only ever sees what actually crosses
    // the mock transport, must observe nothing further.
    let mut dispatched = false;
    for _ in 0..50 {
        if let ServerEvent::Dispatched { sid } = server.poll().unwrap() {
            assert_eq!(sid, 0x3E);
            dispatched = true;
        }
        match client.poll().unwrap() {
            ClientEvent::ResponseReceived { .. } | ClientEvent::Err(_) => {
                panic!("client should see nothing after a suppressed functional send")
            }
            _ => {}
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(dispatched, "server never saw the functional TesterPresent request");
}

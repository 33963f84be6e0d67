//! In-process mock transport shared by this crate's integration tests.
//!
//! Grounded on spec.md §5 "Shared resources": the mock is the only place
//! multiple ports coexist, backed by a bounded queue of pending messages
//! with per-message scheduled-delivery timestamps. Structured the way
//! `examples/petar-dambovaliev-s7/tests/integration_test.rs` drives a real
//! `TcpStream` against a live peer, except the peer here is in-process.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use udsisotp::error::Error;
use udsisotp::transport::{AddressType, PortStatus, SduInfo, Transport};

struct Envelope {
    data: Vec<u8>,
    sdu: SduInfo,
    deliver_at: Instant,
}

/// One end of an in-process SDU-level link between a [`udsisotp::client::Client`]
/// and a [`udsisotp::server::Server`] (or two `MockPort`s wired directly for
/// unit-level port tests). Bypasses ISO-TP framing entirely — whole SDUs are
/// handed across, mirroring the way the client/server core is specified
/// against the abstract [`Transport`] port rather than the CAN wire.
pub struct MockPort {
    outbound: Rc<RefCell<VecDeque<Envelope>>>,
    inbound: Rc<RefCell<VecDeque<Envelope>>>,
    delay: Duration,
    send_buf: Vec<u8>,
    peeked: Option<(Vec<u8>, SduInfo)>,
    mtu: usize,
}

impl MockPort {
    /// A connected pair with zero scheduled-delivery delay.
    pub fn pair(mtu: usize) -> (MockPort, MockPort) {
        Self::pair_with_delay(mtu, Duration::from_millis(0))
    }

    /// A connected pair whose messages become visible to `peek` only after
    /// `delay` has elapsed since `send`.
    pub fn pair_with_delay(mtu: usize, delay: Duration) -> (MockPort, MockPort) {
        let a_to_b = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a = Rc::new(RefCell::new(VecDeque::new()));
        let a = MockPort {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            delay,
            send_buf: vec![0u8; mtu],
            peeked: None,
            mtu,
        };
        let b = MockPort {
            outbound: b_to_a,
            inbound: a_to_b,
            delay,
            send_buf: vec![0u8; mtu],
            peeked: None,
            mtu,
        };
        (a, b)
    }
}

impl Transport for MockPort {
    fn poll(&mut self) -> Result<PortStatus, Error> {
        Ok(PortStatus::IDLE)
    }

    fn send(&mut self, len: usize, sdu: SduInfo) -> Result<usize, Error> {
        if sdu.address_type == AddressType::Functional && len > 7 {
            return Err(Error::Transport(format!(
                "functional sends are limited to 7 bytes, got {}",
                len
            )));
        }
        let data = self.send_buf[..len].to_vec();
        self.outbound.borrow_mut().push_back(Envelope {
            data,
            sdu,
            deliver_at: Instant::now() + self.delay,
        });
        Ok(len)
    }

    fn peek(&mut self) -> Result<(usize, SduInfo), Error> {
        if let Some((ref data, sdu)) = self.peeked {
            return Ok((data.len(), sdu));
        }
        let ready = matches!(self.inbound.borrow().front(), Some(env) if env.deliver_at <= Instant::now());
        if !ready {
            return Ok((0, SduInfo::physical(0, 0)));
        }
        let env = self.inbound.borrow_mut().pop_front().unwrap();
        let len = env.data.len();
        let sdu = env.sdu;
        self.peeked = Some((env.data, sdu));
        Ok((len, sdu))
    }

    fn peek_buf(&self) -> &[u8] {
        self.peeked.as_ref().map(|(d, _)| d.as_slice()).unwrap_or(&[])
    }

    fn ack_recv(&mut self) {
        self.peeked = None;
    }

    fn get_send_buf(&mut self) -> &mut [u8] {
        &mut self.send_buf
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// Bridges two [`udsisotp::isotp::IsoTpLink`]s over a pair of in-process CAN
/// frame queues, for tests that must exercise real SF/FF/CF/FC segmentation
/// end to end rather than the SDU-level [`MockPort`] shortcut.
pub mod can_bus {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use udsisotp::isotp::link::Error;
    use udsisotp::isotp::FramePort;

    pub type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

    /// One direction of a shared two-queue CAN bus. Queues are `Rc<RefCell<_>>`
    /// rather than raw borrows, since both endpoints need a live handle to
    /// both queues for as long as the test drives them.
    pub struct Endpoint {
        pub outbound: Queue,
        pub inbound: Queue,
    }

    /// Builds a connected pair of endpoints plus handles to both underlying
    /// queues for tests that want to inspect or mutate in-flight frames.
    pub fn pair() -> (Endpoint, Endpoint, Queue, Queue) {
        let a_to_b: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let a = Endpoint { outbound: a_to_b.clone(), inbound: b_to_a.clone() };
        let b = Endpoint { outbound: b_to_a.clone(), inbound: a_to_b.clone() };
        (a, b, a_to_b, b_to_a)
    }

    impl FramePort for Endpoint {
        fn write_frame(&mut self, data: &[u8]) -> Result<(), Error> {
            self.outbound.borrow_mut().push_back(data.to_vec());
            Ok(())
        }
        fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.inbound.borrow_mut().pop_front())
        }
    }
}

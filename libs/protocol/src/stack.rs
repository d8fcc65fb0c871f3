//! Stack coordinator: wires the transport and link layers over the
//! host-supplied physical link and clock, converts internal layer events
//! into user-facing ones, and exposes the three pump entry points the
//! host loop drives.
//!
//! ```text
//! host loop                     SureLink engine                hardware
//! ---------                     ---------------                --------
//! queue_incoming(bytes)  ---->  link incoming queue  <----     RX bytes
//! process_incoming_data()       link -> transport -> events
//! process_outgoing_data()       link outgoing queue  ---->     TX bytes
//! tick()                        transport timers
//! poll_event()           <----  StackEvent queue
//! ```

use heapless::{Deque, Vec};

use crate::link::{LinkEvent, LinkLayer};
use crate::phy::{PhysicalLink, TimeSource};
use crate::transport::{
    TransportEvent, TransportLayer, TRANSPORT_MAX_DATAGRAM_PAYLOAD, TRANSPORT_MAX_PAYLOAD_SIZE,
};
use crate::Error;

const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackState {
    Init,
    Ready,
    Connecting,
    Connected,
    Error,
}

/// Stack-level failures, range −128..−97.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    InvalidState,
    NotConnected,
    InvalidParam,
    Timeout,
    BufferFull,
}

impl StackError {
    pub fn code(self) -> i32 {
        match self {
            StackError::InvalidState => -128,
            StackError::NotConnected => -127,
            StackError::InvalidParam => -126,
            StackError::Timeout => -125,
            StackError::BufferFull => -124,
        }
    }
}

/// Everything the engine reports to the host. Drain with
/// [`Stack::poll_event`] after each entry-point call; a full queue drops
/// the newest event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    Ready,
    Connected,
    Disconnected,
    Error,
    Timeout,
    DataReceived(Vec<u8, TRANSPORT_MAX_PAYLOAD_SIZE>),
    DataSent,
    DatagramReceived(Vec<u8, TRANSPORT_MAX_DATAGRAM_PAYLOAD>),
    OutgoingDataAvailable,
    IncomingDataAvailable,
}

/// The assembled three-layer stack.
pub struct Stack<P: PhysicalLink, C: TimeSource> {
    phy: P,
    clock: C,
    link: LinkLayer,
    transport: TransportLayer,
    state: StackState,
    events: Deque<StackEvent, EVENT_QUEUE_DEPTH>,
}

impl<P: PhysicalLink, C: TimeSource> Stack<P, C> {
    pub fn new(phy: P, clock: C) -> Self {
        Self {
            phy,
            clock,
            link: LinkLayer::new(),
            transport: TransportLayer::new(),
            state: StackState::Init,
            events: Deque::new(),
        }
    }

    /// Bring every layer to its ground state and report readiness.
    pub fn initialize(&mut self) {
        self.link.reset();
        self.transport.initialize();
        self.state = StackState::Ready;
        self.push_event(StackEvent::Ready);
        self.pump_events();
    }

    /// Recover from any state, including ERROR, for a fresh start.
    pub fn reset(&mut self) {
        self.initialize();
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == StackState::Connected
    }

    /// Forward keep-alive/timeout tuning to the transport.
    pub fn set_timeout(&mut self, keepalive_ms: u32, timeout_ms: u32) {
        self.transport.set_timeout(keepalive_ms, timeout_ms);
    }

    pub fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    /// Dial the peer. Completion arrives as [`StackEvent::Connected`].
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.state == StackState::Connected {
            return Ok(());
        }
        if self.state != StackState::Ready {
            return Err(StackError::InvalidState.into());
        }

        self.state = StackState::Connecting;
        let now = self.clock.now_ms();
        let result = self.transport.connect(&mut self.link, now);
        if let Err(e) = result {
            self.state = StackState::Error;
            self.push_event(StackEvent::Error);
            self.pump_events();
            return Err(e.into());
        }
        self.pump_events();
        Ok(())
    }

    /// Wait for the peer to dial us.
    pub fn listen(&mut self) -> Result<(), Error> {
        if self.state == StackState::Connecting || self.state == StackState::Connected {
            return Ok(());
        }
        if self.state != StackState::Ready {
            return Err(StackError::InvalidState.into());
        }

        self.state = StackState::Connecting;
        if let Err(e) = self.transport.listen() {
            self.state = StackState::Error;
            self.push_event(StackEvent::Error);
            self.pump_events();
            return Err(e.into());
        }
        Ok(())
    }

    /// Tear the connection down gracefully.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.state != StackState::Connected {
            return Err(StackError::NotConnected.into());
        }

        let now = self.clock.now_ms();
        let result = self.transport.disconnect(&mut self.link, now);
        match result {
            Ok(()) => {
                self.state = StackState::Ready;
                self.push_event(StackEvent::Disconnected);
            }
            Err(e) => {
                self.state = StackState::Error;
                self.push_event(StackEvent::Error);
                self.pump_events();
                return Err(e.into());
            }
        }
        self.pump_events();
        Ok(())
    }

    /// Send reliable, ordered data. Only legal while connected.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(StackError::InvalidParam.into());
        }
        if self.state != StackState::Connected {
            return Err(StackError::InvalidState.into());
        }

        let now = self.clock.now_ms();
        self.transport.send(data, &mut self.link, now)?;
        self.push_event(StackEvent::DataSent);
        self.pump_events();
        Ok(())
    }

    /// Send a best-effort datagram. Legal while READY or CONNECTED.
    pub fn send_datagram(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(StackError::InvalidParam.into());
        }
        if self.state != StackState::Ready && self.state != StackState::Connected {
            return Err(StackError::InvalidState.into());
        }

        self.transport.send_datagram(data, &mut self.link)?;
        self.push_event(StackEvent::DataSent);
        self.pump_events();
        Ok(())
    }

    /// Deposit raw bytes from the physical medium.
    ///
    /// Callable from wherever the driver hands bytes over, as long as the
    /// host serializes it against [`Stack::process_incoming_data`].
    pub fn queue_incoming(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = self.link.on_receive(data).map_err(Error::Link);
        self.pump_events();
        result
    }

    /// Drive the transport timers once.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.transport.tick(&mut self.link, now);
        self.pump_events();
    }

    /// Flush queued wire bytes into the physical link. Returns the bytes
    /// accepted by the hardware on this pump.
    pub fn process_outgoing_data(&mut self) -> Result<usize, Error> {
        let result = self
            .link
            .process_outgoing_data(&mut self.phy)
            .map_err(Error::Physical);
        self.pump_events();
        result
    }

    /// Parse queued received bytes into frames and feed them upward.
    pub fn process_incoming_data(&mut self) -> Result<(), Error> {
        loop {
            let Some(frame) = self.link.process_incoming_data() else {
                break;
            };
            let now = self.clock.now_ms();
            self.transport.on_receive(&frame, &mut self.link, now);
        }
        self.pump_events();
        Ok(())
    }

    /// Route layer events into user events and track the stack state.
    fn pump_events(&mut self) {
        while let Some(event) = self.link.poll_event() {
            match event {
                LinkEvent::OutgoingDataAvailable => {
                    self.push_event(StackEvent::OutgoingDataAvailable)
                }
                LinkEvent::IncomingDataAvailable => {
                    self.push_event(StackEvent::IncomingDataAvailable)
                }
                LinkEvent::CrcError => warn!("stack: link reported a CRC error"),
                LinkEvent::Error => warn!("stack: link reported an error"),
                LinkEvent::Ready | LinkEvent::FrameReceived => {}
            }
        }

        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Connected => {
                    self.state = StackState::Connected;
                    self.push_event(StackEvent::Connected);
                }
                TransportEvent::Disconnected => {
                    self.state = StackState::Ready;
                    self.push_event(StackEvent::Disconnected);
                }
                TransportEvent::Error => {
                    self.state = StackState::Error;
                    self.push_event(StackEvent::Error);
                }
                TransportEvent::Timeout => {
                    self.state = StackState::Error;
                    self.push_event(StackEvent::Timeout);
                }
                TransportEvent::Data(payload) => {
                    self.push_event(StackEvent::DataReceived(payload));
                }
                TransportEvent::Datagram(payload) => {
                    self.push_event(StackEvent::DatagramReceived(payload));
                }
            }
        }
    }

    fn push_event(&mut self, event: StackEvent) {
        if self.events.push_back(event).is_err() {
            warn!("stack: event queue full, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};

    use super::*;
    use crate::link::LinkLayer;
    use crate::testutil::{TestClock, WireEnd};
    use crate::transport::DEFAULT_KEEPALIVE_MS;

    type Wire = RefCell<heapless::Vec<u8, 4096>>;
    type TestStack<'a> = Stack<WireEnd<'a>, TestClock<'a>>;

    struct Harness<'a> {
        client: TestStack<'a>,
        server: TestStack<'a>,
        client_wire: &'a Wire,
        server_wire: &'a Wire,
    }

    fn stack<'a>(wire: &'a Wire, clock: &'a Cell<u32>) -> TestStack<'a> {
        let mut stack = Stack::new(
            WireEnd {
                tx: wire,
                accept: 4096,
            },
            TestClock(clock),
        );
        stack.initialize();
        stack
    }

    impl<'a> Harness<'a> {
        fn new(
            client_wire: &'a Wire,
            server_wire: &'a Wire,
            client_clock: &'a Cell<u32>,
            server_clock: &'a Cell<u32>,
        ) -> Self {
            Self {
                client: stack(client_wire, client_clock),
                server: stack(server_wire, server_clock),
                client_wire,
                server_wire,
            }
        }

        /// Shuttle bytes both ways until the wires stay quiet.
        fn run(&mut self) {
            for _ in 0..8 {
                self.client.process_outgoing_data().unwrap();
                let bytes = core::mem::take(&mut *self.client_wire.borrow_mut());
                if !bytes.is_empty() {
                    self.server.queue_incoming(&bytes).unwrap();
                    self.server.process_incoming_data().unwrap();
                }

                self.server.process_outgoing_data().unwrap();
                let bytes = core::mem::take(&mut *self.server_wire.borrow_mut());
                if !bytes.is_empty() {
                    self.client.queue_incoming(&bytes).unwrap();
                    self.client.process_incoming_data().unwrap();
                }
            }
        }

        fn connect(&mut self) {
            self.server.listen().unwrap();
            self.client.connect().unwrap();
            self.run();
            assert!(self.client.is_connected());
            assert!(self.server.is_connected());
        }
    }

    fn events_of(stack: &mut TestStack<'_>) -> heapless::Vec<StackEvent, 16> {
        let mut out = heapless::Vec::new();
        while let Some(event) = stack.poll_event() {
            out.push(event).unwrap();
        }
        out
    }

    fn contains(events: &[StackEvent], wanted: &StackEvent) -> bool {
        events.iter().any(|e| e == wanted)
    }

    #[test]
    fn initialize_reports_ready() {
        let wire = Wire::default();
        let clock = Cell::new(0);
        let mut s = stack(&wire, &clock);
        let events = events_of(&mut s);
        assert!(contains(&events, &StackEvent::Ready));
        assert_eq!(s.state(), StackState::Ready);
    }

    #[test]
    fn handshake_connects_both_sides() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0x2A), Cell::new(0x7F));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);

        h.server.listen().unwrap();
        h.client.connect().unwrap();
        assert_eq!(h.client.state(), StackState::Connecting);
        assert_eq!(h.server.state(), StackState::Connecting);

        h.run();

        assert!(h.client.is_connected());
        assert!(h.server.is_connected());
        assert!(contains(&events_of(&mut h.client), &StackEvent::Connected));
        assert!(contains(&events_of(&mut h.server), &StackEvent::Connected));
    }

    #[test]
    fn handshake_wire_bytes_match_the_protocol() {
        // Clocks pinned so the sequence seeds are the documented 0x2A/0x7F.
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0x2A), Cell::new(0x7F));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.server.listen().unwrap();

        h.client.connect().unwrap();
        h.client.process_outgoing_data().unwrap();
        let syn_bytes = core::mem::take(&mut *cw.borrow_mut());
        assert_eq!(parse_one_packet(&syn_bytes)[..], [0x01, 0x00, 0x2A, 0x00]);

        h.server.queue_incoming(&syn_bytes).unwrap();
        h.server.process_incoming_data().unwrap();
        h.server.process_outgoing_data().unwrap();
        let syn_ack_bytes = core::mem::take(&mut *sw.borrow_mut());
        assert_eq!(
            parse_one_packet(&syn_ack_bytes)[..],
            [0x02, 0x01, 0x7F, 0x00]
        );

        h.client.queue_incoming(&syn_ack_bytes).unwrap();
        h.client.process_incoming_data().unwrap();
        h.client.process_outgoing_data().unwrap();
        let ack_bytes = core::mem::take(&mut *cw.borrow_mut());
        assert_eq!(parse_one_packet(&ack_bytes)[..], [0x03, 0x01, 0x7F, 0x00]);
        assert!(h.client.is_connected());

        h.server.queue_incoming(&ack_bytes).unwrap();
        h.server.process_incoming_data().unwrap();
        assert!(h.server.is_connected());
    }

    fn parse_one_packet(wire_bytes: &[u8]) -> Vec<u8, 250> {
        let mut parser = LinkLayer::new();
        parser.on_receive(wire_bytes).unwrap();
        parser.process_incoming_data().expect("no frame in bytes")
    }

    #[test]
    fn data_flows_end_to_end_and_is_acknowledged() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0x2A), Cell::new(0x7F));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();
        let _ = events_of(&mut h.client);
        let _ = events_of(&mut h.server);

        h.client.send(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        h.run();

        let server_events = events_of(&mut h.server);
        assert!(server_events.iter().any(|e| matches!(
            e,
            StackEvent::DataReceived(payload) if payload[..] == [0xDE, 0xAD, 0xBE, 0xEF]
        )));

        let client_events = events_of(&mut h.client);
        assert!(contains(&client_events, &StackEvent::DataSent));

        // The ACK cleared the in-flight slot, so another send succeeds.
        h.client.send(&[0x01]).unwrap();
        h.run();
        let server_events = events_of(&mut h.server);
        assert!(server_events
            .iter()
            .any(|e| matches!(e, StackEvent::DataReceived(p) if p[..] == [0x01])));
    }

    #[test]
    fn both_directions_carry_data() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(1), Cell::new(2));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();

        h.client.send(b"ping").unwrap();
        h.run();
        h.server.send(b"pong").unwrap();
        h.run();

        assert!(events_of(&mut h.server)
            .iter()
            .any(|e| matches!(e, StackEvent::DataReceived(p) if p[..] == b"ping"[..])));
        assert!(events_of(&mut h.client)
            .iter()
            .any(|e| matches!(e, StackEvent::DataReceived(p) if p[..] == b"pong"[..])));
    }

    #[test]
    fn datagrams_flow_without_a_connection() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0), Cell::new(0));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);

        h.client.send_datagram(&[0xAA, 0xBB, 0xCC]).unwrap();
        h.run();

        assert!(events_of(&mut h.server).iter().any(|e| matches!(
            e,
            StackEvent::DatagramReceived(p) if p[..] == [0xAA, 0xBB, 0xCC]
        )));
    }

    #[test]
    fn send_is_refused_until_connected() {
        let wire = Wire::default();
        let clock = Cell::new(0);
        let mut s = stack(&wire, &clock);

        assert_eq!(
            s.send(&[0x01]),
            Err(Error::Stack(StackError::InvalidState))
        );
        assert_eq!(s.send(&[]), Err(Error::Stack(StackError::InvalidParam)));
        // Datagrams are fine from READY.
        s.send_datagram(&[0x01]).unwrap();
    }

    #[test]
    fn keepalive_timeout_surfaces_and_blocks_sending() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(10), Cell::new(20));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();
        let _ = events_of(&mut h.client);

        // Silence for three keep-alive intervals; the server never answers
        // because we never shuttle its way.
        cc.set(cc.get() + DEFAULT_KEEPALIVE_MS * 3 + 1);
        h.client.tick();

        let events = events_of(&mut h.client);
        assert!(contains(&events, &StackEvent::Timeout));
        assert_eq!(
            h.client.send(&[0x01]),
            Err(Error::Stack(StackError::InvalidState))
        );
    }

    #[test]
    fn keepalive_exchange_keeps_the_connection_alive() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(10), Cell::new(20));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();

        // Cross one interval: the client probes, the server answers, and
        // the watchdog never fires.
        cc.set(cc.get() + DEFAULT_KEEPALIVE_MS + 1);
        h.client.tick();
        h.run();
        cc.set(cc.get() + DEFAULT_KEEPALIVE_MS + 1);
        h.client.tick();
        h.run();

        assert!(h.client.is_connected());
        let events = events_of(&mut h.client);
        assert!(!contains(&events, &StackEvent::Timeout));
    }

    #[test]
    fn graceful_disconnect_completes_on_both_sides() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0x2A), Cell::new(0x7F));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();
        let _ = events_of(&mut h.client);
        let _ = events_of(&mut h.server);

        h.client.disconnect().unwrap();
        h.run();

        assert_eq!(h.client.state(), StackState::Ready);
        assert_eq!(h.server.state(), StackState::Ready);
        assert!(contains(
            &events_of(&mut h.client),
            &StackEvent::Disconnected
        ));
        assert!(contains(
            &events_of(&mut h.server),
            &StackEvent::Disconnected
        ));

        // The pair can connect again afterwards.
        h.server.listen().unwrap();
        h.client.connect().unwrap();
        h.run();
        assert!(h.client.is_connected());
        assert!(h.server.is_connected());
    }

    #[test]
    fn corrupted_frame_between_valid_ones_loses_nothing_else() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(5), Cell::new(6));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);

        // Three datagrams in one burst; corrupt the middle frame on the wire.
        h.client.send_datagram(&[0x0A]).unwrap();
        h.client.send_datagram(&[0x0B]).unwrap();
        h.client.process_outgoing_data().unwrap();
        let mut bytes = core::mem::take(&mut *cw.borrow_mut());
        let second_frame_payload = bytes
            .iter()
            .rposition(|&b| b == 0x0B)
            .expect("payload byte on the wire");
        bytes[second_frame_payload] ^= 0x04;
        h.client.send_datagram(&[0x0C]).unwrap();
        h.client.process_outgoing_data().unwrap();
        let tail = core::mem::take(&mut *cw.borrow_mut());

        h.server.queue_incoming(&bytes).unwrap();
        h.server.queue_incoming(&tail).unwrap();
        h.server.process_incoming_data().unwrap();

        let events = events_of(&mut h.server);
        let delivered: heapless::Vec<u8, 4> = events
            .iter()
            .filter_map(|e| match e {
                StackEvent::DatagramReceived(p) => Some(p[0]),
                _ => None,
            })
            .collect();
        assert_eq!(&delivered[..], &[0x0A, 0x0C]);
    }

    #[test]
    fn peer_reset_surfaces_as_an_error() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(30), Cell::new(40));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);
        h.connect();
        let _ = events_of(&mut h.server);

        // Client restarts from scratch and dials again.
        h.client.reset();
        h.client.connect().unwrap();
        h.client.process_outgoing_data().unwrap();
        let bytes = core::mem::take(&mut *cw.borrow_mut());
        h.server.queue_incoming(&bytes).unwrap();
        h.server.process_incoming_data().unwrap();

        let events = events_of(&mut h.server);
        assert!(contains(&events, &StackEvent::Error));
        assert_eq!(h.server.state(), StackState::Error);
    }

    #[test]
    fn connect_timeout_exhausts_retries_into_error() {
        let wire = Wire::default();
        let clock = Cell::new(0);
        let mut s = stack(&wire, &clock);
        s.connect().unwrap();

        for _ in 0..4 {
            clock.set(clock.get() + crate::transport::DEFAULT_TIMEOUT_MS + 1);
            s.tick();
        }

        let events = events_of(&mut s);
        assert!(contains(&events, &StackEvent::Timeout));
        assert_eq!(s.state(), StackState::Error);

        // reset() recovers the stack for another attempt.
        s.reset();
        assert_eq!(s.state(), StackState::Ready);
        s.connect().unwrap();
    }

    #[test]
    fn outgoing_and_incoming_availability_events_fire() {
        let (cw, sw) = (Wire::default(), Wire::default());
        let (cc, sc) = (Cell::new(0), Cell::new(0));
        let mut h = Harness::new(&cw, &sw, &cc, &sc);

        h.client.send_datagram(&[0x77]).unwrap();
        let client_events = events_of(&mut h.client);
        assert!(contains(&client_events, &StackEvent::OutgoingDataAvailable));

        h.client.process_outgoing_data().unwrap();
        let bytes = core::mem::take(&mut *cw.borrow_mut());
        h.server.queue_incoming(&bytes).unwrap();
        let server_events = events_of(&mut h.server);
        assert!(contains(&server_events, &StackEvent::IncomingDataAvailable));
    }
}

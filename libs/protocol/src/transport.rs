//! Transport layer: connection lifecycle over the link.
//!
//! Three-way handshake (SYN / SYN_ACK / ACK), stop-and-wait data transfer
//! with per-packet sequence numbers and ACK/NACK, keep-alive probing with
//! watchdog teardown, graceful FIN teardown, and a connectionless datagram
//! side channel. One peer connection at a time.
//!
//! Connection-oriented packets are `TYPE | CONN_ID | SEQ | LENGTH |
//! PAYLOAD`; datagrams are `TYPE=0x0B | LENGTH | PAYLOAD`. The server end
//! allocates the connection id during the handshake; 0x00 means "no
//! connection" and is what a client sends in its SYN.

use heapless::{Deque, Vec};

use crate::link::{LinkLayer, LINK_MAX_PAYLOAD_SIZE};
use crate::Error;

pub const TRANSPORT_HEADER_SIZE: usize = 4; // type + conn id + seq + length
pub const TRANSPORT_MAX_PACKET_SIZE: usize = LINK_MAX_PAYLOAD_SIZE;
pub const TRANSPORT_MAX_PAYLOAD_SIZE: usize =
    TRANSPORT_MAX_PACKET_SIZE - TRANSPORT_HEADER_SIZE;

pub const DATAGRAM_HEADER_SIZE: usize = 2; // type + length
pub const TRANSPORT_MAX_DATAGRAM_PAYLOAD: usize =
    TRANSPORT_MAX_PACKET_SIZE - DATAGRAM_HEADER_SIZE;

pub const CONNECTION_ID_INVALID: u8 = 0x00;
pub const CONNECTION_ID_START: u8 = 0x01;

pub const DEFAULT_KEEPALIVE_MS: u32 = 1000;
pub const DEFAULT_TIMEOUT_MS: u32 = 3000;
/// Documented default; there is no ACK-timeout retransmission timer in
/// this engine — a dead link is reaped by the keep-alive watchdog.
pub const ACK_TIMEOUT_MS: u32 = 100;
pub const MAX_RETRIES: u8 = 3;

const EVENT_QUEUE_DEPTH: usize = 8;

/// Wire packet types. Values 0x0C and above are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Syn = 0x01,
    SynAck = 0x02,
    Ack = 0x03,
    Fin = 0x04,
    FinAck = 0x05,
    Data = 0x06,
    DataAck = 0x07,
    DataNack = 0x08,
    Keepalive = 0x09,
    KeepaliveAck = 0x0A,
    Datagram = 0x0B,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Syn),
            0x02 => Some(PacketType::SynAck),
            0x03 => Some(PacketType::Ack),
            0x04 => Some(PacketType::Fin),
            0x05 => Some(PacketType::FinAck),
            0x06 => Some(PacketType::Data),
            0x07 => Some(PacketType::DataAck),
            0x08 => Some(PacketType::DataNack),
            0x09 => Some(PacketType::Keepalive),
            0x0A => Some(PacketType::KeepaliveAck),
            0x0B => Some(PacketType::Datagram),
            _ => None,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportState {
    Disconnected,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Transport-layer failures, range −96..−65.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    InvalidParam,
    NotConnected,
    Timeout,
    InvalidPacket,
    BufferOverflow,
    SendFailed,
    InvalidState,
}

impl TransportError {
    pub fn code(self) -> i32 {
        match self {
            TransportError::InvalidParam => -96,
            TransportError::NotConnected => -95,
            TransportError::Timeout => -94,
            TransportError::InvalidPacket => -93,
            TransportError::BufferOverflow => -92,
            TransportError::SendFailed => -91,
            TransportError::InvalidState => -90,
        }
    }
}

/// Signals the transport raises toward the stack coordinator. Payloads
/// ride inside the event so no callback plumbing is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error,
    Timeout,
    Data(Vec<u8, TRANSPORT_MAX_PAYLOAD_SIZE>),
    Datagram(Vec<u8, TRANSPORT_MAX_DATAGRAM_PAYLOAD>),
}

/// The three bytes after the type byte, under the connection-oriented
/// reading. A datagram reuses the `connection_id` slot as its length.
#[derive(Debug, Clone, Copy)]
struct PacketHeader {
    connection_id: u8,
    sequence: u8,
    length: u8,
}

/// The connection state machine.
///
/// Owns no I/O: every operation that transmits takes the link layer as a
/// parameter, and timing comes in as a millisecond timestamp from the
/// caller. Events go out through [`TransportLayer::poll_event`].
pub struct TransportLayer {
    state: TransportState,
    connection_id: u8,
    sequence_number: u8,
    peer_sequence_number: u8,
    connect_retries: u8,
    awaiting_ack: bool,
    waiting_response: bool,
    last_tx_time: u32,
    last_keepalive_ack_time: u32,
    keepalive_interval: u32,
    connection_timeout: u32,
    tx_buf: [u8; TRANSPORT_MAX_PACKET_SIZE],
    last_tx_buf: [u8; TRANSPORT_MAX_PACKET_SIZE],
    last_tx_len: usize,
    events: Deque<TransportEvent, EVENT_QUEUE_DEPTH>,
}

impl TransportLayer {
    pub fn new() -> Self {
        Self {
            state: TransportState::Disconnected,
            connection_id: CONNECTION_ID_INVALID,
            sequence_number: 0,
            peer_sequence_number: 0,
            connect_retries: 0,
            awaiting_ack: false,
            waiting_response: false,
            last_tx_time: 0,
            last_keepalive_ack_time: 0,
            keepalive_interval: DEFAULT_KEEPALIVE_MS,
            connection_timeout: DEFAULT_TIMEOUT_MS,
            tx_buf: [0; TRANSPORT_MAX_PACKET_SIZE],
            last_tx_buf: [0; TRANSPORT_MAX_PACKET_SIZE],
            last_tx_len: 0,
            events: Deque::new(),
        }
    }

    /// Reset connection state and restore default timing parameters.
    ///
    /// The connection id survives on purpose: the server side keeps
    /// allocating monotonically across connections.
    pub fn initialize(&mut self) {
        self.reset();
        self.keepalive_interval = DEFAULT_KEEPALIVE_MS;
        self.connection_timeout = DEFAULT_TIMEOUT_MS;
    }

    pub fn reset(&mut self) {
        self.state = TransportState::Disconnected;
        self.sequence_number = 0;
        self.peer_sequence_number = 0;
        self.connect_retries = 0;
        self.awaiting_ack = false;
        self.waiting_response = false;
        self.last_tx_time = 0;
        self.last_keepalive_ack_time = 0;
        self.last_tx_len = 0;
    }

    pub fn set_timeout(&mut self, keepalive_ms: u32, timeout_ms: u32) {
        self.keepalive_interval = keepalive_ms;
        self.connection_timeout = timeout_ms;
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    pub fn max_payload_size(&self) -> usize {
        TRANSPORT_MAX_PAYLOAD_SIZE
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Start a connection as the client.
    ///
    /// Idempotent when already connected; rejected in every other
    /// non-idle state. The initial sequence number is seeded from the
    /// low byte of the clock.
    pub fn connect(&mut self, link: &mut LinkLayer, now: u32) -> Result<(), TransportError> {
        if self.state == TransportState::Connected {
            return Ok(());
        }
        if self.state != TransportState::Disconnected {
            debug!("transport: connect rejected in state {}", self.state as u8);
            return Err(TransportError::InvalidState);
        }

        self.state = TransportState::Connecting;
        self.connect_retries = 0;
        self.waiting_response = true;
        self.sequence_number = (now & 0xFF) as u8;
        self.peer_sequence_number = 0;
        self.last_tx_time = now;

        debug!("transport: connecting, seq {}", self.sequence_number);
        self.send_control(
            link,
            PacketType::Syn,
            CONNECTION_ID_INVALID,
            self.sequence_number,
        );
        Ok(())
    }

    /// Start listening for a connection as the server.
    pub fn listen(&mut self) -> Result<(), TransportError> {
        if self.state == TransportState::Listening || self.state == TransportState::Connected {
            return Ok(());
        }
        if self.state != TransportState::Disconnected {
            debug!("transport: listen rejected in state {}", self.state as u8);
            return Err(TransportError::InvalidState);
        }

        self.state = TransportState::Listening;
        self.sequence_number = 0;
        self.peer_sequence_number = 0;
        Ok(())
    }

    /// Begin a graceful teardown with a FIN.
    pub fn disconnect(&mut self, link: &mut LinkLayer, now: u32) -> Result<(), TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }

        self.state = TransportState::Disconnecting;
        self.waiting_response = true;
        self.last_tx_time = now;

        debug!("transport: disconnecting");
        self.send_control(link, PacketType::Fin, self.connection_id, self.sequence_number);
        Ok(())
    }

    /// Send one DATA packet and hold it for retransmission.
    ///
    /// Stop-and-wait: while the previous DATA is unacknowledged another
    /// send is refused, so at most one packet is ever in flight. Link
    /// errors come back verbatim.
    pub fn send(&mut self, data: &[u8], link: &mut LinkLayer, now: u32) -> Result<(), Error> {
        if data.is_empty() || data.len() > TRANSPORT_MAX_PAYLOAD_SIZE {
            return Err(TransportError::InvalidParam.into());
        }
        if self.state != TransportState::Connected || self.awaiting_ack {
            return Err(TransportError::InvalidState.into());
        }

        self.last_tx_buf[0] = PacketType::Data.into();
        self.last_tx_buf[1] = self.connection_id;
        self.last_tx_buf[2] = self.sequence_number;
        self.last_tx_buf[3] = data.len() as u8;
        self.last_tx_buf[TRANSPORT_HEADER_SIZE..TRANSPORT_HEADER_SIZE + data.len()]
            .copy_from_slice(data);
        self.last_tx_len = TRANSPORT_HEADER_SIZE + data.len();

        link.send(&self.last_tx_buf[..self.last_tx_len])
            .map_err(Error::Link)?;

        self.awaiting_ack = true;
        self.last_tx_time = now;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Ok(())
    }

    /// Send a connectionless, unacknowledged datagram.
    ///
    /// Legal in every state except ERROR; uses neither the connection id
    /// nor a sequence number.
    pub fn send_datagram(&mut self, data: &[u8], link: &mut LinkLayer) -> Result<(), Error> {
        if data.len() > TRANSPORT_MAX_DATAGRAM_PAYLOAD {
            return Err(TransportError::InvalidParam.into());
        }
        if self.state == TransportState::Error {
            return Err(TransportError::InvalidState.into());
        }

        self.tx_buf[0] = PacketType::Datagram.into();
        self.tx_buf[1] = data.len() as u8;
        self.tx_buf[DATAGRAM_HEADER_SIZE..DATAGRAM_HEADER_SIZE + data.len()]
            .copy_from_slice(data);

        link.send(&self.tx_buf[..DATAGRAM_HEADER_SIZE + data.len()])
            .map_err(|_| Error::Transport(TransportError::SendFailed))?;
        Ok(())
    }

    /// Dispatch one received packet.
    ///
    /// Anything that does not fit the current state — wrong type for the
    /// state, unknown type, mismatched connection id — is logged and
    /// dropped; the peer is never told.
    pub fn on_receive(&mut self, data: &[u8], link: &mut LinkLayer, now: u32) {
        if data.len() < TRANSPORT_HEADER_SIZE {
            debug!("transport: runt packet, {} bytes", data.len());
            return;
        }
        let ptype = match PacketType::from_wire(data[0]) {
            Some(t) => t,
            None => {
                debug!("transport: invalid packet type {}", data[0]);
                return;
            }
        };
        let header = PacketHeader {
            connection_id: data[1],
            sequence: data[2],
            length: data[3],
        };

        use TransportState as S;
        match (ptype, self.state) {
            (PacketType::Syn, S::Listening | S::Connected) => self.handle_syn(&header, link, now),
            (PacketType::SynAck, S::Connecting) => self.handle_syn_ack(&header, link, now),
            (PacketType::Ack, S::Connecting | S::Disconnecting) => self.handle_ack(&header, now),
            (PacketType::Fin, S::Connected | S::Disconnecting) => {
                self.handle_fin(&header, link, now)
            }
            (PacketType::FinAck, S::Disconnecting) => self.handle_fin_ack(&header),
            (PacketType::Data, S::Connected) => self.handle_data(data, &header, link),
            (PacketType::DataAck, S::Connected) => self.handle_data_ack(&header),
            (PacketType::DataNack, S::Connected) => self.handle_data_nack(&header, link),
            (PacketType::Keepalive, S::Connected) => self.handle_keepalive(&header, link),
            (PacketType::KeepaliveAck, S::Connected) => self.handle_keepalive_ack(&header, now),
            (PacketType::Datagram, state) if state != S::Error => {
                self.handle_datagram(data, &header)
            }
            _ => {
                debug!(
                    "transport: ignoring type {} in state {}",
                    data[0], self.state as u8
                );
            }
        }
    }

    /// Drive timers. Call at a steady cadence from the host loop.
    pub fn tick(&mut self, link: &mut LinkLayer, now: u32) {
        match self.state {
            TransportState::Connected => {
                let idle = now.wrapping_sub(self.last_keepalive_ack_time);
                if idle > self.keepalive_interval * 3 {
                    info!("transport: keep-alive timeout, tearing down");
                    self.state = TransportState::Disconnecting;
                    self.waiting_response = true;
                    self.last_tx_time = now;
                    self.push_event(TransportEvent::Timeout);
                } else if idle > self.keepalive_interval {
                    self.send_control(link, PacketType::Keepalive, self.connection_id, 0);
                }
            }
            TransportState::Connecting => {
                if self.waiting_response
                    && now.wrapping_sub(self.last_tx_time) > self.connection_timeout
                {
                    if self.connect_retries < MAX_RETRIES {
                        self.connect_retries += 1;
                        debug!(
                            "transport: connect timeout, retry {}/{}",
                            self.connect_retries, MAX_RETRIES
                        );
                        self.last_tx_time = now;
                        self.send_control(
                            link,
                            PacketType::Syn,
                            CONNECTION_ID_INVALID,
                            self.sequence_number,
                        );
                    } else {
                        info!("transport: connect failed after {} retries", self.connect_retries);
                        self.state = TransportState::Error;
                        self.push_event(TransportEvent::Timeout);
                    }
                }
            }
            TransportState::Disconnecting => {
                if self.waiting_response
                    && now.wrapping_sub(self.last_tx_time) > self.connection_timeout
                {
                    debug!("transport: disconnect timed out, forcing");
                    self.state = TransportState::Disconnected;
                    self.waiting_response = false;
                    self.connection_id = CONNECTION_ID_INVALID;
                    self.push_event(TransportEvent::Disconnected);
                }
            }
            _ => {}
        }
    }

    fn handle_syn(&mut self, header: &PacketHeader, link: &mut LinkLayer, now: u32) {
        if self.state == TransportState::Connected {
            if header.connection_id == CONNECTION_ID_INVALID {
                // Peer reset fast path: the far side restarted and is
                // dialing fresh. Drop straight out of the connection.
                info!("transport: peer reset detected");
                self.state = TransportState::Disconnected;
                self.push_event(TransportEvent::Error);
            }
            return;
        }

        // Listening. A proper SYN carries the invalid id; the server
        // allocates the real one.
        if header.connection_id != CONNECTION_ID_INVALID {
            debug!(
                "transport: rejecting SYN carrying connection id {}",
                header.connection_id
            );
            return;
        }

        self.state = TransportState::Connecting;
        self.waiting_response = true;
        self.sequence_number = (now & 0xFF) as u8;
        // The SYN consumes one sequence number on the peer's side.
        self.peer_sequence_number = header.sequence.wrapping_add(1);
        self.last_tx_time = now;

        info!("transport: accepting connection");
        self.send_syn_ack(link);
    }

    fn handle_syn_ack(&mut self, header: &PacketHeader, link: &mut LinkLayer, now: u32) {
        // Adopt the server-chosen connection id and finish the handshake.
        self.connection_id = header.connection_id;
        self.peer_sequence_number = header.sequence;
        self.send_control(link, PacketType::Ack, header.connection_id, header.sequence);

        self.state = TransportState::Connected;
        self.waiting_response = false;
        self.connect_retries = 0;
        // Our SYN consumed a sequence number.
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.last_keepalive_ack_time = now;

        info!("transport: connected, id {}", self.connection_id);
        self.push_event(TransportEvent::Connected);
    }

    fn handle_ack(&mut self, header: &PacketHeader, now: u32) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: ACK for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }

        match self.state {
            TransportState::Connecting => {
                if header.sequence == self.sequence_number {
                    self.state = TransportState::Connected;
                    self.waiting_response = false;
                    self.connect_retries = 0;
                    self.last_keepalive_ack_time = now;
                    info!("transport: connected, id {}", self.connection_id);
                    self.push_event(TransportEvent::Connected);
                }
            }
            TransportState::Disconnecting => {
                if header.sequence == self.sequence_number {
                    self.state = TransportState::Disconnected;
                    self.waiting_response = false;
                    self.connection_id = CONNECTION_ID_INVALID;
                    info!("transport: disconnected");
                    self.push_event(TransportEvent::Disconnected);
                }
            }
            _ => {}
        }
    }

    fn handle_fin(&mut self, header: &PacketHeader, link: &mut LinkLayer, now: u32) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: FIN for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }

        match self.state {
            TransportState::Connected => {
                // Acknowledge, then fold our own teardown into theirs.
                self.send_control(link, PacketType::Ack, self.connection_id, self.sequence_number);
                self.send_control(link, PacketType::Fin, self.connection_id, self.sequence_number);
                self.state = TransportState::Disconnecting;
                self.waiting_response = true;
                self.last_tx_time = now;
            }
            TransportState::Disconnecting => {
                // Crossing FINs: confirm theirs and we are done.
                self.send_control(
                    link,
                    PacketType::FinAck,
                    self.connection_id,
                    self.sequence_number,
                );
                self.state = TransportState::Disconnected;
                self.waiting_response = false;
                info!("transport: disconnected");
                self.push_event(TransportEvent::Disconnected);
            }
            _ => {}
        }
    }

    fn handle_fin_ack(&mut self, header: &PacketHeader) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: FIN-ACK for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }

        self.state = TransportState::Disconnected;
        self.waiting_response = false;
        info!("transport: disconnected");
        self.push_event(TransportEvent::Disconnected);
    }

    fn handle_data(&mut self, data: &[u8], header: &PacketHeader, link: &mut LinkLayer) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: DATA for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }

        let payload = &data[TRANSPORT_HEADER_SIZE..];
        if header.length as usize != payload.len() {
            debug!(
                "transport: DATA length byte {} disagrees with payload {}",
                header.length,
                payload.len()
            );
            return;
        }

        if header.sequence != self.peer_sequence_number {
            debug!(
                "transport: DATA seq {}, expected {}",
                header.sequence, self.peer_sequence_number
            );
            self.send_control(link, PacketType::DataNack, self.connection_id, header.sequence);
            return;
        }

        let mut delivered = Vec::new();
        // Cannot fail: the link caps payloads at 250, minus our header.
        let _ = delivered.extend_from_slice(payload);
        self.push_event(TransportEvent::Data(delivered));

        self.send_control(link, PacketType::DataAck, self.connection_id, header.sequence);
        self.peer_sequence_number = self.peer_sequence_number.wrapping_add(1);
    }

    fn handle_data_ack(&mut self, header: &PacketHeader) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: DATA-ACK for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }
        // The counter already advanced past the packet being confirmed;
        // wrap at 0 is intended.
        if !self.awaiting_ack || header.sequence != self.sequence_number.wrapping_sub(1) {
            return;
        }

        self.awaiting_ack = false;
    }

    fn handle_data_nack(&mut self, header: &PacketHeader, link: &mut LinkLayer) {
        if header.connection_id != self.connection_id {
            debug!(
                "transport: DATA-NACK for connection {}, expected {}",
                header.connection_id, self.connection_id
            );
            return;
        }
        if !self.awaiting_ack || header.sequence != self.sequence_number.wrapping_sub(1) {
            return;
        }

        debug!("transport: retransmitting seq {}", header.sequence);
        if link.send(&self.last_tx_buf[..self.last_tx_len]).is_err() {
            warn!("transport: retransmission failed");
        }
    }

    fn handle_keepalive(&mut self, header: &PacketHeader, link: &mut LinkLayer) {
        if header.connection_id != self.connection_id {
            return;
        }
        self.send_control(link, PacketType::KeepaliveAck, self.connection_id, 0);
    }

    fn handle_keepalive_ack(&mut self, header: &PacketHeader, now: u32) {
        if header.connection_id != self.connection_id {
            return;
        }
        self.last_keepalive_ack_time = now;
    }

    fn handle_datagram(&mut self, data: &[u8], header: &PacketHeader) {
        // Datagram header: TYPE | LENGTH. The length byte at offset 1 is
        // `header.connection_id` under the connection-oriented reading.
        let length = header.connection_id as usize;
        let payload = &data[DATAGRAM_HEADER_SIZE..];
        if length != payload.len() {
            debug!(
                "transport: datagram length byte {} disagrees with payload {}",
                length,
                payload.len()
            );
            return;
        }

        let mut delivered = Vec::new();
        let _ = delivered.extend_from_slice(payload);
        self.push_event(TransportEvent::Datagram(delivered));
    }

    fn send_syn_ack(&mut self, link: &mut LinkLayer) {
        // Allocate the next connection id, skipping the invalid value.
        self.connection_id = self.connection_id.wrapping_add(1);
        if self.connection_id == CONNECTION_ID_INVALID {
            self.connection_id = CONNECTION_ID_START;
        }
        debug!(
            "transport: SYN-ACK, id {}, seq {}",
            self.connection_id, self.sequence_number
        );
        self.send_control(
            link,
            PacketType::SynAck,
            self.connection_id,
            self.sequence_number,
        );
    }

    fn send_control(
        &mut self,
        link: &mut LinkLayer,
        ptype: PacketType,
        connection_id: u8,
        sequence: u8,
    ) {
        self.tx_buf[0] = ptype.into();
        self.tx_buf[1] = connection_id;
        self.tx_buf[2] = sequence;
        self.tx_buf[3] = 0;
        if link.send(&self.tx_buf[..TRANSPORT_HEADER_SIZE]).is_err() {
            warn!("transport: control packet send failed");
        }
    }

    fn push_event(&mut self, event: TransportEvent) {
        if self.events.push_back(event).is_err() {
            warn!("transport: event queue full");
        }
    }
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

//! Link layer: frame integrity between two ends of the pipe.
//!
//! Outbound, a payload becomes `TYPE | LENGTH | PAYLOAD | CRC16-LE`,
//! COBS-encoded, delimiter-terminated, and queued until the host pumps it
//! into the physical link. Inbound bytes accumulate until a delimiter
//! closes a frame; the frame is decoded, length- and CRC-checked, and its
//! payload handed upward. A bad frame never takes the stream down: the
//! parser resyncs on the next delimiter and keeps going.

use heapless::{Deque, Vec};

use crate::cobs::{self, CobsError};
use crate::crc16;
use crate::phy::{PhysicalError, PhysicalLink};
use crate::{COBS_MAX_BLOCK_SIZE, COBS_MAX_ENCODED_SIZE, FRAME_DELIMITER};

pub const LINK_HEADER_SIZE: usize = 2; // type + length
pub const LINK_CRC_SIZE: usize = 2;
pub const LINK_MIN_FRAME_SIZE: usize = LINK_HEADER_SIZE + LINK_CRC_SIZE;
pub const LINK_MAX_FRAME_SIZE: usize = COBS_MAX_BLOCK_SIZE;
pub const LINK_MAX_PAYLOAD_SIZE: usize = LINK_MAX_FRAME_SIZE - LINK_MIN_FRAME_SIZE;

/// Each byte queue holds two worst-case encoded frames.
pub const LINK_BUFFER_SIZE: usize = COBS_MAX_ENCODED_SIZE * 2;

/// The only frame type defined so far; other values are reserved.
pub const FRAME_TYPE_DATA: u8 = 0x01;

const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Ready,
    Sending,
    Error,
}

/// Link-layer failures, range −64..−33.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    General,
    InvalidFrame,
    CrcError,
    BufferFull,
    InvalidParam,
    NotInitialized,
}

impl LinkError {
    pub fn code(self) -> i32 {
        match self {
            LinkError::General => -64,
            LinkError::InvalidFrame => -63,
            LinkError::CrcError => -62,
            LinkError::BufferFull => -61,
            LinkError::InvalidParam => -60,
            LinkError::NotInitialized => -59,
        }
    }
}

/// Signals the link raises toward the stack coordinator. Integrity
/// failures surface here, never as call errors: the byte stream outlives
/// any one bad frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    Ready,
    FrameReceived,
    CrcError,
    Error,
    OutgoingDataAvailable,
    IncomingDataAvailable,
}

/// Frame builder/parser with its outgoing and incoming byte queues.
///
/// The queues are plain arrays compacted by memory move; both are sized
/// for two worst-case encoded frames and never grow.
pub struct LinkLayer {
    state: LinkState,
    frame_buf: [u8; LINK_MAX_FRAME_SIZE],
    encoded_buf: [u8; COBS_MAX_ENCODED_SIZE],
    // Sized for a worst-case encoded body, not a decoded frame: a maximum
    // frame's body runs past LINK_MAX_FRAME_SIZE once COBS overhead lands.
    decode_buf: [u8; COBS_MAX_ENCODED_SIZE],
    outgoing: [u8; LINK_BUFFER_SIZE],
    outgoing_len: usize,
    incoming: [u8; LINK_BUFFER_SIZE],
    incoming_len: usize,
    events: Deque<LinkEvent, EVENT_QUEUE_DEPTH>,
}

impl LinkLayer {
    pub fn new() -> Self {
        Self {
            state: LinkState::Ready,
            frame_buf: [0; LINK_MAX_FRAME_SIZE],
            encoded_buf: [0; COBS_MAX_ENCODED_SIZE],
            decode_buf: [0; COBS_MAX_ENCODED_SIZE],
            outgoing: [0; LINK_BUFFER_SIZE],
            outgoing_len: 0,
            incoming: [0; LINK_BUFFER_SIZE],
            incoming_len: 0,
            events: Deque::new(),
        }
    }

    /// Reset state and both byte queues, then report readiness.
    pub fn reset(&mut self) {
        self.state = LinkState::Ready;
        self.outgoing_len = 0;
        self.incoming_len = 0;
        self.push_event(LinkEvent::Ready);
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn max_payload_size(&self) -> usize {
        LINK_MAX_PAYLOAD_SIZE
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Frame `payload` and queue the encoded bytes for transmission.
    ///
    /// Accepted in READY; an ERROR state auto-resets on the next send.
    /// Fails synchronously on an oversized payload or a full outgoing
    /// queue; the frame is either queued whole or not at all.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > LINK_MAX_PAYLOAD_SIZE {
            self.push_event(LinkEvent::Error);
            return Err(LinkError::InvalidParam);
        }

        if self.state == LinkState::Error {
            self.reset();
        }

        self.frame_buf[0] = FRAME_TYPE_DATA;
        self.frame_buf[1] = payload.len() as u8;
        self.frame_buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + payload.len()]
            .copy_from_slice(payload);

        let crc = crc16::calculate(&self.frame_buf[..LINK_HEADER_SIZE + payload.len()]);
        let crc_bytes = crc.to_le_bytes();
        self.frame_buf[LINK_HEADER_SIZE + payload.len()] = crc_bytes[0];
        self.frame_buf[LINK_HEADER_SIZE + payload.len() + 1] = crc_bytes[1];

        let frame_len = payload.len() + LINK_MIN_FRAME_SIZE;
        let encoded_len = match cobs::encode(&self.frame_buf[..frame_len], &mut self.encoded_buf)
        {
            Ok(n) => n,
            Err(_) => {
                self.state = LinkState::Error;
                self.push_event(LinkEvent::Error);
                return Err(LinkError::General);
            }
        };
        self.encoded_buf[encoded_len] = FRAME_DELIMITER;
        let encoded_len = encoded_len + 1;

        if self.outgoing_len + encoded_len > LINK_BUFFER_SIZE {
            self.push_event(LinkEvent::Error);
            return Err(LinkError::BufferFull);
        }

        self.outgoing[self.outgoing_len..self.outgoing_len + encoded_len]
            .copy_from_slice(&self.encoded_buf[..encoded_len]);
        self.outgoing_len += encoded_len;

        self.push_event(LinkEvent::OutgoingDataAvailable);
        Ok(())
    }

    /// Offer queued bytes to the physical link and drop what it accepted.
    ///
    /// Honors partial writes: at most `phy.max_payload_size()` bytes are
    /// offered per call, and only the accepted prefix leaves the queue.
    /// Returns the physical layer's result verbatim.
    pub fn process_outgoing_data<P: PhysicalLink>(
        &mut self,
        phy: &mut P,
    ) -> Result<usize, PhysicalError> {
        if self.outgoing_len == 0 || self.state != LinkState::Ready {
            return Ok(0);
        }

        self.state = LinkState::Sending;
        let chunk = self.outgoing_len.min(phy.max_payload_size());
        let result = phy.send(&self.outgoing[..chunk]);

        if let Ok(sent) = result {
            if sent > 0 {
                self.outgoing.copy_within(sent..self.outgoing_len, 0);
                self.outgoing_len -= sent;
            }
        }

        // Back to READY even when nothing moved.
        self.state = LinkState::Ready;
        result
    }

    /// Append raw received bytes to the incoming queue.
    ///
    /// On overflow the queue is cleared wholesale; the stream recovers at
    /// the next delimiter.
    pub fn on_receive(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if self.incoming_len + data.len() > LINK_BUFFER_SIZE {
            self.incoming_len = 0;
            return Err(LinkError::BufferFull);
        }

        self.incoming[self.incoming_len..self.incoming_len + data.len()].copy_from_slice(data);
        self.incoming_len += data.len();

        self.push_event(LinkEvent::IncomingDataAvailable);
        Ok(())
    }

    /// Extract the next valid frame payload from the incoming queue.
    ///
    /// Call repeatedly until `None`: each call yields at most one payload.
    /// Undecodable or short garbage is skipped one byte at a time so the
    /// parser realigns on the next delimiter; frames with a bad length or
    /// CRC are dropped whole. CRC failures flag ERROR and emit
    /// [`LinkEvent::CrcError`], never an `Err` — the stream keeps moving.
    pub fn process_incoming_data(&mut self) -> Option<Vec<u8, LINK_MAX_PAYLOAD_SIZE>> {
        while self.incoming_len > 0 {
            let decoded = cobs::decode(&self.incoming[..self.incoming_len], &mut self.decode_buf);
            let (written, consumed) = match decoded {
                Err(CobsError::Incomplete) => return None, // await more bytes
                Err(_) => {
                    // Byte-level resync.
                    self.drop_incoming(1);
                    continue;
                }
                Ok(d) => (d.written, d.consumed),
            };

            if written < LINK_MIN_FRAME_SIZE {
                self.drop_incoming(1);
                continue;
            }

            let payload_len = self.decode_buf[1] as usize;
            if payload_len > LINK_MAX_PAYLOAD_SIZE
                || written != payload_len + LINK_MIN_FRAME_SIZE
            {
                debug!("link: length mismatch, dropping frame");
                self.drop_incoming(consumed);
                continue;
            }

            let received_crc = u16::from_le_bytes([
                self.decode_buf[written - 2],
                self.decode_buf[written - 1],
            ]);
            let computed_crc = crc16::calculate(&self.decode_buf[..written - LINK_CRC_SIZE]);
            if computed_crc != received_crc {
                warn!("link: CRC mismatch");
                self.state = LinkState::Error;
                self.push_event(LinkEvent::CrcError);
                self.drop_incoming(consumed);
                continue;
            }

            let frame_type = self.decode_buf[0];
            self.drop_incoming(consumed);

            if frame_type == FRAME_TYPE_DATA {
                self.state = LinkState::Ready;
                self.push_event(LinkEvent::FrameReceived);
                let mut payload = Vec::new();
                // Cannot fail: payload_len was bounded above.
                let _ = payload.extend_from_slice(
                    &self.decode_buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + payload_len],
                );
                return Some(payload);
            }

            // Reserved frame types are not defined yet.
            debug!("link: reserved frame type {}", frame_type);
            self.state = LinkState::Error;
        }

        None
    }

    fn drop_incoming(&mut self, count: usize) {
        self.incoming.copy_within(count..self.incoming_len, 0);
        self.incoming_len -= count;
    }

    fn push_event(&mut self, event: LinkEvent) {
        if self.events.push_back(event).is_err() {
            warn!("link: event queue full");
        }
    }
}

impl Default for LinkLayer {
    fn default() -> Self {
        Self::new()
    }
}

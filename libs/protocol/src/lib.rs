//! SureLink: a reliable, connection-oriented messaging stack for raw serial
//! links (UART and friends).
//!
//! The crate is a pure protocol engine: it owns no hardware and spawns no
//! tasks. The host wires in a [`PhysicalLink`] (the byte pipe) and a
//! [`TimeSource`] (a monotonic millisecond clock), then drives the engine
//! from its own loop via three entry points on [`Stack`]:
//!
//! * [`Stack::tick`] — timers (keep-alive, connect retries, teardown)
//! * [`Stack::process_outgoing_data`] — flush queued wire bytes downward
//! * [`Stack::process_incoming_data`] — parse received bytes into packets
//!
//! Received bytes are deposited with [`Stack::queue_incoming`]; everything
//! the engine wants to tell the host comes back through
//! [`Stack::poll_event`].
//!
//! Wire layout, inside out: a transport packet (connection-oriented or
//! datagram) rides as the payload of a link frame
//! `TYPE | LENGTH | PAYLOAD | CRC16-LE`, which is COBS-encoded and
//! terminated with a single 0x00 delimiter. No other byte value is
//! reserved.

#![no_std]

#[macro_use]
mod fmt;

pub mod cobs;
pub mod crc16;
pub mod link;
pub mod phy;
pub mod stack;
pub mod transport;

pub use cobs::CobsError;
pub use link::{LinkError, LinkEvent, LinkLayer, LinkState};
pub use phy::{PhysicalError, PhysicalLink, TimeSource};
pub use stack::{Stack, StackError, StackEvent, StackState};
pub use transport::{
    PacketType, TransportError, TransportEvent, TransportLayer, TransportState,
};

/// Largest run of bytes COBS can stuff in one block.
pub const COBS_MAX_BLOCK_SIZE: usize = 254;

/// Worst-case size of an encoded frame, trailing delimiter included:
/// 254 data bytes + 1 overhead byte per 254 + 1 leading code + 1 delimiter.
pub const COBS_MAX_ENCODED_SIZE: usize = 257;

/// The single reserved byte value; terminates every frame on the wire.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Any error the stack can produce, tagged by the layer it came from.
///
/// Each layer owns a disjoint numeric code range so the origin of a code
/// is recoverable from its value alone (see [`Error::code`]):
/// physical −32..−1, link −64..−33, transport −96..−65, stack −128..−97.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Physical(PhysicalError),
    Link(LinkError),
    Transport(TransportError),
    Stack(StackError),
}

impl Error {
    /// Numeric error code within the originating layer's range.
    pub fn code(&self) -> i32 {
        match self {
            Error::Physical(e) => e.code(),
            Error::Link(e) => e.code(),
            Error::Transport(e) => e.code(),
            Error::Stack(e) => e.code(),
        }
    }
}

impl From<PhysicalError> for Error {
    fn from(e: PhysicalError) -> Self {
        Error::Physical(e)
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Error::Link(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_stay_in_their_layer_ranges() {
        let physical = [
            PhysicalError::General,
            PhysicalError::Busy,
            PhysicalError::Overflow,
            PhysicalError::Timeout,
            PhysicalError::HwFail,
            PhysicalError::InvalidParam,
            PhysicalError::NotInitialized,
        ];
        for e in physical {
            assert!((-32..=-1).contains(&e.code()), "{:?} -> {}", e, e.code());
        }

        let link = [
            LinkError::General,
            LinkError::InvalidFrame,
            LinkError::CrcError,
            LinkError::BufferFull,
            LinkError::InvalidParam,
            LinkError::NotInitialized,
        ];
        for e in link {
            assert!((-64..=-33).contains(&e.code()), "{:?} -> {}", e, e.code());
        }

        let transport = [
            TransportError::InvalidParam,
            TransportError::NotConnected,
            TransportError::Timeout,
            TransportError::InvalidPacket,
            TransportError::BufferOverflow,
            TransportError::SendFailed,
            TransportError::InvalidState,
        ];
        for e in transport {
            assert!((-96..=-65).contains(&e.code()), "{:?} -> {}", e, e.code());
        }

        let stack = [
            StackError::InvalidState,
            StackError::NotConnected,
            StackError::InvalidParam,
            StackError::Timeout,
            StackError::BufferFull,
        ];
        for e in stack {
            assert!((-128..=-97).contains(&e.code()), "{:?} -> {}", e, e.code());
        }
    }

    #[test]
    fn error_code_passes_through_the_wrapper() {
        let err: Error = LinkError::BufferFull.into();
        assert_eq!(err.code(), LinkError::BufferFull.code());
        let err: Error = TransportError::InvalidState.into();
        assert_eq!(err.code(), TransportError::InvalidState.code());
    }
}

//! COBS (Consistent Overhead Byte Stuffing) codec.
//!
//! Encoding removes every 0x00 from the frame body at a cost of at most one
//! overhead byte per 254 payload bytes, so 0x00 can delimit frames on the
//! wire. The encoder does NOT append the delimiter; the link layer owns
//! that byte.

use crate::{COBS_MAX_BLOCK_SIZE, FRAME_DELIMITER};

/// Ceiling for a run-length code byte. A code of 0xFF means "254 literal
/// bytes follow, no implicit zero".
pub const COBS_MAX_CODE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CobsError {
    /// Input longer than one COBS block, or a malformed run in the input.
    InvalidInput,
    /// Output buffer cannot hold the worst-case result.
    OutputTooSmall,
    /// No delimiter in the input yet; feed more bytes and retry.
    Incomplete,
}

/// Result of [`decode`]: payload bytes written to the output and input
/// bytes consumed, trailing delimiter included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub written: usize,
    pub consumed: usize,
}

/// Encode `input` into `output`, returning the encoded length.
///
/// `input` must fit in one block (at most [`COBS_MAX_BLOCK_SIZE`] bytes);
/// `output` must hold the worst case `len + len/254 + 1`. An empty input
/// encodes to zero bytes. The encoded body contains no 0x00.
pub fn encode(input: &[u8], output: &mut [u8]) -> Result<usize, CobsError> {
    if input.is_empty() {
        return Ok(0);
    }
    if input.len() > COBS_MAX_BLOCK_SIZE {
        return Err(CobsError::InvalidInput);
    }
    let max_encoded = input.len() + input.len() / 254 + 1;
    if output.len() < max_encoded {
        return Err(CobsError::OutputTooSmall);
    }

    let mut write = 1; // slot 0 is reserved for the first code byte
    let mut code_index = 0;
    let mut code: u8 = 1;

    for &byte in input {
        if byte == FRAME_DELIMITER {
            output[code_index] = code;
            code = 1;
            code_index = write;
            write += 1;
        } else {
            output[write] = byte;
            write += 1;
            code += 1;
            if code == COBS_MAX_CODE {
                // Run is full: finalize it, but the fresh run does not
                // stand for a zero in the input.
                output[code_index] = code;
                code = 1;
                code_index = write;
                write += 1;
            }
        }
    }

    output[code_index] = code;
    Ok(write)
}

/// Decode one frame from the head of `input`.
///
/// Scans up to the first 0x00. Returns [`CobsError::Incomplete`] while no
/// delimiter has arrived, [`CobsError::InvalidInput`] on a zero run length
/// or a run overshooting the delimiter, [`CobsError::OutputTooSmall`] only
/// when the bytes actually decoded would overflow `output` — a block-sized
/// buffer ([`COBS_MAX_BLOCK_SIZE`] bytes) therefore always suffices, even
/// for encoded bodies that carry overhead bytes and run past it. An empty
/// frame (delimiter first) decodes to zero bytes and consumes just the
/// delimiter.
pub fn decode(input: &[u8], output: &mut [u8]) -> Result<Decoded, CobsError> {
    if input.is_empty() {
        return Ok(Decoded {
            written: 0,
            consumed: 0,
        });
    }

    let frame_end = match input.iter().position(|&b| b == FRAME_DELIMITER) {
        Some(pos) => pos,
        None => return Err(CobsError::Incomplete),
    };

    if frame_end == 0 {
        return Ok(Decoded {
            written: 0,
            consumed: 1,
        });
    }

    let mut read = 0;
    let mut write = 0;

    while read < frame_end {
        let code = input[read];
        if code == 0 {
            return Err(CobsError::InvalidInput);
        }
        read += 1;

        let run = code as usize - 1;
        if read + run > frame_end {
            return Err(CobsError::InvalidInput);
        }
        if write + run > output.len() {
            return Err(CobsError::OutputTooSmall);
        }

        output[write..write + run].copy_from_slice(&input[read..read + run]);
        write += run;
        read += run;

        // Each full run and the final run carry no implicit zero.
        if code < COBS_MAX_CODE && read < frame_end {
            if write >= output.len() {
                return Err(CobsError::OutputTooSmall);
            }
            output[write] = 0;
            write += 1;
        }
    }

    Ok(Decoded {
        written: write,
        consumed: frame_end + 1,
    })
}

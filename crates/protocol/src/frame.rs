//! Network bulk framing
//!
//! Inbound network transfers carry one or more whole IP frames back to back.
//! Each frame starts with a fixed 20-byte header whose bytes 2..4 hold the
//! big-endian total length of the frame, header included.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Fixed header size of a network frame
pub const FRAME_HEADER_LEN: usize = 20;

/// Largest frame the receive path accepts (receive MTU class)
pub const MAX_FRAME_SIZE: usize = 2048;

/// Trailer some firmware appends to bulk IN transfers
pub const CRC_SENTINEL: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

const LENGTH_OFFSET: usize = 2;

/// Read and validate the declared total length of a frame header
pub fn declared_length(header: &[u8]) -> Result<usize> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: FRAME_HEADER_LEN,
            available: header.len(),
        });
    }

    let length = BigEndian::read_u16(&header[LENGTH_OFFSET..LENGTH_OFFSET + 2]) as usize;
    if !(FRAME_HEADER_LEN..=MAX_FRAME_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidFrameLength {
            length,
            min: FRAME_HEADER_LEN,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(length)
}

/// Corrected length of a quirky bulk IN transfer
///
/// When the transfer ends 5 or 6 bytes past a multiple of the endpoint's
/// max packet size and its last 4 bytes are the sentinel, those 4 bytes are
/// not payload. Any other transfer keeps its length.
pub fn fix_crc_trailer(buffer: &[u8], actual_length: usize, max_packet: usize) -> usize {
    if actual_length < CRC_SENTINEL.len() || actual_length > buffer.len() || max_packet == 0 {
        return actual_length;
    }

    let rest = actual_length % max_packet;
    if (rest == 5 || rest == 6) && buffer[actual_length - CRC_SENTINEL.len()..actual_length] == CRC_SENTINEL {
        actual_length - CRC_SENTINEL.len()
    } else {
        actual_length
    }
}

/// Whether an outbound transfer of `length` bytes must be followed by a
/// zero-length packet to mark its end
pub fn needs_zero_packet(length: usize, max_packet: usize) -> bool {
    max_packet != 0 && length != 0 && length % max_packet == 0
}

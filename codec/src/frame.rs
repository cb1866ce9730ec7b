// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! Incremental reader for packet frames.
//!
//! A frame is a fixed header followed by `remaining_length` body bytes. The
//! reader never consumes bytes itself: given the bytes received so far, it
//! either reports how many more bytes are needed, or delimits a complete
//! frame. The caller drives the socket reads with the returned byte count,
//! so it never reads past the end of the current frame by more than the
//! kernel already buffered.

use crate::var_int::MAX_REMAINING_LENGTH;
use crate::DecodeError;

/// Result of scanning a partially received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// At least `n` more bytes are needed before the frame can be delimited.
    NeedMore(usize),

    /// A complete frame occupies the first `packet_len` bytes of the buffer.
    Frame {
        /// Byte length of the fixed header, 2 to 5 bytes.
        header_len: usize,

        /// Byte length of the whole frame, fixed header included.
        packet_len: usize,
    },
}

/// Scan `buf` for one complete frame.
///
/// While the remaining-length field is still incomplete only one byte at a
/// time is requested, as the field's own length is not known yet.
///
/// # Errors
///
/// Returns error if the remaining-length field would require a 5th byte or
/// exceeds the maximum packet length.
pub fn scan(buf: &[u8]) -> Result<FrameStatus, DecodeError> {
    if buf.len() < 2 {
        return Ok(FrameStatus::NeedMore(1));
    }

    // Bytes 1..=4 hold the remaining-length variable byte integer.
    let mut remaining_length: usize = 0;
    let mut multiplier: usize = 1;
    let mut header_len = 1;
    loop {
        if header_len > 4 {
            return Err(DecodeError::InvalidVarInt);
        }
        if header_len >= buf.len() {
            return Ok(FrameStatus::NeedMore(1));
        }
        let byte = usize::from(buf[header_len]);
        header_len += 1;
        remaining_length += (byte & 0x7f) * multiplier;
        multiplier *= 128;
        if (byte & 0x80) == 0 {
            break;
        }
    }

    if remaining_length > MAX_REMAINING_LENGTH {
        return Err(DecodeError::InvalidVarInt);
    }

    let packet_len = header_len + remaining_length;
    if buf.len() < packet_len {
        Ok(FrameStatus::NeedMore(packet_len - buf.len()))
    } else {
        Ok(FrameStatus::Frame {
            header_len,
            packet_len,
        })
    }
}

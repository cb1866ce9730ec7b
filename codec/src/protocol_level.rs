// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// The 8 bit unsigned value that represents the revision level of the protocol
/// used by the Client.
///
/// The Server MUST respond to the CONNECT Packet with a CONNACK return code
/// 0x01 (unacceptable protocol level) and then disconnect the Client if the
/// Protocol Level is not supported by the Server [MQTT-3.1.2-2].
///
/// Only MQTT 3.1.1 is supported.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolLevel {
    #[default]
    V311 = 4,
}

impl ProtocolLevel {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            4 => Ok(Self::V311),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

impl DecodePacket for ProtocolLevel {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Self::try_from(ba.read_byte()?)
    }
}

impl EncodePacket for ProtocolLevel {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, EncodeError};

/// Protocol name is a constant in MQTT 3.1.1 [MQTT-3.1.2-1].
pub const PROTOCOL_NAME: &str = "MQTT";

/// Convert packet fields into byte stream.
pub trait EncodePacket {
    /// Encode packet into byte stream `buf`, returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if packet fields are invalid.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse packet fields from a byte stream.
pub trait DecodePacket: Sized {
    /// Decode packet fields from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if byte stream in `ba` does not conform to the packet
    /// structure.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Packet identifier.
///
/// The Packet Identifier field is only present in PUBLISH (QoS > 0),
/// PUBACK, PUBREC, PUBREL, PUBCOMP, SUBSCRIBE, SUBACK, UNSUBSCRIBE
/// and UNSUBACK packets [MQTT-2.3.1].
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    /// Create a new packet id object.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get inner value.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

/// Quality of service level of application messages.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

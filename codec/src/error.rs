// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::io;

use crate::byte_array::ByteArrayError;
use crate::topic::TopicError;
use crate::utils::StringError;
use crate::var_int::VarIntError;

/// Errors returned while decoding a byte stream into packets.
///
/// Every variant maps to "Malformed Packet" on the wire level: the receiver
/// MUST close the network connection [MQTT-4.8.0-1].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Type nibble in fixed header is not a known control packet type.
    InvalidPacketType,

    /// Reserved flag bits in fixed header do not have their mandatory value.
    InvalidPacketFlags,

    /// Remaining length field is not a valid variable byte integer, or
    /// a 5th continuation byte would be required.
    InvalidVarInt,

    /// Remaining length does not match the actual packet body.
    InvalidRemainingLength,

    /// Not enough bytes available in buffer.
    OutOfRange,

    /// Invalid UTF-8 string, or string contains a null character.
    InvalidString,

    /// Topic or topic filter violates MQTT-4.7 rules.
    InvalidTopic,

    /// QoS is not 0, 1 or 2, or reserved bits around it are non-zero.
    InvalidQoS,

    /// Packet id is zero where a non-zero value is required [MQTT-2.3.1-1].
    InvalidPacketId,

    /// Protocol name is not "MQTT".
    InvalidProtocolName,

    /// Protocol level is not 4 (MQTT 3.1.1).
    InvalidProtocolLevel,

    /// Connect flags are inconsistent, e.g. will-qos set without will flag.
    InvalidConnectFlags,

    /// Connect return code is in the reserved range.
    InvalidReturnCode,

    /// Client id field is invalid.
    InvalidClientId,

    /// The payload of a SUBSCRIBE/UNSUBSCRIBE packet contains no topic filter
    /// [MQTT-3.8.3-3].
    EmptyTopicFilter,

    /// Length of data exceeds its limitation.
    TooManyData,
}

/// Errors returned while encoding packets into a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    IoError,

    /// Invalid data in packet fields.
    InvalidData,

    /// Packet is larger than the maximum remaining length.
    InvalidVarInt,

    /// Invalid UTF-8 string, or string is too long.
    InvalidString,

    /// Topic or topic filter violates MQTT-4.7 rules.
    InvalidTopic,

    /// Client id contains invalid characters or has invalid length.
    InvalidClientId,

    /// Length of data exceeds its limitation.
    TooManyData,
}

impl From<ByteArrayError> for DecodeError {
    fn from(e: ByteArrayError) -> Self {
        match e {
            ByteArrayError::OutOfRange => Self::OutOfRange,
            ByteArrayError::InvalidString(_) => Self::InvalidString,
        }
    }
}

impl From<VarIntError> for DecodeError {
    fn from(_e: VarIntError) -> Self {
        Self::InvalidVarInt
    }
}

impl From<StringError> for DecodeError {
    fn from(_e: StringError) -> Self {
        Self::InvalidString
    }
}

impl From<TopicError> for DecodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

impl From<io::Error> for EncodeError {
    fn from(_e: io::Error) -> Self {
        Self::IoError
    }
}

impl From<VarIntError> for EncodeError {
    fn from(_e: VarIntError) -> Self {
        Self::InvalidVarInt
    }
}

impl From<StringError> for EncodeError {
    fn from(_e: StringError) -> Self {
        Self::InvalidString
    }
}

impl From<TopicError> for EncodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

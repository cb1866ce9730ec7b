// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType,
};

/// Return code of a connect acknowledgement.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The Server does not support the level of the MQTT protocol requested
    /// by the Client.
    UnacceptedProtocol = 1,

    /// The Client identifier is correct UTF-8 but not allowed by the Server.
    IdentifierRejected = 2,

    /// The Network Connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed, or authentication
    /// failed.
    BadUserNameOrPassword = 4,

    /// The Client is not authorized to connect.
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptedProtocol),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUserNameOrPassword),
            5 => Ok(Self::NotAuthorized),
            // Values 6-255 are reserved.
            _ => Err(DecodeError::InvalidReturnCode),
        }
    }
}

/// `ConnectAckPacket` is sent by the Server in response to a `ConnectPacket`.
///
/// The first packet sent from the Server to the Client MUST be a CONNACK
/// Packet [MQTT-3.2.0-1].
///
/// Basic structure of the packet:
/// ```txt
///  7                  0
/// +--------------------+
/// | Fixed header       |
/// |                    |
/// +--------------------+
/// | Ack flags          |
/// +--------------------+
/// | Return code        |
/// +--------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectAckPacket {
    /// Session present flag.
    ///
    /// If the Server accepts a connection with CleanSession set to 1, the
    /// Server MUST set Session Present to 0 in the CONNACK packet
    /// [MQTT-3.2.2-1]. If a server sends a CONNACK packet containing a
    /// non-zero return code it MUST set Session Present to 0 [MQTT-3.2.2-4].
    session_present: bool,

    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    #[must_use]
    pub const fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        let session_present = match return_code {
            ConnectReturnCode::Accepted => session_present,
            _ => false,
        };
        Self {
            session_present,
            return_code,
        }
    }

    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }

    const fn remaining_length() -> usize {
        // Ack flags + return code.
        2
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != Self::remaining_length() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let ack_flags = ba.read_byte()?;
        // Bits 7-1 of the ack flags are reserved and MUST be set to 0
        // [MQTT-3.2.2-1].
        if ack_flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let session_present = ack_flags & 0b0000_0001 == 0b0000_0001;
        let return_code = ConnectReturnCode::try_from(ba.read_byte()?)?;

        Ok(Self {
            session_present,
            return_code,
        })
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = FixedHeader::new(PacketType::ConnectAck, Self::remaining_length())?;
        fixed_header.encode(buf)?;

        let ack_flags = if self.session_present { 0b0000_0001 } else { 0b0000_0000 };
        buf.push(ack_flags);
        buf.push(self.return_code as u8);

        Ok(buf.len() - old_len)
    }
}

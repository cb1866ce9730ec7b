// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType,
};

/// `DisconnectPacket` is the final Control Packet sent from the Client to the
/// Server. It indicates that the Client is disconnecting cleanly.
///
/// After sending this packet the Client MUST close the network connection
/// [MQTT-3.14.4-1]. The Server MUST discard any Will Message associated with
/// the current connection without publishing it [MQTT-3.14.4-3].
///
/// This packet has no variable header and no payload.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisconnectPacket {}

impl DisconnectPacket {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

impl DecodePacket for DisconnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Disconnect {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 0 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self {})
    }
}

impl EncodePacket for DisconnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::Disconnect, 0)?;
        fixed_header.encode(buf)
    }
}

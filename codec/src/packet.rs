// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodeError, EncodePacket, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};

/// A decoded control packet of any type.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl Packet {
    /// Decode one complete frame in `buf` into a typed packet, dispatching on
    /// the type nibble of the fixed header byte.
    ///
    /// # Errors
    ///
    /// Returns error if the packet body does not decode, or if the frame
    /// contains bytes the body decoder did not consume.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let type_bits = buf.first().copied().ok_or(DecodeError::OutOfRange)? >> 4;
        let mut ba = ByteArray::new(buf);

        let packet = match type_bits {
            1 => Self::Connect(ConnectPacket::decode(&mut ba)?),
            2 => Self::ConnectAck(ConnectAckPacket::decode(&mut ba)?),
            3 => Self::Publish(PublishPacket::decode(&mut ba)?),
            4 => Self::PublishAck(PublishAckPacket::decode(&mut ba)?),
            5 => Self::PublishReceived(PublishReceivedPacket::decode(&mut ba)?),
            6 => Self::PublishRelease(PublishReleasePacket::decode(&mut ba)?),
            7 => Self::PublishComplete(PublishCompletePacket::decode(&mut ba)?),
            8 => Self::Subscribe(SubscribePacket::decode(&mut ba)?),
            9 => Self::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?),
            10 => Self::Unsubscribe(UnsubscribePacket::decode(&mut ba)?),
            11 => Self::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?),
            12 => Self::PingRequest(PingRequestPacket::decode(&mut ba)?),
            13 => Self::PingResponse(PingResponsePacket::decode(&mut ba)?),
            14 => Self::Disconnect(DisconnectPacket::decode(&mut ba)?),
            _ => return Err(DecodeError::InvalidPacketType),
        };

        // Every decoder consumes its body exactly.
        if ba.remaining_bytes() != 0 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(packet)
    }

    /// Get packet type in fixed header.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnectAck(_) => PacketType::ConnectAck,
            Self::Publish(packet) => PacketType::Publish {
                dup: packet.dup(),
                qos: packet.qos(),
                retain: packet.retain(),
            },
            Self::PublishAck(_) => PacketType::PublishAck,
            Self::PublishReceived(_) => PacketType::PublishReceived,
            Self::PublishRelease(_) => PacketType::PublishRelease,
            Self::PublishComplete(_) => PacketType::PublishComplete,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubscribeAck(_) => PacketType::SubscribeAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubscribeAck(_) => PacketType::UnsubscribeAck,
            Self::PingRequest(_) => PacketType::PingRequest,
            Self::PingResponse(_) => PacketType::PingResponse,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }
}

impl EncodePacket for Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(packet) => packet.encode(buf),
            Self::ConnectAck(packet) => packet.encode(buf),
            Self::Publish(packet) => packet.encode(buf),
            Self::PublishAck(packet) => packet.encode(buf),
            Self::PublishReceived(packet) => packet.encode(buf),
            Self::PublishRelease(packet) => packet.encode(buf),
            Self::PublishComplete(packet) => packet.encode(buf),
            Self::Subscribe(packet) => packet.encode(buf),
            Self::SubscribeAck(packet) => packet.encode(buf),
            Self::Unsubscribe(packet) => packet.encode(buf),
            Self::UnsubscribeAck(packet) => packet.encode(buf),
            Self::PingRequest(packet) => packet.encode(buf),
            Self::PingResponse(packet) => packet.encode(buf),
            Self::Disconnect(packet) => packet.encode(buf),
        }
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType,
};

/// `PublishReleasePacket` is the response to a `PublishReceivedPacket`.
/// It is the third packet of the `QoS` 2 protocol exchange.
///
/// Bits 3,2,1 and 0 of the fixed header in the PUBREL Control Packet are
/// reserved and MUST be set to 0,0,1 and 0 respectively. The Server MUST
/// treat any other value as malformed and close the Network Connection
/// [MQTT-3.6.1-1].
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReleasePacket {
    packet_id: PacketId,
}

impl PublishReleasePacket {
    #[must_use]
    pub const fn new(packet_id: PacketId) -> Self {
        Self { packet_id }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }
}

impl DecodePacket for PublishReleasePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishRelease {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != PacketId::bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let packet_id = PacketId::decode(ba)?;
        Ok(Self { packet_id })
    }
}

impl EncodePacket for PublishReleasePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = FixedHeader::new(PacketType::PublishRelease, PacketId::bytes())?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = PublishReleasePacket::new(PacketId::new(9));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x62, 0x02, 0x00, 0x09]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishReleasePacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_zero_flags() {
        let buf = [0x60, 0x02, 0x00, 0x09];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishReleasePacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }
}

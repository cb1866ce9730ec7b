// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType,
};

/// `PingResponsePacket` is sent by the Server to the Client in response to a
/// `PingRequestPacket`. It indicates that the Server is alive.
///
/// This packet has no variable header and no payload.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingResponsePacket {}

impl PingResponsePacket {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

impl DecodePacket for PingResponsePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PingResponse {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 0 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self {})
    }
}

impl EncodePacket for PingResponsePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0)?;
        fixed_header.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = PingResponsePacket::new();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0xd0, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PingResponsePacket::decode(&mut ba).unwrap(), packet);
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, QoS, VarIntError,
};

/// Return code of a single subscription in a `SubscribeAckPacket`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeAck {
    /// Subscription accepted, with the maximum `QoS` the Server grants.
    QoS(QoS),

    /// Subscription refused.
    Failed,
}

impl SubscribeAck {
    const FAILED: u8 = 0x80;
}

impl From<SubscribeAck> for u8 {
    fn from(ack: SubscribeAck) -> Self {
        match ack {
            SubscribeAck::QoS(qos) => qos as u8,
            SubscribeAck::Failed => SubscribeAck::FAILED,
        }
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        // Allowed return codes are 0x00, 0x01, 0x02 and 0x80 [MQTT-3.9.3-2].
        if v == Self::FAILED {
            Ok(Self::Failed)
        } else {
            QoS::try_from(v).map(Self::QoS)
        }
    }
}

/// `SubscribeAckPacket` is sent by the Server to the Client to confirm receipt
/// and processing of a `SubscribePacket`.
///
/// The SUBACK Packet MUST contain a return code for each Topic Filter/QoS pair,
/// in the same order as in the SUBSCRIBE Packet [MQTT-3.9.3-1].
///
/// Basic structure of the packet:
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Packet id             |
/// |                       |
/// +-----------------------+
/// | Ack 0                 |
/// +-----------------------+
/// | Ack 1                 |
/// +-----------------------+
/// | ...                   |
/// +-----------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,

    acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn new(packet_id: PacketId, ack: SubscribeAck) -> Self {
        Self {
            packet_id,
            acks: vec![ack],
        }
    }

    #[must_use]
    pub const fn with_vec(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        Self { packet_id, acks }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acks(&self) -> &[SubscribeAck] {
        &self.acks
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = PacketId::bytes() + self.acks.len();
        FixedHeader::new(PacketType::SubscribeAck, remaining_length)
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() <= PacketId::bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let packet_id = PacketId::decode(ba)?;

        let ack_count = fixed_header.remaining_length() - PacketId::bytes();
        let mut acks = Vec::with_capacity(ack_count);
        for _i in 0..ack_count {
            acks.push(SubscribeAck::try_from(ba.read_byte()?)?);
        }

        Ok(Self { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        for ack in &self.acks {
            buf.push((*ack).into());
        }

        Ok(buf.len() - old_len)
    }
}

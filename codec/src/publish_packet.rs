// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use bytes::BytesMut;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, PubTopic, QoS, VarIntError,
};

/// `PublishPacket` is used to transport application messages from the Client
/// to the Server, or from the Server to the Client.
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name length     |
/// |                       |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// |                       |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// Note that `packet_id` is only present in `QoS` 1 and `QoS` 2 packets.
///
/// Response of `PublishPacket`:
/// * `QoS` 0, no response
/// * `QoS` 1, `PublishAckPacket`
/// * `QoS` 2, `PublishReceivedPacket`
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// If dup field is false, this is the first occasion the packet is sent.
    /// If it is true, this packet might be re-delivery of an earlier attempt.
    ///
    /// The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
    dup: bool,

    /// `qos` field indicates the level of assurance for delivery of the packet.
    qos: QoS,

    /// If `retain` is true in a packet sent to the Server, the message is
    /// stored so that it can be delivered to future subscribers. A zero-byte
    /// payload removes the existing retained message for that topic
    /// [MQTT-3.3.1-10]. When forwarding to currently connected subscribers,
    /// the Server sets the flag to false [MQTT-3.3.1-9].
    retain: bool,

    /// `topic` name must not contain wildcard characters.
    topic: PubTopic,

    /// `packet_id` field is absent if `QoS` is 0.
    packet_id: PacketId,

    /// Application payload. May be empty.
    msg: BytesMut,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            qos,
            dup: false,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            msg: BytesMut::from(msg),
        })
    }

    /// Update `retain` flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    /// Get current `retain` flag.
    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` is set in a `QoS` 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidData);
        }
        self.dup = dup;
        Ok(self)
    }

    /// Get current `dup` flag.
    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Update `QoS` value.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
            self.dup = false;
        }
        self.qos = qos;
        self
    }

    /// Get current `QoS`.
    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// The Packet Identifier field is only present in PUBLISH Packets where
    /// the `QoS` level is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Get current topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;

        let (dup, qos, retain) =
            if let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() {
                (dup, qos, retain)
            } else {
                return Err(DecodeError::InvalidPacketType);
            };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let topic = PubTopic::decode(ba)?;

        // The Packet Identifier field is only present in PUBLISH Packets
        // where the QoS level is 1 or 2.
        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                // SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0)
                // Control Packets MUST contain a non-zero 16-bit Packet
                // Identifier [MQTT-2.3.1-1].
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        // It is valid for a PUBLISH Packet to contain a zero length payload.
        if fixed_header.remaining_length() < topic.bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let mut msg_len = fixed_header.remaining_length() - topic.bytes();
        if qos != QoS::AtMostOnce {
            if msg_len < PacketId::bytes() {
                return Err(DecodeError::InvalidRemainingLength);
            }
            msg_len -= PacketId::bytes();
        }

        let msg = BytesMut::from(ba.read_bytes(msg_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        // Write variable header
        self.topic.encode(v)?;
        if self.qos() != QoS::AtMostOnce {
            self.packet_id.encode(v)?;
        }

        // Write payload
        v.write_all(&self.msg)?;

        Ok(v.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_qos0() {
        let buf = vec![
            0x30, 0x0b, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'1', 0x68, 0x69, 0x21,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.qos(), QoS::AtMostOnce);
        assert!(!packet.dup());
        assert!(!packet.retain());
        assert_eq!(packet.topic(), "room/1");
        assert_eq!(packet.message(), &[0x68, 0x69, 0x21]);
    }

    #[test]
    fn test_decode_qos1() {
        let buf = vec![
            0x32, 0x0a, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'1', 0x00, 0x07,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.qos(), QoS::AtLeastOnce);
        assert_eq!(packet.packet_id().value(), 7);
        assert!(packet.message().is_empty());
    }

    #[test]
    fn test_decode_qos2() {
        let buf = vec![
            0x34, 0x0b, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'1', 0x00, 0x09, 0x02,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.qos(), QoS::ExactOnce);
        assert_eq!(packet.packet_id().value(), 9);
        assert_eq!(packet.message(), &[0x02]);
    }

    #[test]
    fn test_decode_rejects_dup_on_qos0() {
        let buf = vec![
            0x38, 0x0b, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'1', 0x68, 0x69, 0x21,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_decode_rejects_wildcard_topic() {
        let buf = vec![
            0x30, 0x09, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'#', 0x68,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidTopic)
        );
    }

    #[test]
    fn test_decode_rejects_zero_packet_id() {
        let buf = vec![
            0x32, 0x0a, 0x00, 0x06, b'r', b'o', b'o', b'm', b'/', b'1', 0x00, 0x00,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }

    #[test]
    fn test_encode_round_trip() {
        let mut packet = PublishPacket::new("room/1", QoS::AtLeastOnce, &[0x01]).unwrap();
        packet.set_packet_id(PacketId::new(17));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishPacket::decode(&mut ba).unwrap(), packet);
    }
}

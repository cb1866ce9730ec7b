// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::connect_flags::ConnectFlags;
use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType, ProtocolLevel, PubTopic, QoS, StringData, U16Data, VarIntError,
    PROTOCOL_NAME,
};

/// `ConnectPacket` is the first packet sent to the Server after a network
/// connection is established.
///
/// Basic structure of the packet:
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name length       |
/// |                            |
/// +----------------------------+
/// | Protocol name ...          |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Client id length           |
/// |                            |
/// +----------------------------+
/// | Client id string ...       |
/// +----------------------------+
/// | Will topic length          |
/// |                            |
/// +----------------------------+
/// | Will topic string ...      |
/// +----------------------------+
/// | Will message length        |
/// |                            |
/// +----------------------------+
/// | Will message bytes ...     |
/// +----------------------------+
/// | Username length            |
/// |                            |
/// +----------------------------+
/// | Username string ...        |
/// +----------------------------+
/// | Password length            |
/// |                            |
/// +----------------------------+
/// | Password bytes ...         |
/// +----------------------------+
/// ```
///
/// Will topic/message, username and password fields are present in the
/// payload if and only if the matching flag is set in connect flags.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    /// Protocol name can only be `MQTT` [MQTT-3.1.2-1].
    protocol_name: StringData,

    protocol_level: ProtocolLevel,

    connect_flags: ConnectFlags,

    /// Time interval between two packets in seconds.
    ///
    /// The Client must send a packet before exceeding this interval. If this
    /// value is non-zero and the interval elapses without a packet, the
    /// Server disconnects the network [MQTT-3.1.2-24]. A value of zero turns
    /// the keep alive mechanism off.
    keep_alive: U16Data,

    /// `client_id` identifies the session on the Server side.
    ///
    /// May be empty, in which case the Server assigns a unique id and requires
    /// `clean_session` to be true [MQTT-3.1.3-7].
    client_id: StringData,

    /// Topic the Will Message is published to, present iff the will flag is set.
    will_topic: Option<PubTopic>,

    /// Payload of the Will Message, present iff the will flag is set.
    will_message: BinaryData,

    username: StringData,

    password: BinaryData,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            protocol_name,
            keep_alive: U16Data::new(60),
            client_id,
            ..Self::default()
        })
    }

    /// Update connect flags.
    pub fn set_connect_flags(&mut self, flags: ConnectFlags) -> &mut Self {
        self.connect_flags = flags;
        self
    }

    /// Get current connect flags.
    #[must_use]
    #[inline]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    /// Update keep alive value in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = U16Data::new(keep_alive);
        self
    }

    /// Get current keep alive value in seconds.
    #[must_use]
    #[inline]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive.value()
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update username value.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is invalid.
    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        self.username = StringData::from(username)?;
        self.connect_flags.set_has_username(!username.is_empty());
        Ok(self)
    }

    /// Get current username, if the username flag is set.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        if self.connect_flags.has_username() {
            Some(self.username.as_ref())
        } else {
            None
        }
    }

    /// Update password value.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is too long.
    pub fn set_password(&mut self, password: &[u8]) -> Result<&mut Self, EncodeError> {
        self.password = BinaryData::from_slice(password)?;
        self.connect_flags.set_has_password(!password.is_empty());
        Ok(self)
    }

    /// Get current password, if the password flag is set.
    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        if self.connect_flags.has_password() {
            Some(self.password.as_ref())
        } else {
            None
        }
    }

    /// Update will-topic and will-message, and set the will flag.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid or `message` is too long.
    pub fn set_will(&mut self, topic: &str, message: &[u8]) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = BinaryData::from_slice(message)?;
        self.connect_flags.set_will(true);
        Ok(self)
    }

    /// Get current will-topic value, if the will flag is set.
    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    /// Get current will-message value.
    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_ref()
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.protocol_name.bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + U16Data::bytes()
            + self.client_id.bytes();

        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username() {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password() {
            remaining_length += self.password.bytes();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        // Write variable header
        self.protocol_name.encode(v)?;
        self.protocol_level.encode(v)?;
        self.connect_flags.encode(v)?;
        self.keep_alive.encode(v)?;

        // Write payload
        self.client_id.encode(v)?;
        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                will_topic.encode(v)?;
            }
            self.will_message.encode(v)?;
        }
        if self.connect_flags.has_username() {
            self.username.encode(v)?;
        }
        if self.connect_flags.has_password() {
            self.password.encode(v)?;
        }

        Ok(v.len() - old_len)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::decode(ba)?;

        let connect_flags = ConnectFlags::decode(ba)?;

        // If the Will Flag is set to 1, the value of Will QoS can be 0, 1,
        // or 2. It MUST NOT be 3 [MQTT-3.1.2-14]. QoS decode already rejects
        // value 3, so only flag consistency is left to check here.
        if !connect_flags.will()
            && (connect_flags.will_qos() != QoS::AtMostOnce || connect_flags.will_retain())
        {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let keep_alive = U16Data::decode(ba)?;

        let client_id = StringData::decode(ba).map_err(|_err| DecodeError::InvalidClientId)?;

        // If the Client supplies a zero-byte ClientId with CleanSession set to 0,
        // the Server MUST respond to the CONNECT Packet with a CONNACK return code
        // 0x02 (Identifier rejected) and then close the Network Connection
        // [MQTT-3.1.3-8].
        if client_id.is_empty() && !connect_flags.clean_session() {
            return Err(DecodeError::InvalidClientId);
        }

        // Presence of the remaining fields is gated strictly by the connect
        // flags [MQTT-3.1.2-9], [MQTT-3.1.2-19], [MQTT-3.1.2-21].
        let will_topic = if connect_flags.will() {
            Some(PubTopic::decode(ba)?)
        } else {
            None
        };
        let will_message = if connect_flags.will() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        let username = if connect_flags.has_username() {
            StringData::decode(ba)?
        } else {
            StringData::new()
        };

        let password = if connect_flags.has_password() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 84, 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.client_id(), "wvPTXcCw");
        assert_eq!(packet.keep_alive(), 60);
        assert!(packet.connect_flags().clean_session());
        assert_eq!(packet.username(), None);
        assert_eq!(packet.will_topic(), None);
    }

    #[test]
    fn test_decode_with_will_and_credentials() {
        let mut packet = ConnectPacket::new("A").unwrap();
        packet.set_will("lwt/A", &[0xde, 0xad]).unwrap();
        let mut flags = packet.connect_flags().clone();
        flags.set_will_qos(QoS::AtLeastOnce);
        packet.set_connect_flags(flags);
        packet.set_username("admin").unwrap();
        packet.set_password(b"secret").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.will_topic(), Some("lwt/A"));
        assert_eq!(decoded.will_message(), &[0xde, 0xad]);
        assert_eq!(decoded.connect_flags().will_qos(), QoS::AtLeastOnce);
        assert_eq!(decoded.username(), Some("admin"));
        assert_eq!(decoded.password(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_decode_rejects_bad_protocol_name() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 83, 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }

    #[test]
    fn test_decode_rejects_bad_protocol_level() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 84, 3, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolLevel)
        );
    }

    #[test]
    fn test_decode_rejects_empty_client_id_without_clean_session() {
        let buf: Vec<u8> = vec![16, 12, 0, 4, 77, 81, 84, 84, 4, 0, 0, 60, 0, 0];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidClientId)
        );
    }
}

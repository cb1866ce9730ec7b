// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS};

/// Structure of `ConnectFlags` is:
/// ```txt
///         7               6              5          4-3          2            1             0
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// | Username Flag | Password Flag | Will Retain | Will QoS | Will Flag | Clean Session | Reserved |
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// ```
#[allow(clippy::struct_excessive_bools)]
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFlags {
    /// `username` field specifies whether `username` shall be presented in the payload.
    has_username: bool,

    /// `password` field specifies whether `password` shall be presented in the payload.
    /// If `username` field is false, then this field shall be false too.
    has_password: bool,

    /// `will_retain` field specifies if the Will Message is to be retained when it
    /// is published. If the `will` field is false, then this field must be false.
    will_retain: bool,

    /// `QoS` level to be used when publishing the Will Message.
    will_qos: QoS,

    /// If this field is set to true, a Will Message is stored on the Server side when
    /// the Client connects, and is published when the connection closes abnormally:
    /// * I/O error or network error
    /// * keep alive timeout
    /// * network disconnected without Disconnect Packet
    /// * protocol error
    will: bool,

    /// To control how to handle Session State.
    /// If `clean_session` is true, the Client and Server must discard any previous
    /// Session State and start a new one, which lasts as long as the network
    /// connection.
    clean_session: bool,
}

impl ConnectFlags {
    /// Get byte length in packet.
    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        1
    }

    /// Update `has_username` flag.
    pub fn set_has_username(&mut self, has_username: bool) -> &mut Self {
        self.has_username = has_username;
        self
    }

    /// Get current `has_username` flag.
    #[must_use]
    #[inline]
    pub const fn has_username(&self) -> bool {
        self.has_username
    }

    /// Update `has_password` flag.
    pub fn set_has_password(&mut self, has_password: bool) -> &mut Self {
        self.has_password = has_password;
        self
    }

    /// Get current `has_password` flag.
    #[must_use]
    #[inline]
    pub const fn has_password(&self) -> bool {
        self.has_password
    }

    /// Update will-retain flag.
    pub fn set_will_retain(&mut self, will_retain: bool) -> &mut Self {
        self.will_retain = will_retain;
        self
    }

    /// Get will-retain flag.
    #[must_use]
    #[inline]
    pub const fn will_retain(&self) -> bool {
        self.will_retain
    }

    /// Update will-qos.
    pub fn set_will_qos(&mut self, qos: QoS) -> &mut Self {
        self.will_qos = qos;
        self
    }

    /// Get current will-qos.
    #[must_use]
    #[inline]
    pub const fn will_qos(&self) -> QoS {
        self.will_qos
    }

    /// Update will flag.
    pub fn set_will(&mut self, will: bool) -> &mut Self {
        if !will {
            self.will_qos = QoS::AtMostOnce;
            self.will_retain = false;
        }
        self.will = will;
        self
    }

    /// Get current will flag.
    #[must_use]
    #[inline]
    pub const fn will(&self) -> bool {
        self.will
    }

    /// Update clean-session flag.
    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    /// Get clean-session flag.
    #[must_use]
    #[inline]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }
}

impl Default for ConnectFlags {
    fn default() -> Self {
        Self {
            has_username: false,
            has_password: false,
            will_retain: false,
            will_qos: QoS::AtMostOnce,
            will: false,
            clean_session: true,
        }
    }
}

impl EncodePacket for ConnectFlags {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut flags = 0b0000_0000;
        if self.has_username {
            flags |= 0b1000_0000;
        }
        if self.has_password {
            flags |= 0b0100_0000;
        }
        if self.will_retain {
            flags |= 0b0010_0000;
        }
        flags |= match self.will_qos {
            QoS::AtMostOnce => 0b0000_0000,
            QoS::AtLeastOnce => 0b0000_1000,
            QoS::ExactOnce => 0b0001_0000,
        };
        if self.will {
            flags |= 0b0000_0100;
        }
        if self.clean_session {
            flags |= 0b0000_0010;
        }
        v.push(flags);

        Ok(Self::bytes())
    }
}

impl DecodePacket for ConnectFlags {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        let has_username = flags & 0b1000_0000 == 0b1000_0000;
        let has_password = flags & 0b0100_0000 == 0b0100_0000;
        let will_retain = flags & 0b0010_0000 == 0b0010_0000;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will = flags & 0b0000_0100 == 0b0000_0100;
        let clean_session = flags & 0b0000_0010 == 0b0000_0010;

        // The Server MUST validate that the reserved flag in the CONNECT Control Packet
        // is set to zero and disconnect the Client if it is not zero [MQTT-3.1.2-3].
        if flags & 0b0000_0001 != 0b0000_0000 {
            return Err(DecodeError::InvalidConnectFlags);
        }

        // If the User Name Flag is set to 0, the Password Flag MUST be set to 0
        // [MQTT-3.1.2-22].
        if !has_username && has_password {
            return Err(DecodeError::InvalidConnectFlags);
        }

        // If the Will Flag is set to 0 the Will QoS and Will Retain fields MUST be
        // set to zero [MQTT-3.1.2-11], [MQTT-3.1.2-13].
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidConnectFlags);
        }

        Ok(Self {
            has_username,
            has_password,
            will_retain,
            will_qos,
            will,
            clean_session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let buf = [0b1100_1110];
        let mut ba = ByteArray::new(&buf);
        let flags = ConnectFlags::decode(&mut ba).unwrap();
        assert!(flags.has_username());
        assert!(flags.has_password());
        assert!(!flags.will_retain());
        assert_eq!(flags.will_qos(), QoS::AtLeastOnce);
        assert!(flags.will());
        assert!(flags.clean_session());
    }

    #[test]
    fn test_decode_rejects_reserved_bit() {
        let buf = [0b0000_0011];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectFlags::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }

    #[test]
    fn test_decode_rejects_password_without_username() {
        let buf = [0b0100_0010];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectFlags::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }

    #[test]
    fn test_decode_rejects_will_qos_without_will() {
        let buf = [0b0000_1010];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectFlags::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,

    /// Topic length exceeds 65535 bytes.
    TooManyData,

    /// Topic contains a null character, or a wildcard character is not
    /// placed according to MQTT-4.7.1 rules.
    InvalidChar,

    /// Topic name contains wildcard characters.
    ContainsWildcardChar,
}

/// One level of a topic filter, delimited by `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopicPart {
    /// Normal part.
    Normal(String),

    /// Empty part, between two adjacent separators or at either end.
    Empty,

    /// `#` char, to match any remaining parts, the parent level included.
    MultiWildcard,

    /// `+` char, to match exactly one part.
    SingleWildcard,
}

impl TopicPart {
    fn has_wildcard(s: &str) -> bool {
        s.contains(|c| c == '#' || c == '+')
    }

    fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "" => Ok(Self::Empty),
            "+" => Ok(Self::SingleWildcard),
            "#" => Ok(Self::MultiWildcard),
            _ => {
                if Self::has_wildcard(s) {
                    // `+` and `#` must occupy an entire level [MQTT-4.7.1-2],
                    // [MQTT-4.7.1-3].
                    Err(TopicError::InvalidChar)
                } else {
                    Ok(Self::Normal(s.to_string()))
                }
            }
        }
    }
}

fn validate_topic_chars(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains('\u{0}') {
        return Err(TopicError::InvalidChar);
    }
    Ok(())
}

/// Topic name a PUBLISH packet is addressed to.
///
/// The Topic Name in the PUBLISH Packet MUST NOT contain wildcard
/// characters [MQTT-3.3.2-2].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic object from `topic` string.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty, too long or contains invalid
    /// characters.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_topic_chars(topic)?;
        if TopicPart::has_wildcard(topic) {
            return Err(TopicError::ContainsWildcardChar);
        }
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        Self::new(&s).map_err(Into::into)
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter a SUBSCRIBE packet carries, with `+` and `#` wildcards.
///
/// Wildcard placement rules are defined in MQTT chapter 4.7 Topic Names
/// and Topic Filters:
/// * `#` matches any number of levels, including the parent level. It MUST
///   be the last character of the filter, and MUST occupy an entire level
///   [MQTT-4.7.1-1], [MQTT-4.7.1-2].
/// * `+` matches exactly one level and MUST occupy an entire level
///   [MQTT-4.7.1-3].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone)]
pub struct SubTopic {
    topic: String,
    parts: Vec<TopicPart>,
}

impl PartialEq for SubTopic {
    fn eq(&self, other: &Self) -> bool {
        self.topic.eq(&other.topic)
    }
}

impl Eq for SubTopic {}

impl std::hash::Hash for SubTopic {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.topic.hash(state);
    }
}

impl SubTopic {
    /// Create a new topic filter object from `topic` string.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` violates wildcard placement rules.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_topic_chars(topic)?;
        let parts = topic
            .split('/')
            .map(TopicPart::parse)
            .collect::<Result<Vec<_>, TopicError>>()?;
        for (index, part) in parts.iter().enumerate() {
            if part == &TopicPart::MultiWildcard && index != parts.len() - 1 {
                return Err(TopicError::InvalidChar);
            }
        }
        Ok(Self {
            topic: topic.to_string(),
            parts,
        })
    }

    /// Check whether topic name `s` matches this filter.
    #[must_use]
    pub fn is_match(&self, s: &str) -> bool {
        let levels: Vec<&str> = s.split('/').collect();
        let mut index = 0;
        for part in &self.parts {
            match part {
                // `sport/#` also matches the parent `sport` [MQTT-4.7.1-1].
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    if index >= levels.len() {
                        return false;
                    }
                    index += 1;
                }
                TopicPart::Normal(ref filter_level) => {
                    if index >= levels.len() || filter_level != levels[index] {
                        return false;
                    }
                    index += 1;
                }
                TopicPart::Empty => {
                    if index >= levels.len() || !levels[index].is_empty() {
                        return false;
                    }
                    index += 1;
                }
            }
        }
        index == levels.len()
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.topic.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.topic
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        Self::new(&s).map_err(Into::into)
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.topic.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.topic.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("sport/tennis/player1").is_ok());
        assert_eq!(
            PubTopic::new("sport/tennis/#"),
            Err(TopicError::ContainsWildcardChar)
        );
        assert_eq!(
            PubTopic::new("sport/+/player1"),
            Err(TopicError::ContainsWildcardChar)
        );
        assert_eq!(PubTopic::new(""), Err(TopicError::EmptyTopic));
    }

    #[test]
    fn test_sub_topic_parse() {
        assert!(SubTopic::new("#").is_ok());
        assert!(SubTopic::new("+").is_ok());
        assert!(SubTopic::new("sport/tennis/player1").is_ok());
        assert!(SubTopic::new("sport/tennis/player1/#").is_ok());
        assert!(SubTopic::new("sport/+/player1").is_ok());
        assert!(SubTopic::new("+/tennis/#").is_ok());

        assert!(SubTopic::new("sport/tennis#").is_err());
        assert!(SubTopic::new("sport/#x").is_err());
        assert!(SubTopic::new("sport/b+").is_err());
        assert!(SubTopic::new("sport/#/ranking").is_err());
        assert!(SubTopic::new("").is_err());
    }

    #[test]
    fn test_multi_wildcard_match() {
        let filter = SubTopic::new("#").unwrap();
        assert!(filter.is_match("sport"));
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(filter.is_match("/"));

        let filter = SubTopic::new("sport/#").unwrap();
        assert!(filter.is_match("sport"));
        assert!(filter.is_match("sport/tennis"));
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(!filter.is_match("sporting"));
    }

    #[test]
    fn test_single_wildcard_match() {
        let filter = SubTopic::new("sport/+").unwrap();
        assert!(filter.is_match("sport/tennis"));
        assert!(filter.is_match("sport/"));
        assert!(!filter.is_match("sport"));
        assert!(!filter.is_match("sport/tennis/player1"));

        let filter = SubTopic::new("+/+").unwrap();
        assert!(filter.is_match("a/b"));
        assert!(filter.is_match("/b"));
        assert!(!filter.is_match("a"));
    }

    #[test]
    fn test_literal_match() {
        let filter = SubTopic::new("sport/tennis").unwrap();
        assert!(filter.is_match("sport/tennis"));
        assert!(!filter.is_match("sport/Tennis"));
        assert!(!filter.is_match("sport/tennis/player1"));
    }
}

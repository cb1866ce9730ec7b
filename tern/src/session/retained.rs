// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Store of the last retained message per topic.

use std::collections::HashMap;

use codec::{PublishPacket, QoS, SubscribeTopic};

/// Maps a topic name to the last PUBLISH received on it with the retain flag
/// set.
#[derive(Debug, Default, Clone)]
pub struct RetainedMessages {
    map: HashMap<String, PublishPacket>,
}

impl RetainedMessages {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Apply the retained semantics of `packet`.
    ///
    /// If the retain flag is unset this is a no-op. A retained PUBLISH with a
    /// zero-byte payload removes any message retained on that topic
    /// [MQTT-3.3.1-10], [MQTT-3.3.1-11]; otherwise the stored message is
    /// replaced [MQTT-3.3.1-5].
    pub fn retain(&mut self, packet: &PublishPacket) {
        if !packet.retain() {
            return;
        }
        if packet.message().is_empty() {
            if self.map.remove(packet.topic()).is_some() {
                log::debug!("retained: Removed retained message on {}", packet.topic());
            }
        } else {
            self.map
                .insert(packet.topic().to_string(), packet.clone());
        }
    }

    /// Collect retained messages whose topic matches any filter in `topics`.
    ///
    /// Each retained topic appears at most once, delivered at the minimum of
    /// its stored QoS and the highest QoS of the filters matching it.
    #[must_use]
    pub fn find_matches(&self, topics: &[SubscribeTopic]) -> Vec<(PublishPacket, QoS)> {
        let mut result = Vec::new();
        for packet in self.map.values() {
            let mut best: Option<QoS> = None;
            for topic in topics {
                if topic.topic().is_match(packet.topic()) {
                    best = Some(best.map_or(topic.qos(), |qos| qos.max(topic.qos())));
                }
            }
            if let Some(qos) = best {
                result.push((packet.clone(), qos.min(packet.qos())));
            }
        }
        result
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retained_publish(topic: &str, qos: QoS, msg: &[u8]) -> PublishPacket {
        let mut packet = PublishPacket::new(topic, qos, msg).unwrap();
        packet.set_retain(true);
        packet
    }

    #[test]
    fn test_retain_ignores_unretained() {
        let mut store = RetainedMessages::new();
        let packet = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[0xaa]).unwrap();
        store.retain(&packet);
        assert!(store.is_empty());
    }

    #[test]
    fn test_retain_replaces_existing() {
        let mut store = RetainedMessages::new();
        store.retain(&retained_publish("cfg/x", QoS::AtMostOnce, &[0xaa]));
        store.retain(&retained_publish("cfg/x", QoS::AtLeastOnce, &[0xbb]));
        assert_eq!(store.len(), 1);

        let filters = [SubscribeTopic::new("cfg/#", QoS::ExactOnce).unwrap()];
        let matches = store.find_matches(&filters);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0.message(), &[0xbb]);
        assert_eq!(matches[0].1, QoS::AtLeastOnce);
    }

    #[test]
    fn test_empty_payload_removes_entry() {
        let mut store = RetainedMessages::new();
        store.retain(&retained_publish("cfg/x", QoS::AtMostOnce, &[0xaa]));
        store.retain(&retained_publish("cfg/x", QoS::AtMostOnce, &[]));
        assert!(store.is_empty());

        let filters = [SubscribeTopic::new("cfg/#", QoS::AtMostOnce).unwrap()];
        assert!(store.find_matches(&filters).is_empty());
    }

    #[test]
    fn test_find_matches_effective_qos() {
        let mut store = RetainedMessages::new();
        store.retain(&retained_publish("cfg/x", QoS::ExactOnce, &[0xaa]));

        // Effective QoS is the minimum of retained and subscribed QoS.
        let filters = [SubscribeTopic::new("cfg/x", QoS::AtMostOnce).unwrap()];
        assert_eq!(store.find_matches(&filters)[0].1, QoS::AtMostOnce);

        // Multiple matching filters grant the highest subscribed QoS, once.
        let filters = [
            SubscribeTopic::new("cfg/#", QoS::AtMostOnce).unwrap(),
            SubscribeTopic::new("cfg/x", QoS::AtLeastOnce).unwrap(),
        ];
        let matches = store.find_matches(&filters);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, QoS::AtLeastOnce);
    }
}

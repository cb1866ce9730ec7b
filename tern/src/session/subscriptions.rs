// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Topic subscription index across all connected sessions.

use std::collections::HashMap;

use codec::{QoS, SubTopic, SubscribeAck, SubscribeAckPacket, SubscribePacket, UnsubscribePacket};

use crate::commands::ClientId;

/// Topic filter and granted maximum QoS of one subscription.
#[derive(Debug, Clone)]
pub struct SubscribePattern {
    topic: SubTopic,

    /// Maximum QoS the Server will use when publishing to this subscription.
    qos: QoS,
}

impl SubscribePattern {
    #[must_use]
    pub const fn new(topic: SubTopic, qos: QoS) -> Self {
        Self { topic, qos }
    }

    #[must_use]
    pub const fn topic(&self) -> &SubTopic {
        &self.topic
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }
}

/// The union of all subscription entries of all connected sessions, keyed by
/// client id and topic filter string.
#[derive(Debug, Default, Clone)]
pub struct TopicSubscriptions {
    map: HashMap<ClientId, HashMap<String, SubscribePattern>>,
}

impl TopicSubscriptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert all filters in `packet` for `client_id`.
    ///
    /// A filter identical to an existing subscription replaces it, possibly
    /// with another QoS [MQTT-3.8.4-3].
    ///
    /// If a Server receives a SUBSCRIBE packet that contains multiple Topic
    /// Filters it MUST handle it as if it had received a sequence of multiple
    /// SUBSCRIBE packets, except that it combines their responses into a
    /// single SUBACK response [MQTT-3.8.4-4].
    pub fn subscribe(&mut self, client_id: &str, packet: &SubscribePacket) -> SubscribeAckPacket {
        let patterns = self.map.entry(client_id.to_string()).or_default();

        let mut ack_vec = Vec::with_capacity(packet.topics().len());
        for topic in packet.topics() {
            patterns.insert(
                topic.topic().as_ref().to_string(),
                SubscribePattern::new(topic.topic().clone(), topic.qos()),
            );
            // The granted QoS mirrors the requested one.
            ack_vec.push(SubscribeAck::QoS(topic.qos()));
        }

        SubscribeAckPacket::with_vec(packet.packet_id(), ack_vec)
    }

    /// Remove every entry of `client_id` whose filter appears in `packet`.
    ///
    /// Returns the number of removed entries.
    pub fn unsubscribe(&mut self, client_id: &str, packet: &UnsubscribePacket) -> usize {
        self.map.get_mut(client_id).map_or(0, |patterns| {
            packet
                .topics()
                .iter()
                .filter(|topic| patterns.remove(topic.as_ref()).is_some())
                .count()
        })
    }

    /// Remove all entries of `client_id`.
    ///
    /// Returns the number of removed entries.
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        self.map.remove(client_id).map_or(0, |patterns| patterns.len())
    }

    /// Collect the sessions subscribed to `topic`.
    ///
    /// If several filters of the same client match, the client appears once
    /// with the maximum of the granted QoS values.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Vec<(ClientId, QoS)> {
        let mut result = Vec::new();
        for (client_id, patterns) in &self.map {
            let mut best: Option<QoS> = None;
            for pattern in patterns.values() {
                if pattern.topic().is_match(topic) {
                    best = Some(best.map_or(pattern.qos(), |qos| qos.max(pattern.qos())));
                }
            }
            if let Some(qos) = best {
                result.push((client_id.clone(), qos));
            }
        }
        result
    }
}

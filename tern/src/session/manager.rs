// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Maps client ids to sessions and orchestrates message routing.

use std::collections::HashMap;
use std::time::Duration;

use codec::{
    Packet, PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use tokio::sync::mpsc::Sender;

use super::{LastWill, RetainedMessages, Session, TopicSubscriptions};
use crate::commands::{
    ClientId, ConnectionToDispatcherCmd, DispatcherToConnectionCmd, DisconnectReason,
    RetryDirection,
};
use crate::config::General;
use crate::error::Error;

/// Owns the session map, the topic subscription index and the retained
/// message store.
///
/// All methods run on the dispatcher task; the three structures are never
/// touched from anywhere else.
pub struct SessionManager {
    /// Cloned into sessions so their retry timers can post expirations back
    /// to the dispatcher.
    dispatcher_sender: Sender<ConnectionToDispatcherCmd>,

    ack_timeout: Duration,

    max_retries: usize,

    sessions: HashMap<ClientId, Session>,

    subscriptions: TopicSubscriptions,

    retained: RetainedMessages,
}

impl SessionManager {
    #[must_use]
    pub fn new(general: &General, dispatcher_sender: Sender<ConnectionToDispatcherCmd>) -> Self {
        Self {
            dispatcher_sender,
            ack_timeout: general.pub_ack_timeout(),
            max_retries: general.pub_max_retries(),
            sessions: HashMap::new(),
            subscriptions: TopicSubscriptions::new(),
            retained: RetainedMessages::new(),
        }
    }

    /// A client passed authentication, bind a fresh session to its
    /// connection.
    ///
    /// An existing session with the same client id is disconnected first
    /// [MQTT-3.1.4-2].
    pub async fn client_connected(
        &mut self,
        client_id: ClientId,
        packet: &codec::ConnectPacket,
        connection_sender: Sender<DispatcherToConnectionCmd>,
    ) {
        if let Some(old_session) = self.sessions.remove(&client_id) {
            log::info!("sessions: Replacing existing session of {client_id}");
            self.subscriptions.remove_client(&client_id);
            old_session.close_connection().await;
        }

        let last_will = packet.will_topic().map(|topic| LastWill {
            topic: topic.to_string(),
            message: packet.will_message().to_vec(),
            qos: packet.connect_flags().will_qos(),
            retain: packet.connect_flags().will_retain(),
        });

        let session = Session::new(
            client_id.clone(),
            connection_sender,
            self.dispatcher_sender.clone(),
            last_will,
            self.ack_timeout,
            self.max_retries,
        );
        self.sessions.insert(client_id.clone(), session);
        log::info!("sessions: Client {client_id} connected");
    }

    /// A connection went away. Publish the last will on abrupt disconnects,
    /// then destroy the session and its subscriptions.
    pub async fn client_disconnected(&mut self, client_id: &str, reason: DisconnectReason) {
        log::info!("sessions: Client {client_id} disconnected, reason {reason:?}");

        if !reason.suppresses_last_will() {
            let last_will = self
                .sessions
                .get(client_id)
                .and_then(|session| session.last_will().cloned());
            if let Some(will) = last_will {
                // The will goes through the normal publish path, retained
                // semantics included.
                match PublishPacket::new(&will.topic, will.qos, &will.message) {
                    Ok(mut publish) => {
                        publish.set_retain(will.retain);
                        self.publish_message(&publish).await;
                    }
                    Err(err) => {
                        log::error!(
                            "sessions: Invalid last will of {client_id}, topic {}: {err:?}",
                            will.topic
                        );
                    }
                }
            }
        }

        self.sessions.remove(client_id);
        self.subscriptions.remove_client(client_id);
    }

    /// Register the filters of a SUBSCRIBE packet, answer SUBACK and deliver
    /// matching retained messages.
    pub async fn client_subscribed(&mut self, client_id: &str, packet: &SubscribePacket) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            log::error!("sessions: No session of {client_id} found");
            return;
        };

        let ack = self.subscriptions.subscribe(client_id, packet);
        session.send(Packet::SubscribeAck(ack)).await;

        // Retained messages matching the new filters are delivered with the
        // retain flag kept [MQTT-3.3.1-8].
        for (retained, qos) in self.retained.find_matches(packet.topics()) {
            session.publish(&retained, qos).await;
        }
    }

    /// Drop the listed filters of `client_id`, answer UNSUBACK.
    pub async fn client_unsubscribed(&mut self, client_id: &str, packet: &UnsubscribePacket) {
        let removed = self.subscriptions.unsubscribe(client_id, packet);
        log::debug!("sessions: Client {client_id} removed {removed} subscriptions");

        if let Some(session) = self.sessions.get(client_id) {
            session
                .send(Packet::UnsubscribeAck(UnsubscribeAckPacket::new(
                    packet.packet_id(),
                )))
                .await;
        }
    }

    /// A client published an application message.
    pub async fn client_published(&mut self, client_id: &str, packet: &PublishPacket) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            log::error!("sessions: No session of {client_id} found");
            return;
        };

        let deliver = session.client_sent_publish(packet).await;
        if deliver {
            self.publish_message(packet).await;
        }
    }

    pub async fn client_acked_publish(&mut self, client_id: &str, packet: &PublishAckPacket) {
        let ret = match self.sessions.get_mut(client_id) {
            Some(session) => session.client_acked_publish(packet.packet_id()).await,
            None => Err(Error::session_error(client_id)),
        };
        self.check_violation(client_id, ret).await;
    }

    pub async fn client_received_publish(
        &mut self,
        client_id: &str,
        packet: &PublishReceivedPacket,
    ) {
        let ret = match self.sessions.get_mut(client_id) {
            Some(session) => session.client_received_publish(packet.packet_id()).await,
            None => Err(Error::session_error(client_id)),
        };
        self.check_violation(client_id, ret).await;
    }

    pub async fn client_released_publish(
        &mut self,
        client_id: &str,
        packet: &PublishReleasePacket,
    ) {
        let ret = match self.sessions.get_mut(client_id) {
            Some(session) => session.client_released_publish(packet.packet_id()).await,
            None => Err(Error::session_error(client_id)),
        };
        self.check_violation(client_id, ret).await;
    }

    pub async fn client_completed_publish(
        &mut self,
        client_id: &str,
        packet: &PublishCompletePacket,
    ) {
        let ret = match self.sessions.get_mut(client_id) {
            Some(session) => session.client_completed_publish(packet.packet_id()).await,
            None => Err(Error::session_error(client_id)),
        };
        self.check_violation(client_id, ret).await;
    }

    /// Route an expired retry timer to its session.
    pub async fn retry_timeout(
        &mut self,
        client_id: &str,
        direction: RetryDirection,
        packet_id: codec::PacketId,
        epoch: u64,
    ) {
        // The session may have been destroyed since the timer was armed.
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.retry_timeout(direction, packet_id, epoch).await;
        }
    }

    /// Destroy all sessions.
    pub async fn destroy_all(&mut self) {
        log::info!("sessions: Destroying all {} sessions", self.sessions.len());
        for (_client_id, session) in self.sessions.drain() {
            session.close_connection().await;
        }
        self.subscriptions = TopicSubscriptions::new();
    }

    /// Deliver `packet` to all matching subscribers, then apply its retained
    /// semantics.
    ///
    /// The copy forwarded to subscribers carries retain=0 [MQTT-3.3.1-9];
    /// forwarding happens before the store update so a concurrent subscriber
    /// never sees the message twice.
    async fn publish_message(&mut self, packet: &PublishPacket) {
        let mut forwarded = packet.clone();
        forwarded.set_retain(false);

        for (client_id, max_qos) in self.subscriptions.resolve(packet.topic()) {
            if let Some(session) = self.sessions.get_mut(&client_id) {
                session.publish(&forwarded, max_qos).await;
            }
        }

        self.retained.retain(packet);
    }

    /// Tear the session down if `ret` is a protocol violation.
    ///
    /// The connection is told to close without dispatching its own
    /// disconnect; last will and cleanup run here, as on any abrupt
    /// disconnect.
    async fn check_violation(&mut self, client_id: &str, ret: Result<(), Error>) {
        if let Err(err) = ret {
            log::error!("sessions: {err}");
            if let Some(session) = self.sessions.get(client_id) {
                session.close_connection().await;
            }
            self.client_disconnected(client_id, DisconnectReason::ProtocolViolation)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{ConnectPacket, PacketId, QoS, SubscribeTopic};
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::Receiver;

    fn new_manager() -> (SessionManager, Receiver<ConnectionToDispatcherCmd>) {
        let (dispatcher_sender, dispatcher_receiver) = mpsc::channel(32);
        let manager = SessionManager::new(&General::default(), dispatcher_sender);
        (manager, dispatcher_receiver)
    }

    async fn connect(
        manager: &mut SessionManager,
        client_id: &str,
        packet: &ConnectPacket,
    ) -> Receiver<DispatcherToConnectionCmd> {
        let (sender, receiver) = mpsc::channel(32);
        manager
            .client_connected(client_id.to_string(), packet, sender)
            .await;
        receiver
    }

    fn expect_publish(receiver: &mut Receiver<DispatcherToConnectionCmd>) -> PublishPacket {
        loop {
            match receiver.try_recv() {
                Ok(DispatcherToConnectionCmd::Send(Packet::Publish(packet))) => return packet,
                Ok(DispatcherToConnectionCmd::Send(_)) => {}
                other => panic!("Expected a PUBLISH, got {other:?}"),
            }
        }
    }

    fn subscribe_packet(filters: &[(&str, QoS)]) -> SubscribePacket {
        let topics = filters
            .iter()
            .map(|(filter, qos)| SubscribeTopic::new(filter, *qos).unwrap())
            .collect();
        SubscribePacket::with_topics(PacketId::new(1), topics)
    }

    #[tokio::test]
    async fn test_publish_routes_to_subscribers() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let connect_a = ConnectPacket::new("A").unwrap();
        let mut receiver_a = connect(&mut manager, "A", &connect_a).await;
        manager
            .client_subscribed("A", &subscribe_packet(&[("room/1", QoS::AtMostOnce)]))
            .await;
        // Drain the SUBACK.
        let _suback = receiver_a.try_recv().unwrap();

        let connect_b = ConnectPacket::new("B").unwrap();
        let _receiver_b = connect(&mut manager, "B", &connect_b).await;

        let publish = PublishPacket::new("room/1", QoS::AtMostOnce, &[0x68, 0x69]).unwrap();
        manager.client_published("B", &publish).await;

        let delivered = expect_publish(&mut receiver_a);
        assert_eq!(delivered.topic(), "room/1");
        assert_eq!(delivered.message(), &[0x68, 0x69]);
        assert_eq!(delivered.qos(), QoS::AtMostOnce);
        assert!(!delivered.retain());
    }

    #[tokio::test]
    async fn test_last_will_published_on_abrupt_disconnect() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let mut connect_a = ConnectPacket::new("A").unwrap();
        connect_a.set_will("lwt/A", &[0xde, 0xad]).unwrap();
        let mut flags = connect_a.connect_flags().clone();
        flags.set_will_qos(QoS::AtLeastOnce);
        connect_a.set_connect_flags(flags);
        let _receiver_a = connect(&mut manager, "A", &connect_a).await;

        let connect_c = ConnectPacket::new("C").unwrap();
        let mut receiver_c = connect(&mut manager, "C", &connect_c).await;
        manager
            .client_subscribed("C", &subscribe_packet(&[("lwt/#", QoS::AtLeastOnce)]))
            .await;
        let _suback = receiver_c.try_recv().unwrap();

        manager
            .client_disconnected("A", DisconnectReason::NetworkOrServerFailure)
            .await;

        let will = expect_publish(&mut receiver_c);
        assert_eq!(will.topic(), "lwt/A");
        assert_eq!(will.message(), &[0xde, 0xad]);
        assert_eq!(will.qos(), QoS::AtLeastOnce);
        assert!(!will.retain());
    }

    #[tokio::test]
    async fn test_graceful_disconnect_suppresses_last_will() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let mut connect_a = ConnectPacket::new("A").unwrap();
        connect_a.set_will("lwt/A", &[0xde, 0xad]).unwrap();
        let _receiver_a = connect(&mut manager, "A", &connect_a).await;

        let connect_c = ConnectPacket::new("C").unwrap();
        let mut receiver_c = connect(&mut manager, "C", &connect_c).await;
        manager
            .client_subscribed("C", &subscribe_packet(&[("lwt/#", QoS::AtLeastOnce)]))
            .await;
        let _suback = receiver_c.try_recv().unwrap();

        manager
            .client_disconnected("A", DisconnectReason::ClientDisconnect)
            .await;

        assert!(receiver_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_message_delivered_on_subscribe() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let connect_b = ConnectPacket::new("B").unwrap();
        let _receiver_b = connect(&mut manager, "B", &connect_b).await;
        let mut publish = PublishPacket::new("cfg/x", QoS::AtLeastOnce, &[0xaa]).unwrap();
        publish.set_packet_id(PacketId::new(5));
        publish.set_retain(true);
        manager.client_published("B", &publish).await;

        let connect_a = ConnectPacket::new("A").unwrap();
        let mut receiver_a = connect(&mut manager, "A", &connect_a).await;
        manager
            .client_subscribed("A", &subscribe_packet(&[("cfg/#", QoS::AtMostOnce)]))
            .await;
        let _suback = receiver_a.try_recv().unwrap();

        let retained = expect_publish(&mut receiver_a);
        assert_eq!(retained.topic(), "cfg/x");
        assert!(retained.retain());
        // min(retained QoS 1, subscribed QoS 0)
        assert_eq!(retained.qos(), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_retained_deletion() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let connect_b = ConnectPacket::new("B").unwrap();
        let _receiver_b = connect(&mut manager, "B", &connect_b).await;
        let mut publish = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[0xaa]).unwrap();
        publish.set_retain(true);
        manager.client_published("B", &publish).await;

        let mut delete = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[]).unwrap();
        delete.set_retain(true);
        manager.client_published("B", &delete).await;

        let connect_a = ConnectPacket::new("A").unwrap();
        let mut receiver_a = connect(&mut manager, "A", &connect_a).await;
        manager
            .client_subscribed("A", &subscribe_packet(&[("cfg/#", QoS::AtMostOnce)]))
            .await;
        let _suback = receiver_a.try_recv().unwrap();
        assert!(receiver_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_takeover_closes_old_connection() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let connect_a = ConnectPacket::new("A").unwrap();
        let mut old_receiver = connect(&mut manager, "A", &connect_a).await;
        let _new_receiver = connect(&mut manager, "A", &connect_a).await;

        match old_receiver.try_recv() {
            Ok(DispatcherToConnectionCmd::Close) => {}
            other => panic!("Expected a Close command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_puback_for_unknown_id_closes_connection() {
        let (mut manager, _dispatcher_receiver) = new_manager();

        let connect_a = ConnectPacket::new("A").unwrap();
        let mut receiver_a = connect(&mut manager, "A", &connect_a).await;

        manager
            .client_acked_publish("A", &PublishAckPacket::new(PacketId::new(42)))
            .await;
        match receiver_a.try_recv() {
            Ok(DispatcherToConnectionCmd::Close) => {}
            other => panic!("Expected a Close command, got {other:?}"),
        }
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-client session state and the QoS 1/2 in-flight state machines.

use std::collections::HashMap;
use std::time::Duration;

use codec::{
    Packet, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS,
};
use tokio::sync::mpsc::Sender;

use crate::commands::{
    ClientId, ConnectionToDispatcherCmd, DispatcherToConnectionCmd, RetryDirection,
};
use crate::error::{Error, ErrorKind};

mod inflight;
mod manager;
mod retained;
mod subscriptions;

use inflight::{RxPublication, TxPublication, TxState};
pub use manager::SessionManager;
pub use retained::RetainedMessages;
pub use subscriptions::{SubscribePattern, TopicSubscriptions};

/// Will message registered at CONNECT time, published when the session ends
/// abruptly.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Per-client state, owned by the session manager and keyed by client id.
///
/// The session holds a sender handle to its connection task. The connection
/// may die independently of the session; outbound operations then become
/// no-ops.
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,

    connection_sender: Sender<DispatcherToConnectionCmd>,

    /// Retry timers post their expirations back through this channel.
    dispatcher_sender: Sender<ConnectionToDispatcherCmd>,

    last_will: Option<LastWill>,

    ack_timeout: Duration,

    max_retries: usize,

    /// QoS 2 publications received from the client, keyed by the packet id
    /// the client chose.
    rx_in_flight: HashMap<PacketId, RxPublication>,

    /// QoS 1/2 publications sent to the client, keyed by the packet id
    /// allocated here.
    tx_in_flight: HashMap<PacketId, TxPublication>,

    /// Packet id counter, wrapping within 1..=0xffff.
    next_packet_id: u16,

    /// Monotonic counter identifying retry timer armings.
    next_timer_epoch: u64,
}

impl Session {
    #[must_use]
    pub fn new(
        client_id: ClientId,
        connection_sender: Sender<DispatcherToConnectionCmd>,
        dispatcher_sender: Sender<ConnectionToDispatcherCmd>,
        last_will: Option<LastWill>,
        ack_timeout: Duration,
        max_retries: usize,
    ) -> Self {
        Self {
            client_id,
            connection_sender,
            dispatcher_sender,
            last_will,
            ack_timeout,
            max_retries,
            rx_in_flight: HashMap::new(),
            tx_in_flight: HashMap::new(),
            next_packet_id: 0,
            next_timer_epoch: 0,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWill> {
        self.last_will.as_ref()
    }

    /// Send `packet` to the client.
    ///
    /// A dead connection makes this a no-op.
    pub async fn send(&self, packet: Packet) {
        if let Err(err) = self
            .connection_sender
            .send(DispatcherToConnectionCmd::Send(packet))
            .await
        {
            log::debug!(
                "session: Connection of {} is gone, dropping packet: {err}",
                self.client_id
            );
        }
    }

    /// Ask the connection task to shut the socket down.
    pub async fn close_connection(&self) {
        if let Err(err) = self
            .connection_sender
            .send(DispatcherToConnectionCmd::Close)
            .await
        {
            log::debug!(
                "session: Connection of {} is gone already: {err}",
                self.client_id
            );
        }
    }

    /// Handle a PUBLISH packet received from this client.
    ///
    /// Returns true if the message shall be delivered to subscribers.
    pub async fn client_sent_publish(&mut self, packet: &PublishPacket) -> bool {
        match packet.qos() {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => {
                // QoS 1 is acknowledged right away, no state is kept.
                self.send(Packet::PublishAck(PublishAckPacket::new(packet.packet_id())))
                    .await;
                true
            }
            QoS::ExactOnce => {
                let packet_id = packet.packet_id();
                if self.rx_in_flight.contains_key(&packet_id) {
                    // Client retry of an exchange still in progress. The
                    // message reached subscribers on the first attempt
                    // [MQTT-4.3.3-2].
                    self.send(Packet::PublishReceived(PublishReceivedPacket::new(
                        packet_id,
                    )))
                    .await;
                    false
                } else {
                    self.send(Packet::PublishReceived(PublishReceivedPacket::new(
                        packet_id,
                    )))
                    .await;
                    let epoch = self.arm_retry_timer(RetryDirection::Receive, packet_id);
                    self.rx_in_flight
                        .insert(packet_id, RxPublication::new(packet_id, epoch));
                    true
                }
            }
        }
    }

    /// Handle a PUBREL packet received from this client.
    ///
    /// # Errors
    ///
    /// Returns error if no QoS 2 exchange with this packet id is in flight.
    pub async fn client_released_publish(&mut self, packet_id: PacketId) -> Result<(), Error> {
        if self.rx_in_flight.remove(&packet_id).is_some() {
            self.send(Packet::PublishComplete(PublishCompletePacket::new(
                packet_id,
            )))
            .await;
            Ok(())
        } else {
            Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: PUBREL without matching PUBLISH, client {}, packet id {packet_id}",
                    self.client_id
                ),
            ))
        }
    }

    /// Handle a PUBACK packet received from this client.
    ///
    /// # Errors
    ///
    /// Returns error if the packet id is not in flight, or the publication
    /// is a QoS 2 exchange.
    pub async fn client_acked_publish(&mut self, packet_id: PacketId) -> Result<(), Error> {
        match self.tx_in_flight.get(&packet_id).map(TxPublication::state) {
            Some(TxState::WaitingForAck) => {
                self.tx_in_flight.remove(&packet_id);
                log::trace!(
                    "session: QoS 1 publication {packet_id} to {} completed",
                    self.client_id
                );
                Ok(())
            }
            Some(_) => Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: PUBACK in QoS 2 exchange, client {}, packet id {packet_id}",
                    self.client_id
                ),
            )),
            None => Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: PUBACK for unknown packet id {packet_id}, client {}",
                    self.client_id
                ),
            )),
        }
    }

    /// Handle a PUBREC packet received from this client.
    ///
    /// # Errors
    ///
    /// Returns error if the packet id is not in flight, or the publication
    /// is a QoS 1 exchange.
    pub async fn client_received_publish(&mut self, packet_id: PacketId) -> Result<(), Error> {
        let state = match self.tx_in_flight.get(&packet_id).map(TxPublication::state) {
            Some(state) => state,
            None => {
                return Err(Error::from_string(
                    ErrorKind::ProtocolViolation,
                    format!(
                        "session: PUBREC for unknown packet id {packet_id}, client {}",
                        self.client_id
                    ),
                ))
            }
        };
        match state {
            TxState::WaitingForRec | TxState::WaitingForComp => {
                // First PUBREC moves the exchange on; a repeated PUBREC means
                // the peer lost our PUBREL, so send it again.
                self.send(Packet::PublishRelease(PublishReleasePacket::new(packet_id)))
                    .await;
                let epoch = self.arm_retry_timer(RetryDirection::Transmit, packet_id);
                if let Some(entry) = self.tx_in_flight.get_mut(&packet_id) {
                    entry.set_state(TxState::WaitingForComp);
                    entry.set_epoch(epoch);
                }
                Ok(())
            }
            TxState::WaitingForAck => Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: PUBREC in QoS 1 exchange, client {}, packet id {packet_id}",
                    self.client_id
                ),
            )),
        }
    }

    /// Handle a PUBCOMP packet received from this client.
    ///
    /// # Errors
    ///
    /// Returns error if the packet id is not in flight, or the exchange did
    /// not reach the PUBREL stage yet.
    pub async fn client_completed_publish(&mut self, packet_id: PacketId) -> Result<(), Error> {
        match self.tx_in_flight.get(&packet_id).map(TxPublication::state) {
            Some(TxState::WaitingForComp) => {
                self.tx_in_flight.remove(&packet_id);
                log::trace!(
                    "session: QoS 2 publication {packet_id} to {} completed",
                    self.client_id
                );
                Ok(())
            }
            Some(_) => Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: Unexpected PUBCOMP, client {}, packet id {packet_id}",
                    self.client_id
                ),
            )),
            None => Err(Error::from_string(
                ErrorKind::ProtocolViolation,
                format!(
                    "session: PUBCOMP for unknown packet id {packet_id}, client {}",
                    self.client_id
                ),
            )),
        }
    }

    /// Publish an application message to this client, at the minimum of the
    /// message QoS and `max_qos` granted by the subscription.
    pub async fn publish(&mut self, packet: &PublishPacket, max_qos: QoS) {
        let qos = packet.qos().min(max_qos);
        let mut publish = packet.clone();
        publish.set_qos(qos);
        let _ret = publish.set_dup(false);

        if qos == QoS::AtMostOnce {
            self.send(Packet::Publish(publish)).await;
            return;
        }

        let Some(packet_id) = self.allocate_packet_id() else {
            log::warn!(
                "session: All packet ids of {} are in flight, dropping publication",
                self.client_id
            );
            return;
        };
        publish.set_packet_id(packet_id);

        let state = if qos == QoS::AtLeastOnce {
            TxState::WaitingForAck
        } else {
            TxState::WaitingForRec
        };
        self.send(Packet::Publish(publish.clone())).await;
        let epoch = self.arm_retry_timer(RetryDirection::Transmit, packet_id);
        self.tx_in_flight
            .insert(packet_id, TxPublication::new(publish, state, epoch));
    }

    /// Handle an expired retry timer.
    ///
    /// The publication the timer was armed for may have completed, failed or
    /// been rearmed since; a missing entry or a stale `epoch` makes this a
    /// no-op.
    pub async fn retry_timeout(
        &mut self,
        direction: RetryDirection,
        packet_id: PacketId,
        epoch: u64,
    ) {
        match direction {
            RetryDirection::Receive => {
                let Some(entry) = self.rx_in_flight.get(&packet_id).copied() else {
                    return;
                };
                if entry.epoch() != epoch {
                    return;
                }
                if entry.retry_count() < self.max_retries {
                    self.send(Packet::PublishReceived(PublishReceivedPacket::new(
                        packet_id,
                    )))
                    .await;
                    let new_epoch = self.arm_retry_timer(RetryDirection::Receive, packet_id);
                    if let Some(entry) = self.rx_in_flight.get_mut(&packet_id) {
                        entry.increment_retry();
                        entry.set_epoch(new_epoch);
                    }
                } else {
                    log::warn!(
                        "session: Abandoning inbound publication {packet_id} of {}",
                        self.client_id
                    );
                    self.rx_in_flight.remove(&packet_id);
                }
            }
            RetryDirection::Transmit => {
                let (state, publish) = match self.tx_in_flight.get(&packet_id) {
                    Some(entry) if entry.epoch() == epoch => {
                        if entry.retry_count() >= self.max_retries {
                            log::warn!(
                                "session: Abandoning publication {packet_id} to {}",
                                self.client_id
                            );
                            self.tx_in_flight.remove(&packet_id);
                            return;
                        }
                        (entry.state(), entry.publish().clone())
                    }
                    _ => return,
                };
                let resend = match state {
                    TxState::WaitingForAck | TxState::WaitingForRec => {
                        let mut publish = publish;
                        // set_dup only fails on QoS 0, which never enters
                        // the in-flight table.
                        let _ret = publish.set_dup(true);
                        Packet::Publish(publish)
                    }
                    TxState::WaitingForComp => {
                        Packet::PublishRelease(PublishReleasePacket::new(packet_id))
                    }
                };
                self.send(resend).await;
                let new_epoch = self.arm_retry_timer(RetryDirection::Transmit, packet_id);
                if let Some(entry) = self.tx_in_flight.get_mut(&packet_id) {
                    entry.increment_retry();
                    entry.set_epoch(new_epoch);
                }
            }
        }
    }

    /// Allocate the next free packet id.
    ///
    /// Ids currently in flight are skipped, and id 0 is never allocated
    /// [MQTT-2.3.1-1]. Returns None if all 65535 ids are in flight.
    fn allocate_packet_id(&mut self) -> Option<PacketId> {
        for _i in 0..usize::from(u16::MAX) {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            let packet_id = PacketId::new(self.next_packet_id);
            if !self.tx_in_flight.contains_key(&packet_id) {
                return Some(packet_id);
            }
        }
        None
    }

    /// Arm a retry timer for `packet_id` and return the arming epoch.
    ///
    /// The timer task holds no reference to this session; its expiry is
    /// routed through the dispatcher and matched against the entry's current
    /// epoch, so a firing after release or rearm is a no-op.
    fn arm_retry_timer(&mut self, direction: RetryDirection, packet_id: PacketId) -> u64 {
        self.next_timer_epoch += 1;
        let epoch = self.next_timer_epoch;
        let client_id = self.client_id.clone();
        let sender = self.dispatcher_sender.clone();
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ret = sender
                .send(ConnectionToDispatcherCmd::RetryTimeout {
                    client_id,
                    direction,
                    packet_id,
                    epoch,
                })
                .await;
        });
        epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::Receiver;

    const ACK_TIMEOUT: Duration = Duration::from_millis(40);
    const MAX_RETRIES: usize = 2;

    fn new_session() -> (
        Session,
        Receiver<DispatcherToConnectionCmd>,
        Receiver<ConnectionToDispatcherCmd>,
    ) {
        let (connection_sender, connection_receiver) = mpsc::channel(32);
        let (dispatcher_sender, dispatcher_receiver) = mpsc::channel(32);
        let session = Session::new(
            "client-a".to_string(),
            connection_sender,
            dispatcher_sender,
            None,
            ACK_TIMEOUT,
            MAX_RETRIES,
        );
        (session, connection_receiver, dispatcher_receiver)
    }

    fn expect_sent(receiver: &mut Receiver<DispatcherToConnectionCmd>) -> Packet {
        match receiver.try_recv() {
            Ok(DispatcherToConnectionCmd::Send(packet)) => packet,
            other => panic!("Expected a Send command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_qos1_publish_received_is_acked_without_state() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let mut publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        publish.set_packet_id(PacketId::new(7));
        assert!(session.client_sent_publish(&publish).await);

        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishAck(PublishAckPacket::new(PacketId::new(7)))
        );
        assert!(session.rx_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_qos2_publish_retry_is_not_redelivered() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let mut publish = PublishPacket::new("a/b", QoS::ExactOnce, &[0x02]).unwrap();
        publish.set_packet_id(PacketId::new(9));
        assert!(session.client_sent_publish(&publish).await);
        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishReceived(PublishReceivedPacket::new(PacketId::new(9)))
        );

        // Client retries while the exchange is open.
        let _ret = publish.set_dup(true);
        assert!(!session.client_sent_publish(&publish).await);
        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishReceived(PublishReceivedPacket::new(PacketId::new(9)))
        );

        // PUBREL completes the exchange and releases the id.
        session
            .client_released_publish(PacketId::new(9))
            .await
            .unwrap();
        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishComplete(PublishCompletePacket::new(PacketId::new(9)))
        );
        assert!(session.rx_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_pubrel_without_publish_is_a_violation() {
        let (mut session, _connection_receiver, _dispatcher_receiver) = new_session();
        let ret = session.client_released_publish(PacketId::new(3)).await;
        assert_eq!(
            ret.unwrap_err().kind(),
            &ErrorKind::ProtocolViolation
        );
    }

    #[tokio::test]
    async fn test_qos1_transmit_completes_on_puback() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        session.publish(&publish, QoS::AtLeastOnce).await;

        let sent = expect_sent(&mut connection_receiver);
        let Packet::Publish(sent) = sent else {
            panic!("Expected a PUBLISH, got {sent:?}");
        };
        assert_eq!(sent.qos(), QoS::AtLeastOnce);
        let packet_id = sent.packet_id();
        assert!(session.tx_in_flight.contains_key(&packet_id));

        session.client_acked_publish(packet_id).await.unwrap();
        assert!(session.tx_in_flight.is_empty());

        // A second PUBACK for the same id has no entry left to match.
        let ret = session.client_acked_publish(packet_id).await;
        assert_eq!(ret.unwrap_err().kind(), &ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_qos2_transmit_full_exchange() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::ExactOnce, &[0x02]).unwrap();
        session.publish(&publish, QoS::ExactOnce).await;

        let sent = expect_sent(&mut connection_receiver);
        let Packet::Publish(sent) = sent else {
            panic!("Expected a PUBLISH, got {sent:?}");
        };
        let packet_id = sent.packet_id();

        // PUBCOMP before PUBREC is a protocol violation.
        let ret = session.client_completed_publish(packet_id).await;
        assert_eq!(ret.unwrap_err().kind(), &ErrorKind::ProtocolViolation);

        session.client_received_publish(packet_id).await.unwrap();
        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishRelease(PublishReleasePacket::new(packet_id))
        );

        // A repeated PUBREC resends PUBREL without a state change.
        session.client_received_publish(packet_id).await.unwrap();
        assert_eq!(
            expect_sent(&mut connection_receiver),
            Packet::PublishRelease(PublishReleasePacket::new(packet_id))
        );

        session.client_completed_publish(packet_id).await.unwrap();
        assert!(session.tx_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_qos_is_capped() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::ExactOnce, &[0x02]).unwrap();
        session.publish(&publish, QoS::AtMostOnce).await;

        let sent = expect_sent(&mut connection_receiver);
        let Packet::Publish(sent) = sent else {
            panic!("Expected a PUBLISH, got {sent:?}");
        };
        assert_eq!(sent.qos(), QoS::AtMostOnce);
        assert!(session.tx_in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_packet_id_allocation_skips_in_flight() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        session.publish(&publish, QoS::AtLeastOnce).await;
        session.publish(&publish, QoS::AtLeastOnce).await;

        let first = expect_sent(&mut connection_receiver);
        let second = expect_sent(&mut connection_receiver);
        let (Packet::Publish(first), Packet::Publish(second)) = (first, second) else {
            panic!("Expected two PUBLISH packets");
        };
        assert_ne!(first.packet_id(), second.packet_id());
    }

    #[tokio::test]
    async fn test_retry_timer_posts_timeout_to_dispatcher() {
        let (mut session, mut connection_receiver, mut dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        session.publish(&publish, QoS::AtLeastOnce).await;
        let _first = expect_sent(&mut connection_receiver);

        let cmd = dispatcher_receiver.recv().await.unwrap();
        let ConnectionToDispatcherCmd::RetryTimeout {
            client_id,
            direction,
            packet_id,
            epoch,
        } = cmd
        else {
            panic!("Expected a RetryTimeout command, got {cmd:?}");
        };
        assert_eq!(client_id, "client-a");
        assert_eq!(direction, RetryDirection::Transmit);

        // Driving the timeout through the session resends with dup=1.
        session.retry_timeout(direction, packet_id, epoch).await;
        let resent = expect_sent(&mut connection_receiver);
        let Packet::Publish(resent) = resent else {
            panic!("Expected a PUBLISH, got {resent:?}");
        };
        assert!(resent.dup());
        assert_eq!(resent.packet_id(), packet_id);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_releases_id() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        session.publish(&publish, QoS::AtLeastOnce).await;
        let sent = expect_sent(&mut connection_receiver);
        let Packet::Publish(sent) = sent else {
            panic!("Expected a PUBLISH, got {sent:?}");
        };
        let packet_id = sent.packet_id();

        // Walk the publication through its whole retry budget by hand.
        for _i in 0..MAX_RETRIES {
            let epoch = session.tx_in_flight.get(&packet_id).unwrap().epoch();
            session
                .retry_timeout(RetryDirection::Transmit, packet_id, epoch)
                .await;
            let _resent = expect_sent(&mut connection_receiver);
        }
        let epoch = session.tx_in_flight.get(&packet_id).unwrap().epoch();
        session
            .retry_timeout(RetryDirection::Transmit, packet_id, epoch)
            .await;
        assert!(session.tx_in_flight.is_empty());

        // A firing for the released id is a no-op.
        session
            .retry_timeout(RetryDirection::Transmit, packet_id, epoch)
            .await;
        assert!(connection_receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_epoch_is_a_no_op() {
        let (mut session, mut connection_receiver, _dispatcher_receiver) = new_session();

        let publish = PublishPacket::new("a/b", QoS::AtLeastOnce, &[0x01]).unwrap();
        session.publish(&publish, QoS::AtLeastOnce).await;
        let sent = expect_sent(&mut connection_receiver);
        let Packet::Publish(sent) = sent else {
            panic!("Expected a PUBLISH, got {sent:?}");
        };
        let packet_id = sent.packet_id();
        let epoch = session.tx_in_flight.get(&packet_id).unwrap().epoch();

        session
            .retry_timeout(RetryDirection::Transmit, packet_id, epoch)
            .await;
        let _resent = expect_sent(&mut connection_receiver);

        // The entry was rearmed with a newer epoch; the old one is stale.
        session
            .retry_timeout(RetryDirection::Transmit, packet_id, epoch)
            .await;
        assert!(connection_receiver.try_recv().is_err());
    }
}

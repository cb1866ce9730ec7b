// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::{Packet, PacketId, PublishAckPacket, PublishPacket, QoS};

mod common;
use common::{start_broker, TestClient};

#[tokio::test]
async fn test_retained_message_delivered_to_new_subscriber() {
    let address = start_broker(18981).await;

    let mut client_b = TestClient::connect(address).await;
    client_b.connect_client("B").await;
    let mut publish = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[0xaa]).unwrap();
    publish.set_retain(true);
    client_b.send(&publish).await;

    let mut client_a = TestClient::connect(address).await;
    client_a.connect_client("A").await;
    client_a.subscribe("cfg/#", QoS::AtMostOnce, 1).await;

    let delivered = client_a.recv_packet().await;
    let Packet::Publish(delivered) = delivered else {
        panic!("Expected a PUBLISH, got {delivered:?}");
    };
    assert_eq!(delivered.topic(), "cfg/x");
    assert_eq!(delivered.message(), &[0xaa]);
    assert!(delivered.retain());
}

#[tokio::test]
async fn test_retained_delivery_qos_is_min_of_both() {
    let address = start_broker(18982).await;

    let mut client_b = TestClient::connect(address).await;
    client_b.connect_client("B").await;
    let mut publish = PublishPacket::new("cfg/x", QoS::AtLeastOnce, &[0xaa]).unwrap();
    publish.set_packet_id(PacketId::new(3));
    publish.set_retain(true);
    client_b.send(&publish).await;
    let _ack = client_b.recv_packet().await;

    // Subscribed at QoS 0, retained at QoS 1: delivered at QoS 0.
    let mut client_a = TestClient::connect(address).await;
    client_a.connect_client("A").await;
    client_a.subscribe("cfg/#", QoS::AtMostOnce, 1).await;
    let delivered = client_a.recv_packet().await;
    let Packet::Publish(delivered) = delivered else {
        panic!("Expected a PUBLISH, got {delivered:?}");
    };
    assert_eq!(delivered.qos(), QoS::AtMostOnce);
    assert!(delivered.retain());

    // Subscribed at QoS 2, retained at QoS 1: delivered at QoS 1.
    let mut client_c = TestClient::connect(address).await;
    client_c.connect_client("C").await;
    client_c.subscribe("cfg/#", QoS::ExactOnce, 1).await;
    let delivered = client_c.recv_packet().await;
    let Packet::Publish(delivered) = delivered else {
        panic!("Expected a PUBLISH, got {delivered:?}");
    };
    assert_eq!(delivered.qos(), QoS::AtLeastOnce);
    client_c.send(&PublishAckPacket::new(delivered.packet_id())).await;
}

#[tokio::test]
async fn test_empty_payload_deletes_retained_message() {
    let address = start_broker(18983).await;

    let mut client_b = TestClient::connect(address).await;
    client_b.connect_client("B").await;
    let mut publish = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[0xaa]).unwrap();
    publish.set_retain(true);
    client_b.send(&publish).await;

    // A first subscriber sees the retained message.
    let mut client_a = TestClient::connect(address).await;
    client_a.connect_client("A").await;
    client_a.subscribe("cfg/#", QoS::AtMostOnce, 1).await;
    let _delivered = client_a.recv_packet().await;

    // An empty payload deletes the entry.
    let mut delete = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[]).unwrap();
    delete.set_retain(true);
    client_b.send(&delete).await;

    // Later subscribers receive nothing.
    let mut client_c = TestClient::connect(address).await;
    client_c.connect_client("C").await;
    client_c.subscribe("cfg/#", QoS::AtMostOnce, 1).await;
    client_c.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_live_forwarding_clears_retain_flag() {
    let address = start_broker(18984).await;

    let mut client_a = TestClient::connect(address).await;
    client_a.connect_client("A").await;
    client_a.subscribe("cfg/#", QoS::AtMostOnce, 1).await;

    let mut client_b = TestClient::connect(address).await;
    client_b.connect_client("B").await;
    let mut publish = PublishPacket::new("cfg/x", QoS::AtMostOnce, &[0xaa]).unwrap();
    publish.set_retain(true);
    client_b.send(&publish).await;

    // A subscriber connected at publish time sees retain=0 [MQTT-3.3.1-9].
    let delivered = client_a.recv_packet().await;
    let Packet::Publish(delivered) = delivered else {
        panic!("Expected a PUBLISH, got {delivered:?}");
    };
    assert!(!delivered.retain());
}

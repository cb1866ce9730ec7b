// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

#![allow(dead_code)]

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;

use codec::{
    frame, ConnectAckPacket, ConnectPacket, ConnectReturnCode, EncodePacket, FrameStatus, Packet,
    PacketId, QoS, SubscribeAck, SubscribePacket,
};
use tern::config::Config;
use tern::server::ServerContext;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Short retry interval so QoS retransmission tests finish quickly.
pub const PUB_ACK_TIMEOUT: Duration = Duration::from_millis(300);
pub const PUB_MAX_RETRIES: usize = 2;

fn broker_config(port: u16) -> String {
    format!(
        r#"
[general]
address = "127.0.0.1:{port}"
connect_timeout = 2000
pub_ack_timeout = 300
pub_max_retries = 2

[log]
console_log = false
"#
    )
}

/// Start a broker on `port` inside the current runtime.
pub async fn start_broker(port: u16) -> SocketAddr {
    start_broker_with(port, &broker_config(port)).await
}

/// Start a broker on `port` with a custom TOML config.
pub async fn start_broker_with(port: u16, config_content: &str) -> SocketAddr {
    let _ret = env_logger::builder().is_test(true).try_init();

    let config: Config = toml::from_str(config_content).unwrap();
    config.validate().unwrap();
    let server = ServerContext::new(config).unwrap();
    tokio::spawn(async move {
        if let Err(err) = server.run().await {
            panic!("broker failed: {err}");
        }
    });

    let address: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    // Wait for the listener to come up.
    for _i in 0..50 {
        if TcpStream::connect(address).await.is_ok() {
            return address;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broker on {address} did not come up");
}

/// A raw MQTT client speaking codec-encoded frames over a socket.
pub struct TestClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TestClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    /// Send one encoded packet.
    pub async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Receive the next packet, waiting up to five seconds.
    pub async fn recv_packet(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, async {
            loop {
                match frame::scan(&self.buffer).unwrap() {
                    FrameStatus::NeedMore(_more_bytes) => {
                        let n_recv = self.stream.read_buf(&mut self.buffer).await.unwrap();
                        assert!(n_recv > 0, "stream closed while waiting for a packet");
                    }
                    FrameStatus::Frame { packet_len, .. } => {
                        let frame = self.buffer.split_to(packet_len);
                        return Packet::decode(&frame).unwrap();
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Assert the broker closes the stream.
    pub async fn expect_closed(&mut self) {
        timeout(RECV_TIMEOUT, async {
            loop {
                match self.stream.read_buf(&mut self.buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(_n_recv) => {}
                }
            }
        })
        .await
        .expect("timed out waiting for the stream to close");
    }

    /// Assert nothing arrives on the stream for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        match timeout(wait, self.stream.read_buf(&mut self.buffer)).await {
            Err(_elapsed) => {}
            Ok(Ok(0)) => panic!("stream closed while expecting silence"),
            Ok(Ok(n_recv)) => panic!("unexpected {n_recv} bytes while expecting silence"),
            Ok(Err(err)) => panic!("read failed while expecting silence: {err}"),
        }
    }

    /// Run the CONNECT handshake with `client_id` and assert acceptance.
    pub async fn connect_client(&mut self, client_id: &str) {
        let packet = ConnectPacket::new(client_id).unwrap();
        self.send_connect(&packet).await;
    }

    /// Send `packet` and assert the connection is accepted.
    pub async fn send_connect(&mut self, packet: &ConnectPacket) {
        self.send(packet).await;
        let ack = self.recv_packet().await;
        assert_eq!(
            ack,
            Packet::ConnectAck(ConnectAckPacket::new(false, ConnectReturnCode::Accepted))
        );
    }

    /// Subscribe to one filter and assert the SUBACK mirrors `qos`.
    pub async fn subscribe(&mut self, filter: &str, qos: QoS, packet_id: u16) {
        let packet = SubscribePacket::new(filter, qos, PacketId::new(packet_id)).unwrap();
        self.send(&packet).await;
        let ack = self.recv_packet().await;
        let Packet::SubscribeAck(ack) = ack else {
            panic!("Expected a SUBACK, got {ack:?}");
        };
        assert_eq!(ack.packet_id(), PacketId::new(packet_id));
        assert_eq!(ack.acks(), &[SubscribeAck::QoS(qos)]);
    }
}

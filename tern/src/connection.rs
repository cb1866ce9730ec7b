// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! One task per client socket, owning the protocol pipeline up to the
//! dispatcher.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codec::utils::random_client_id;
use codec::{
    frame, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, EncodePacket,
    FrameStatus, Packet, PingResponsePacket,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Instant};

use crate::auth::AuthService;
use crate::commands::{
    ClientId, ConnectionId, ConnectionToDispatcherCmd, DisconnectReason, DispatcherToConnectionCmd,
};
use crate::config::General;

const CHANNEL_CAPACITY: usize = 64;

/// Placeholder deadline while no keep alive is armed; the select guard keeps
/// the timer from ever firing in that state.
const KEEP_ALIVE_FALLBACK: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Accepted, no CONNECT seen yet.
    Invalid,

    /// CONNECT accepted, session registered.
    Connected,

    /// Tear the connection down at the next loop turn.
    Disconnected,
}

/// Owns one client socket and its read/write loops.
///
/// CONNECT, PINGREQ and DISCONNECT are handled here; everything else is
/// forwarded to the dispatcher. The connection holds no reference to its
/// session.
pub struct Connection {
    id: ConnectionId,
    remote_address: SocketAddr,
    stream: TcpStream,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,

    status: Status,
    client_id: ClientId,
    keep_alive: Option<Duration>,
    connect_timeout: Duration,

    /// Why the loop was left; decides whether the last will fires.
    reason: DisconnectReason,

    /// Set once a Disconnect command reached the dispatcher, or the
    /// dispatcher itself tore the session down.
    disconnect_dispatched: bool,

    /// Set once the session was registered with the dispatcher.
    session_created: bool,

    auth: Arc<dyn AuthService>,
    dispatcher_sender: Sender<ConnectionToDispatcherCmd>,
    sender: Sender<DispatcherToConnectionCmd>,
    receiver: Receiver<DispatcherToConnectionCmd>,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        remote_address: SocketAddr,
        general: &General,
        auth: Arc<dyn AuthService>,
        dispatcher_sender: Sender<ConnectionToDispatcherCmd>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            id,
            remote_address,
            stream,
            read_buffer: BytesMut::with_capacity(general.read_buffer_size()),
            write_buffer: Vec::with_capacity(general.write_buffer_size()),
            status: Status::Invalid,
            client_id: ClientId::new(),
            keep_alive: None,
            connect_timeout: general.connect_timeout(),
            reason: DisconnectReason::NetworkOrServerFailure,
            disconnect_dispatched: false,
            session_created: false,
            auth,
            dispatcher_sender,
            sender,
            receiver,
        }
    }

    pub async fn run_loop(mut self) {
        log::info!(
            "connection: Accepted #{} from {}",
            self.id,
            self.remote_address
        );

        // If the Server does not receive a CONNECT Packet within a
        // reasonable amount of time after the Network Connection is
        // established, the Server SHOULD close the connection [MQTT-3.1.4].
        let connect_deadline = time::sleep(self.connect_timeout);
        tokio::pin!(connect_deadline);

        let keep_alive_timer = time::sleep(KEEP_ALIVE_FALLBACK);
        tokio::pin!(keep_alive_timer);

        loop {
            tokio::select! {
                ret = self.stream.read_buf(&mut self.read_buffer) => {
                    match ret {
                        Ok(0) => {
                            log::info!("connection: Peer closed stream, {}", self.remote_address);
                            self.reason = DisconnectReason::NetworkOrServerFailure;
                            break;
                        }
                        Ok(_n_recv) => {
                            if let Err(reason) = self.handle_incoming().await {
                                self.reason = reason;
                                break;
                            }
                            if self.status == Status::Disconnected {
                                break;
                            }
                            // Every control packet from the client restarts
                            // the keep alive interval.
                            if let Some(period) = self.keep_alive {
                                keep_alive_timer.as_mut().reset(Instant::now() + period);
                            }
                        }
                        Err(err) => {
                            log::error!(
                                "connection: Read failed, {}, err: {err}",
                                self.remote_address
                            );
                            self.reason = DisconnectReason::NetworkOrServerFailure;
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    match self.handle_dispatcher_cmd(cmd).await {
                        Ok(()) => {
                            if self.status == Status::Disconnected {
                                break;
                            }
                        }
                        Err(reason) => {
                            self.reason = reason;
                            break;
                        }
                    }
                }
                () = &mut connect_deadline, if self.status == Status::Invalid => {
                    log::warn!(
                        "connection: No CONNECT within {:?}, {}",
                        self.connect_timeout,
                        self.remote_address
                    );
                    // No session exists yet, close without any dispatch.
                    break;
                }
                () = &mut keep_alive_timer, if self.keep_alive.is_some()
                        && self.status == Status::Connected => {
                    log::warn!("connection: Keep alive expired, {}", self.client_id);
                    self.reason = DisconnectReason::KeepAliveTimeoutExpired;
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        if self.session_created && !self.disconnect_dispatched {
            let cmd = ConnectionToDispatcherCmd::Disconnect(self.client_id.clone(), self.reason);
            if let Err(err) = self.dispatcher_sender.send(cmd).await {
                log::error!("connection: Failed to send disconnect cmd, err: {err}");
            }
        }
        let _ret = self.stream.shutdown().await;
        log::info!("connection: Closed #{}, {}", self.id, self.remote_address);
    }

    /// Consume all complete frames in the read buffer.
    async fn handle_incoming(&mut self) -> Result<(), DisconnectReason> {
        loop {
            match frame::scan(&self.read_buffer) {
                Ok(FrameStatus::NeedMore(more_bytes)) => {
                    self.read_buffer.reserve(more_bytes);
                    return Ok(());
                }
                Ok(FrameStatus::Frame { packet_len, .. }) => {
                    let frame = self.read_buffer.split_to(packet_len);
                    self.handle_frame(&frame).await?;
                    if self.status == Status::Disconnected {
                        return Ok(());
                    }
                }
                Err(err) => {
                    log::error!(
                        "connection: Invalid frame from {}, err: {err:?}",
                        self.remote_address
                    );
                    return Err(DisconnectReason::ProtocolViolation);
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), DisconnectReason> {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                // Some CONNECT rejections carry a CONNACK return code before
                // the close: an unacceptable protocol name or level is
                // answered with 0x01 [MQTT-3.1.2-2], a zero-byte client id
                // with clean session unset with 0x02 [MQTT-3.1.3-8].
                if self.status == Status::Invalid {
                    let return_code = match err {
                        DecodeError::InvalidProtocolName
                        | DecodeError::InvalidProtocolLevel => {
                            Some(ConnectReturnCode::UnacceptedProtocol)
                        }
                        DecodeError::InvalidClientId => {
                            Some(ConnectReturnCode::IdentifierRejected)
                        }
                        _ => None,
                    };
                    if let Some(return_code) = return_code {
                        log::warn!(
                            "connection: Rejecting CONNECT from {} with {return_code:?}",
                            self.remote_address
                        );
                        let ack = ConnectAckPacket::new(false, return_code);
                        let _ret = self.send_packet(&Packet::ConnectAck(ack)).await;
                        self.status = Status::Disconnected;
                        return Ok(());
                    }
                }
                log::error!(
                    "connection: Invalid packet from {}, err: {err:?}",
                    self.remote_address
                );
                return Err(DisconnectReason::ProtocolViolation);
            }
        };

        match self.status {
            Status::Invalid => match packet {
                Packet::Connect(packet) => self.on_client_connect(packet).await,
                packet => {
                    // The first packet sent from the Client to the Server
                    // MUST be a CONNECT Packet [MQTT-3.1.0-1].
                    log::error!(
                        "connection: Expected CONNECT, got {:?}, {}",
                        packet.packet_type(),
                        self.remote_address
                    );
                    Err(DisconnectReason::ProtocolViolation)
                }
            },
            Status::Connected => self.on_client_packet(packet).await,
            Status::Disconnected => Ok(()),
        }
    }

    async fn on_client_connect(&mut self, packet: ConnectPacket) -> Result<(), DisconnectReason> {
        let granted =
            self.auth
                .authenticate(self.remote_address, packet.username(), packet.password());
        if !granted {
            log::warn!(
                "connection: Authentication failed for {:?} from {}",
                packet.username(),
                self.remote_address
            );
            // No session was created; the connection closes without any
            // last will.
            let ack = ConnectAckPacket::new(false, ConnectReturnCode::BadUserNameOrPassword);
            let _ret = self.send_packet(&Packet::ConnectAck(ack)).await;
            self.reason = DisconnectReason::AuthenticationFailed;
            self.status = Status::Disconnected;
            return Ok(());
        }

        let mut packet = packet;
        if packet.client_id().is_empty() {
            // Assign a unique client id [MQTT-3.1.3-6]. Generated ids are
            // always valid.
            let client_id = random_client_id();
            let _ret = packet.set_client_id(&client_id);
        }
        self.client_id = packet.client_id().to_string();

        // A keep alive value of zero turns the mechanism off [MQTT-3.1.2-24].
        if packet.keep_alive() > 0 {
            self.keep_alive = Some(Duration::from_secs(u64::from(packet.keep_alive())));
        }

        self.dispatch(ConnectionToDispatcherCmd::Connect {
            client_id: self.client_id.clone(),
            packet,
            sender: self.sender.clone(),
        })
        .await?;
        self.session_created = true;

        self.send_packet(&Packet::ConnectAck(ConnectAckPacket::new(
            false,
            ConnectReturnCode::Accepted,
        )))
        .await?;
        self.status = Status::Connected;
        log::info!(
            "connection: Client {} connected from {}",
            self.client_id,
            self.remote_address
        );
        Ok(())
    }

    async fn on_client_packet(&mut self, packet: Packet) -> Result<(), DisconnectReason> {
        match packet {
            Packet::Connect(_) => {
                // The Server MUST process a second CONNECT Packet sent from
                // a Client as a protocol violation and disconnect the Client
                // [MQTT-3.1.0-2]. No CONNACK is sent.
                log::error!("connection: Second CONNECT from {}", self.client_id);
                Err(DisconnectReason::ProtocolViolation)
            }
            Packet::PingRequest(_) => {
                self.send_packet(&Packet::PingResponse(PingResponsePacket::new()))
                    .await
            }
            Packet::Disconnect(_) => {
                self.dispatch(ConnectionToDispatcherCmd::Disconnect(
                    self.client_id.clone(),
                    DisconnectReason::ClientDisconnect,
                ))
                .await?;
                self.disconnect_dispatched = true;
                self.status = Status::Disconnected;
                Ok(())
            }
            Packet::Subscribe(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::Subscribe(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::Unsubscribe(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::Unsubscribe(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::Publish(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::Publish(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::PublishAck(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::PublishAck(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::PublishReceived(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::PublishReceived(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::PublishRelease(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::PublishRelease(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            Packet::PublishComplete(packet) => {
                self.dispatch(ConnectionToDispatcherCmd::PublishComplete(
                    self.client_id.clone(),
                    packet,
                ))
                .await
            }
            packet => {
                // CONNACK, SUBACK, UNSUBACK and PINGRESP only ever travel
                // from the Server to the Client.
                log::error!(
                    "connection: Unexpected {:?} from client {}",
                    packet.packet_type(),
                    self.client_id
                );
                Err(DisconnectReason::ProtocolViolation)
            }
        }
    }

    async fn handle_dispatcher_cmd(
        &mut self,
        cmd: DispatcherToConnectionCmd,
    ) -> Result<(), DisconnectReason> {
        match cmd {
            DispatcherToConnectionCmd::Send(packet) => self.send_packet(&packet).await,
            DispatcherToConnectionCmd::Close => {
                log::info!("connection: Closed by dispatcher, {}", self.client_id);
                // The dispatcher already tore the session down.
                self.disconnect_dispatched = true;
                self.status = Status::Disconnected;
                Ok(())
            }
        }
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), DisconnectReason> {
        self.write_buffer.clear();
        if let Err(err) = packet.encode(&mut self.write_buffer) {
            log::error!(
                "connection: Failed to encode packet for {}, err: {err:?}",
                self.client_id
            );
            return Ok(());
        }
        if let Err(err) = self.stream.write_all(&self.write_buffer).await {
            log::error!(
                "connection: Write failed, {}, err: {err}",
                self.remote_address
            );
            return Err(DisconnectReason::NetworkOrServerFailure);
        }
        Ok(())
    }

    async fn dispatch(&mut self, cmd: ConnectionToDispatcherCmd) -> Result<(), DisconnectReason> {
        if let Err(err) = self.dispatcher_sender.send(cmd).await {
            log::error!("connection: Dispatcher is gone, err: {err}");
            return Err(DisconnectReason::NetworkOrServerFailure);
        }
        Ok(())
    }
}

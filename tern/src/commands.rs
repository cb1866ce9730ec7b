// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{
    ConnectPacket, Packet, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribePacket, UnsubscribePacket,
};
use tokio::sync::mpsc::Sender;

/// Client id of a connected session.
pub type ClientId = String;

/// Identifies one accepted socket, before a client id is known.
pub type ConnectionId = u64;

/// Why a connection is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a DISCONNECT packet.
    ClientDisconnect,

    /// CONNECT was rejected by the authentication service.
    AuthenticationFailed,

    /// Client sent a malformed packet or a packet its connection state
    /// forbids.
    ProtocolViolation,

    /// No packet arrived within the keep alive interval.
    KeepAliveTimeoutExpired,

    /// I/O error on the socket, or the peer vanished.
    NetworkOrServerFailure,
}

impl DisconnectReason {
    /// On receipt of DISCONNECT the Server MUST discard any Will Message
    /// associated with the current connection without publishing it
    /// [MQTT-3.14.4-3]. A rejected CONNECT never created a session, so there
    /// is no will to publish either.
    #[must_use]
    pub const fn suppresses_last_will(self) -> bool {
        matches!(self, Self::ClientDisconnect | Self::AuthenticationFailed)
    }
}

/// Which in-flight table a retry timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirection {
    /// A publication received from the client, QoS 2 only.
    Receive,

    /// A publication sent to the client, QoS 1 or 2.
    Transmit,
}

/// Commands sent from connection tasks to the dispatcher.
#[derive(Debug)]
pub enum ConnectionToDispatcherCmd {
    /// Client passed authentication, create a session bound to `sender`.
    Connect {
        client_id: ClientId,
        packet: ConnectPacket,
        sender: Sender<DispatcherToConnectionCmd>,
    },

    /// Connection is going away, run last-will and session cleanup.
    Disconnect(ClientId, DisconnectReason),

    Subscribe(ClientId, SubscribePacket),
    Unsubscribe(ClientId, UnsubscribePacket),
    Publish(ClientId, PublishPacket),
    PublishAck(ClientId, PublishAckPacket),
    PublishReceived(ClientId, PublishReceivedPacket),
    PublishRelease(ClientId, PublishReleasePacket),
    PublishComplete(ClientId, PublishCompletePacket),

    /// A retry timer armed by an in-flight publication fired.
    ///
    /// `epoch` identifies the arming; a stale epoch means the publication
    /// has moved on and the firing is a no-op.
    RetryTimeout {
        client_id: ClientId,
        direction: RetryDirection,
        packet_id: PacketId,
        epoch: u64,
    },

    /// Destroy all sessions.
    Shutdown,
}

/// Commands sent from the dispatcher to one connection task.
#[derive(Debug, Clone)]
pub enum DispatcherToConnectionCmd {
    /// Encode `packet` and write it to the socket.
    Send(Packet),

    /// Shut the connection down, a protocol violation was detected during
    /// dispatch.
    Close,
}

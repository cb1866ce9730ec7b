// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod base;
mod binary_data;
mod byte_array;
mod connect_ack_packet;
mod connect_flags;
mod connect_packet;
mod disconnect_packet;
mod error;
pub mod frame;
mod header;
mod packet;
mod ping_request_packet;
mod ping_response_packet;
mod protocol_level;
mod publish_ack_packet;
mod publish_complete_packet;
mod publish_packet;
mod publish_received_packet;
mod publish_release_packet;
mod string_data;
mod subscribe_ack_packet;
mod subscribe_packet;
pub mod topic;
mod u16_data;
mod unsubscribe_ack_packet;
mod unsubscribe_packet;
pub mod utils;
mod var_int;

pub use base::{DecodePacket, EncodePacket, PacketId, QoS, PROTOCOL_NAME};
pub use binary_data::BinaryData;
pub use byte_array::{ByteArray, ByteArrayError};
pub use connect_ack_packet::{ConnectAckPacket, ConnectReturnCode};
pub use connect_flags::ConnectFlags;
pub use connect_packet::ConnectPacket;
pub use disconnect_packet::DisconnectPacket;
pub use error::{DecodeError, EncodeError};
pub use frame::FrameStatus;
pub use header::{FixedHeader, PacketType};
pub use packet::Packet;
pub use ping_request_packet::PingRequestPacket;
pub use ping_response_packet::PingResponsePacket;
pub use protocol_level::ProtocolLevel;
pub use publish_ack_packet::PublishAckPacket;
pub use publish_complete_packet::PublishCompletePacket;
pub use publish_packet::PublishPacket;
pub use publish_received_packet::PublishReceivedPacket;
pub use publish_release_packet::PublishReleasePacket;
pub use string_data::StringData;
pub use subscribe_ack_packet::{SubscribeAck, SubscribeAckPacket};
pub use subscribe_packet::{SubscribePacket, SubscribeTopic};
pub use topic::{PubTopic, SubTopic};
pub use u16_data::U16Data;
pub use unsubscribe_ack_packet::UnsubscribeAckPacket;
pub use unsubscribe_packet::UnsubscribePacket;
pub use var_int::{VarInt, VarIntError, MAX_REMAINING_LENGTH};

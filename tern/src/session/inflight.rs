// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! In-flight publication state, one entry per unacknowledged packet id.
//!
//! A packet id becomes reusable only when its entry leaves the table, either
//! because the protocol exchange completed or because the retry budget was
//! exhausted.

use codec::{PacketId, PublishPacket};

/// States of a transmit-side publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// QoS 1, PUBLISH sent, waiting for PUBACK.
    WaitingForAck,

    /// QoS 2, PUBLISH sent, waiting for PUBREC.
    WaitingForRec,

    /// QoS 2, PUBREL sent, waiting for PUBCOMP.
    WaitingForComp,
}

/// A QoS 1 or QoS 2 publication sent to the client and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct TxPublication {
    /// The PUBLISH packet being delivered, retransmitted with dup=1 on
    /// timeout.
    publish: PublishPacket,

    state: TxState,

    retry_count: usize,

    /// Identifies the currently armed retry timer. A timer firing with an
    /// older epoch belongs to a cancelled arming and is ignored.
    epoch: u64,
}

impl TxPublication {
    #[must_use]
    pub const fn new(publish: PublishPacket, state: TxState, epoch: u64) -> Self {
        Self {
            publish,
            state,
            retry_count: 0,
            epoch,
        }
    }

    #[must_use]
    pub const fn publish(&self) -> &PublishPacket {
        &self.publish
    }

    #[must_use]
    pub const fn state(&self) -> TxState {
        self.state
    }

    pub fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    #[must_use]
    pub const fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }
}

/// A QoS 2 publication received from the client, PUBREC sent, waiting for
/// PUBREL.
///
/// Keyed by the packet id the client chose. While the entry exists, a PUBLISH
/// retry with the same packet id is not delivered to subscribers again
/// [MQTT-4.3.3-2].
#[derive(Debug, Clone, Copy)]
pub struct RxPublication {
    packet_id: PacketId,

    retry_count: usize,

    epoch: u64,
}

impl RxPublication {
    #[must_use]
    pub const fn new(packet_id: PacketId, epoch: u64) -> Self {
        Self {
            packet_id,
            retry_count: 0,
            epoch,
        }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub const fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }
}

// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Fan-in of connection events into the session manager.

use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::ConnectionToDispatcherCmd;
use crate::config::General;
use crate::session::SessionManager;

/// Receives commands from all connection tasks over one channel and invokes
/// the matching session manager method.
///
/// The dispatcher itself is stateless; all broker state lives in the session
/// manager, which only ever runs on this task.
pub struct Dispatcher {
    receiver: Receiver<ConnectionToDispatcherCmd>,
    session_manager: SessionManager,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        general: &General,
        sender: Sender<ConnectionToDispatcherCmd>,
        receiver: Receiver<ConnectionToDispatcherCmd>,
    ) -> Self {
        Self {
            receiver,
            session_manager: SessionManager::new(general, sender),
        }
    }

    pub async fn run_loop(mut self) {
        while let Some(cmd) = self.receiver.recv().await {
            self.handle_connection_cmd(cmd).await;
        }
        log::info!("dispatcher: All connection senders are gone, stopping");
    }

    async fn handle_connection_cmd(&mut self, cmd: ConnectionToDispatcherCmd) {
        match cmd {
            ConnectionToDispatcherCmd::Connect {
                client_id,
                packet,
                sender,
            } => {
                self.session_manager
                    .client_connected(client_id, &packet, sender)
                    .await;
            }
            ConnectionToDispatcherCmd::Disconnect(client_id, reason) => {
                self.session_manager
                    .client_disconnected(&client_id, reason)
                    .await;
            }
            ConnectionToDispatcherCmd::Subscribe(client_id, packet) => {
                self.session_manager
                    .client_subscribed(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::Unsubscribe(client_id, packet) => {
                self.session_manager
                    .client_unsubscribed(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::Publish(client_id, packet) => {
                self.session_manager
                    .client_published(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::PublishAck(client_id, packet) => {
                self.session_manager
                    .client_acked_publish(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::PublishReceived(client_id, packet) => {
                self.session_manager
                    .client_received_publish(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::PublishRelease(client_id, packet) => {
                self.session_manager
                    .client_released_publish(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::PublishComplete(client_id, packet) => {
                self.session_manager
                    .client_completed_publish(&client_id, &packet)
                    .await;
            }
            ConnectionToDispatcherCmd::RetryTimeout {
                client_id,
                direction,
                packet_id,
                epoch,
            } => {
                self.session_manager
                    .retry_timeout(&client_id, direction, packet_id, epoch)
                    .await;
            }
            ConnectionToDispatcherCmd::Shutdown => {
                self.session_manager.destroy_all().await;
            }
        }
    }
}

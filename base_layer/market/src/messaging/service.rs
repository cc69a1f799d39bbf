// Copyright 2022. The Agora Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::time::Duration;

use agora_comms::{
    connectivity::{ConnectivityEvent, ConnectivityEvents},
    transport::PeerTransport,
};
use agora_shutdown::ShutdownSignal;
use log::*;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle, time};

use super::Messenger;

const LOG_TARGET: &str = "market::messaging::service";

/// The retry engine: walks the outgoing queue on a fixed interval and whenever a
/// peer connects, making one bounded delivery attempt per entry. Entries are only
/// ever removed by ACK processing, never by the retry engine itself.
pub struct MessengerService<T: PeerTransport> {
    messenger: Messenger<T>,
    resend_interval: Duration,
    connectivity: ConnectivityEvents,
    shutdown_signal: ShutdownSignal,
}

impl<T: PeerTransport> MessengerService<T> {
    pub fn new(
        messenger: Messenger<T>,
        resend_interval: Duration,
        connectivity: ConnectivityEvents,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            messenger,
            resend_interval,
            connectivity,
            shutdown_signal,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    pub async fn start(mut self) {
        info!(
            target: LOG_TARGET,
            "Messenger retry engine started (interval {}s)",
            self.resend_interval.as_secs()
        );
        let mut events = self.connectivity.subscribe();
        let mut interval = time::interval(self.resend_interval);
        // The first tick fires immediately; skip it so startup does not race the
        // caller's initial sends.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.messenger.resend_pending().await {
                        warn!(target: LOG_TARGET, "Resend pass failed: {}", err);
                    }
                },
                event = events.recv() => {
                    match event {
                        Ok(ConnectivityEvent::PeerConnected(peer)) => {
                            trace!(target: LOG_TARGET, "Peer {} connected, flushing their queue", peer.short_str());
                            if let Err(err) = self.messenger.resend_for(peer).await {
                                warn!(target: LOG_TARGET, "Resend to {} failed: {}", peer.short_str(), err);
                            }
                        },
                        Ok(_) => {},
                        Err(RecvError::Lagged(n)) => {
                            debug!(target: LOG_TARGET, "Connectivity events lagged by {}", n);
                        },
                        Err(RecvError::Closed) => break,
                    }
                },
                _ = &mut self.shutdown_signal => {
                    break;
                },
            }
        }
        info!(target: LOG_TARGET, "Messenger retry engine shut down");
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_comms::{
        ban::BanList,
        message::{Envelope, MessageType},
        node_identity::NodeIdentity,
        service::OutboundMessaging,
        transport::memory::MemoryNetwork,
    };
    use agora_shutdown::Shutdown;

    use super::*;
    use crate::storage::{messages::OutgoingMessageSql, MarketDatabase};

    const PROTOCOL: &str = "/agora/app/1.0.0";

    #[tokio::test]
    async fn queued_message_is_resent_on_peer_connected() {
        let network = MemoryNetwork::new();
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), PROTOCOL);
        let events = ConnectivityEvents::new();
        let outbound = OutboundMessaging::new(transport, BanList::new(), events.clone());
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let messenger = Messenger::new(db.clone(), outbound, identity.clone());

        // The recipient comes online only after the message was queued.
        let recipient_identity = NodeIdentity::random();
        let recipient = recipient_identity.node_id();
        let mut envelope = Envelope::wrap(MessageType::Chat, b"queued".to_vec());
        envelope.sign(&identity);
        messenger.send_reliably(recipient, envelope, None).await.unwrap();
        assert_eq!(db.with_connection(OutgoingMessageSql::count).unwrap(), 1);

        let shutdown = Shutdown::new();
        let service = MessengerService::new(
            messenger.clone(),
            Duration::from_secs(600),
            events.clone(),
            shutdown.to_signal(),
        );
        let handle = service.spawn();

        let (_recipient_transport, mut recipient_rx) = network.create_endpoint(recipient, PROTOCOL);
        events.publish(ConnectivityEvent::PeerConnected(recipient));

        // The retry engine dials the now-reachable peer and hands over a stream.
        let (from, _stream) = recipient_rx.recv().await.unwrap();
        assert_eq!(from, identity.node_id());

        // Still queued: only an ACK removes entries.
        assert_eq!(db.with_connection(OutgoingMessageSql::count).unwrap(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn ack_removes_queue_entry() {
        let network = MemoryNetwork::new();
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), PROTOCOL);
        let events = ConnectivityEvents::new();
        let outbound = OutboundMessaging::new(transport, BanList::new(), events);
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let messenger = Messenger::new(db.clone(), outbound, identity.clone());

        let recipient = NodeIdentity::random().node_id();
        let mut envelope = Envelope::wrap(MessageType::Chat, b"x".to_vec());
        envelope.sign(&identity);
        let id = envelope.id.clone();
        messenger.send_reliably(recipient, envelope, None).await.unwrap();

        assert!(messenger.process_ack(&id).unwrap());
        assert!(!messenger.process_ack(&id).unwrap());
        assert_eq!(db.with_connection(OutgoingMessageSql::count).unwrap(), 0);
    }
}

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

//! Follow relationships. Outbound follow/unfollow share one sequence class per
//! peer, so a rapid follow-then-unfollow is applied remotely in that order and
//! never resurrects the link.

use agora_comms::{
    message::{InboundMessage, MessageType},
    node_id::NodeId,
    transport::PeerTransport,
};
use diesel::SqliteConnection;
use log::*;
use prost::Message;

use crate::{
    messaging::{error::MessagingError, inbound::MessageHandler, Messenger},
    proto::FollowPayload,
    storage::{
        follow::{FollowLinks, FollowRelation},
        messages::SequenceClass,
        MarketDatabase,
    },
};

const LOG_TARGET: &str = "market::follow";

pub struct FollowService<T: PeerTransport> {
    db: MarketDatabase,
    messenger: Messenger<T>,
}

impl<T: PeerTransport> Clone for FollowService<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            messenger: self.messenger.clone(),
        }
    }
}

impl<T: PeerTransport> FollowService<T> {
    pub fn new(db: MarketDatabase, messenger: Messenger<T>) -> Self {
        Self { db, messenger }
    }

    /// Records the link locally and notifies the peer. Idempotent.
    pub async fn follow(&self, peer: NodeId) -> Result<(), MessagingError> {
        let envelope = self.db.transaction_with(|conn| {
            FollowLinks::add(conn, &peer, FollowRelation::Following)?;
            let envelope = self.messenger.prepare_sequenced(
                conn,
                &peer,
                &SequenceClass::Follow,
                MessageType::Follow,
                FollowPayload {}.encode_to_vec(),
            )?;
            self.messenger.queue(conn, &peer, &envelope)?;
            Ok::<_, MessagingError>(envelope)
        })?;
        self.messenger.dispatch(peer, envelope, None).await;
        info!(target: LOG_TARGET, "Now following {}", peer.short_str());
        Ok(())
    }

    pub async fn unfollow(&self, peer: NodeId) -> Result<(), MessagingError> {
        let envelope = self.db.transaction_with(|conn| {
            FollowLinks::remove(conn, &peer, FollowRelation::Following)?;
            let envelope = self.messenger.prepare_sequenced(
                conn,
                &peer,
                &SequenceClass::Follow,
                MessageType::Unfollow,
                FollowPayload {}.encode_to_vec(),
            )?;
            self.messenger.queue(conn, &peer, &envelope)?;
            Ok::<_, MessagingError>(envelope)
        })?;
        self.messenger.dispatch(peer, envelope, None).await;
        info!(target: LOG_TARGET, "No longer following {}", peer.short_str());
        Ok(())
    }

    pub fn followers(&self) -> Result<Vec<NodeId>, MessagingError> {
        Ok(self.db.with_connection(|conn| FollowLinks::list(conn, FollowRelation::Follower))?)
    }

    pub fn following(&self) -> Result<Vec<NodeId>, MessagingError> {
        Ok(self.db.with_connection(|conn| FollowLinks::list(conn, FollowRelation::Following))?)
    }
}

impl<T: PeerTransport> MessageHandler for FollowService<T> {
    fn handle(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), MessagingError> {
        match message.message_type()? {
            MessageType::Follow => {
                FollowLinks::add(conn, &message.source_peer, FollowRelation::Follower)?;
                debug!(target: LOG_TARGET, "{} started following us", message.source_peer.short_str());
            },
            MessageType::Unfollow => {
                FollowLinks::remove(conn, &message.source_peer, FollowRelation::Follower)?;
                debug!(target: LOG_TARGET, "{} stopped following us", message.source_peer.short_str());
            },
            other => {
                return Err(MessagingError::HandlerError(format!(
                    "{:?} is not a follow message",
                    other
                )))
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_comms::{
        ban::BanList,
        connectivity::ConnectivityEvents,
        message::Envelope,
        node_identity::NodeIdentity,
        service::OutboundMessaging,
        transport::memory::{MemoryNetwork, MemoryTransport},
    };

    use super::*;
    use crate::storage::messages::OutgoingMessageSql;

    fn make_service(network: &MemoryNetwork) -> (FollowService<MemoryTransport>, MarketDatabase) {
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), "/agora/test/1.0.0");
        let outbound = OutboundMessaging::new(transport, BanList::new(), ConnectivityEvents::new());
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let messenger = Messenger::new(db.clone(), outbound, identity);
        (FollowService::new(db.clone(), messenger), db)
    }

    #[tokio::test]
    async fn follow_then_unfollow_takes_consecutive_sequence_numbers() {
        let network = MemoryNetwork::new();
        let (service, db) = make_service(&network);
        let peer = NodeIdentity::random().node_id();

        service.follow(peer).await.unwrap();
        assert_eq!(service.following().unwrap(), vec![peer]);
        service.unfollow(peer).await.unwrap();
        assert!(service.following().unwrap().is_empty());

        let queued = db.with_connection(OutgoingMessageSql::all).unwrap();
        let sequences: Vec<(i32, u64)> = queued
            .iter()
            .map(|row| {
                let envelope = Envelope::decode(row.envelope.as_slice()).unwrap();
                (row.message_type, envelope.sequence)
            })
            .collect();
        assert_eq!(sequences, vec![
            (MessageType::Follow as i32, 1),
            (MessageType::Unfollow as i32, 2)
        ]);
    }

    #[tokio::test]
    async fn inbound_follow_and_unfollow_track_followers() {
        let network = MemoryNetwork::new();
        let (service, db) = make_service(&network);
        let sender = NodeIdentity::random();

        let mut envelope = Envelope::wrap(MessageType::Follow, FollowPayload {}.encode_to_vec());
        envelope.sequence = 1;
        envelope.sign(&sender);
        let follow = InboundMessage::new(sender.node_id(), envelope);
        db.transaction_with(|conn| service.handle(conn, &follow)).unwrap();
        assert_eq!(service.followers().unwrap(), vec![sender.node_id()]);

        // A repeated follow is a no-op, not an error.
        db.transaction_with(|conn| service.handle(conn, &follow)).unwrap();
        assert_eq!(service.followers().unwrap().len(), 1);

        let mut envelope = Envelope::wrap(MessageType::Unfollow, FollowPayload {}.encode_to_vec());
        envelope.sequence = 2;
        envelope.sign(&sender);
        let unfollow = InboundMessage::new(sender.node_id(), envelope);
        db.transaction_with(|conn| service.handle(conn, &unfollow)).unwrap();
        assert!(service.followers().unwrap().is_empty());
    }
}

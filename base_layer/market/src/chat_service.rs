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

//! Direct messaging between peers. Messages ride the reliable messenger's chat
//! sequence class, so each conversation arrives in the order it was written.

use agora_comms::{
    message::{InboundMessage, MessageType},
    node_id::NodeId,
    transport::PeerTransport,
};
use chrono::Utc;
use diesel::SqliteConnection;
use log::*;
use prost::Message;
use tokio::sync::broadcast;

use crate::{
    messaging::{error::MessagingError, inbound::MessageHandler, Messenger},
    proto::ChatPayload,
    storage::{chat::ChatMessageSql, messages::SequenceClass, MarketDatabase},
};

const LOG_TARGET: &str = "market::chat";

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatMessageReceived {
    pub from: NodeId,
    pub subject: String,
    pub body: String,
}

pub struct ChatService<T: PeerTransport> {
    db: MarketDatabase,
    messenger: Messenger<T>,
    events: broadcast::Sender<ChatMessageReceived>,
}

impl<T: PeerTransport> Clone for ChatService<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            messenger: self.messenger.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: PeerTransport> ChatService<T> {
    pub fn new(db: MarketDatabase, messenger: Messenger<T>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { db, messenger, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessageReceived> {
        self.events.subscribe()
    }

    /// Queues a chat message for reliable, in-order delivery and records it in
    /// the local history.
    pub async fn send_message(&self, to: NodeId, subject: &str, body: &str) -> Result<(), MessagingError> {
        let payload = ChatPayload {
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp: Utc::now().timestamp() as u64,
        };
        let envelope = self.db.transaction_with(|conn| {
            let envelope = self.messenger.prepare_sequenced(
                conn,
                &to,
                &SequenceClass::Chat,
                MessageType::Chat,
                payload.encode_to_vec(),
            )?;
            self.messenger.queue(conn, &to, &envelope)?;
            ChatMessageSql::new(
                envelope.id.clone(),
                &to,
                true,
                payload.subject.clone(),
                payload.body.clone(),
            )
            .insert(conn)?;
            Ok::<_, MessagingError>(envelope)
        })?;
        self.messenger.dispatch(to, envelope, None).await;
        Ok(())
    }

    pub fn history(&self, peer: &NodeId) -> Result<Vec<ChatMessageSql>, MessagingError> {
        Ok(self.db.with_connection(|conn| ChatMessageSql::history(conn, peer))?)
    }

    pub fn mark_read(&self, peer: &NodeId) -> Result<usize, MessagingError> {
        Ok(self.db.with_connection(|conn| ChatMessageSql::mark_read(conn, peer))?)
    }

    pub fn unread_count(&self, peer: &NodeId) -> Result<i64, MessagingError> {
        Ok(self.db.with_connection(|conn| ChatMessageSql::unread_count(conn, peer))?)
    }
}

impl<T: PeerTransport> MessageHandler for ChatService<T> {
    fn handle(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), MessagingError> {
        let payload = message.decode_payload::<ChatPayload>()?;
        ChatMessageSql::new(
            message.envelope.id.clone(),
            &message.source_peer,
            false,
            payload.subject.clone(),
            payload.body.clone(),
        )
        .insert(conn)?;
        debug!(
            target: LOG_TARGET,
            "Chat message from {} recorded",
            message.source_peer.short_str()
        );
        let _ = self.events.send(ChatMessageReceived {
            from: message.source_peer,
            subject: payload.subject,
            body: payload.body,
        });
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

    fn make_service(network: &MemoryNetwork) -> (ChatService<MemoryTransport>, MarketDatabase) {
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), "/agora/test/1.0.0");
        let outbound = OutboundMessaging::new(transport, BanList::new(), ConnectivityEvents::new());
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let messenger = Messenger::new(db.clone(), outbound, identity);
        (ChatService::new(db.clone(), messenger), db)
    }

    #[tokio::test]
    async fn sent_messages_are_queued_and_in_history() {
        let network = MemoryNetwork::new();
        let (service, db) = make_service(&network);
        let peer = NodeIdentity::random().node_id();

        service.send_message(peer, "", "hello there").await.unwrap();
        service.send_message(peer, "", "second").await.unwrap();

        let history = service.history(&peer).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.outgoing));
        assert_eq!(db.with_connection(OutgoingMessageSql::count).unwrap(), 2);

        // Consecutive messages to one peer take consecutive chat sequence numbers.
        let queued = db.with_connection(OutgoingMessageSql::all).unwrap();
        let sequences: Vec<u64> = queued
            .iter()
            .map(|row| Envelope::decode(row.envelope.as_slice()).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn inbound_message_lands_in_history_unread() {
        let network = MemoryNetwork::new();
        let (service, db) = make_service(&network);
        let sender = NodeIdentity::random();

        let payload = ChatPayload {
            subject: String::new(),
            body: "you have my attention".to_string(),
            timestamp: 1,
        };
        let mut envelope = Envelope::wrap(MessageType::Chat, payload.encode_to_vec());
        envelope.sequence = 1;
        envelope.sign(&sender);
        let message = InboundMessage::new(sender.node_id(), envelope);
        db.transaction_with(|conn| service.handle(conn, &message)).unwrap();

        let peer = sender.node_id();
        assert_eq!(service.unread_count(&peer).unwrap(), 1);
        assert_eq!(service.mark_read(&peer).unwrap(), 1);
        assert_eq!(service.unread_count(&peer).unwrap(), 0);
    }
}

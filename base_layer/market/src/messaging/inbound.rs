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

//! Routes verified inbound envelopes to the application handlers. One storage
//! transaction per message covers the duplicate check, the ledger write, the
//! sequencing machinery and the handler's own effects; the ACK goes out only
//! after that transaction commits. A failed handler rolls everything back and
//! withholds the ACK, so the sender retries.

use std::sync::Arc;

use agora_comms::{
    message::{InboundMessage, MessageType},
    service::{HandlerError, InboundMessageHandler},
    transport::PeerTransport,
};
use async_trait::async_trait;
use diesel::SqliteConnection;
use log::*;

use super::{error::MessagingError, park::process_sequenced, Messenger};
use crate::{
    proto::order_id_of,
    storage::messages::{IncomingMessageLedger, SequenceClass},
};

const LOG_TARGET: &str = "market::messaging::inbound";

/// An application handler invoked inside the per-message storage transaction.
/// Implementations must be idempotent: an equivalent repopulation is a no-op
/// returning `Ok`, so retried messages are still ACKed.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), MessagingError>;
}

enum Outcome {
    Processed,
    Duplicate,
}

/// The single entry point registered with the network service for every
/// application message type.
pub struct InboundRouter<T: PeerTransport> {
    messenger: Messenger<T>,
    chat: Arc<dyn MessageHandler>,
    follow: Arc<dyn MessageHandler>,
    order: Arc<dyn MessageHandler>,
}

impl<T: PeerTransport> InboundRouter<T> {
    pub fn new(
        messenger: Messenger<T>,
        chat: Arc<dyn MessageHandler>,
        follow: Arc<dyn MessageHandler>,
        order: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            messenger,
            chat,
            follow,
            order,
        }
    }

    fn handler_for(&self, message_type: MessageType) -> Option<&Arc<dyn MessageHandler>> {
        use MessageType::*;
        match message_type {
            Chat => Some(&self.chat),
            Follow | Unfollow => Some(&self.follow),
            mt if mt.is_order_message() => Some(&self.order),
            _ => None,
        }
    }

    async fn process(&self, message: InboundMessage) -> Result<(), MessagingError> {
        let message_type = message.message_type()?;
        if message_type == MessageType::Ack {
            let ack = message.decode_payload::<agora_comms::message::AckPayload>()?;
            self.messenger.process_ack(&ack.acked_id)?;
            return Ok(());
        }

        let Some(handler) = self.handler_for(message_type) else {
            warn!(
                target: LOG_TARGET,
                "No handler for {:?} from {}, dropping",
                message_type,
                message.source_peer.short_str()
            );
            return Ok(());
        };
        let class = SequenceClass::classify(message_type, order_id_of(&message)?.as_deref());

        let handler = handler.clone();
        let outcome = self.messenger.database().transaction_with(|conn| {
            if IncomingMessageLedger::is_known(conn, &message.envelope.id)? {
                return Ok(Outcome::Duplicate);
            }
            IncomingMessageLedger::mark_seen(conn, &message.envelope.id)?;
            match &class {
                Some(class) => {
                    process_sequenced(conn, class, &message, |conn, admissible| handler.handle(conn, admissible))?;
                },
                None => handler.handle(conn, &message)?,
            }
            Ok::<_, MessagingError>(Outcome::Processed)
        })?;

        // Duplicates are ACKed too: the first delivery's ACK may have been lost.
        match outcome {
            Outcome::Duplicate => {
                debug!(
                    target: LOG_TARGET,
                    "Duplicate message from {}, re-ACKing",
                    message.source_peer.short_str()
                );
            },
            Outcome::Processed => {},
        }
        self.messenger.send_ack(message.source_peer, &message.envelope.id).await;
        Ok(())
    }
}

#[async_trait]
impl<T: PeerTransport> InboundMessageHandler for InboundRouter<T> {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        self.process(message).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use agora_comms::{
        ban::BanList,
        connectivity::ConnectivityEvents,
        message::{Envelope, MessageExt, MessageType},
        node_identity::NodeIdentity,
        service::OutboundMessaging,
        transport::memory::MemoryNetwork,
    };
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::{proto::ChatPayload, storage::MarketDatabase};

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail: Mutex<bool>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }
    }

    impl MessageHandler for Recorder {
        fn handle(&self, _conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), MessagingError> {
            if *self.fail.lock().unwrap() {
                return Err(MessagingError::HandlerError("induced".to_string()));
            }
            self.seen.lock().unwrap().push(message.envelope.sequence);
            Ok(())
        }
    }

    fn make_router(
        db: MarketDatabase,
    ) -> (InboundRouter<agora_comms::transport::memory::MemoryTransport>, Arc<Recorder>, Arc<NodeIdentity>) {
        let network = MemoryNetwork::new();
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), "/agora/test/1.0.0");
        let outbound = OutboundMessaging::new(transport, BanList::new(), ConnectivityEvents::new());
        let messenger = Messenger::new(db, outbound, identity.clone());
        let recorder = Recorder::new();
        let router = InboundRouter::new(
            messenger,
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
        );
        (router, recorder, identity)
    }

    fn chat_message(sender: &NodeIdentity, sequence: u64) -> InboundMessage {
        let mut envelope = Envelope::wrap(MessageType::Chat, ChatPayload::default().to_encoded_bytes());
        envelope.sequence = sequence;
        envelope.sign(sender);
        InboundMessage::new(sender.node_id(), envelope)
    }

    #[tokio::test]
    async fn duplicate_is_suppressed_but_not_rejected() {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let (router, recorder, _identity) = make_router(db);
        let sender = NodeIdentity::random();

        let message = chat_message(&sender, 1);
        router.process(message.clone()).await.unwrap();
        router.process(message).await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn out_of_order_chat_delivers_in_sequence() {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let (router, recorder, _identity) = make_router(db);
        let sender = NodeIdentity::random();

        router.process(chat_message(&sender, 2)).await.unwrap();
        router.process(chat_message(&sender, 3)).await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
        router.process(chat_message(&sender, 1)).await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_handler_leaves_message_unseen() {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let (router, recorder, _identity) = make_router(db.clone());
        let sender = NodeIdentity::random();

        *recorder.fail.lock().unwrap() = true;
        let message = chat_message(&sender, 1);
        assert!(router.process(message.clone()).await.is_err());
        // The rollback covers the dedup ledger, so the retry is processed.
        *recorder.fail.lock().unwrap() = false;
        router.process(message).await.unwrap();
        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[1]);
    }
}

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

//! At-least-once delivery on top of the best-effort network layer. Outbound
//! messages are queued durably in the same transaction as the caller's state
//! changes; entries leave the queue only when the recipient's ACK arrives. The
//! parking buffer ([`park`]) gives per-class ordered delivery on the inbound side.

pub mod error;
pub mod inbound;
pub mod park;
pub mod service;

use std::sync::Arc;

use agora_comms::{
    message::{AckPayload, Envelope, MessageExt, MessageType},
    node_id::NodeId,
    node_identity::NodeIdentity,
    service::OutboundMessaging,
    transport::PeerTransport,
};
use diesel::SqliteConnection;
use log::*;
use prost::Message;
use tokio::sync::oneshot;

use self::error::MessagingError;
use crate::storage::{
    messages::{OutgoingMessageSql, SequenceClass, Sequences},
    MarketDatabase,
};

const LOG_TARGET: &str = "market::messaging";

/// The reliable-send side of the messenger. Cheap to clone; the retry engine in
/// [`service`] shares the same queue.
pub struct Messenger<T: PeerTransport> {
    db: MarketDatabase,
    outbound: OutboundMessaging<T>,
    identity: Arc<NodeIdentity>,
}

impl<T: PeerTransport> Clone for Messenger<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            outbound: self.outbound.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<T: PeerTransport> Messenger<T> {
    pub fn new(db: MarketDatabase, outbound: OutboundMessaging<T>, identity: Arc<NodeIdentity>) -> Self {
        Self { db, outbound, identity }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Builds a signed, sequenced envelope for `(to, class)`. The sequence counter
    /// update is part of `conn`'s transaction, so an aborted send never burns a
    /// sequence number.
    pub fn prepare_sequenced(
        &self,
        conn: &mut SqliteConnection,
        to: &NodeId,
        class: &SequenceClass,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<Envelope, MessagingError> {
        let mut envelope = Envelope::wrap(message_type, payload);
        envelope.sequence = Sequences::next_outgoing(conn, to, class)?;
        envelope.sign(&self.identity);
        Ok(envelope)
    }

    pub fn prepare_unsequenced(&self, message_type: MessageType, payload: Vec<u8>) -> Envelope {
        let mut envelope = Envelope::wrap(message_type, payload);
        envelope.sign(&self.identity);
        envelope
    }

    /// Persists the envelope to the outgoing queue as part of `conn`'s
    /// transaction. Call [`dispatch`] after the transaction commits.
    ///
    /// [`dispatch`]: Messenger::dispatch
    pub fn queue(&self, conn: &mut SqliteConnection, to: &NodeId, envelope: &Envelope) -> Result<(), MessagingError> {
        let message_type = envelope.message_type()?;
        OutgoingMessageSql::new(envelope.id.clone(), to, message_type, envelope.encode_to_vec()).insert(conn)?;
        Ok(())
    }

    /// Makes one direct delivery attempt for an already-queued envelope. The
    /// completion signal fires once the attempt has been made; it says nothing
    /// about delivery, which only the ACK confirms.
    pub async fn dispatch(&self, to: NodeId, envelope: Envelope, completion: Option<oneshot::Sender<()>>) {
        match self.outbound.send_message(to, &envelope).await {
            Ok(_) => {
                trace!(target: LOG_TARGET, "Direct delivery attempt to {} succeeded", to.short_str());
            },
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    "Direct delivery to {} failed, message stays queued: {}",
                    to.short_str(),
                    err
                );
            },
        }
        if let Err(e) = self.db.with_connection(|conn| {
            OutgoingMessageSql::mark_attempted(conn, &envelope.id)?;
            Ok(())
        }) {
            warn!(target: LOG_TARGET, "Failed to record delivery attempt: {}", e);
        }
        if let Some(tx) = completion {
            let _ = tx.send(());
        }
    }

    /// Queue-then-attempt in one call, for callers with no transaction of their
    /// own. Fails before anything is queued if the envelope is unserializable.
    pub async fn send_reliably(
        &self,
        to: NodeId,
        envelope: Envelope,
        completion: Option<oneshot::Sender<()>>,
    ) -> Result<(), MessagingError> {
        self.db.transaction_with(|conn| self.queue(conn, &to, &envelope))?;
        self.dispatch(to, envelope, completion).await;
        Ok(())
    }

    /// Removes the queue entry for an acked message id. Idempotent.
    pub fn process_ack(&self, acked_id: &[u8]) -> Result<bool, MessagingError> {
        let removed = self.db.transaction(|conn| OutgoingMessageSql::remove(conn, acked_id))?;
        if removed {
            debug!(target: LOG_TARGET, "ACK cleared queued message {}", hex::encode(acked_id));
        }
        Ok(removed)
    }

    /// Best-effort, unpersisted single acknowledgement attempt.
    pub async fn send_ack(&self, to: NodeId, acked_id: &[u8]) {
        let payload = AckPayload {
            acked_id: acked_id.to_vec(),
        }
        .to_encoded_bytes();
        let envelope = self.prepare_unsequenced(MessageType::Ack, payload);
        if let Err(err) = self.outbound.send_message(to, &envelope).await {
            debug!(
                target: LOG_TARGET,
                "ACK to {} not delivered (they will resend): {}",
                to.short_str(),
                err
            );
        }
    }

    /// One resend pass over queued messages for a single peer.
    pub async fn resend_for(&self, peer: NodeId) -> Result<(), MessagingError> {
        let pending = self.db.with_connection(|conn| OutgoingMessageSql::for_recipient(conn, &peer))?;
        self.attempt_all(pending).await
    }

    /// One resend pass over the entire queue.
    pub async fn resend_pending(&self) -> Result<(), MessagingError> {
        let pending = self.db.with_connection(OutgoingMessageSql::all)?;
        if !pending.is_empty() {
            debug!(target: LOG_TARGET, "Retrying {} queued message(s)", pending.len());
        }
        self.attempt_all(pending).await
    }

    async fn attempt_all(&self, pending: Vec<OutgoingMessageSql>) -> Result<(), MessagingError> {
        for row in pending {
            let recipient: NodeId = match row.recipient.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!(target: LOG_TARGET, "Skipping queue entry with bad recipient '{}'", row.recipient);
                    continue;
                },
            };
            let envelope = match Envelope::decode(row.envelope.as_slice()) {
                Ok(env) => env,
                Err(err) => {
                    warn!(target: LOG_TARGET, "Skipping undecodable queue entry: {}", err);
                    continue;
                },
            };
            self.dispatch(recipient, envelope, None).await;
        }
        Ok(())
    }

    pub(crate) fn database(&self) -> &MarketDatabase {
        &self.db
    }
}

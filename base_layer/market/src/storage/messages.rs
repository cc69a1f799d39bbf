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

use std::fmt;

use agora_comms::{message::MessageType, node_id::NodeId};
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, SqliteConnection};

use super::MarketStorageError;
use crate::schema::{incoming_messages, outgoing_messages, parked_messages, sequences};

/// The category within which ordered delivery is enforced. Follow and unfollow
/// share one class; all messages for one order share another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SequenceClass {
    Chat,
    Follow,
    Order(String),
}

impl SequenceClass {
    /// Determines the class for an inbound message, given the order id extracted
    /// from its payload (order messages only). Returns `None` for unsequenced
    /// types.
    pub fn classify(message_type: MessageType, order_id: Option<&str>) -> Option<Self> {
        use MessageType::*;
        match message_type {
            Chat => Some(SequenceClass::Chat),
            Follow | Unfollow => Some(SequenceClass::Follow),
            mt if mt.is_order_message() => order_id.map(|id| SequenceClass::Order(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for SequenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceClass::Chat => f.write_str("chat"),
            SequenceClass::Follow => f.write_str("follow"),
            SequenceClass::Order(id) => write!(f, "order:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Direction {
    Outgoing = 0,
    Incoming = 1,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = outgoing_messages)]
pub struct OutgoingMessageSql {
    pub id: Vec<u8>,
    pub recipient: String,
    pub message_type: i32,
    pub envelope: Vec<u8>,
    pub first_enqueued_at: NaiveDateTime,
    pub last_attempt_at: Option<NaiveDateTime>,
}

impl OutgoingMessageSql {
    pub fn new(id: Vec<u8>, recipient: &NodeId, message_type: MessageType, envelope: Vec<u8>) -> Self {
        Self {
            id,
            recipient: recipient.to_string(),
            message_type: message_type as i32,
            envelope,
            first_enqueued_at: Utc::now().naive_utc(),
            last_attempt_at: None,
        }
    }

    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<(), MarketStorageError> {
        diesel::insert_into(outgoing_messages::table)
            .values(self)
            .execute(conn)?;
        Ok(())
    }

    /// Removes the entry for an acked message id. Returns false if it was already
    /// gone, which is fine: ACK processing is idempotent.
    pub fn remove(conn: &mut SqliteConnection, id: &[u8]) -> Result<bool, MarketStorageError> {
        let n = diesel::delete(outgoing_messages::table.filter(outgoing_messages::id.eq(id))).execute(conn)?;
        Ok(n > 0)
    }

    pub fn all(conn: &mut SqliteConnection) -> Result<Vec<Self>, MarketStorageError> {
        Ok(outgoing_messages::table
            .order(outgoing_messages::first_enqueued_at.asc())
            .load::<Self>(conn)?)
    }

    pub fn for_recipient(conn: &mut SqliteConnection, recipient: &NodeId) -> Result<Vec<Self>, MarketStorageError> {
        Ok(outgoing_messages::table
            .filter(outgoing_messages::recipient.eq(recipient.to_string()))
            .order(outgoing_messages::first_enqueued_at.asc())
            .load::<Self>(conn)?)
    }

    pub fn mark_attempted(conn: &mut SqliteConnection, id: &[u8]) -> Result<(), MarketStorageError> {
        diesel::update(outgoing_messages::table.filter(outgoing_messages::id.eq(id)))
            .set(outgoing_messages::last_attempt_at.eq(Utc::now().naive_utc()))
            .execute(conn)?;
        Ok(())
    }

    pub fn count(conn: &mut SqliteConnection) -> Result<i64, MarketStorageError> {
        Ok(outgoing_messages::table.count().get_result(conn)?)
    }
}

/// The durable set of message ids ever received, giving at-most-once application
/// processing across restarts.
pub struct IncomingMessageLedger;

impl IncomingMessageLedger {
    pub fn is_known(conn: &mut SqliteConnection, id: &[u8]) -> Result<bool, MarketStorageError> {
        let n: i64 = incoming_messages::table
            .filter(incoming_messages::id.eq(id))
            .count()
            .get_result(conn)?;
        Ok(n > 0)
    }

    /// Records the id. Must commit before the ACK goes out so a crash in between
    /// re-delivers the message rather than losing it.
    pub fn mark_seen(conn: &mut SqliteConnection, id: &[u8]) -> Result<(), MarketStorageError> {
        diesel::insert_or_ignore_into(incoming_messages::table)
            .values((
                incoming_messages::id.eq(id),
                incoming_messages::received_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = parked_messages)]
pub struct ParkedMessageSql {
    pub id: i32,
    pub peer: String,
    pub class: String,
    pub sequence: i64,
    pub envelope: Vec<u8>,
}

impl ParkedMessageSql {
    pub fn park(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        class: &SequenceClass,
        sequence: u64,
        envelope: &[u8],
    ) -> Result<(), MarketStorageError> {
        diesel::insert_or_ignore_into(parked_messages::table)
            .values((
                parked_messages::peer.eq(peer.to_string()),
                parked_messages::class.eq(class.to_string()),
                parked_messages::sequence.eq(sequence as i64),
                parked_messages::envelope.eq(envelope),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// Removes and returns the parked envelope with exactly this sequence, if any.
    pub fn take(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        class: &SequenceClass,
        sequence: u64,
    ) -> Result<Option<Vec<u8>>, MarketStorageError> {
        let row = parked_messages::table
            .filter(parked_messages::peer.eq(peer.to_string()))
            .filter(parked_messages::class.eq(class.to_string()))
            .filter(parked_messages::sequence.eq(sequence as i64))
            .first::<Self>(conn)
            .optional()?;
        match row {
            Some(row) => {
                diesel::delete(parked_messages::table.filter(parked_messages::id.eq(row.id))).execute(conn)?;
                Ok(Some(row.envelope))
            },
            None => Ok(None),
        }
    }

    pub fn count(conn: &mut SqliteConnection) -> Result<i64, MarketStorageError> {
        Ok(parked_messages::table.count().get_result(conn)?)
    }
}

/// Per `(peer, class, direction)` sequence high-water marks. Outgoing rows hold the
/// last assigned sequence; incoming rows hold the last sequence delivered to a
/// handler.
pub struct Sequences;

impl Sequences {
    pub fn current(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        class: &SequenceClass,
        direction: Direction,
    ) -> Result<u64, MarketStorageError> {
        let num: Option<i64> = sequences::table
            .filter(sequences::peer.eq(peer.to_string()))
            .filter(sequences::class.eq(class.to_string()))
            .filter(sequences::direction.eq(direction as i32))
            .select(sequences::num)
            .first(conn)
            .optional()?;
        Ok(num.unwrap_or(0) as u64)
    }

    /// Increments and returns the next outgoing sequence for `(peer, class)`. The
    /// counter is persistent, so assignments stay strictly increasing across
    /// restarts.
    pub fn next_outgoing(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        class: &SequenceClass,
    ) -> Result<u64, MarketStorageError> {
        let next = Self::current(conn, peer, class, Direction::Outgoing)? + 1;
        Self::set(conn, peer, class, Direction::Outgoing, next)?;
        Ok(next)
    }

    pub fn set(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        class: &SequenceClass,
        direction: Direction,
        num: u64,
    ) -> Result<(), MarketStorageError> {
        let updated = diesel::update(
            sequences::table
                .filter(sequences::peer.eq(peer.to_string()))
                .filter(sequences::class.eq(class.to_string()))
                .filter(sequences::direction.eq(direction as i32)),
        )
        .set(sequences::num.eq(num as i64))
        .execute(conn)?;
        if updated == 0 {
            diesel::insert_into(sequences::table)
                .values((
                    sequences::peer.eq(peer.to_string()),
                    sequences::class.eq(class.to_string()),
                    sequences::direction.eq(direction as i32),
                    sequences::num.eq(num as i64),
                ))
                .execute(conn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use agora_comms::node_identity::NodeIdentity;
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::storage::MarketDatabase;

    fn test_db() -> MarketDatabase {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(12));
        MarketDatabase::connect(&url).unwrap()
    }

    #[test]
    fn outgoing_queue_round_trip() {
        let db = test_db();
        let peer = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            let row = OutgoingMessageSql::new(vec![1; 20], &peer, MessageType::Chat, vec![9, 9]);
            row.insert(conn)?;
            assert_eq!(OutgoingMessageSql::count(conn)?, 1);
            assert_eq!(OutgoingMessageSql::for_recipient(conn, &peer)?.len(), 1);
            assert!(OutgoingMessageSql::remove(conn, &[1; 20])?);
            assert!(!OutgoingMessageSql::remove(conn, &[1; 20])?);
            assert_eq!(OutgoingMessageSql::count(conn)?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn incoming_ledger_is_durable_set() {
        let db = test_db();
        db.with_connection(|conn| {
            assert!(!IncomingMessageLedger::is_known(conn, &[7; 20])?);
            IncomingMessageLedger::mark_seen(conn, &[7; 20])?;
            IncomingMessageLedger::mark_seen(conn, &[7; 20])?;
            assert!(IncomingMessageLedger::is_known(conn, &[7; 20])?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn sequences_increase_per_class() {
        let db = test_db();
        let peer = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            assert_eq!(Sequences::next_outgoing(conn, &peer, &SequenceClass::Chat)?, 1);
            assert_eq!(Sequences::next_outgoing(conn, &peer, &SequenceClass::Chat)?, 2);
            assert_eq!(Sequences::next_outgoing(conn, &peer, &SequenceClass::Follow)?, 1);
            let order = SequenceClass::Order("abc".to_string());
            assert_eq!(Sequences::next_outgoing(conn, &peer, &order)?, 1);
            assert_eq!(Sequences::current(conn, &peer, &SequenceClass::Chat, Direction::Outgoing)?, 2);
            assert_eq!(Sequences::current(conn, &peer, &SequenceClass::Chat, Direction::Incoming)?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn parked_messages_take_by_sequence() {
        let db = test_db();
        let peer = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            let class = SequenceClass::Chat;
            ParkedMessageSql::park(conn, &peer, &class, 3, &[3])?;
            ParkedMessageSql::park(conn, &peer, &class, 2, &[2])?;
            // Parking the same sequence twice is a no-op.
            ParkedMessageSql::park(conn, &peer, &class, 2, &[2])?;
            assert_eq!(ParkedMessageSql::count(conn)?, 2);
            assert_eq!(ParkedMessageSql::take(conn, &peer, &class, 2)?, Some(vec![2]));
            assert_eq!(ParkedMessageSql::take(conn, &peer, &class, 2)?, None);
            assert_eq!(ParkedMessageSql::take(conn, &peer, &class, 3)?, Some(vec![3]));
            assert_eq!(ParkedMessageSql::count(conn)?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn classify_message_types() {
        assert_eq!(SequenceClass::classify(MessageType::Chat, None), Some(SequenceClass::Chat));
        assert_eq!(
            SequenceClass::classify(MessageType::Unfollow, None),
            Some(SequenceClass::Follow)
        );
        assert_eq!(
            SequenceClass::classify(MessageType::Refund, Some("o1")),
            Some(SequenceClass::Order("o1".to_string()))
        );
        assert_eq!(SequenceClass::classify(MessageType::Ack, None), None);
    }
}

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

use agora_comms::node_id::NodeId;
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, SqliteConnection};

use super::MarketStorageError;
use crate::schema::chat_messages;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = chat_messages)]
pub struct ChatMessageSql {
    pub message_id: Vec<u8>,
    pub peer: String,
    pub outgoing: bool,
    pub subject: String,
    pub body: String,
    pub read: bool,
    pub timestamp: NaiveDateTime,
}

impl ChatMessageSql {
    pub fn new(message_id: Vec<u8>, peer: &NodeId, outgoing: bool, subject: String, body: String) -> Self {
        Self {
            message_id,
            peer: peer.to_string(),
            outgoing,
            subject,
            body,
            read: outgoing,
            timestamp: Utc::now().naive_utc(),
        }
    }

    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<(), MarketStorageError> {
        diesel::insert_or_ignore_into(chat_messages::table)
            .values(self)
            .execute(conn)?;
        Ok(())
    }

    pub fn history(conn: &mut SqliteConnection, peer: &NodeId) -> Result<Vec<Self>, MarketStorageError> {
        Ok(chat_messages::table
            .filter(chat_messages::peer.eq(peer.to_string()))
            .order(chat_messages::timestamp.asc())
            .load::<Self>(conn)?)
    }

    pub fn mark_read(conn: &mut SqliteConnection, peer: &NodeId) -> Result<usize, MarketStorageError> {
        Ok(diesel::update(
            chat_messages::table
                .filter(chat_messages::peer.eq(peer.to_string()))
                .filter(chat_messages::read.eq(false)),
        )
        .set(chat_messages::read.eq(true))
        .execute(conn)?)
    }

    pub fn unread_count(conn: &mut SqliteConnection, peer: &NodeId) -> Result<i64, MarketStorageError> {
        Ok(chat_messages::table
            .filter(chat_messages::peer.eq(peer.to_string()))
            .filter(chat_messages::read.eq(false))
            .count()
            .get_result(conn)?)
    }
}

#[cfg(test)]
mod test {
    use agora_comms::node_identity::NodeIdentity;
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::storage::MarketDatabase;

    #[test]
    fn chat_history_and_read_flags() {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(12));
        let db = MarketDatabase::connect(&url).unwrap();
        let peer = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            ChatMessageSql::new(vec![1; 20], &peer, false, String::new(), "hi".to_string()).insert(conn)?;
            ChatMessageSql::new(vec![2; 20], &peer, true, String::new(), "hello".to_string()).insert(conn)?;
            assert_eq!(ChatMessageSql::unread_count(conn, &peer)?, 1);
            let history = ChatMessageSql::history(conn, &peer)?;
            assert_eq!(history.len(), 2);
            assert_eq!(ChatMessageSql::mark_read(conn, &peer)?, 1);
            assert_eq!(ChatMessageSql::unread_count(conn, &peer)?, 0);
            Ok(())
        })
        .unwrap();
    }
}

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
use crate::schema::cached_name_entries;

/// The advisory cache of peer -> last-observed published root. May be stale; C6
/// decides when to trust it.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = cached_name_entries)]
pub struct CachedNameEntrySql {
    pub peer: String,
    pub content_address: String,
    pub observed_at: NaiveDateTime,
}

impl CachedNameEntrySql {
    pub fn upsert(conn: &mut SqliteConnection, peer: &NodeId, content_address: &str) -> Result<(), MarketStorageError> {
        let updated = diesel::update(cached_name_entries::table.filter(cached_name_entries::peer.eq(peer.to_string())))
            .set((
                cached_name_entries::content_address.eq(content_address),
                cached_name_entries::observed_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        if updated == 0 {
            diesel::insert_into(cached_name_entries::table)
                .values((
                    cached_name_entries::peer.eq(peer.to_string()),
                    cached_name_entries::content_address.eq(content_address),
                    cached_name_entries::observed_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
        }
        Ok(())
    }

    pub fn find(conn: &mut SqliteConnection, peer: &NodeId) -> Result<Option<Self>, MarketStorageError> {
        Ok(cached_name_entries::table
            .filter(cached_name_entries::peer.eq(peer.to_string()))
            .first::<Self>(conn)
            .optional()?)
    }
}

#[cfg(test)]
mod test {
    use agora_comms::node_identity::NodeIdentity;
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::storage::MarketDatabase;

    #[test]
    fn upsert_replaces_entry() {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(12));
        let db = MarketDatabase::connect(&url).unwrap();
        let peer = NodeIdentity::random().node_id();
        db.with_connection(|conn| {
            assert!(CachedNameEntrySql::find(conn, &peer)?.is_none());
            CachedNameEntrySql::upsert(conn, &peer, "addr-1")?;
            CachedNameEntrySql::upsert(conn, &peer, "addr-2")?;
            let entry = CachedNameEntrySql::find(conn, &peer)?.unwrap();
            assert_eq!(entry.content_address, "addr-2");
            Ok(())
        })
        .unwrap();
    }
}

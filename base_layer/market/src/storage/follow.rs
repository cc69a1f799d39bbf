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
use chrono::Utc;
use diesel::{prelude::*, SqliteConnection};

use super::MarketStorageError;
use crate::schema::follow_links;

/// Who the link points at: peers following us, or peers we follow. The public
/// `followers.json` / `following.json` records are regenerated from these rows at
/// publish time, so the table is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FollowRelation {
    Follower = 0,
    Following = 1,
}

pub struct FollowLinks;

impl FollowLinks {
    pub fn add(conn: &mut SqliteConnection, peer: &NodeId, relation: FollowRelation) -> Result<(), MarketStorageError> {
        diesel::insert_or_ignore_into(follow_links::table)
            .values((
                follow_links::peer.eq(peer.to_string()),
                follow_links::relation.eq(relation as i32),
                follow_links::since.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn remove(
        conn: &mut SqliteConnection,
        peer: &NodeId,
        relation: FollowRelation,
    ) -> Result<bool, MarketStorageError> {
        let n = diesel::delete(
            follow_links::table
                .filter(follow_links::peer.eq(peer.to_string()))
                .filter(follow_links::relation.eq(relation as i32)),
        )
        .execute(conn)?;
        Ok(n > 0)
    }

    /// Peers with the given relation, oldest link first.
    pub fn list(conn: &mut SqliteConnection, relation: FollowRelation) -> Result<Vec<NodeId>, MarketStorageError> {
        let rows: Vec<String> = follow_links::table
            .filter(follow_links::relation.eq(relation as i32))
            .order(follow_links::since.asc())
            .select(follow_links::peer)
            .load(conn)?;
        rows.into_iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| MarketStorageError::ConversionError(format!("bad node id in follow_links: {}", s)))
            })
            .collect()
    }

    pub fn count(conn: &mut SqliteConnection, relation: FollowRelation) -> Result<i64, MarketStorageError> {
        Ok(follow_links::table
            .filter(follow_links::relation.eq(relation as i32))
            .count()
            .get_result(conn)?)
    }
}

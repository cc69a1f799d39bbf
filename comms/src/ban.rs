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

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use crate::node_id::NodeId;

/// A shared set of peers whose traffic is dropped in both directions. Inbound
/// envelopes from a banned peer are discarded before signature verification and
/// outbound sends fail fast. Clones share the same underlying set.
#[derive(Clone, Default)]
pub struct BanList {
    banned: Arc<RwLock<HashSet<NodeId>>>,
}

impl BanList {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_peers<I: IntoIterator<Item = NodeId>>(peers: I) -> Self {
        Self {
            banned: Arc::new(RwLock::new(peers.into_iter().collect())),
        }
    }

    pub fn ban(&self, peer: NodeId) -> bool {
        self.banned.write().unwrap().insert(peer)
    }

    pub fn unban(&self, peer: &NodeId) -> bool {
        self.banned.write().unwrap().remove(peer)
    }

    pub fn is_banned(&self, peer: &NodeId) -> bool {
        self.banned.read().unwrap().contains(peer)
    }

    pub fn banned_peers(&self) -> Vec<NodeId> {
        self.banned.read().unwrap().iter().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_identity::NodeIdentity;

    #[test]
    fn ban_and_unban() {
        let list = BanList::new();
        let peer = NodeIdentity::random().node_id();
        assert!(!list.is_banned(&peer));
        assert!(list.ban(peer));
        assert!(!list.ban(peer));
        assert!(list.is_banned(&peer));
        assert!(list.unban(&peer));
        assert!(!list.is_banned(&peer));
    }

    #[test]
    fn clones_share_state() {
        let list = BanList::new();
        let clone = list.clone();
        let peer = NodeIdentity::random().node_id();
        list.ban(peer);
        assert!(clone.is_banned(&peer));
    }
}

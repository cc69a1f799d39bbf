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

//! Publishes the local snapshot to the distribution backends and resolves other
//! peers' snapshots, with an advisory cache in between. Publish requests funnel
//! through [`service::PublisherService`], which coalesces a burst of requests
//! into a single snapshot upload.

pub mod backend;
pub mod error;
pub mod service;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agora_comms::{node_id::NodeId, node_identity::NodeIdentity};
use log::*;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};

use self::{
    backend::{BlockStore, NameRecord, NameSystem},
    error::PublisherError,
};
use crate::{
    content_store::ContentStore,
    storage::{
        cache::CachedNameEntrySql,
        follow::{FollowLinks, FollowRelation},
        kv::{KeyValue, KV_KEY_NAME_SEQUENCE},
        MarketDatabase,
    },
};

const LOG_TARGET: &str = "market::publisher";

pub type PublishWaiter = oneshot::Sender<Result<String, PublisherError>>;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub resolve_timeout: Duration,
    pub fetch_timeout: Duration,
    pub resolve_quorum: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
            resolve_quorum: 2,
        }
    }
}

/// The root block of a snapshot: relative path -> block address for every file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub files: BTreeMap<String, String>,
}

pub struct Publisher<B, N> {
    store: ContentStore,
    db: MarketDatabase,
    identity: Arc<NodeIdentity>,
    blocks: Arc<B>,
    names: Arc<N>,
    config: PublisherConfig,
    request_tx: mpsc::UnboundedSender<PublishWaiter>,
}

impl<B, N> Clone for Publisher<B, N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            db: self.db.clone(),
            identity: self.identity.clone(),
            blocks: self.blocks.clone(),
            names: self.names.clone(),
            config: self.config.clone(),
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<B: BlockStore, N: NameSystem> Publisher<B, N> {
    /// Creates the publisher and the request channel its service drains.
    pub fn new(
        store: ContentStore,
        db: MarketDatabase,
        identity: Arc<NodeIdentity>,
        blocks: Arc<B>,
        names: Arc<N>,
        config: PublisherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PublishWaiter>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                db,
                identity,
                blocks,
                names,
                config,
                request_tx,
            },
            request_rx,
        )
    }

    /// Requests a publish and waits for the service to complete one that covers
    /// this request. Concurrent callers may share a single upload.
    pub async fn publish(&self) -> Result<String, PublisherError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx.send(tx).map_err(|_| PublisherError::Shutdown)?;
        rx.await.map_err(|_| PublisherError::Shutdown)?
    }

    /// Takes a snapshot and uploads it immediately, bypassing coalescing. Used by
    /// the service; callers normally go through [`publish`].
    ///
    /// [`publish`]: Publisher::publish
    pub async fn publish_now(&self) -> Result<String, PublisherError> {
        self.regenerate_follow_records().await?;

        let files = self.store.snapshot_files()?;
        let mut manifest = SnapshotManifest::default();
        for (rel, bytes) in files {
            let address = self.blocks.put(bytes).await?;
            manifest.files.insert(rel, address);
        }
        let root = self.blocks.put(serde_json::to_vec(&manifest)?).await?;

        let sequence = self.db.transaction(|conn| {
            let next = KeyValue::get(conn, KV_KEY_NAME_SEQUENCE)?
                .and_then(|b| b.try_into().ok().map(u64::from_le_bytes))
                .unwrap_or(0) +
                1;
            KeyValue::set(conn, KV_KEY_NAME_SEQUENCE, &next.to_le_bytes())?;
            Ok(next)
        })?;

        let record = NameRecord::new(&self.identity, root.clone(), sequence);
        self.names.publish(record).await?;
        let own_id = self.identity.node_id();
        self.db
            .with_connection(|conn| CachedNameEntrySql::upsert(conn, &own_id, &root))?;
        info!(
            target: LOG_TARGET,
            "Published snapshot {} (sequence {}, {} file(s))",
            &root[..root.len().min(12)],
            sequence,
            manifest.files.len()
        );
        Ok(root)
    }

    /// The follow table is the source of truth; the public records and the
    /// profile counts are regenerated from it on every publish.
    async fn regenerate_follow_records(&self) -> Result<(), PublisherError> {
        let (followers, following) = self.db.with_connection(|conn| {
            Ok((
                FollowLinks::list(conn, FollowRelation::Follower)?,
                FollowLinks::list(conn, FollowRelation::Following)?,
            ))
        })?;
        let followers: Vec<String> = followers.iter().map(ToString::to_string).collect();
        let following: Vec<String> = following.iter().map(ToString::to_string).collect();

        let mut tx = self.store.begin().await;
        tx.set_followers(&followers)?;
        tx.set_following(&following)?;
        if let Some(mut profile) = tx.get_profile()? {
            profile.follower_count = followers.len() as u64;
            profile.following_count = following.len() as u64;
            tx.set_profile(&profile)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Resolves a peer's current root address. With `use_cache` a cached entry is
    /// returned immediately and refreshed in the background; the caller accepts
    /// possible staleness in exchange for latency. When the live lookup fails and
    /// a cached root exists, the cached root is served instead of the error.
    pub async fn resolve(&self, peer: NodeId, use_cache: bool) -> Result<String, PublisherError> {
        if peer == self.identity.node_id() {
            // Own content never goes over the network.
            let cached = self.db.with_connection(|conn| CachedNameEntrySql::find(conn, &peer))?;
            return match cached {
                Some(entry) => Ok(entry.content_address),
                None => self.publish_now().await,
            };
        }
        if use_cache {
            let cached = self.db.with_connection(|conn| CachedNameEntrySql::find(conn, &peer))?;
            if let Some(entry) = cached {
                trace!(
                    target: LOG_TARGET,
                    "Serving cached root for {}, refreshing in background",
                    peer.short_str()
                );
                let publisher = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = publisher.resolve_remote(peer).await {
                        debug!(target: LOG_TARGET, "Background refresh for {} failed: {}", peer.short_str(), err);
                    }
                });
                return Ok(entry.content_address);
            }
        }
        match self.resolve_remote(peer).await {
            Ok(root) => Ok(root),
            Err(err @ (PublisherError::Timeout(_) | PublisherError::NotFound(_) | PublisherError::BackendError(_))) => {
                // A lookup failure falls back to the last known root, so a
                // publisher that is currently offline can still be browsed.
                let cached = self.db.with_connection(|conn| CachedNameEntrySql::find(conn, &peer))?;
                match cached {
                    Some(entry) => {
                        warn!(
                            target: LOG_TARGET,
                            "Name lookup for {} failed ({}), serving last cached root",
                            peer.short_str(),
                            err
                        );
                        Ok(entry.content_address)
                    },
                    None => Err(err),
                }
            },
            Err(err) => Err(err),
        }
    }

    async fn resolve_remote(&self, peer: NodeId) -> Result<String, PublisherError> {
        let records = time::timeout(
            self.config.resolve_timeout,
            self.names.resolve(peer, self.config.resolve_quorum),
        )
        .await
        .map_err(|_| PublisherError::Timeout("name resolution"))??;

        // Take the best verified record; forged or misdirected records are
        // silently discarded.
        let best = records
            .into_iter()
            .filter(|record| match record.verify(&peer) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: LOG_TARGET, "Discarding record for {}: {}", peer.short_str(), err);
                    false
                },
            })
            .max_by_key(|record| record.sequence)
            .ok_or_else(|| PublisherError::NotFound(peer.to_string()))?;

        self.db
            .with_connection(|conn| CachedNameEntrySql::upsert(conn, &peer, &best.content_address))?;
        Ok(best.content_address)
    }

    /// Fetches one file out of a peer's snapshot by relative path.
    pub async fn fetch_file(&self, peer: NodeId, path: &str, use_cache: bool) -> Result<Vec<u8>, PublisherError> {
        let root = self.resolve(peer, use_cache).await?;
        let manifest_bytes = self.fetch_block(&root).await?;
        let manifest: SnapshotManifest = serde_json::from_slice(&manifest_bytes)?;
        let address = manifest
            .files
            .get(path)
            .ok_or_else(|| PublisherError::NotFound(format!("{}:{}", peer, path)))?;
        self.fetch_block(address).await
    }

    async fn fetch_block(&self, address: &str) -> Result<Vec<u8>, PublisherError> {
        time::timeout(self.config.fetch_timeout, self.blocks.get(address))
            .await
            .map_err(|_| PublisherError::Timeout("block fetch"))??
            .ok_or_else(|| PublisherError::NotFound(address.to_string()))
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }
}

#[cfg(test)]
mod test {
    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_test_utils::paths::create_temporary_data_path;

    use super::{
        backend::{MemoryBlockStore, MemoryNameSystem},
        *,
    };
    use crate::content_store::{records::Profile, FOLLOWERS_FILE, PROFILE_FILE};

    struct Node {
        publisher: Publisher<MemoryBlockStore, MemoryNameSystem>,
        store: ContentStore,
        identity: Arc<NodeIdentity>,
        db: MarketDatabase,
        _request_rx: mpsc::UnboundedReceiver<PublishWaiter>,
    }

    fn make_node(blocks: &Arc<MemoryBlockStore>, names: &Arc<MemoryNameSystem>) -> Node {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let identity = Arc::new(NodeIdentity::random());
        let store = ContentStore::new(create_temporary_data_path(), db.clone(), identity.clone()).unwrap();
        let (publisher, request_rx) = Publisher::new(
            store.clone(),
            db.clone(),
            identity.clone(),
            blocks.clone(),
            names.clone(),
            PublisherConfig::default(),
        );
        Node {
            publisher,
            store,
            identity,
            db,
            _request_rx: request_rx,
        }
    }

    async fn set_profile(node: &Node, name: &str) {
        let mut tx = node.store.begin().await;
        tx.set_profile(&Profile {
            name: name.to_string(),
            ..Default::default()
        })
        .unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn publish_then_resolve_and_fetch_from_another_node() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(MemoryNameSystem::new());
        let vendor = make_node(&blocks, &names);
        let buyer = make_node(&blocks, &names);

        set_profile(&vendor, "Vendor").await;
        vendor.publisher.publish_now().await.unwrap();

        let bytes = buyer
            .publisher
            .fetch_file(vendor.identity.node_id(), PROFILE_FILE, false)
            .await
            .unwrap();
        let profile: Profile = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(profile.name, "Vendor");
    }

    #[tokio::test]
    async fn resolve_picks_highest_sequence() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(MemoryNameSystem::new());
        let vendor = make_node(&blocks, &names);
        let buyer = make_node(&blocks, &names);

        let first = vendor.publisher.publish_now().await.unwrap();
        set_profile(&vendor, "Changed").await;
        let second = vendor.publisher.publish_now().await.unwrap();
        assert_ne!(first, second);

        let resolved = buyer.publisher.resolve(vendor.identity.node_id(), false).await.unwrap();
        assert_eq!(resolved, second);
    }

    #[tokio::test]
    async fn forged_records_are_discarded() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(MemoryNameSystem::new());
        let victim = make_node(&blocks, &names);
        let buyer = make_node(&blocks, &names);

        // An attacker publishes a record under the victim's id but signed with
        // their own key.
        let attacker = NodeIdentity::random();
        let mut forged = NameRecord::new(&attacker, "evil-root".to_string(), 99);
        forged.peer = victim.identity.node_id().to_string();
        names.inject(victim.identity.node_id(), forged);

        let err = buyer
            .publisher
            .resolve(victim.identity.node_id(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PublisherError::NotFound(_)));
    }

    #[tokio::test]
    async fn cached_resolve_returns_immediately_and_refreshes() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(MemoryNameSystem::new());
        let vendor = make_node(&blocks, &names);
        let buyer = make_node(&blocks, &names);

        let first = vendor.publisher.publish_now().await.unwrap();
        assert_eq!(
            buyer.publisher.resolve(vendor.identity.node_id(), false).await.unwrap(),
            first
        );

        set_profile(&vendor, "v2").await;
        let second = vendor.publisher.publish_now().await.unwrap();

        // The cached answer is the stale root.
        let cached = buyer.publisher.resolve(vendor.identity.node_id(), true).await.unwrap();
        assert_eq!(cached, first);

        // The background refresh eventually updates the cache.
        let vendor_id = vendor.identity.node_id();
        for _ in 0..50 {
            let entry = buyer
                .publisher
                .db
                .with_connection(|conn| CachedNameEntrySql::find(conn, &vendor_id))
                .unwrap();
            if entry.map(|e| e.content_address) == Some(second.clone()) {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        panic!("cache was never refreshed");
    }

    struct UnreachableNames;

    #[async_trait::async_trait]
    impl NameSystem for UnreachableNames {
        async fn publish(&self, _record: NameRecord) -> Result<(), PublisherError> {
            Err(PublisherError::BackendError("name system unreachable".to_string()))
        }

        async fn resolve(&self, _peer: NodeId, _quorum: usize) -> Result<Vec<NameRecord>, PublisherError> {
            Err(PublisherError::BackendError("name system unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn lookup_failure_falls_back_to_the_cached_root() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(UnreachableNames);
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let identity = Arc::new(NodeIdentity::random());
        let store = ContentStore::new(create_temporary_data_path(), db.clone(), identity.clone()).unwrap();
        let (publisher, _request_rx) =
            Publisher::new(store, db.clone(), identity, blocks, names, PublisherConfig::default());

        // Nothing cached yet: the lookup failure surfaces.
        let vendor = NodeIdentity::random().node_id();
        let err = publisher.resolve(vendor, false).await.unwrap_err();
        assert!(matches!(err, PublisherError::BackendError(_)));

        // With a cached root, the same failure is absorbed.
        db.with_connection(|conn| CachedNameEntrySql::upsert(conn, &vendor, "cached-root"))
            .unwrap();
        assert_eq!(publisher.resolve(vendor, false).await.unwrap(), "cached-root");
        assert_eq!(publisher.resolve(vendor, true).await.unwrap(), "cached-root");
    }

    #[tokio::test]
    async fn publish_regenerates_follow_records_and_counts() {
        let blocks = Arc::new(MemoryBlockStore::new());
        let names = Arc::new(MemoryNameSystem::new());
        let vendor = make_node(&blocks, &names);
        let buyer = make_node(&blocks, &names);
        let follower = NodeIdentity::random().node_id();

        set_profile(&vendor, "Vendor").await;
        vendor
            .db
            .with_connection(|conn| FollowLinks::add(conn, &follower, FollowRelation::Follower))
            .unwrap();
        vendor.publisher.publish_now().await.unwrap();

        let bytes = vendor
            .publisher
            .fetch_file(vendor.identity.node_id(), FOLLOWERS_FILE, false)
            .await
            .unwrap();
        let followers: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(followers, vec![follower.to_string()]);

        let bytes = buyer
            .publisher
            .fetch_file(vendor.identity.node_id(), PROFILE_FILE, false)
            .await
            .unwrap();
        let profile: Profile = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(profile.follower_count, 1);
    }
}

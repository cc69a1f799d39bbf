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

//! The pluggable distribution backends: a content-addressed block store and a
//! mutable name system mapping node ids to signed root records. The in-memory
//! implementations back the tests and single-process deployments.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use agora_comms::{node_id::NodeId, node_identity::NodeIdentity};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::PublisherError;

/// Immutable content-addressed block storage. Addresses are hex SHA-256 of the
/// block contents, so any replica can validate what it serves.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, PublisherError>;
    async fn get(&self, address: &str) -> Result<Option<Vec<u8>>, PublisherError>;
}

/// The mutable pointer layer. `resolve` returns however many replicas answered,
/// up to `quorum`; callers pick the best verified record themselves.
#[async_trait]
pub trait NameSystem: Send + Sync + 'static {
    async fn publish(&self, record: NameRecord) -> Result<(), PublisherError>;
    async fn resolve(&self, peer: NodeId, quorum: usize) -> Result<Vec<NameRecord>, PublisherError>;
}

/// A signed, sequenced pointer from a node id to the root address of its current
/// snapshot. Self-certifying: the embedded public key must hash to `peer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRecord {
    /// Hex node id of the publisher.
    pub peer: String,
    /// Hex ed25519 public key of the publisher.
    pub public_key: String,
    /// Root block address of the published snapshot.
    pub content_address: String,
    /// Monotonic per-publisher sequence; higher supersedes lower.
    pub sequence: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl NameRecord {
    pub fn new(identity: &NodeIdentity, content_address: String, sequence: u64) -> Self {
        let mut record = Self {
            peer: identity.node_id().to_string(),
            public_key: hex::encode(identity.public_key().as_bytes()),
            content_address,
            sequence,
            timestamp: chrono::Utc::now().timestamp(),
            signature: String::new(),
        };
        let signature = identity.sign(&record.signing_bytes().expect("record serialization cannot fail"));
        record.signature = hex::encode(signature.to_bytes());
        record
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, PublisherError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Checks the signature and that the signing key actually belongs to
    /// `expected_peer`. Anything a malicious replica could have altered fails here.
    pub fn verify(&self, expected_peer: &NodeId) -> Result<(), PublisherError> {
        let key_bytes: [u8; 32] = hex::decode(&self.public_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PublisherError::BadRecord("malformed public key".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| PublisherError::BadRecord("invalid public key".to_string()))?;
        if NodeId::from_public_key(&key) != *expected_peer {
            return Err(PublisherError::BadRecord("publisher key does not match peer".to_string()));
        }
        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PublisherError::BadRecord("malformed signature".to_string()))?;
        key.verify(&self.signing_bytes()?, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| PublisherError::BadRecord("signature verification failed".to_string()))
    }
}

#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, PublisherError> {
        let address = hex::encode(Sha256::digest(&bytes));
        self.blocks.lock().unwrap().insert(address.clone(), bytes);
        Ok(address)
    }

    async fn get(&self, address: &str) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(self.blocks.lock().unwrap().get(address).cloned())
    }
}

/// Keeps every published record per peer, newest last, so resolution sees the
/// same record multiplicity a networked name system would return.
#[derive(Clone, Default)]
pub struct MemoryNameSystem {
    records: Arc<Mutex<HashMap<NodeId, Vec<NameRecord>>>>,
}

impl MemoryNameSystem {
    pub fn new() -> Self {
        Default::default()
    }

    /// Test hook: injects a record verbatim, bypassing publish.
    pub fn inject(&self, peer: NodeId, record: NameRecord) {
        self.records.lock().unwrap().entry(peer).or_default().push(record);
    }
}

#[async_trait]
impl NameSystem for MemoryNameSystem {
    async fn publish(&self, record: NameRecord) -> Result<(), PublisherError> {
        let peer: NodeId = record
            .peer
            .parse()
            .map_err(|_| PublisherError::BadRecord("malformed peer id".to_string()))?;
        self.records.lock().unwrap().entry(peer).or_default().push(record);
        Ok(())
    }

    async fn resolve(&self, peer: NodeId, quorum: usize) -> Result<Vec<NameRecord>, PublisherError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&peer)
            .map(|all| all.iter().rev().take(quorum.max(1)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_verifies_and_rejects_tampering() {
        let identity = NodeIdentity::random();
        let record = NameRecord::new(&identity, "abc123".to_string(), 7);
        record.verify(&identity.node_id()).unwrap();

        let mut forged = record.clone();
        forged.content_address = "evil".to_string();
        assert!(matches!(
            forged.verify(&identity.node_id()),
            Err(PublisherError::BadRecord(_))
        ));

        // A valid record for someone else must not resolve for this peer.
        let other = NodeIdentity::random();
        assert!(record.verify(&other.node_id()).is_err());
    }

    #[tokio::test]
    async fn block_store_round_trip() {
        let store = MemoryBlockStore::new();
        let address = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(address, hex::encode(Sha256::digest(b"hello")));
        assert_eq!(store.get(&address).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn name_system_returns_newest_first_up_to_quorum() {
        let names = MemoryNameSystem::new();
        let identity = NodeIdentity::random();
        for seq in 1..=5 {
            names
                .publish(NameRecord::new(&identity, format!("addr-{}", seq), seq))
                .await
                .unwrap();
        }
        let records = names.resolve(identity.node_id(), 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 5);
    }
}

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

use agora_shutdown::ShutdownSignal;
use log::*;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{
    backend::{BlockStore, NameSystem},
    error::PublisherError,
    PublishWaiter,
    Publisher,
};

const LOG_TARGET: &str = "market::publisher::service";

/// Drains the publish-request channel. Each pass takes every waiter that has
/// queued up, performs one snapshot upload and answers them all, so a burst of
/// content edits costs a single publish.
pub struct PublisherService<B: BlockStore, N: NameSystem> {
    publisher: Publisher<B, N>,
    request_rx: mpsc::UnboundedReceiver<PublishWaiter>,
    shutdown_signal: ShutdownSignal,
}

impl<B: BlockStore, N: NameSystem> PublisherService<B, N> {
    pub fn new(
        publisher: Publisher<B, N>,
        request_rx: mpsc::UnboundedReceiver<PublishWaiter>,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            publisher,
            request_rx,
            shutdown_signal,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    pub async fn start(mut self) {
        info!(target: LOG_TARGET, "Publisher service started");
        loop {
            tokio::select! {
                maybe_waiter = self.request_rx.recv() => {
                    let Some(first) = maybe_waiter else { break };
                    let mut waiters = vec![first];
                    while let Ok(waiter) = self.request_rx.try_recv() {
                        waiters.push(waiter);
                    }
                    if waiters.len() > 1 {
                        debug!(target: LOG_TARGET, "Coalescing {} publish request(s)", waiters.len());
                    }
                    let result = self.publisher.publish_now().await.map_err(|e| e.to_string());
                    for waiter in waiters {
                        let reply = match &result {
                            Ok(root) => Ok(root.clone()),
                            Err(msg) => Err(PublisherError::PublishFailed(msg.clone())),
                        };
                        let _ = waiter.send(reply);
                    }
                },
                _ = &mut self.shutdown_signal => break,
            }
        }
        info!(target: LOG_TARGET, "Publisher service shut down");
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_comms::node_identity::NodeIdentity;
    use agora_shutdown::Shutdown;
    use agora_test_utils::paths::create_temporary_data_path;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        content_store::ContentStore,
        publisher::{
            backend::{MemoryBlockStore, MemoryNameSystem},
            PublisherConfig,
        },
        storage::{
            kv::{KeyValue, KV_KEY_NAME_SEQUENCE},
            MarketDatabase,
        },
    };

    #[tokio::test]
    async fn queued_requests_share_one_publish() {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let identity = Arc::new(NodeIdentity::random());
        let store = ContentStore::new(create_temporary_data_path(), db.clone(), identity.clone()).unwrap();
        let (publisher, request_rx) = Publisher::new(
            store,
            db.clone(),
            identity,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryNameSystem::new()),
            PublisherConfig::default(),
        );

        // Queue three waiters before the service starts draining; they must all
        // be answered by the same upload.
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            publisher.request_tx.send(tx).unwrap();
            receivers.push(rx);
        }

        let shutdown = Shutdown::new();
        let handle = PublisherService::new(publisher, request_rx, shutdown.to_signal()).spawn();

        let mut roots = Vec::new();
        for rx in receivers {
            roots.push(rx.await.unwrap().unwrap());
        }
        assert!(roots.windows(2).all(|w| w[0] == w[1]));

        // One upload means the sequence advanced exactly once.
        let sequence = db
            .with_connection(|conn| KeyValue::get(conn, KV_KEY_NAME_SEQUENCE))
            .unwrap()
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
            .unwrap();
        assert_eq!(sequence, 1);
        drop(handle);
    }

    #[tokio::test]
    async fn publish_fails_once_service_is_gone() {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let identity = Arc::new(NodeIdentity::random());
        let store = ContentStore::new(create_temporary_data_path(), db.clone(), identity.clone()).unwrap();
        let (publisher, request_rx) = Publisher::new(
            store,
            db,
            identity,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryNameSystem::new()),
            PublisherConfig::default(),
        );
        drop(request_rx);
        assert!(matches!(publisher.publish().await, Err(PublisherError::Shutdown)));
    }
}

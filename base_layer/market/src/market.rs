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

//! Node composition. [`Market::spawn`] wires the storage, messaging, content,
//! publishing and commerce services together over a caller-supplied transport
//! and wallet, and tears them all down on the shutdown signal.

use std::{path::PathBuf, sync::Arc, time::Duration};

use agora_common_sqlite::connection::DbConnectionUrl;
use agora_comms::{
    ban::BanList,
    connectivity::ConnectivityEvents,
    message::MessageType,
    node_id::NodeId,
    node_identity::NodeIdentity,
    service::{InboundMessageHandler, NetworkService, OutboundMessaging, DEFAULT_SEND_TIMEOUT},
    transport::PeerTransport,
};
use agora_key_manager::{KeyBranch, KeyManager};
use agora_shutdown::ShutdownSignal;
use log::*;
use thiserror::Error;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};

use crate::{
    chat_service::ChatService,
    content_store::{error::ContentStoreError, records::Rating, ContentStore},
    follow_service::FollowService,
    messaging::{inbound::InboundRouter, service::MessengerService, Messenger},
    order_service::{service::OrderWorker, OrderEvent, OrderMessageHandler, OrderService},
    proto::RatingPayload,
    publisher::{
        backend::{BlockStore, NameSystem},
        service::PublisherService,
        Publisher,
        PublisherConfig,
    },
    storage::{MarketDatabase, MarketStorageError},
    wallet::WalletBackend,
};

const LOG_TARGET: &str = "market::node";

/// Every message type the inbound router handles. Registered one by one so the
/// network service drops unknown types at the edge.
const ROUTED_MESSAGE_TYPES: &[MessageType] = &[
    MessageType::Ack,
    MessageType::Chat,
    MessageType::Follow,
    MessageType::Unfollow,
    MessageType::OrderOpen,
    MessageType::OrderReject,
    MessageType::OrderCancel,
    MessageType::OrderConfirmation,
    MessageType::OrderFulfillment,
    MessageType::OrderComplete,
    MessageType::DisputeOpen,
    MessageType::DisputeUpdate,
    MessageType::DisputeClose,
    MessageType::Refund,
    MessageType::PaymentSent,
    MessageType::PaymentFinalized,
];

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Storage error: {0}")]
    StorageError(#[from] MarketStorageError),
    #[error("Content store error: {0}")]
    ContentStoreError(#[from] ContentStoreError),
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Root directory for the content store.
    pub content_dir: PathBuf,
    pub database_url: DbConnectionUrl,
    /// How often the messenger retries undelivered queue entries.
    pub resend_interval: Duration,
    /// Per-message direct send timeout.
    pub send_timeout: Duration,
    pub publisher: PublisherConfig,
}

impl MarketConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            content_dir: base_dir.join("content"),
            database_url: DbConnectionUrl::file(base_dir.join("market.sqlite")),
            resend_interval: Duration::from_secs(60),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            publisher: PublisherConfig::default(),
        }
    }
}

/// A running market node. Dropping it does not stop the services; trigger the
/// shutdown signal passed to [`spawn`] and await [`join`] for that.
///
/// [`spawn`]: Market::spawn
/// [`join`]: Market::join
pub struct Market<T: PeerTransport, B, N> {
    identity: Arc<NodeIdentity>,
    db: MarketDatabase,
    store: ContentStore,
    publisher: Publisher<B, N>,
    chat: ChatService<T>,
    follow: FollowService<T>,
    orders: OrderService<T>,
    handles: Vec<JoinHandle<()>>,
}

impl<T, B, N> Market<T, B, N>
where
    T: PeerTransport + 'static,
    B: BlockStore + 'static,
    N: NameSystem + 'static,
{
    /// Wires up and spawns every service of a node. `inbound` is the stream of
    /// incoming peer connections from the transport that produced `transport`,
    /// `seed` derives the escrow and rating key managers, and `wallet`, `blocks`
    /// and `names` are the external backends.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: MarketConfig,
        identity: Arc<NodeIdentity>,
        transport: T,
        inbound: mpsc::Receiver<(NodeId, T::Stream)>,
        ban_list: BanList,
        wallet: Arc<dyn WalletBackend>,
        blocks: Arc<B>,
        names: Arc<N>,
        seed: [u8; 32],
        shutdown_signal: ShutdownSignal,
    ) -> Result<Self, MarketError> {
        let db = MarketDatabase::connect(&config.database_url)?;
        let store = ContentStore::new(config.content_dir.clone(), db.clone(), identity.clone())?;

        let connectivity = ConnectivityEvents::new();
        let outbound = OutboundMessaging::new(transport, ban_list.clone(), connectivity.clone())
            .with_send_timeout(config.send_timeout);
        let messenger = Messenger::new(db.clone(), outbound, identity.clone());

        let escrow_keys = Arc::new(KeyManager::new(seed, KeyBranch::Escrow));
        let rating_keys = Arc::new(KeyManager::new(seed, KeyBranch::Rating));
        let (orders, cosign_rx) =
            OrderService::new(db.clone(), messenger.clone(), wallet, escrow_keys, rating_keys);

        let chat = ChatService::new(db.clone(), messenger.clone());
        let follow = FollowService::new(db.clone(), messenger.clone());

        let (publisher, publish_rx) = Publisher::new(
            store.clone(),
            db.clone(),
            identity.clone(),
            blocks,
            names,
            config.publisher.clone(),
        );

        let router: Arc<dyn InboundMessageHandler> = Arc::new(InboundRouter::new(
            messenger.clone(),
            Arc::new(chat.clone()),
            Arc::new(follow.clone()),
            Arc::new(OrderMessageHandler::new(orders.clone(), store.clone())),
        ));
        let mut network = NetworkService::new(inbound, ban_list, connectivity.clone(), shutdown_signal.clone());
        for message_type in ROUTED_MESSAGE_TYPES {
            network.register_handler(*message_type, router.clone());
        }

        let mut handles = vec![
            network.spawn(),
            MessengerService::new(
                messenger,
                config.resend_interval,
                connectivity,
                shutdown_signal.clone(),
            )
            .spawn(),
            PublisherService::new(publisher.clone(), publish_rx, shutdown_signal.clone()).spawn(),
            OrderWorker::new(orders.clone(), cosign_rx, shutdown_signal.clone()).spawn(),
        ];
        handles.push(spawn_rating_filer(
            orders.clone(),
            store.clone(),
            publisher.clone(),
            shutdown_signal,
        ));

        info!(
            target: LOG_TARGET,
            "Market node {} started",
            identity.node_id().short_str()
        );
        Ok(Self {
            identity,
            db,
            store,
            publisher,
            chat,
            follow,
            orders,
            handles,
        })
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn database(&self) -> &MarketDatabase {
        &self.db
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher<B, N> {
        &self.publisher
    }

    pub fn chat(&self) -> &ChatService<T> {
        &self.chat
    }

    pub fn follow(&self) -> &FollowService<T> {
        &self.follow
    }

    pub fn orders(&self) -> &OrderService<T> {
        &self.orders
    }

    /// Waits for every spawned service to exit. Returns once the shutdown
    /// signal given to [`spawn`] has been triggered and honoured.
    ///
    /// [`spawn`]: Market::spawn
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        info!(target: LOG_TARGET, "Market node {} stopped", self.identity.node_id().short_str());
    }
}

/// Files verified ratings from completed orders into the vendor's content store
/// and requests a publish so buyers can see them.
fn spawn_rating_filer<T, B, N>(
    orders: OrderService<T>,
    store: ContentStore,
    publisher: Publisher<B, N>,
    mut shutdown_signal: ShutdownSignal,
) -> JoinHandle<()>
where
    T: PeerTransport + 'static,
    B: BlockStore + 'static,
    N: NameSystem + 'static,
{
    let mut events = orders.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(OrderEvent::Completed { order_id, ratings }) => {
                            if let Err(err) = file_ratings(&store, &order_id, &ratings).await {
                                error!(target: LOG_TARGET, "Failed to file ratings for order {}: {}", order_id, err);
                                continue;
                            }
                            if let Err(err) = publisher.publish().await {
                                warn!(target: LOG_TARGET, "Publish after rating update failed: {}", err);
                            }
                        },
                        Ok(_) => {},
                        Err(RecvError::Lagged(n)) => {
                            warn!(target: LOG_TARGET, "Order events lagged by {}", n);
                        },
                        Err(RecvError::Closed) => break,
                    }
                },
                _ = &mut shutdown_signal => break,
            }
        }
        debug!(target: LOG_TARGET, "Rating filer shut down");
    })
}

async fn file_ratings(
    store: &ContentStore,
    order_id: &str,
    ratings: &[RatingPayload],
) -> Result<(), ContentStoreError> {
    let mut tx = store.begin().await;
    for rating in ratings {
        tx.set_rating(&Rating {
            order_id: order_id.to_string(),
            overall: rating.overall,
            quality: rating.quality,
            customer_service: rating.customer_service,
            description: rating.description,
            delivery_speed: rating.delivery_speed,
            review: rating.review.clone(),
            rating_key: hex::encode(&rating.rating_key),
            signature: hex::encode(&rating.signature),
        })?;
    }
    tx.commit()?;
    info!(
        target: LOG_TARGET,
        "Filed {} rating(s) for completed order {}",
        ratings.len(),
        order_id
    );
    Ok(())
}

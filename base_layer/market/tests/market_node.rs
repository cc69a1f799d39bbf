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

//! End-to-end tests of whole nodes talking over the in-memory network, sharing
//! one in-memory wallet as "the chain" and one block store as "the network".

use std::{sync::Arc, time::Duration};

use agora_common::configuration::network::Network;
use agora_common_sqlite::connection::DbConnectionUrl;
use agora_comms::{
    ban::BanList,
    node_identity::NodeIdentity,
    transport::memory::{MemoryNetwork, MemoryTransport},
};
use agora_market::{
    content_store::records::Listing,
    order_service::{PurchaseOptions, RatingInput},
    publisher::{
        backend::{MemoryBlockStore, MemoryNameSystem},
        PublisherConfig,
    },
    storage::{
        messages::OutgoingMessageSql,
        orders::{OrderSql, OrderState, PaymentMethod},
    },
    wallet::MemoryWallet,
    Market,
    MarketConfig,
};
use agora_shutdown::Shutdown;
use rand::{rngs::OsRng, RngCore};
use tokio::time::{sleep, timeout};

type TestMarket = Market<MemoryTransport, MemoryBlockStore, MemoryNameSystem>;

struct Harness {
    network: MemoryNetwork,
    wallet: Arc<MemoryWallet>,
    blocks: Arc<MemoryBlockStore>,
    names: Arc<MemoryNameSystem>,
    shutdown: Shutdown,
}

impl Harness {
    fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            wallet: MemoryWallet::new(10),
            blocks: Arc::new(MemoryBlockStore::new()),
            names: Arc::new(MemoryNameSystem::new()),
            shutdown: Shutdown::new(),
        }
    }

    fn spawn_node(&self) -> TestMarket {
        let identity = Arc::new(NodeIdentity::random());
        let (transport, inbound) = self
            .network
            .create_endpoint(identity.node_id(), Network::TestNet.protocol_id());
        let config = MarketConfig {
            content_dir: agora_test_utils::paths::create_temporary_data_path().join("content"),
            database_url: DbConnectionUrl::memory(agora_test_utils::random::string(12)),
            resend_interval: Duration::from_millis(200),
            send_timeout: Duration::from_secs(5),
            publisher: PublisherConfig::default(),
        };
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Market::spawn(
            config,
            identity,
            transport,
            inbound,
            BanList::new(),
            self.wallet.clone(),
            self.blocks.clone(),
            self.names.clone(),
            seed,
            self.shutdown.to_signal(),
        )
        .unwrap()
    }
}

/// Polls `predicate` until it holds or ten seconds pass.
async fn wait_until<F: FnMut() -> bool>(what: &str, mut predicate: F) {
    timeout(Duration::from_secs(10), async {
        loop {
            if predicate() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn order_state(node: &TestMarket, order_id: &str) -> Option<OrderState> {
    node.database()
        .with_connection(|conn| OrderSql::find(conn, order_id))
        .unwrap()
        .map(|order| order.state().unwrap())
}

fn outgoing_queue_len(node: &TestMarket) -> i64 {
    node.database().with_connection(OutgoingMessageSql::count).unwrap()
}

async fn publish_listing(vendor: &TestMarket, slug: &str, price: u64) -> Listing {
    let mut tx = vendor.content_store().begin().await;
    tx.set_listing(
        Listing {
            slug: slug.to_string(),
            title: "Red hat".to_string(),
            description: "A hat, red".to_string(),
            price,
            currency: "AGC".to_string(),
            ..Default::default()
        },
        Vec::new(),
    )
    .unwrap();
    tx.commit().unwrap();
    vendor.content_store().listing(slug).unwrap().unwrap()
}

#[tokio::test]
async fn chat_arrives_in_order_and_the_queue_drains() {
    let harness = Harness::new();
    let alice = harness.spawn_node();
    let bob = harness.spawn_node();

    for body in ["one", "two", "three"] {
        alice.chat().send_message(bob.node_id(), "", body).await.unwrap();
    }

    let alice_id = alice.node_id();
    wait_until("bob to receive all three messages", || {
        bob.chat().history(&alice_id).unwrap().len() == 3
    })
    .await;
    let bodies: Vec<String> = bob
        .chat()
        .history(&alice_id)
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);

    // Every delivery was ACKed, so nothing is left to retry.
    wait_until("alice's outgoing queue to drain", || outgoing_queue_len(&alice) == 0).await;
}

#[tokio::test]
async fn rapid_follow_unfollow_never_resurrects_the_link() {
    let harness = Harness::new();
    let alice = harness.spawn_node();
    let bob = harness.spawn_node();

    alice.follow().follow(bob.node_id()).await.unwrap();
    alice.follow().unfollow(bob.node_id()).await.unwrap();

    // Once both messages are ACKed bob has applied them in order.
    wait_until("alice's outgoing queue to drain", || outgoing_queue_len(&alice) == 0).await;
    assert!(bob.follow().followers().unwrap().is_empty());

    alice.follow().follow(bob.node_id()).await.unwrap();
    wait_until("bob to see the follower", || {
        bob.follow().followers().unwrap() == vec![alice.node_id()]
    })
    .await;
}

#[tokio::test]
async fn direct_order_happy_path_across_two_nodes() {
    let harness = Harness::new();
    let vendor = harness.spawn_node();
    let buyer = harness.spawn_node();

    let listing = publish_listing(&vendor, "red-hat", 5000).await;

    let order_id = buyer
        .orders()
        .purchase_listing(vendor.node_id(), &listing, PurchaseOptions {
            payment_method: PaymentMethod::Direct,
            moderator: None,
            refund_address: "buyer-refund".to_string(),
        })
        .await
        .unwrap();

    wait_until("the vendor to record the order", || {
        order_state(&vendor, &order_id) == Some(OrderState::AwaitingPayment)
    })
    .await;

    vendor.orders().confirm_order(&order_id, "in stock").await.unwrap();
    wait_until("the buyer to learn the payment address", || {
        buyer
            .database()
            .with_connection(|conn| OrderSql::find(conn, &order_id))
            .unwrap()
            .and_then(|o| o.payment_address)
            .is_some()
    })
    .await;

    buyer.orders().fund_order(&order_id, 5000).await.unwrap();
    wait_until("both sides to reach Confirmed", || {
        order_state(&buyer, &order_id) == Some(OrderState::Confirmed)
            && order_state(&vendor, &order_id) == Some(OrderState::Confirmed)
    })
    .await;

    vendor
        .orders()
        .fulfill_order(&order_id, "TRACK-1", "post", "")
        .await
        .unwrap();
    wait_until("the buyer to see fulfillment", || {
        order_state(&buyer, &order_id) == Some(OrderState::Fulfilled)
    })
    .await;

    buyer
        .orders()
        .complete_order(&order_id, RatingInput {
            overall: 5,
            quality: 5,
            customer_service: 4,
            description: 5,
            delivery_speed: 3,
            review: "hat arrived, is red".to_string(),
        })
        .await
        .unwrap();

    // The vendor verifies the rating, files it and completes the order.
    wait_until("the vendor to complete the order", || {
        order_state(&vendor, &order_id) == Some(OrderState::Completed)
    })
    .await;
    wait_until("the rating to land in the vendor's store", || {
        !vendor.content_store().rating_index().unwrap().is_empty()
    })
    .await;
}

#[tokio::test]
async fn published_snapshot_is_resolvable_by_peers() {
    let harness = Harness::new();
    let vendor = harness.spawn_node();
    let browser = harness.spawn_node();

    publish_listing(&vendor, "red-hat", 5000).await;
    let root = vendor.publisher().publish().await.unwrap();

    let resolved = browser.publisher().resolve(vendor.node_id(), true).await.unwrap();
    assert_eq!(resolved, root);

    let bytes = browser
        .publisher()
        .fetch_file(vendor.node_id(), "listings/red-hat.json", true)
        .await
        .unwrap();
    let listing: Listing = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(listing.price, 5000);
    assert_eq!(listing.vendor_id, vendor.node_id().to_string());
}

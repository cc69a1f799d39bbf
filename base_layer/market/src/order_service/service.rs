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

use agora_comms::transport::PeerTransport;
use agora_shutdown::ShutdownSignal;
use log::*;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};

use super::OrderService;
use crate::{
    proto::RefundPayload,
    wallet::WalletEvent,
};

const LOG_TARGET: &str = "market::orders::service";

/// Drives the order state machine from the wallet's observation stream and
/// executes buyer-side refund co-signing outside the inbound handler's storage
/// transaction.
pub struct OrderWorker<T: PeerTransport> {
    service: OrderService<T>,
    wallet_events: tokio::sync::broadcast::Receiver<WalletEvent>,
    cosign_requests: mpsc::UnboundedReceiver<RefundPayload>,
    shutdown_signal: ShutdownSignal,
}

impl<T: PeerTransport> OrderWorker<T> {
    pub fn new(
        service: OrderService<T>,
        cosign_requests: mpsc::UnboundedReceiver<RefundPayload>,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        let wallet_events = service.wallet.subscribe();
        Self {
            service,
            wallet_events,
            cosign_requests,
            shutdown_signal,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }

    pub async fn start(mut self) {
        info!(target: LOG_TARGET, "Order worker started");
        loop {
            tokio::select! {
                event = self.wallet_events.recv() => {
                    match event {
                        Ok(WalletEvent::FundsReceived { address, txid, amount }) => {
                            if let Err(err) = self.service.apply_funding(&address, &txid, amount).await {
                                error!(target: LOG_TARGET, "Failed to apply funding {}: {}", txid, err);
                            }
                        },
                        Ok(WalletEvent::SpendObserved { address, txid, destination, amount }) => {
                            if let Err(err) = self.service.apply_spend(&address, &txid, &destination, amount).await {
                                error!(target: LOG_TARGET, "Failed to apply spend {}: {}", txid, err);
                            }
                        },
                        Err(RecvError::Lagged(n)) => {
                            warn!(target: LOG_TARGET, "Wallet observations lagged by {}", n);
                        },
                        Err(RecvError::Closed) => {
                            warn!(target: LOG_TARGET, "Wallet observation stream closed");
                            break;
                        },
                    }
                },
                // The worker owns a service clone, so this channel never closes
                // while the worker runs.
                Some(payload) = self.cosign_requests.recv() => {
                    let order_id = payload.order_id.clone();
                    if let Err(err) = self.service.cosign_refund(payload).await {
                        warn!(target: LOG_TARGET, "Refund co-sign for order {} failed: {}", order_id, err);
                    }
                },
                _ = &mut self.shutdown_signal => {
                    break;
                },
            }
        }
        info!(target: LOG_TARGET, "Order worker shut down");
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_comms::{
        ban::BanList,
        connectivity::ConnectivityEvents,
        node_identity::NodeIdentity,
        service::OutboundMessaging,
        transport::memory::{MemoryNetwork, MemoryTransport},
    };
    use agora_key_manager::{KeyBranch, KeyManager};
    use agora_shutdown::Shutdown;
    use prost::Message;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        messaging::Messenger,
        order_service::OrderEvent,
        proto::OrderOpenPayload,
        storage::{
            orders::{OrderRole, OrderSql, OrderState, OrderTransactionSql, PaymentMethod, RefundSql},
            MarketDatabase,
        },
        wallet::{MemoryWallet, WalletBackend},
    };

    const PROTOCOL: &str = "/agora/test/1.0.0";

    fn make_service(
        network: &MemoryNetwork,
        wallet: Arc<MemoryWallet>,
    ) -> (OrderService<MemoryTransport>, mpsc::UnboundedReceiver<RefundPayload>, MarketDatabase) {
        let identity = Arc::new(NodeIdentity::random());
        let (transport, _inbound) = network.create_endpoint(identity.node_id(), PROTOCOL);
        let outbound = OutboundMessaging::new(transport, BanList::new(), ConnectivityEvents::new());
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        let messenger = Messenger::new(db.clone(), outbound, identity);
        let (service, cosign_rx) = OrderService::new(
            db.clone(),
            messenger,
            wallet,
            Arc::new(KeyManager::random(KeyBranch::Escrow)),
            Arc::new(KeyManager::random(KeyBranch::Rating)),
        );
        (service, cosign_rx, db)
    }

    fn seeded_order(db: &MarketDatabase, order_id: &str, method: PaymentMethod, amount: u64, address: &str) {
        let buyer = NodeIdentity::random().node_id();
        let vendor = NodeIdentity::random().node_id();
        let open = OrderOpenPayload {
            order_id: order_id.to_string(),
            listing_slug: "thing".to_string(),
            payment_method: method as i32,
            amount,
            refund_address: "refund-addr".to_string(),
            ..Default::default()
        };
        db.with_connection(|conn| {
            OrderSql::new(
                order_id.to_string(),
                OrderRole::Vendor,
                method,
                &buyer,
                &vendor,
                None,
                amount,
                vec![7; 32],
                open.encode_to_vec(),
            )
            .insert(conn)?;
            OrderSql::set_payment_address(conn, order_id, address)
        })
        .unwrap();
    }

    #[tokio::test]
    async fn observed_funding_promotes_the_order() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(0);
        let (service, cosign_rx, db) = make_service(&network, wallet.clone());
        seeded_order(&db, "ord-1", PaymentMethod::Direct, 5_000, "pay-addr-1");

        let mut events = service.subscribe();
        let shutdown = Shutdown::new();
        let handle = OrderWorker::new(service, cosign_rx, shutdown.to_signal()).spawn();

        wallet.send_to_address("pay-addr-1", 5_000).await.unwrap();

        let mut funded = false;
        while let Ok(Ok(event)) = timeout(Duration::from_secs(5), events.recv()).await {
            if let OrderEvent::StateChanged { order_id, state } = event {
                assert_eq!(order_id, "ord-1");
                assert_eq!(state, OrderState::Funded);
                funded = true;
                break;
            }
        }
        assert!(funded);
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-1")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Funded);
        drop(handle);
    }

    #[tokio::test]
    async fn partial_funding_does_not_promote() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(0);
        let (service, _cosign_rx, db) = make_service(&network, wallet);
        seeded_order(&db, "ord-2", PaymentMethod::Direct, 5_000, "pay-addr-2");

        service.apply_funding("pay-addr-2", "tx-1", 2_000).await.unwrap();
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-2")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::AwaitingPayment);

        service.apply_funding("pay-addr-2", "tx-2", 3_000).await.unwrap();
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-2")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Funded);
    }

    #[tokio::test]
    async fn refund_spends_are_allocated_per_funding_and_reach_refunded() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(10);
        let (service, _cosign_rx, db) = make_service(&network, wallet);
        seeded_order(&db, "ord-3", PaymentMethod::Moderated, 232_222, "escrow-3");
        db.with_connection(|conn| {
            OrderTransactionSql::record(conn, "ord-3", "fund-1", 10_000, false, None)?;
            OrderTransactionSql::record(conn, "ord-3", "fund-2", 222_222, false, None)?;
            OrderSql::set_state(conn, "ord-3", OrderState::Funded)
        })
        .unwrap();

        // Two refund tranches, each netting the release fee out of one funding.
        service.apply_spend("escrow-3", "spend-1", "refund-addr", 9_990).await.unwrap();
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-3")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Funded);

        service
            .apply_spend("escrow-3", "spend-2", "refund-addr", 222_212)
            .await
            .unwrap();
        let (order, refunds) = db
            .with_connection(|conn| Ok((OrderSql::find(conn, "ord-3")?.unwrap(), RefundSql::for_order(conn, "ord-3")?)))
            .unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Refunded);
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].amount, 9_990);
        assert_eq!(refunds[1].amount, 222_212);
    }

    #[tokio::test]
    async fn vendor_claim_overrules_a_local_cancel() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(10);
        let (service, _cosign_rx, db) = make_service(&network, wallet);
        seeded_order(&db, "ord-4", PaymentMethod::Cancelable, 5_000, "escrow-4");
        db.with_connection(|conn| {
            OrderTransactionSql::record(conn, "ord-4", "fund-1", 5_000, false, None)?;
            OrderSql::set_cancellation(conn, "ord-4", b"cancel")?;
            OrderSql::set_state(conn, "ord-4", OrderState::Canceled)
        })
        .unwrap();

        // The spend that confirmed went to the vendor, not the refund address.
        service
            .apply_spend("escrow-4", "claim-1", "vendor-payout", 4_990)
            .await
            .unwrap();
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-4")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Confirmed);
    }

    #[tokio::test]
    async fn buyer_cancel_spend_overrules_an_optimistic_confirm() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(10);
        let (service, _cosign_rx, db) = make_service(&network, wallet);
        seeded_order(&db, "ord-5", PaymentMethod::Cancelable, 5_000, "escrow-5");
        db.with_connection(|conn| {
            OrderTransactionSql::record(conn, "ord-5", "fund-1", 5_000, false, None)?;
            // The vendor confirmed locally, then the buyer's cancel arrived.
            OrderSql::set_cancellation(conn, "ord-5", b"cancel")?;
            OrderSql::set_state(conn, "ord-5", OrderState::Confirmed)
        })
        .unwrap();

        service
            .apply_spend("escrow-5", "cancel-1", "refund-addr", 4_990)
            .await
            .unwrap();
        let order = db.with_connection(|conn| OrderSql::find(conn, "ord-5")).unwrap().unwrap();
        assert_eq!(order.state().unwrap(), OrderState::Canceled);
        // The cancel spend is not a refund: no refund rows were written.
        let refunds = db.with_connection(|conn| RefundSql::for_order(conn, "ord-5")).unwrap();
        assert!(refunds.is_empty());
    }

    #[tokio::test]
    async fn spends_on_unknown_addresses_are_ignored() {
        let network = MemoryNetwork::new();
        let wallet = MemoryWallet::new(0);
        let (service, _cosign_rx, _db) = make_service(&network, wallet);
        service.apply_funding("nobody", "tx", 1).await.unwrap();
        service.apply_spend("nobody", "tx", "dest", 1).await.unwrap();
    }
}

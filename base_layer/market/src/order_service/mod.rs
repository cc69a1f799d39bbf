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

//! The order state machine. Local operations are the actions a user takes on
//! their own node; the inbound handler applies the counterparty's messages. Both
//! record their effects and the resulting outbound messages in one storage
//! transaction, so a crash never leaves an order half-advanced.
//!
//! Funding and escrow releases are driven by wallet observations, not by
//! counterparty claims: a PAYMENT_SENT message is informational, the order only
//! becomes funded when the wallet sees the transaction. The same observation
//! stream settles the cancel/confirm race on cancelable orders.

pub mod error;
pub mod escrow;
pub mod service;

use std::sync::Arc;

use agora_comms::{
    message::{Envelope, InboundMessage, MessageExt, MessageType},
    node_id::NodeId,
    transport::PeerTransport,
};
use agora_key_manager::{multisig::sign_multisig, ChainCode, KeyManager};
use chrono::Utc;
use diesel::SqliteConnection;
use ed25519_dalek::Verifier;
use log::*;
use prost::Message;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{broadcast, mpsc};

use self::error::OrderServiceError;
use crate::{
    content_store::ContentStore,
    messaging::{error::MessagingError, inbound::MessageHandler, Messenger},
    proto::{
        rating_signing_bytes,
        DisputeClosePayload,
        DisputeOpenPayload,
        DisputeUpdatePayload,
        OrderCancelPayload,
        OrderCompletePayload,
        OrderConfirmationPayload,
        OrderFulfillmentPayload,
        OrderOpenPayload,
        OrderRejectPayload,
        PartialSignature,
        PaymentFinalizedPayload,
        PaymentSentPayload,
        RatingPayload,
        RefundPayload,
    },
    storage::{
        messages::SequenceClass,
        orders::{CaseSql, CaseState, OrderRole, OrderSql, OrderState, OrderTransactionSql, PaymentMethod, RefundSql},
        MarketDatabase,
    },
    wallet::WalletBackend,
};

const LOG_TARGET: &str = "market::orders";

const EVENT_CHANNEL_SIZE: usize = 64;
const ORDER_ID_BYTES: usize = 10;

#[derive(Debug, Clone)]
pub enum OrderEvent {
    StateChanged { order_id: String, state: OrderState },
    PaymentReceived { order_id: String, txid: String, amount: u64 },
    RefundRecorded { order_id: String, txid: String, amount: u64 },
    /// The vendor received ORDER_COMPLETE with verified ratings.
    Completed { order_id: String, ratings: Vec<RatingPayload> },
}

/// The moderator a buyer nominates when purchasing with moderated escrow.
#[derive(Debug, Clone)]
pub struct ModeratorInfo {
    pub peer: NodeId,
    /// The moderator's published escrow public key, from their profile.
    pub escrow_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PurchaseOptions {
    pub payment_method: PaymentMethod,
    pub moderator: Option<ModeratorInfo>,
    /// Where any refund of this order should be paid.
    pub refund_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct RatingInput {
    pub overall: u32,
    pub quality: u32,
    pub customer_service: u32,
    pub description: u32,
    pub delivery_speed: u32,
    pub review: String,
}

pub struct OrderService<T: PeerTransport> {
    db: MarketDatabase,
    messenger: Messenger<T>,
    wallet: Arc<dyn WalletBackend>,
    escrow_keys: Arc<KeyManager>,
    rating_keys: Arc<KeyManager>,
    events: broadcast::Sender<OrderEvent>,
    cosign_tx: mpsc::UnboundedSender<RefundPayload>,
}

impl<T: PeerTransport> Clone for OrderService<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            messenger: self.messenger.clone(),
            wallet: self.wallet.clone(),
            escrow_keys: self.escrow_keys.clone(),
            rating_keys: self.rating_keys.clone(),
            events: self.events.clone(),
            cosign_tx: self.cosign_tx.clone(),
        }
    }
}

impl<T: PeerTransport> OrderService<T> {
    /// Returns the service and the receiver for buyer co-sign requests, which the
    /// [`service::OrderWorker`] consumes.
    pub fn new(
        db: MarketDatabase,
        messenger: Messenger<T>,
        wallet: Arc<dyn WalletBackend>,
        escrow_keys: Arc<KeyManager>,
        rating_keys: Arc<KeyManager>,
    ) -> (Self, mpsc::UnboundedReceiver<RefundPayload>) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (cosign_tx, cosign_rx) = mpsc::unbounded_channel();
        (
            Self {
                db,
                messenger,
                wallet,
                escrow_keys,
                rating_keys,
                events,
                cosign_tx,
            },
            cosign_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    fn node_id(&self) -> NodeId {
        self.messenger.identity().node_id()
    }

    fn emit(&self, event: OrderEvent) {
        let _ = self.events.send(event);
    }

    fn load(&self, conn: &mut SqliteConnection, order_id: &str) -> Result<OrderSql, OrderServiceError> {
        OrderSql::find(conn, order_id)?.ok_or_else(|| OrderServiceError::OrderNotFound(order_id.to_string()))
    }

    fn load_order(&self, order_id: &str) -> Result<OrderSql, OrderServiceError> {
        let order = self.db.with_connection(|conn| OrderSql::find(conn, order_id))?;
        order.ok_or_else(|| OrderServiceError::OrderNotFound(order_id.to_string()))
    }

    fn contract_of(order: &OrderSql) -> Result<OrderOpenPayload, OrderServiceError> {
        Ok(OrderOpenPayload::decode(order.contract.as_slice())?)
    }

    fn confirmation_of(order: &OrderSql) -> Result<Option<OrderConfirmationPayload>, OrderServiceError> {
        match &order.confirmation {
            Some(raw) => Ok(Some(OrderConfirmationPayload::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    fn require_role(order: &OrderSql, role: OrderRole, action: &'static str) -> Result<(), OrderServiceError> {
        if order.role()? != role {
            return Err(OrderServiceError::InvalidRole {
                order_id: order.order_id.clone(),
                action,
            });
        }
        Ok(())
    }

    /// Messages about an order are only accepted from the counterparty they are
    /// supposed to come from; the network layer has already verified the envelope
    /// signature against the source peer.
    fn require_from(order: &OrderSql, expected: NodeId, message: &InboundMessage) -> Result<(), OrderServiceError> {
        if message.source_peer != expected {
            return Err(OrderServiceError::BadRequest(format!(
                "message about order {} came from the wrong peer",
                order.order_id
            )));
        }
        Ok(())
    }

    fn invalid_state(order: &OrderSql, action: &'static str) -> OrderServiceError {
        OrderServiceError::InvalidState {
            order_id: order.order_id.clone(),
            state: order.state().unwrap_or(OrderState::AwaitingPayment),
            action,
        }
    }

    // ---- local operations -------------------------------------------------

    /// Opens an order against a listing fetched from the vendor's snapshot.
    /// Returns the new order id once ORDER_OPEN is queued for delivery.
    pub async fn purchase_listing(
        &self,
        vendor: NodeId,
        listing: &crate::content_store::records::Listing,
        options: PurchaseOptions,
    ) -> Result<String, OrderServiceError> {
        if listing.price == 0 {
            return Err(OrderServiceError::BadRequest("listing has no price".to_string()));
        }
        let moderator = match (options.payment_method, &options.moderator) {
            (PaymentMethod::Moderated, Some(info)) => {
                escrow::parse_key(&info.escrow_key)?;
                Some(info.clone())
            },
            (PaymentMethod::Moderated, None) => {
                return Err(OrderServiceError::BadRequest(
                    "moderated payment requires a moderator".to_string(),
                ))
            },
            (_, _) => None,
        };

        let mut id_bytes = [0u8; ORDER_ID_BYTES];
        OsRng.fill_bytes(&mut id_bytes);
        let order_id = hex::encode(id_bytes);

        let chaincode = ChainCode::random();
        let buyer_escrow = self.escrow_keys.derive_key(&chaincode, 0);
        let rating_key = self.rating_keys.derive_key(&chaincode, 0);

        let payload = OrderOpenPayload {
            order_id: order_id.clone(),
            listing_slug: listing.slug.clone(),
            payment_method: options.payment_method as i32,
            amount: listing.price,
            chaincode: chaincode.as_bytes().to_vec(),
            buyer_escrow_key: buyer_escrow.public.to_bytes().to_vec(),
            moderator: moderator.as_ref().map(|m| m.peer.to_string()).unwrap_or_default(),
            moderator_key: moderator.as_ref().map(|m| m.escrow_key.clone()).unwrap_or_default(),
            rating_keys: vec![rating_key.public.to_bytes().to_vec()],
            refund_address: options.refund_address,
            timestamp: Utc::now().timestamp() as u64,
        };
        let contract = payload.to_encoded_bytes();

        let buyer = self.node_id();
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::new(
                order_id.clone(),
                OrderRole::Buyer,
                options.payment_method,
                &buyer,
                &vendor,
                moderator.as_ref().map(|m| &m.peer),
                payload.amount,
                payload.chaincode.clone(),
                contract.clone(),
            )
            .insert(conn)?;
            self.prepare_order_message(conn, &vendor, &order_id, MessageType::OrderOpen, contract.clone())
        })?;
        self.messenger.dispatch(vendor, envelope, None).await;
        info!(
            target: LOG_TARGET,
            "Opened order {} for '{}' with {}",
            order_id,
            payload.listing_slug,
            vendor.short_str()
        );
        Ok(order_id)
    }

    /// Vendor accepts an order, announcing the payment address. On a funded
    /// cancelable order this also claims the escrow, racing any in-flight cancel.
    pub async fn confirm_order(&self, order_id: &str, comment: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Vendor, "confirm")?;
        let state = order.state()?;
        if !matches!(state, OrderState::AwaitingPayment | OrderState::Funded) {
            return Err(Self::invalid_state(&order, "confirm"));
        }
        let open = Self::contract_of(&order)?;
        let method = order.payment_method()?;
        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let vendor_escrow = self.escrow_keys.derive_key(&chaincode, 0);

        let payment_address = match method {
            PaymentMethod::Direct => self.wallet.new_address().await?,
            _ => escrow::script_address(&escrow::script_for(method, &open, &vendor_escrow.public)?),
        };
        let payload = OrderConfirmationPayload {
            order_id: order_id.to_string(),
            vendor_escrow_key: vendor_escrow.public.to_bytes().to_vec(),
            payment_address: payment_address.clone(),
            comment: comment.to_string(),
        };

        let buyer = order.buyer_node_id()?;
        let promoted = state == OrderState::Funded;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_confirmation(conn, order_id, &payload.to_encoded_bytes())?;
            OrderSql::set_payment_address(conn, order_id, &payment_address)?;
            if promoted {
                OrderSql::set_state(conn, order_id, OrderState::Confirmed)?;
            }
            self.prepare_order_message(
                conn,
                &buyer,
                order_id,
                MessageType::OrderConfirmation,
                payload.to_encoded_bytes(),
            )
        })?;
        if promoted {
            self.emit(OrderEvent::StateChanged {
                order_id: order_id.to_string(),
                state: OrderState::Confirmed,
            });
        }

        // Claiming the funds is what actually wins the cancel/confirm race; the
        // chain observation reconciles whichever side lost.
        if method == PaymentMethod::Cancelable && promoted {
            if let Err(err) = self
                .claim_cancelable_funding(&order, &open, &vendor_escrow, &payment_address)
                .await
            {
                info!(
                    target: LOG_TARGET,
                    "Escrow claim for order {} did not go through ({}); the observed spend decides the race",
                    order_id,
                    err
                );
            }
        }

        self.messenger.dispatch(buyer, envelope, None).await;
        info!(target: LOG_TARGET, "Confirmed order {} ({})", order_id, payment_address);
        Ok(())
    }

    async fn claim_cancelable_funding(
        &self,
        order: &OrderSql,
        open: &OrderOpenPayload,
        vendor_escrow: &agora_key_manager::DerivedKeypair,
        source: &str,
    ) -> Result<(), OrderServiceError> {
        let fundings = self
            .db
            .with_connection(|conn| OrderTransactionSql::fundings(conn, &order.order_id))?;
        let total: u64 = fundings.iter().map(|f| f.amount as u64).sum();
        let fee = self.wallet.escrow_release_fee();
        if total <= fee {
            return Ok(());
        }
        let claim_address = self.wallet.new_address().await?;
        let script = escrow::script_for(PaymentMethod::Cancelable, open, &vendor_escrow.public)?;
        let inputs = fundings
            .iter()
            .map(|f| agora_key_manager::SpendInput {
                txid: f.txid.clone(),
                index: 0,
                amount: f.amount as u64,
            })
            .collect::<Vec<_>>();
        let outputs = vec![agora_key_manager::multisig::SpendOutput {
            address: claim_address,
            amount: total - fee,
        }];
        let sigs = sign_multisig(&vendor_escrow.secret, &script, &inputs, &outputs)?;
        let package = agora_key_manager::multisig::combine_signatures(&script, inputs, outputs, vec![sigs])?;
        self.wallet.broadcast_spend(source, &package).await?;
        Ok(())
    }

    /// Vendor declines an order before any payment arrived.
    pub async fn reject_order(&self, order_id: &str, reason: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Vendor, "reject")?;
        if order.state()? != OrderState::AwaitingPayment {
            return Err(Self::invalid_state(&order, "reject"));
        }
        let payload = OrderRejectPayload {
            order_id: order_id.to_string(),
            reason: reason.to_string(),
        };
        let buyer = order.buyer_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_rejection(conn, order_id, &payload.to_encoded_bytes())?;
            OrderSql::set_state(conn, order_id, OrderState::Rejected)?;
            self.prepare_order_message(conn, &buyer, order_id, MessageType::OrderReject, payload.to_encoded_bytes())
        })?;
        self.emit(OrderEvent::StateChanged {
            order_id: order_id.to_string(),
            state: OrderState::Rejected,
        });
        self.messenger.dispatch(buyer, envelope, None).await;
        Ok(())
    }

    /// Buyer cancels. On a funded cancelable order this spends the escrow back to
    /// the refund address, racing any concurrent vendor confirmation.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "cancel")?;
        let state = order.state()?;
        if !matches!(state, OrderState::AwaitingPayment | OrderState::Funded) {
            return Err(Self::invalid_state(&order, "cancel"));
        }
        let method = order.payment_method()?;
        let open = Self::contract_of(&order)?;
        let funding_total = self
            .db
            .with_connection(|conn| OrderTransactionSql::funding_total(conn, order_id))?;
        if funding_total > 0 {
            if method != PaymentMethod::Cancelable {
                return Err(Self::invalid_state(&order, "cancel after funding"));
            }
            if open.refund_address.is_empty() {
                return Err(OrderServiceError::BadRequest("order has no refund address".to_string()));
            }
            if let Err(err) = self.reclaim_cancelable_funding(&order, &open).await {
                info!(
                    target: LOG_TARGET,
                    "Cancel spend for order {} did not go through ({}); the observed spend decides the race",
                    order_id,
                    err
                );
            }
        }

        let payload = OrderCancelPayload {
            order_id: order_id.to_string(),
        };
        let vendor = order.vendor_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_cancellation(conn, order_id, &payload.to_encoded_bytes())?;
            OrderSql::set_state(conn, order_id, OrderState::Canceled)?;
            self.prepare_order_message(conn, &vendor, order_id, MessageType::OrderCancel, payload.to_encoded_bytes())
        })?;
        self.emit(OrderEvent::StateChanged {
            order_id: order_id.to_string(),
            state: OrderState::Canceled,
        });
        self.messenger.dispatch(vendor, envelope, None).await;
        Ok(())
    }

    async fn reclaim_cancelable_funding(
        &self,
        order: &OrderSql,
        open: &OrderOpenPayload,
    ) -> Result<(), OrderServiceError> {
        let confirmation =
            Self::confirmation_of(order)?.ok_or_else(|| OrderServiceError::BadRequest("order not confirmed".to_string()))?;
        let vendor_key = escrow::parse_key(&confirmation.vendor_escrow_key)?;
        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let buyer_escrow = self.escrow_keys.derive_key(&chaincode, 0);
        let script = escrow::script_for(PaymentMethod::Cancelable, open, &vendor_key)?;

        let fundings = self
            .db
            .with_connection(|conn| OrderTransactionSql::fundings(conn, &order.order_id))?;
        let total: u64 = fundings.iter().map(|f| f.amount as u64).sum();
        let fee = self.wallet.escrow_release_fee();
        if total <= fee {
            return Err(OrderServiceError::NothingToRefund(order.order_id.clone()));
        }
        let inputs = fundings
            .iter()
            .map(|f| agora_key_manager::SpendInput {
                txid: f.txid.clone(),
                index: 0,
                amount: f.amount as u64,
            })
            .collect::<Vec<_>>();
        let outputs = vec![agora_key_manager::multisig::SpendOutput {
            address: open.refund_address.clone(),
            amount: total - fee,
        }];
        let sigs = sign_multisig(&buyer_escrow.secret, &script, &inputs, &outputs)?;
        let package = agora_key_manager::multisig::combine_signatures(&script, inputs, outputs, vec![sigs])?;
        let source = order
            .payment_address
            .clone()
            .ok_or_else(|| OrderServiceError::BadRequest("order has no payment address".to_string()))?;
        self.wallet.broadcast_spend(&source, &package).await?;
        Ok(())
    }

    /// Buyer pays `amount` to the order's payment address. Multiple fundings of
    /// one order accumulate. Returns the funding txid.
    pub async fn fund_order(&self, order_id: &str, amount: u64) -> Result<String, OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "fund")?;
        let state = order.state()?;
        if !matches!(state, OrderState::AwaitingPayment | OrderState::Funded | OrderState::Confirmed) {
            return Err(Self::invalid_state(&order, "fund"));
        }
        let address = order
            .payment_address
            .clone()
            .ok_or_else(|| OrderServiceError::BadRequest("order not confirmed with a payment address".to_string()))?;
        if amount == 0 {
            return Err(OrderServiceError::BadRequest("funding amount must be non-zero".to_string()));
        }

        let txid = self.wallet.send_to_address(&address, amount).await?;
        // Record directly; the wallet observation of the same txid is a no-op.
        let promoted = self.db.transaction_with(|conn| {
            OrderTransactionSql::record(conn, order_id, &txid, amount, false, None)?;
            let promoted = self.promote_on_funding(conn, order_id)?;
            Ok::<_, OrderServiceError>(promoted)
        })?;
        if let Some(state) = promoted {
            self.emit(OrderEvent::StateChanged {
                order_id: order_id.to_string(),
                state,
            });
        }

        let payload = PaymentSentPayload {
            order_id: order_id.to_string(),
            txid: txid.clone(),
            amount,
        };
        let vendor = order.vendor_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            self.prepare_order_message(conn, &vendor, order_id, MessageType::PaymentSent, payload.to_encoded_bytes())
        })?;
        self.messenger.dispatch(vendor, envelope, None).await;
        info!(target: LOG_TARGET, "Funded order {} with {} ({})", order_id, amount, txid);
        Ok(txid)
    }

    /// Once observed funding covers the order amount, an unconfirmed order becomes
    /// funded; a confirmed-pending one jumps straight to confirmed.
    fn promote_on_funding(
        &self,
        conn: &mut SqliteConnection,
        order_id: &str,
    ) -> Result<Option<OrderState>, OrderServiceError> {
        let order = self.load(conn, order_id)?;
        if order.state()? != OrderState::AwaitingPayment {
            return Ok(None);
        }
        let total = OrderTransactionSql::funding_total(conn, order_id)?;
        if total < order.payment_amount as u64 {
            return Ok(None);
        }
        let next = if order.confirmation.is_some() {
            OrderState::Confirmed
        } else {
            OrderState::Funded
        };
        OrderSql::set_state(conn, order_id, next)?;
        Ok(Some(next))
    }

    /// Vendor marks the order shipped.
    pub async fn fulfill_order(
        &self,
        order_id: &str,
        tracking_number: &str,
        shipper: &str,
        note: &str,
    ) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Vendor, "fulfill")?;
        if order.state()? != OrderState::Confirmed {
            return Err(Self::invalid_state(&order, "fulfill"));
        }
        let payload = OrderFulfillmentPayload {
            order_id: order_id.to_string(),
            tracking_number: tracking_number.to_string(),
            shipper: shipper.to_string(),
            note: note.to_string(),
        };
        let buyer = order.buyer_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_fulfillment(conn, order_id, &payload.to_encoded_bytes())?;
            OrderSql::set_state(conn, order_id, OrderState::Fulfilled)?;
            self.prepare_order_message(
                conn,
                &buyer,
                order_id,
                MessageType::OrderFulfillment,
                payload.to_encoded_bytes(),
            )
        })?;
        self.emit(OrderEvent::StateChanged {
            order_id: order_id.to_string(),
            state: OrderState::Fulfilled,
        });
        self.messenger.dispatch(buyer, envelope, None).await;
        Ok(())
    }

    /// Buyer completes the order, attaching a rating signed with the per-order
    /// rating key announced in ORDER_OPEN.
    pub async fn complete_order(&self, order_id: &str, rating: RatingInput) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "complete")?;
        if order.state()? != OrderState::Fulfilled {
            return Err(Self::invalid_state(&order, "complete"));
        }
        for score in [
            rating.overall,
            rating.quality,
            rating.customer_service,
            rating.description,
            rating.delivery_speed,
        ] {
            if !(1..=5).contains(&score) {
                return Err(OrderServiceError::BadRequest(
                    "rating scores must be between 1 and 5".to_string(),
                ));
            }
        }
        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let rating_key = self.rating_keys.derive_key(&chaincode, 0);
        let mut signed = RatingPayload {
            overall: rating.overall,
            quality: rating.quality,
            customer_service: rating.customer_service,
            description: rating.description,
            delivery_speed: rating.delivery_speed,
            review: rating.review,
            rating_key: rating_key.public.to_bytes().to_vec(),
            signature: Vec::new(),
        };
        signed.signature = rating_key.sign(&rating_signing_bytes(&signed)).to_bytes().to_vec();

        let payload = OrderCompletePayload {
            order_id: order_id.to_string(),
            ratings: vec![signed],
        };
        let vendor = order.vendor_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_completion(conn, order_id, &payload.to_encoded_bytes())?;
            OrderSql::set_state(conn, order_id, OrderState::Completed)?;
            self.prepare_order_message(conn, &vendor, order_id, MessageType::OrderComplete, payload.to_encoded_bytes())
        })?;
        self.emit(OrderEvent::StateChanged {
            order_id: order_id.to_string(),
            state: OrderState::Completed,
        });
        self.messenger.dispatch(vendor, envelope, None).await;
        Ok(())
    }

    /// Vendor refunds whatever remains of the observed funding, one tranche per
    /// funding transaction. Escrow refunds net out the release fee per tranche; a
    /// request with nothing left to pay back is an error, not a no-op.
    pub async fn refund_order(&self, order_id: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Vendor, "refund")?;
        if order.state()?.is_terminal() {
            return Err(Self::invalid_state(&order, "refund"));
        }
        let open = Self::contract_of(&order)?;
        if open.refund_address.is_empty() {
            return Err(OrderServiceError::BadRequest("order has no refund address".to_string()));
        }
        let method = order.payment_method()?;
        let fee = match method {
            PaymentMethod::Direct => 0,
            _ => self.wallet.escrow_release_fee(),
        };

        let tranches = self.db.with_connection(|conn| {
            let mut tranches = Vec::new();
            for funding in OrderTransactionSql::fundings(conn, order_id)? {
                let gross = funding.amount as u64;
                let spent = fee + RefundSql::refunded_for_funding(conn, order_id, &funding.txid)?;
                if gross > spent {
                    tranches.push((funding.txid, gross, gross - spent));
                }
            }
            Ok(tranches)
        })?;
        if tranches.is_empty() {
            return Err(OrderServiceError::NothingToRefund(order_id.to_string()));
        }

        match method {
            PaymentMethod::Direct => self.refund_direct(&order, &open, tranches).await,
            PaymentMethod::Cancelable => self.refund_cancelable(&order, &open, tranches).await,
            PaymentMethod::Moderated => self.refund_moderated(&order, &open, tranches).await,
        }
    }

    async fn refund_direct(
        &self,
        order: &OrderSql,
        open: &OrderOpenPayload,
        tranches: Vec<(String, u64, u64)>,
    ) -> Result<(), OrderServiceError> {
        let order_id = order.order_id.clone();
        let buyer = order.buyer_node_id()?;
        for (funding_txid, _gross, net) in tranches {
            let txid = self.wallet.send_to_address(&open.refund_address, net).await?;
            let payload = RefundPayload {
                order_id: order_id.clone(),
                funding_txid: funding_txid.clone(),
                refund_txid: txid.clone(),
                amount: net,
                refund_address: open.refund_address.clone(),
                vendor_signatures: Vec::new(),
            };
            let (envelope, fully) = self.db.transaction_with(|conn| {
                RefundSql::record(conn, &order_id, &funding_txid, net, &open.refund_address)?;
                let envelope =
                    self.prepare_order_message(conn, &buyer, &order_id, MessageType::Refund, payload.to_encoded_bytes())?;
                let fully = RefundSql::total_refunded(conn, &order_id)? >=
                    OrderTransactionSql::funding_total(conn, &order_id)?;
                if fully {
                    OrderSql::set_state(conn, &order_id, OrderState::Refunded)?;
                }
                Ok::<_, OrderServiceError>((envelope, fully))
            })?;
            self.emit(OrderEvent::RefundRecorded {
                order_id: order_id.clone(),
                txid,
                amount: net,
            });
            if fully {
                self.emit(OrderEvent::StateChanged {
                    order_id: order_id.clone(),
                    state: OrderState::Refunded,
                });
            }
            self.messenger.dispatch(buyer, envelope, None).await;
        }
        Ok(())
    }

    /// Cancelable escrow: the vendor alone meets the 1-of-2 threshold, so each
    /// tranche is broadcast here. Refund rows are written by the observation path
    /// on both sides, keeping the two ledgers symmetric.
    async fn refund_cancelable(
        &self,
        order: &OrderSql,
        open: &OrderOpenPayload,
        tranches: Vec<(String, u64, u64)>,
    ) -> Result<(), OrderServiceError> {
        let order_id = order.order_id.clone();
        let buyer = order.buyer_node_id()?;
        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let vendor_escrow = self.escrow_keys.derive_key(&chaincode, 0);
        let script = escrow::script_for(PaymentMethod::Cancelable, open, &vendor_escrow.public)?;
        let source = order
            .payment_address
            .clone()
            .ok_or_else(|| OrderServiceError::BadRequest("order has no payment address".to_string()))?;

        for (funding_txid, gross, net) in tranches {
            let inputs = vec![agora_key_manager::SpendInput {
                txid: funding_txid.clone(),
                index: 0,
                amount: gross,
            }];
            let outputs = vec![agora_key_manager::multisig::SpendOutput {
                address: open.refund_address.clone(),
                amount: net,
            }];
            let sigs = sign_multisig(&vendor_escrow.secret, &script, &inputs, &outputs)?;
            let package = agora_key_manager::multisig::combine_signatures(&script, inputs, outputs, vec![sigs])?;
            let txid = self.wallet.broadcast_spend(&source, &package).await?;

            let payload = RefundPayload {
                order_id: order_id.clone(),
                funding_txid,
                refund_txid: txid,
                amount: net,
                refund_address: open.refund_address.clone(),
                vendor_signatures: Vec::new(),
            };
            let envelope = self.db.transaction_with(|conn| {
                self.prepare_order_message(conn, &buyer, &order_id, MessageType::Refund, payload.to_encoded_bytes())
            })?;
            self.messenger.dispatch(buyer, envelope, None).await;
        }
        Ok(())
    }

    /// Moderated escrow: the vendor cannot meet 2-of-3 alone, so each tranche is
    /// sent as partial signatures for the buyer to co-sign and broadcast.
    async fn refund_moderated(
        &self,
        order: &OrderSql,
        open: &OrderOpenPayload,
        tranches: Vec<(String, u64, u64)>,
    ) -> Result<(), OrderServiceError> {
        let order_id = order.order_id.clone();
        let buyer = order.buyer_node_id()?;
        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let vendor_escrow = self.escrow_keys.derive_key(&chaincode, 0);
        let script = escrow::script_for(PaymentMethod::Moderated, open, &vendor_escrow.public)?;

        for (funding_txid, gross, net) in tranches {
            let inputs = vec![agora_key_manager::SpendInput {
                txid: funding_txid.clone(),
                index: 0,
                amount: gross,
            }];
            let outputs = vec![agora_key_manager::multisig::SpendOutput {
                address: open.refund_address.clone(),
                amount: net,
            }];
            let sigs = sign_multisig(&vendor_escrow.secret, &script, &inputs, &outputs)?;
            let payload = RefundPayload {
                order_id: order_id.clone(),
                funding_txid,
                refund_txid: String::new(),
                amount: net,
                refund_address: open.refund_address.clone(),
                vendor_signatures: sigs
                    .into_iter()
                    .map(|s| PartialSignature {
                        input_index: s.input_index,
                        public_key: s.public_key.to_vec(),
                        signature: s.signature.to_vec(),
                    })
                    .collect(),
            };
            let envelope = self.db.transaction_with(|conn| {
                self.prepare_order_message(conn, &buyer, &order_id, MessageType::Refund, payload.to_encoded_bytes())
            })?;
            self.messenger.dispatch(buyer, envelope, None).await;
        }
        info!(
            target: LOG_TARGET,
            "Sent refund co-sign request(s) for moderated order {}", order_id
        );
        Ok(())
    }

    /// Either party escalates a moderated order to its moderator.
    pub async fn open_dispute(&self, order_id: &str, claim: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        let role = order.role()?;
        if role == OrderRole::Moderator {
            return Err(OrderServiceError::InvalidRole {
                order_id: order_id.to_string(),
                action: "open a dispute",
            });
        }
        if order.payment_method()? != PaymentMethod::Moderated {
            return Err(OrderServiceError::BadRequest(
                "only moderated orders can be disputed".to_string(),
            ));
        }
        let state = order.state()?;
        if state.is_terminal() || state == OrderState::Disputed {
            return Err(Self::invalid_state(&order, "dispute"));
        }
        let moderator: NodeId = order
            .moderator
            .as_deref()
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| OrderServiceError::BadRequest("order has no moderator".to_string()))?;
        let counterparty = match role {
            OrderRole::Buyer => order.vendor_node_id()?,
            _ => order.buyer_node_id()?,
        };

        let payload = DisputeOpenPayload {
            order_id: order_id.to_string(),
            claim: claim.to_string(),
            contract: order.contract.clone(),
            opener_role: role as i32,
        };
        let envelopes = self.db.transaction_with(|conn| {
            CaseSql::open(conn, order_id, role, claim)?;
            self.file_case_contract(conn, order_id, role, &order.contract)?;
            OrderSql::set_state(conn, order_id, OrderState::Disputed)?;
            let to_moderator =
                self.prepare_order_message(conn, &moderator, order_id, MessageType::DisputeOpen, payload.to_encoded_bytes())?;
            let to_counterparty = self.prepare_order_message(
                conn,
                &counterparty,
                order_id,
                MessageType::DisputeOpen,
                payload.to_encoded_bytes(),
            )?;
            Ok::<_, OrderServiceError>(vec![(moderator, to_moderator), (counterparty, to_counterparty)])
        })?;
        self.emit(OrderEvent::StateChanged {
            order_id: order_id.to_string(),
            state: OrderState::Disputed,
        });
        for (to, envelope) in envelopes {
            self.messenger.dispatch(to, envelope, None).await;
        }
        info!(target: LOG_TARGET, "Opened dispute on order {}", order_id);
        Ok(())
    }

    /// A party sends their contract copy and a comment to the moderator.
    pub async fn update_dispute(&self, order_id: &str, comment: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        let role = order.role()?;
        if order.state()? != OrderState::Disputed {
            return Err(Self::invalid_state(&order, "update a dispute on"));
        }
        let moderator: NodeId = order
            .moderator
            .as_deref()
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| OrderServiceError::BadRequest("order has no moderator".to_string()))?;
        let payload = DisputeUpdatePayload {
            order_id: order_id.to_string(),
            comment: comment.to_string(),
            contract: order.contract.clone(),
            updater_role: role as i32,
        };
        let envelope = self.db.transaction_with(|conn| {
            CaseSql::open(conn, order_id, role, "")?;
            self.file_case_contract(conn, order_id, role, &order.contract)?;
            self.prepare_order_message(
                conn,
                &moderator,
                order_id,
                MessageType::DisputeUpdate,
                payload.to_encoded_bytes(),
            )
        })?;
        self.messenger.dispatch(moderator, envelope, None).await;
        Ok(())
    }

    /// Moderator records the decision and notifies every party whose node id the
    /// case has seen.
    pub async fn close_dispute(&self, order_id: &str, resolution: &str) -> Result<(), OrderServiceError> {
        let case = self
            .db
            .with_connection(|conn| CaseSql::find(conn, order_id))?
            .ok_or_else(|| OrderServiceError::CaseNotFound(order_id.to_string()))?;
        if CaseState::try_from(case.state)? != CaseState::Open {
            return Err(OrderServiceError::BadRequest(format!(
                "case {} is already closed",
                order_id
            )));
        }
        let recipients: Vec<NodeId> = [case.buyer_peer.as_deref(), case.vendor_peer.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(|p| p.parse().ok())
            .collect();
        if recipients.is_empty() {
            return Err(OrderServiceError::BadRequest(
                "no party of this case is known yet".to_string(),
            ));
        }
        let payload = DisputeClosePayload {
            order_id: order_id.to_string(),
            resolution: resolution.to_string(),
        };
        let envelopes = self.db.transaction_with(|conn| {
            CaseSql::close(conn, order_id, resolution)?;
            let mut envelopes = Vec::new();
            for to in &recipients {
                envelopes.push((
                    *to,
                    self.prepare_order_message(conn, to, order_id, MessageType::DisputeClose, payload.to_encoded_bytes())?,
                ));
            }
            Ok::<_, OrderServiceError>(envelopes)
        })?;
        for (to, envelope) in envelopes {
            self.messenger.dispatch(to, envelope, None).await;
        }
        info!(target: LOG_TARGET, "Closed dispute on order {}", order_id);
        Ok(())
    }

    /// Buyer signals that the payment is final and no longer contestable.
    pub async fn finalize_payment(&self, order_id: &str) -> Result<(), OrderServiceError> {
        let order = self.load_order(order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "finalize")?;
        if !matches!(
            order.state()?,
            OrderState::Confirmed | OrderState::Fulfilled | OrderState::Completed
        ) {
            return Err(Self::invalid_state(&order, "finalize"));
        }
        let payload = PaymentFinalizedPayload {
            order_id: order_id.to_string(),
        };
        let vendor = order.vendor_node_id()?;
        let envelope = self.db.transaction_with(|conn| {
            OrderSql::set_payment_finalized(conn, order_id)?;
            self.prepare_order_message(
                conn,
                &vendor,
                order_id,
                MessageType::PaymentFinalized,
                payload.to_encoded_bytes(),
            )
        })?;
        self.messenger.dispatch(vendor, envelope, None).await;
        Ok(())
    }

    fn prepare_order_message(
        &self,
        conn: &mut SqliteConnection,
        to: &NodeId,
        order_id: &str,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<Envelope, OrderServiceError> {
        let class = SequenceClass::Order(order_id.to_string());
        let envelope = self.messenger.prepare_sequenced(conn, to, &class, message_type, payload)?;
        self.messenger.queue(conn, to, &envelope)?;
        Ok(envelope)
    }

    fn file_case_contract(
        &self,
        conn: &mut SqliteConnection,
        order_id: &str,
        role: OrderRole,
        contract: &[u8],
    ) -> Result<(), OrderServiceError> {
        match role {
            OrderRole::Buyer => CaseSql::set_buyer_contract(conn, order_id, contract)?,
            OrderRole::Vendor => CaseSql::set_vendor_contract(conn, order_id, contract)?,
            OrderRole::Moderator => {},
        }
        Ok(())
    }

    // ---- inbound message handling -----------------------------------------

    pub(crate) fn handle_inbound(
        &self,
        conn: &mut SqliteConnection,
        store: &ContentStore,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        use MessageType::*;
        match message.message_type()? {
            OrderOpen => self.handle_order_open(conn, store, message),
            OrderReject => self.handle_order_reject(conn, message),
            OrderCancel => self.handle_order_cancel(conn, message),
            OrderConfirmation => self.handle_order_confirmation(conn, message),
            OrderFulfillment => self.handle_order_fulfillment(conn, message),
            OrderComplete => self.handle_order_complete(conn, message),
            DisputeOpen => self.handle_dispute_open(conn, message),
            DisputeUpdate => self.handle_dispute_update(conn, message),
            DisputeClose => self.handle_dispute_close(conn, message),
            Refund => self.handle_refund(conn, message),
            PaymentSent => self.handle_payment_sent(conn, message),
            PaymentFinalized => self.handle_payment_finalized(conn, message),
            other => Err(OrderServiceError::BadRequest(format!(
                "{:?} is not an order message",
                other
            ))),
        }
    }

    fn handle_order_open(
        &self,
        conn: &mut SqliteConnection,
        store: &ContentStore,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderOpenPayload>()?;
        if let Some(existing) = OrderSql::find(conn, &payload.order_id)? {
            if existing.contract == message.envelope.payload {
                return Ok(());
            }
            return Err(OrderServiceError::BadRequest(format!(
                "conflicting ORDER_OPEN for {}",
                payload.order_id
            )));
        }

        if payload.amount == 0 {
            return Err(OrderServiceError::BadRequest("order amount is zero".to_string()));
        }
        let method = PaymentMethod::try_from(payload.payment_method)?;
        ChainCode::from_bytes(&payload.chaincode)?;
        escrow::parse_key(&payload.buyer_escrow_key)?;
        if payload.rating_keys.is_empty() {
            return Err(OrderServiceError::BadRequest("order carries no rating keys".to_string()));
        }
        for key in &payload.rating_keys {
            escrow::parse_key(key)?;
        }
        let moderator: Option<NodeId> = if method == PaymentMethod::Moderated {
            escrow::parse_key(&payload.moderator_key)?;
            Some(
                payload
                    .moderator
                    .parse()
                    .map_err(|_| OrderServiceError::BadRequest("invalid moderator id".to_string()))?,
            )
        } else {
            None
        };

        let listing = store
            .listing(&payload.listing_slug)?
            .ok_or_else(|| OrderServiceError::BadRequest(format!("unknown listing '{}'", payload.listing_slug)))?;
        if listing.price != payload.amount {
            return Err(OrderServiceError::BadRequest(format!(
                "order amount {} does not match listing price {}",
                payload.amount, listing.price
            )));
        }

        OrderSql::new(
            payload.order_id.clone(),
            OrderRole::Vendor,
            method,
            &message.source_peer,
            &self.node_id(),
            moderator.as_ref(),
            payload.amount,
            payload.chaincode.clone(),
            message.envelope.payload.clone(),
        )
        .insert(conn)?;
        info!(
            target: LOG_TARGET,
            "Received order {} for '{}' from {}",
            payload.order_id,
            payload.listing_slug,
            message.source_peer.short_str()
        );
        Ok(())
    }

    fn handle_order_reject(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderRejectPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.vendor_node_id()?, message)?;
        let state = order.state()?;
        if state == OrderState::Rejected {
            return Ok(());
        }
        OrderSql::set_rejection(conn, &payload.order_id, &message.envelope.payload)?;
        if !state.is_terminal() {
            OrderSql::set_state(conn, &payload.order_id, OrderState::Rejected)?;
            self.emit(OrderEvent::StateChanged {
                order_id: payload.order_id,
                state: OrderState::Rejected,
            });
        }
        Ok(())
    }

    fn handle_order_cancel(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderCancelPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.buyer_node_id()?, message)?;
        OrderSql::set_cancellation(conn, &payload.order_id, &message.envelope.payload)?;
        match order.state()? {
            OrderState::AwaitingPayment | OrderState::Funded => {
                OrderSql::set_state(conn, &payload.order_id, OrderState::Canceled)?;
                self.emit(OrderEvent::StateChanged {
                    order_id: payload.order_id,
                    state: OrderState::Canceled,
                });
            },
            // A confirmed cancelable order is a race in flight; the observed
            // escrow spend settles it.
            OrderState::Confirmed if order.payment_method()? == PaymentMethod::Cancelable => {},
            state => {
                warn!(
                    target: LOG_TARGET,
                    "ORDER_CANCEL from {} for order {} in state {:?} has no effect",
                    message.source_peer.short_str(),
                    payload.order_id,
                    state
                );
            },
        }
        Ok(())
    }

    fn handle_order_confirmation(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderConfirmationPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.vendor_node_id()?, message)?;
        if order.confirmation.as_deref() == Some(message.envelope.payload.as_slice()) {
            return Ok(());
        }
        let method = order.payment_method()?;
        let vendor_key = escrow::parse_key(&payload.vendor_escrow_key)?;
        if method != PaymentMethod::Direct {
            // The payment address must be the escrow script both sides can derive.
            let open = Self::contract_of(&order)?;
            let expected = escrow::script_address(&escrow::script_for(method, &open, &vendor_key)?);
            if payload.payment_address != expected {
                return Err(OrderServiceError::BadRequest(
                    "confirmation payment address does not match the escrow script".to_string(),
                ));
            }
        }
        OrderSql::set_confirmation(conn, &payload.order_id, &message.envelope.payload)?;
        OrderSql::set_payment_address(conn, &payload.order_id, &payload.payment_address)?;
        if order.state()? == OrderState::Funded {
            OrderSql::set_state(conn, &payload.order_id, OrderState::Confirmed)?;
            self.emit(OrderEvent::StateChanged {
                order_id: payload.order_id,
                state: OrderState::Confirmed,
            });
        }
        Ok(())
    }

    fn handle_order_fulfillment(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderFulfillmentPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.vendor_node_id()?, message)?;
        if order.fulfillment.as_deref() == Some(message.envelope.payload.as_slice()) {
            return Ok(());
        }
        if order.state()? != OrderState::Confirmed {
            return Err(Self::invalid_state(&order, "record a fulfillment for"));
        }
        OrderSql::set_fulfillment(conn, &payload.order_id, &message.envelope.payload)?;
        OrderSql::set_state(conn, &payload.order_id, OrderState::Fulfilled)?;
        self.emit(OrderEvent::StateChanged {
            order_id: payload.order_id,
            state: OrderState::Fulfilled,
        });
        Ok(())
    }

    fn handle_order_complete(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<OrderCompletePayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.buyer_node_id()?, message)?;
        if order.completion.as_deref() == Some(message.envelope.payload.as_slice()) {
            return Ok(());
        }
        if order.state()? != OrderState::Fulfilled {
            return Err(Self::invalid_state(&order, "complete"));
        }
        let open = Self::contract_of(&order)?;
        for rating in &payload.ratings {
            Self::verify_rating(&open, rating)?;
        }
        OrderSql::set_completion(conn, &payload.order_id, &message.envelope.payload)?;
        OrderSql::set_state(conn, &payload.order_id, OrderState::Completed)?;
        self.emit(OrderEvent::StateChanged {
            order_id: payload.order_id.clone(),
            state: OrderState::Completed,
        });
        self.emit(OrderEvent::Completed {
            order_id: payload.order_id,
            ratings: payload.ratings,
        });
        Ok(())
    }

    /// A rating is acceptable only if its key was announced in ORDER_OPEN and its
    /// signature checks out, which ties it to the buyer without naming them.
    fn verify_rating(open: &OrderOpenPayload, rating: &RatingPayload) -> Result<(), OrderServiceError> {
        if !open.rating_keys.iter().any(|k| k == &rating.rating_key) {
            return Err(OrderServiceError::BadRequest(
                "rating key was not announced in the order".to_string(),
            ));
        }
        let key = escrow::parse_key(&rating.rating_key)?;
        let sig_bytes: [u8; 64] = rating
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| OrderServiceError::BadRequest("malformed rating signature".to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(&rating_signing_bytes(rating), &signature)
            .map_err(|_| OrderServiceError::BadRequest("invalid rating signature".to_string()))?;
        for score in [
            rating.overall,
            rating.quality,
            rating.customer_service,
            rating.description,
            rating.delivery_speed,
        ] {
            if !(1..=5).contains(&score) {
                return Err(OrderServiceError::BadRequest("rating score out of range".to_string()));
            }
        }
        Ok(())
    }

    fn handle_dispute_open(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<DisputeOpenPayload>()?;
        let opener_role = OrderRole::try_from(payload.opener_role)?;
        if opener_role == OrderRole::Moderator {
            return Err(OrderServiceError::BadRequest("a moderator cannot open a dispute".to_string()));
        }
        if let Some(order) = OrderSql::find(conn, &payload.order_id)? {
            // We are the counterparty; the moderator holds no order record.
            let expected = match opener_role {
                OrderRole::Buyer => order.buyer_node_id()?,
                _ => order.vendor_node_id()?,
            };
            if expected != message.source_peer {
                return Err(OrderServiceError::BadRequest(
                    "dispute opener does not match the order".to_string(),
                ));
            }
            let state = order.state()?;
            if !state.is_terminal() && state != OrderState::Disputed {
                OrderSql::set_state(conn, &payload.order_id, OrderState::Disputed)?;
                self.emit(OrderEvent::StateChanged {
                    order_id: payload.order_id.clone(),
                    state: OrderState::Disputed,
                });
            }
        }
        CaseSql::open(conn, &payload.order_id, opener_role, &payload.claim)?;
        CaseSql::set_party(conn, &payload.order_id, opener_role, &message.source_peer)?;
        self.file_case_contract(conn, &payload.order_id, opener_role, &payload.contract)?;
        info!(
            target: LOG_TARGET,
            "Dispute opened on order {} by {}",
            payload.order_id,
            message.source_peer.short_str()
        );
        Ok(())
    }

    fn handle_dispute_update(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<DisputeUpdatePayload>()?;
        let updater_role = OrderRole::try_from(payload.updater_role)?;
        if updater_role == OrderRole::Moderator {
            return Err(OrderServiceError::BadRequest("a moderator cannot update a dispute".to_string()));
        }
        // The parties' messages are ordered per sender, not across senders: an
        // update may land before the opener's DISPUTE_OPEN does.
        CaseSql::open(conn, &payload.order_id, updater_role, "")?;
        CaseSql::set_party(conn, &payload.order_id, updater_role, &message.source_peer)?;
        self.file_case_contract(conn, &payload.order_id, updater_role, &payload.contract)?;
        Ok(())
    }

    fn handle_dispute_close(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<DisputeClosePayload>()?;
        if let Some(order) = OrderSql::find(conn, &payload.order_id)? {
            let moderator: Option<NodeId> = order.moderator.as_deref().and_then(|m| m.parse().ok());
            if moderator != Some(message.source_peer) {
                return Err(OrderServiceError::BadRequest(
                    "dispute close did not come from the order's moderator".to_string(),
                ));
            }
            if order.state()? == OrderState::Disputed {
                OrderSql::set_state(conn, &payload.order_id, OrderState::Resolved)?;
                self.emit(OrderEvent::StateChanged {
                    order_id: payload.order_id.clone(),
                    state: OrderState::Resolved,
                });
            }
        }
        if CaseSql::find(conn, &payload.order_id)?.is_some() {
            CaseSql::close(conn, &payload.order_id, &payload.resolution)?;
        }
        Ok(())
    }

    fn handle_refund(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<RefundPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "receive a refund for")?;
        Self::require_from(&order, order.vendor_node_id()?, message)?;
        match order.payment_method()? {
            PaymentMethod::Direct => {
                if payload.refund_txid.is_empty() {
                    return Err(OrderServiceError::BadRequest("direct refund without a txid".to_string()));
                }
                RefundSql::record(conn, &payload.order_id, &payload.funding_txid, payload.amount, &payload.refund_address)?;
                self.emit(OrderEvent::RefundRecorded {
                    order_id: payload.order_id.clone(),
                    txid: payload.refund_txid,
                    amount: payload.amount,
                });
                let fully = RefundSql::total_refunded(conn, &payload.order_id)? >=
                    OrderTransactionSql::funding_total(conn, &payload.order_id)?;
                if fully && !order.state()?.is_terminal() {
                    OrderSql::set_state(conn, &payload.order_id, OrderState::Refunded)?;
                    self.emit(OrderEvent::StateChanged {
                        order_id: payload.order_id,
                        state: OrderState::Refunded,
                    });
                }
            },
            // The vendor broadcast this one; the observation path records it.
            PaymentMethod::Cancelable => {
                debug!(
                    target: LOG_TARGET,
                    "Vendor announced escrow refund {} for order {}", payload.refund_txid, payload.order_id
                );
            },
            PaymentMethod::Moderated => {
                if payload.vendor_signatures.is_empty() {
                    return Err(OrderServiceError::BadRequest(
                        "moderated refund carries no vendor signatures".to_string(),
                    ));
                }
                // Co-signing and broadcasting happen outside this transaction.
                if self.cosign_tx.send(payload).is_err() {
                    warn!(target: LOG_TARGET, "Refund co-sign worker is gone, dropping request");
                }
            },
        }
        Ok(())
    }

    fn handle_payment_sent(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<PaymentSentPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.buyer_node_id()?, message)?;
        // Informational only. Funding is recognized when the wallet observes it,
        // never on the counterparty's say-so.
        info!(
            target: LOG_TARGET,
            "Buyer announced payment {} of {} for order {}", payload.txid, payload.amount, payload.order_id
        );
        Ok(())
    }

    fn handle_payment_finalized(
        &self,
        conn: &mut SqliteConnection,
        message: &InboundMessage,
    ) -> Result<(), OrderServiceError> {
        let payload = message.decode_payload::<PaymentFinalizedPayload>()?;
        let order = self.load(conn, &payload.order_id)?;
        Self::require_from(&order, order.buyer_node_id()?, message)?;
        OrderSql::set_payment_finalized(conn, &payload.order_id)?;
        Ok(())
    }

    // ---- wallet observation handling (driven by the worker) ---------------

    /// Applies an observed funding transaction to whichever order watches the
    /// address. Unknown addresses are ignored.
    pub(crate) async fn apply_funding(&self, address: &str, txid: &str, amount: u64) -> Result<(), OrderServiceError> {
        let applied = self.db.transaction_with(|conn| {
            let Some(order) = OrderSql::find_by_payment_address(conn, address)? else {
                return Ok::<_, OrderServiceError>(None);
            };
            OrderTransactionSql::record(conn, &order.order_id, txid, amount, false, None)?;
            let promoted = self.promote_on_funding(conn, &order.order_id)?;
            Ok(Some((order.order_id, promoted)))
        })?;
        if let Some((order_id, promoted)) = applied {
            self.emit(OrderEvent::PaymentReceived {
                order_id: order_id.clone(),
                txid: txid.to_string(),
                amount,
            });
            if let Some(state) = promoted {
                self.emit(OrderEvent::StateChanged { order_id, state });
            }
        }
        Ok(())
    }

    /// Applies an observed spend of an order's escrow. A spend towards the refund
    /// address is allocated against the fundings; anything else is the vendor
    /// claiming, which settles the cancelable race in the vendor's favor.
    pub(crate) async fn apply_spend(
        &self,
        address: &str,
        txid: &str,
        destination: &str,
        amount: u64,
    ) -> Result<(), OrderServiceError> {
        let events = self.db.transaction_with(|conn| {
            let Some(order) = OrderSql::find_by_payment_address(conn, address)? else {
                return Ok::<_, OrderServiceError>(Vec::new());
            };
            let order_id = order.order_id.clone();
            OrderTransactionSql::record(conn, &order_id, txid, amount, true, Some(destination))?;

            let open = Self::contract_of(&order)?;
            let method = order.payment_method()?;
            let state = order.state()?;
            let mut events = Vec::new();

            let cancel_in_flight =
                method == PaymentMethod::Cancelable && (state == OrderState::Canceled || order.cancellation.is_some());
            if destination == open.refund_address && !cancel_in_flight {
                events.extend(self.allocate_refund(conn, &order, &open, txid, amount)?);
            } else if destination == open.refund_address {
                // The buyer's cancel spend confirmed; the vendor side may have
                // optimistically moved to Confirmed.
                if state != OrderState::Canceled {
                    OrderSql::set_state(conn, &order_id, OrderState::Canceled)?;
                    events.push(OrderEvent::StateChanged {
                        order_id: order_id.clone(),
                        state: OrderState::Canceled,
                    });
                }
            } else if method == PaymentMethod::Cancelable &&
                matches!(
                    state,
                    OrderState::AwaitingPayment | OrderState::Funded | OrderState::Canceled
                )
            {
                // The vendor's claim confirmed; a locally-canceled buyer side is
                // overruled by the chain.
                OrderSql::set_state(conn, &order_id, OrderState::Confirmed)?;
                events.push(OrderEvent::StateChanged {
                    order_id,
                    state: OrderState::Confirmed,
                });
            }
            Ok(events)
        })?;
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    /// Allocates an observed refund payment across the order's fundings, oldest
    /// first, netting the release fee out of each funding's refundable value.
    fn allocate_refund(
        &self,
        conn: &mut SqliteConnection,
        order: &OrderSql,
        open: &OrderOpenPayload,
        txid: &str,
        amount: u64,
    ) -> Result<Vec<OrderEvent>, OrderServiceError> {
        let order_id = order.order_id.clone();
        let fee = match order.payment_method()? {
            PaymentMethod::Direct => 0,
            _ => self.wallet.escrow_release_fee(),
        };
        let mut left = amount;
        let mut events = Vec::new();
        for funding in OrderTransactionSql::fundings(conn, &order_id)? {
            if left == 0 {
                break;
            }
            let gross = funding.amount as u64;
            let spent = fee + RefundSql::refunded_for_funding(conn, &order_id, &funding.txid)?;
            if gross <= spent {
                continue;
            }
            let portion = left.min(gross - spent);
            RefundSql::record(conn, &order_id, &funding.txid, portion, &open.refund_address)?;
            left -= portion;
        }
        if left > 0 {
            warn!(
                target: LOG_TARGET,
                "Observed refund {} exceeds the refundable value of order {} by {}", txid, order_id, left
            );
        }
        events.push(OrderEvent::RefundRecorded {
            order_id: order_id.clone(),
            txid: txid.to_string(),
            amount: amount - left,
        });

        let fully = OrderTransactionSql::fundings(conn, &order_id)?.iter().all(|funding| {
            let gross = funding.amount as u64;
            RefundSql::refunded_for_funding(conn, &order_id, &funding.txid)
                .map(|refunded| gross <= fee + refunded)
                .unwrap_or(false)
        });
        if fully && !order.state()?.is_terminal() {
            OrderSql::set_state(conn, &order_id, OrderState::Refunded)?;
            events.push(OrderEvent::StateChanged {
                order_id,
                state: OrderState::Refunded,
            });
        }
        Ok(events)
    }

    /// Buyer side of a moderated refund: co-sign the vendor's partial signatures
    /// and broadcast. Recording happens when the spend is observed.
    pub(crate) async fn cosign_refund(&self, payload: RefundPayload) -> Result<(), OrderServiceError> {
        let order = self.load_order(&payload.order_id)?;
        Self::require_role(&order, OrderRole::Buyer, "co-sign a refund for")?;
        if order.payment_method()? != PaymentMethod::Moderated {
            return Err(OrderServiceError::BadRequest(
                "co-signing only applies to moderated orders".to_string(),
            ));
        }
        let open = Self::contract_of(&order)?;
        let confirmation = Self::confirmation_of(&order)?
            .ok_or_else(|| OrderServiceError::BadRequest("order not confirmed".to_string()))?;
        let vendor_key = escrow::parse_key(&confirmation.vendor_escrow_key)?;
        let source = order
            .payment_address
            .clone()
            .ok_or_else(|| OrderServiceError::BadRequest("order has no payment address".to_string()))?;

        let funding = self
            .db
            .with_connection(|conn| OrderTransactionSql::fundings(conn, &payload.order_id))?
            .into_iter()
            .find(|f| f.txid == payload.funding_txid)
            .ok_or_else(|| OrderServiceError::BadRequest("refund names an unknown funding tx".to_string()))?;
        let gross = funding.amount as u64;
        let refunded = self
            .db
            .with_connection(|conn| RefundSql::refunded_for_funding(conn, &payload.order_id, &payload.funding_txid))?;
        let fee = self.wallet.escrow_release_fee();
        if gross <= fee + refunded || payload.amount > gross - fee - refunded {
            return Err(OrderServiceError::BadRequest(
                "refund exceeds the funding's remaining value".to_string(),
            ));
        }

        let chaincode = ChainCode::from_bytes(&order.chaincode)?;
        let buyer_escrow = self.escrow_keys.derive_key(&chaincode, 0);
        let script = escrow::script_for(PaymentMethod::Moderated, &open, &vendor_key)?;
        let inputs = vec![agora_key_manager::SpendInput {
            txid: payload.funding_txid.clone(),
            index: 0,
            amount: gross,
        }];
        let outputs = vec![agora_key_manager::multisig::SpendOutput {
            address: payload.refund_address.clone(),
            amount: payload.amount,
        }];
        let buyer_sigs = sign_multisig(&buyer_escrow.secret, &script, &inputs, &outputs)?;
        let vendor_sigs = payload
            .vendor_signatures
            .iter()
            .map(|s| {
                Ok(agora_key_manager::InputSignature {
                    input_index: s.input_index,
                    public_key: s
                        .public_key
                        .as_slice()
                        .try_into()
                        .map_err(|_| OrderServiceError::BadRequest("malformed vendor signature key".to_string()))?,
                    signature: s
                        .signature
                        .as_slice()
                        .try_into()
                        .map_err(|_| OrderServiceError::BadRequest("malformed vendor signature".to_string()))?,
                })
            })
            .collect::<Result<Vec<_>, OrderServiceError>>()?;
        let package =
            agora_key_manager::multisig::combine_signatures(&script, inputs, outputs, vec![vendor_sigs, buyer_sigs])?;
        let txid = self.wallet.broadcast_spend(&source, &package).await?;
        info!(
            target: LOG_TARGET,
            "Co-signed and broadcast refund {} for order {}", txid, payload.order_id
        );
        Ok(())
    }
}

/// Adapter registering the order service with the inbound router.
pub struct OrderMessageHandler<T: PeerTransport> {
    service: OrderService<T>,
    store: ContentStore,
}

impl<T: PeerTransport> OrderMessageHandler<T> {
    pub fn new(service: OrderService<T>, store: ContentStore) -> Self {
        Self { service, store }
    }
}

impl<T: PeerTransport> MessageHandler for OrderMessageHandler<T> {
    fn handle(&self, conn: &mut SqliteConnection, message: &InboundMessage) -> Result<(), MessagingError> {
        self.service.handle_inbound(conn, &self.store, message).map_err(|err| match err {
            OrderServiceError::MessagingError(inner) => inner,
            other => MessagingError::HandlerError(other.to_string()),
        })
    }
}

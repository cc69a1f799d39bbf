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

//! Envelope payload types for every application message. Field numbers are part
//! of the wire contract and must never be reassigned.

/// `MessageType::Chat`. `subject` is an order id for order-scoped chat, empty for
/// general conversation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChatPayload {
    #[prost(string, tag = "1")]
    pub subject: String,
    #[prost(string, tag = "2")]
    pub body: String,
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
}

/// `MessageType::Follow` and `MessageType::Unfollow` carry no data beyond the
/// envelope itself.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FollowPayload {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderOpenPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub listing_slug: String,
    #[prost(int32, tag = "3")]
    pub payment_method: i32,
    #[prost(uint64, tag = "4")]
    pub amount: u64,
    /// Per-order chaincode for deterministic escrow and rating subkeys.
    #[prost(bytes = "vec", tag = "5")]
    pub chaincode: Vec<u8>,
    /// The buyer's derived escrow public key for this order.
    #[prost(bytes = "vec", tag = "6")]
    pub buyer_escrow_key: Vec<u8>,
    /// Moderator node id (hex), empty for unmoderated orders.
    #[prost(string, tag = "7")]
    pub moderator: String,
    /// The moderator's published escrow public key, empty for unmoderated orders.
    #[prost(bytes = "vec", tag = "8")]
    pub moderator_key: Vec<u8>,
    /// Per-item rating public keys derived from the buyer's rating master key.
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub rating_keys: Vec<Vec<u8>>,
    #[prost(string, tag = "10")]
    pub refund_address: String,
    #[prost(uint64, tag = "11")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderRejectPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderCancelPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderConfirmationPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    /// The vendor's derived escrow public key for this order.
    #[prost(bytes = "vec", tag = "2")]
    pub vendor_escrow_key: Vec<u8>,
    /// Where the buyer should send payment: the vendor address (direct) or the
    /// escrow script address.
    #[prost(string, tag = "3")]
    pub payment_address: String,
    #[prost(string, tag = "4")]
    pub comment: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderFulfillmentPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub tracking_number: String,
    #[prost(string, tag = "3")]
    pub shipper: String,
    #[prost(string, tag = "4")]
    pub note: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RatingPayload {
    #[prost(uint32, tag = "1")]
    pub overall: u32,
    #[prost(uint32, tag = "2")]
    pub quality: u32,
    #[prost(uint32, tag = "3")]
    pub customer_service: u32,
    #[prost(uint32, tag = "4")]
    pub description: u32,
    #[prost(uint32, tag = "5")]
    pub delivery_speed: u32,
    #[prost(string, tag = "6")]
    pub review: String,
    /// The per-item rating public key announced in ORDER_OPEN.
    #[prost(bytes = "vec", tag = "7")]
    pub rating_key: Vec<u8>,
    /// Signature by the rating key over the canonical encoding of the fields above.
    #[prost(bytes = "vec", tag = "8")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderCompletePayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(message, repeated, tag = "2")]
    pub ratings: Vec<RatingPayload>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisputeOpenPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub claim: String,
    /// The opener's copy of the order contract, for the moderator to compare.
    #[prost(bytes = "vec", tag = "3")]
    pub contract: Vec<u8>,
    /// The opener's role on the order (buyer or vendor), so a moderator who holds
    /// no order record can file the contract on the right side of the case.
    #[prost(int32, tag = "4")]
    pub opener_role: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisputeUpdatePayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub comment: String,
    #[prost(bytes = "vec", tag = "3")]
    pub contract: Vec<u8>,
    #[prost(int32, tag = "4")]
    pub updater_role: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DisputeClosePayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub resolution: String,
}

/// One party's signature over one input of an escrow spend, carried in settlement
/// messages so the counterparty can co-sign and broadcast.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PartialSignature {
    #[prost(uint32, tag = "1")]
    pub input_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RefundPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    /// The funding transaction this refund is issued against.
    #[prost(string, tag = "2")]
    pub funding_txid: String,
    /// The refund transaction broadcast by the vendor. Empty on moderated orders,
    /// where the vendor cannot meet the 2-of-3 threshold alone; the buyer co-signs
    /// with `vendor_signatures` and broadcasts.
    #[prost(string, tag = "3")]
    pub refund_txid: String,
    #[prost(uint64, tag = "4")]
    pub amount: u64,
    #[prost(string, tag = "5")]
    pub refund_address: String,
    #[prost(message, repeated, tag = "6")]
    pub vendor_signatures: Vec<PartialSignature>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PaymentSentPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub txid: String,
    #[prost(uint64, tag = "3")]
    pub amount: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PaymentFinalizedPayload {
    #[prost(string, tag = "1")]
    pub order_id: String,
}

use agora_comms::message::{InboundMessage, MessageError, MessageType};
use prost::Message;

/// Extracts the order id from an order-message payload without fully interpreting
/// it, for sequencing by `(sender, order)` class.
pub fn order_id_of(message: &InboundMessage) -> Result<Option<String>, MessageError> {
    use MessageType::*;
    let id = match message.message_type()? {
        OrderOpen => message.decode_payload::<OrderOpenPayload>()?.order_id,
        OrderReject => message.decode_payload::<OrderRejectPayload>()?.order_id,
        OrderCancel => message.decode_payload::<OrderCancelPayload>()?.order_id,
        OrderConfirmation => message.decode_payload::<OrderConfirmationPayload>()?.order_id,
        OrderFulfillment => message.decode_payload::<OrderFulfillmentPayload>()?.order_id,
        OrderComplete => message.decode_payload::<OrderCompletePayload>()?.order_id,
        DisputeOpen => message.decode_payload::<DisputeOpenPayload>()?.order_id,
        DisputeUpdate => message.decode_payload::<DisputeUpdatePayload>()?.order_id,
        DisputeClose => message.decode_payload::<DisputeClosePayload>()?.order_id,
        Refund => message.decode_payload::<RefundPayload>()?.order_id,
        PaymentSent => message.decode_payload::<PaymentSentPayload>()?.order_id,
        PaymentFinalized => message.decode_payload::<PaymentFinalizedPayload>()?.order_id,
        _ => return Ok(None),
    };
    if id.is_empty() {
        return Err(MessageError::MalformedPayload("empty order id".to_string()));
    }
    Ok(Some(id))
}

/// The canonical bytes a rating signature commits to.
pub fn rating_signing_bytes(rating: &RatingPayload) -> Vec<u8> {
    let mut unsigned = rating.clone();
    unsigned.signature = Vec::new();
    unsigned.encode_to_vec()
}

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

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use prost::Message;
use rand::{rngs::OsRng, RngCore};

use super::error::MessageError;
use crate::{node_id::NodeId, node_identity::NodeIdentity};

/// The number of bytes in a message id.
pub const MESSAGE_ID_LEN: usize = 20;

/// The closed set of application message types. The wire value of each variant is
/// frozen; new types may only be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    Ack = 1,
    Chat = 2,
    Follow = 3,
    Unfollow = 4,
    OrderOpen = 5,
    OrderReject = 6,
    OrderCancel = 7,
    OrderConfirmation = 8,
    OrderFulfillment = 9,
    OrderComplete = 10,
    DisputeOpen = 11,
    DisputeUpdate = 12,
    DisputeClose = 13,
    Refund = 14,
    PaymentSent = 15,
    PaymentFinalized = 16,
}

impl MessageType {
    pub fn is_order_message(self) -> bool {
        use MessageType::*;
        matches!(
            self,
            OrderOpen |
                OrderReject |
                OrderCancel |
                OrderConfirmation |
                OrderFulfillment |
                OrderComplete |
                DisputeOpen |
                DisputeUpdate |
                DisputeClose |
                Refund |
                PaymentSent |
                PaymentFinalized
        )
    }

    /// Message types that must be delivered to their handler in sender order.
    /// Follow and unfollow share one sequence class; all order messages for a
    /// given order share another.
    pub fn is_sequenced(self) -> bool {
        use MessageType::*;
        matches!(self, Chat | Follow | Unfollow) || self.is_order_message()
    }
}

/// The signed wire envelope every message travels in.
///
/// The signature covers the canonical encoding of all other fields, so any
/// mutation in transit invalidates it. `sequence == 0` means the message is
/// unsequenced and bypasses the parking buffer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    // Kept as a raw i32 so unknown wire values survive until [`message_type`]
    // maps them to a typed error.
    #[prost(int32, tag = "2")]
    pub message_type: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub sequence: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub sender_public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Builds an unsigned envelope with a fresh random message id.
    pub fn wrap(message_type: MessageType, payload: Vec<u8>) -> Self {
        let mut id = vec![0u8; MESSAGE_ID_LEN];
        OsRng.fill_bytes(&mut id);
        Self {
            id,
            message_type: message_type as i32,
            payload,
            sequence: 0,
            sender_public_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    pub fn message_type(&self) -> Result<MessageType, MessageError> {
        MessageType::from_i32(self.message_type).ok_or(MessageError::UnknownType(self.message_type))
    }

    /// The canonical bytes the signature commits to: the envelope with the
    /// signature field cleared, deterministically encoded.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        unsigned.encode_to_vec()
    }

    /// Fills in the sender key and signature. Must be called after the sequence
    /// number has been assigned, since the signature covers it.
    pub fn sign(&mut self, identity: &NodeIdentity) {
        self.sender_public_key = identity.public_key().as_bytes().to_vec();
        self.signature = identity.sign(&self.signing_bytes()).to_bytes().to_vec();
    }

    /// Verifies the signature and checks that the embedded sender key hashes to
    /// `claimed_sender`, the peer id observed at the transport layer.
    pub fn verify(&self, claimed_sender: &NodeId) -> Result<(), MessageError> {
        self.message_type()?;
        let key_bytes: [u8; 32] = self
            .sender_public_key
            .as_slice()
            .try_into()
            .map_err(|_| MessageError::BadSignature)?;
        let public_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| MessageError::BadSignature)?;
        if NodeId::from_public_key(&public_key) != *claimed_sender {
            return Err(MessageError::SenderMismatch);
        }
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| MessageError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        public_key
            .verify(&self.signing_bytes(), &signature)
            .map_err(|_| MessageError::BadSignature)
    }

    pub fn sender_node_id(&self) -> Result<NodeId, MessageError> {
        let key_bytes: [u8; 32] = self
            .sender_public_key
            .as_slice()
            .try_into()
            .map_err(|_| MessageError::BadSignature)?;
        let public_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| MessageError::BadSignature)?;
        Ok(NodeId::from_public_key(&public_key))
    }
}

/// Payload of [`MessageType::Ack`]: the id of the message being acknowledged.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AckPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub acked_id: Vec<u8>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wrap_assigns_unique_ids() {
        let a = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        let b = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        assert_eq!(a.id.len(), MESSAGE_ID_LEN);
        assert_ne!(a.id, b.id);
        assert_eq!(a.sequence, 0);
        assert_eq!(a.message_type().unwrap(), MessageType::Chat);
    }

    #[test]
    fn sign_and_verify() {
        let identity = NodeIdentity::random();
        let mut env = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        env.sequence = 3;
        env.sign(&identity);
        env.verify(&identity.node_id()).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let identity = NodeIdentity::random();
        let mut env = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        env.sign(&identity);
        env.payload = b"tampered".to_vec();
        let err = env.verify(&identity.node_id()).unwrap_err();
        assert!(matches!(err, MessageError::BadSignature));
    }

    #[test]
    fn verify_rejects_tampered_sequence() {
        let identity = NodeIdentity::random();
        let mut env = Envelope::wrap(MessageType::OrderOpen, b"order".to_vec());
        env.sequence = 1;
        env.sign(&identity);
        env.sequence = 2;
        assert!(matches!(
            env.verify(&identity.node_id()).unwrap_err(),
            MessageError::BadSignature
        ));
    }

    #[test]
    fn verify_rejects_sender_mismatch() {
        let identity = NodeIdentity::random();
        let other = NodeIdentity::random();
        let mut env = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        env.sign(&identity);
        assert!(matches!(
            env.verify(&other.node_id()).unwrap_err(),
            MessageError::SenderMismatch
        ));
    }

    #[test]
    fn verify_rejects_unknown_type() {
        let identity = NodeIdentity::random();
        let mut env = Envelope::wrap(MessageType::Chat, b"hello".to_vec());
        env.message_type = 999;
        env.sign(&identity);
        assert!(matches!(
            env.verify(&identity.node_id()).unwrap_err(),
            MessageError::UnknownType(999)
        ));
    }

    #[test]
    fn sequenced_classes() {
        assert!(MessageType::Chat.is_sequenced());
        assert!(MessageType::Follow.is_sequenced());
        assert!(MessageType::OrderFulfillment.is_sequenced());
        assert!(!MessageType::Ack.is_sequenced());
        assert!(MessageType::Refund.is_order_message());
        assert!(!MessageType::Chat.is_order_message());
    }
}

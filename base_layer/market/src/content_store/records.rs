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

//! The JSON record types of the public snapshot. Field order in these structs is
//! the canonical serialization order; signatures commit to it.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::ContentStoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    /// Where direct-payment buyers send funds.
    #[serde(default)]
    pub payment_address: String,
    /// The party's published escrow public key (hex), used by counterparties when
    /// building moderated escrows.
    #[serde(default)]
    pub escrow_key: String,
    #[serde(default)]
    pub moderator: bool,
    #[serde(default)]
    pub follower_count: u64,
    #[serde(default)]
    pub following_count: u64,
}

/// A coupon as published: the code is replaced by its SHA-256 hash so only
/// holders of the code can redeem it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub title: String,
    pub discount: String,
    pub hash: String,
}

/// Vendor-side input for a coupon; the store hashes the code before publication.
#[derive(Debug, Clone, PartialEq)]
pub struct CouponInput {
    pub title: String,
    pub discount: String,
    pub code: String,
}

impl CouponInput {
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.code.as_bytes()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: u64,
    pub currency: String,
    /// Hex node id of the vendor; filled in by the store.
    #[serde(default)]
    pub vendor_id: String,
    #[serde(default)]
    pub coupons: Vec<Coupon>,
    /// Hex ed25519 signature by the vendor identity over the canonical encoding
    /// with this field empty; filled in by the store.
    #[serde(default)]
    pub signature: String,
}

impl Listing {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ContentStoreError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn verify(&self, vendor_key: &VerifyingKey) -> Result<(), ContentStoreError> {
        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ContentStoreError::BadListingSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        vendor_key
            .verify(&self.signing_bytes()?, &signature)
            .map_err(|_| ContentStoreError::BadListingSignature)
    }

    /// Content hash of the published listing bytes, as carried in the index.
    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingIndexEntry {
    pub slug: String,
    pub title: String,
    pub price: u64,
    pub currency: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub order_id: String,
    pub overall: u32,
    pub quality: u32,
    pub customer_service: u32,
    pub description: u32,
    pub delivery_speed: u32,
    #[serde(default)]
    pub review: String,
    /// Hex per-item rating public key from the order's ORDER_OPEN.
    pub rating_key: String,
    /// Hex signature by the rating key.
    pub signature: String,
}

impl Rating {
    /// The id prefix under which the rating is filed (`ratings/<prefix>.json`).
    pub fn id_prefix(&self) -> String {
        let digest = Sha256::new()
            .chain_update(self.order_id.as_bytes())
            .chain_update(self.rating_key.as_bytes())
            .finalize();
        hex::encode(&digest[..8])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingIndexEntry {
    pub id: String,
    pub overall: u32,
}

#[cfg(test)]
mod test {
    use agora_comms::node_identity::NodeIdentity;

    use super::*;

    #[test]
    fn listing_sign_verify_round_trip() {
        let identity = NodeIdentity::random();
        let mut listing = Listing {
            slug: "red-hat".to_string(),
            title: "Red hat".to_string(),
            description: "A hat, red".to_string(),
            price: 1000,
            currency: "BTC".to_string(),
            vendor_id: identity.node_id().to_string(),
            coupons: vec![],
            signature: String::new(),
        };
        let sig = identity.sign(&listing.signing_bytes().unwrap());
        listing.signature = hex::encode(sig.to_bytes());
        listing.verify(identity.public_key()).unwrap();

        listing.price = 1;
        assert!(listing.verify(identity.public_key()).is_err());
    }

    #[test]
    fn coupon_code_is_hashed() {
        let input = CouponInput {
            title: "summer".to_string(),
            discount: "10%".to_string(),
            code: "SUNSHINE".to_string(),
        };
        assert_eq!(input.hash(), hex::encode(Sha256::digest(b"SUNSHINE")));
    }

    #[test]
    fn rating_prefix_is_stable() {
        let rating = Rating {
            order_id: "o-1".to_string(),
            rating_key: "aa".to_string(),
            ..Default::default()
        };
        assert_eq!(rating.id_prefix(), rating.id_prefix());
        assert_eq!(rating.id_prefix().len(), 16);
    }
}

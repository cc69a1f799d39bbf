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

//! Escrow script construction shared by both sides of an order. The buyer builds
//! the same script from ORDER_OPEN plus the vendor key in ORDER_CONFIRMATION that
//! the vendor built when confirming, so the payment address is verifiable rather
//! than trusted.

use agora_key_manager::RedeemScript;
use ed25519_dalek::VerifyingKey;

use super::error::OrderServiceError;
use crate::{proto::OrderOpenPayload, storage::orders::PaymentMethod};

pub fn parse_key(bytes: &[u8]) -> Result<VerifyingKey, OrderServiceError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OrderServiceError::BadRequest("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&raw).map_err(|_| OrderServiceError::BadRequest("invalid public key".to_string()))
}

/// The redeem script for an escrowed order: 1-of-2 buyer/vendor for cancelable
/// payments, 2-of-3 with the moderator for moderated ones.
pub fn script_for(
    method: PaymentMethod,
    open: &OrderOpenPayload,
    vendor_key: &VerifyingKey,
) -> Result<RedeemScript, OrderServiceError> {
    let buyer_key = parse_key(&open.buyer_escrow_key)?;
    let script = match method {
        PaymentMethod::Direct => {
            return Err(OrderServiceError::BadRequest(
                "direct payments have no escrow script".to_string(),
            ))
        },
        PaymentMethod::Cancelable => RedeemScript::multisig(1, &[buyer_key, *vendor_key])?,
        PaymentMethod::Moderated => {
            let moderator_key = parse_key(&open.moderator_key)?;
            RedeemScript::multisig(2, &[buyer_key, *vendor_key, moderator_key])?
        },
    };
    Ok(script)
}

/// Escrow addresses are the hex script hash.
pub fn script_address(script: &RedeemScript) -> String {
    hex::encode(script.script_hash())
}

#[cfg(test)]
mod test {
    use agora_key_manager::{ChainCode, KeyBranch, KeyManager};

    use super::*;

    #[test]
    fn both_sides_derive_the_same_address() {
        let chaincode = ChainCode::random();
        let buyer = KeyManager::random(KeyBranch::Escrow).derive_key(&chaincode, 0);
        let vendor = KeyManager::random(KeyBranch::Escrow).derive_key(&chaincode, 0);
        let moderator = KeyManager::random(KeyBranch::Escrow).derive_key(&chaincode, 0);

        let open = OrderOpenPayload {
            buyer_escrow_key: buyer.public.to_bytes().to_vec(),
            moderator_key: moderator.public.to_bytes().to_vec(),
            ..Default::default()
        };
        let vendor_side = script_for(PaymentMethod::Moderated, &open, &vendor.public).unwrap();
        let buyer_side = script_for(PaymentMethod::Moderated, &open, &vendor.public).unwrap();
        assert_eq!(script_address(&vendor_side), script_address(&buyer_side));
        assert_eq!(vendor_side.threshold(), 2);

        let cancelable = script_for(PaymentMethod::Cancelable, &open, &vendor.public).unwrap();
        assert_eq!(cancelable.threshold(), 1);
        assert_ne!(script_address(&cancelable), script_address(&vendor_side));

        assert!(script_for(PaymentMethod::Direct, &open, &vendor.public).is_err());
    }
}

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

//! Canonical k-of-n escrow scripts and detached partial signatures. The script bytes
//! are chain-agnostic; the wallet backend maps them onto whatever the target chain
//! natively supports and broadcasts the combined spend.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{domain_hasher, KeyManagerError};

const LABEL_SCRIPT: &[u8] = b"redeem_script";
const LABEL_SPEND: &[u8] = b"spend_input";

const SCRIPT_VERSION: u8 = 1;

/// Single-signer fallback that becomes spendable after a delay, used on moderated
/// orders so a vendor is not held hostage by an unresponsive buyer and moderator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLock {
    pub delay_secs: u64,
    #[serde(with = "hex::serde")]
    pub fallback_key: [u8; 32],
}

/// A k-of-n multisig redeem script over the derived escrow public keys, held in
/// canonical (sorted) order so that every party constructs identical script bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemScript {
    threshold: usize,
    keys: Vec<[u8; 32]>,
    timelock: Option<TimeLock>,
}

impl RedeemScript {
    /// Build a k-of-n script. Key order does not matter; the canonical form sorts them.
    pub fn multisig(threshold: usize, keys: &[VerifyingKey]) -> Result<Self, KeyManagerError> {
        if threshold == 0 || threshold > keys.len() {
            return Err(KeyManagerError::InvalidThreshold {
                threshold,
                keys: keys.len(),
            });
        }
        let mut key_bytes: Vec<[u8; 32]> = keys.iter().map(|k| k.to_bytes()).collect();
        key_bytes.sort_unstable();
        if key_bytes.windows(2).any(|w| w[0] == w[1]) {
            return Err(KeyManagerError::DuplicateKey);
        }
        Ok(Self {
            threshold,
            keys: key_bytes,
            timelock: None,
        })
    }

    /// Add a time-locked single-signer fallback to the script.
    pub fn with_timelock(mut self, delay_secs: u64, fallback: &VerifyingKey) -> Self {
        self.timelock = Some(TimeLock {
            delay_secs,
            fallback_key: fallback.to_bytes(),
        });
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn timelock(&self) -> Option<&TimeLock> {
        self.timelock.as_ref()
    }

    pub fn contains(&self, key: &VerifyingKey) -> bool {
        self.keys.binary_search(&key.to_bytes()).is_ok()
    }

    /// The deterministic script encoding. Equal scripts produce equal bytes on every
    /// machine, which is what the escrow address is derived from.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.keys.len() * 32 + 48);
        bytes.push(SCRIPT_VERSION);
        bytes.push(self.threshold as u8);
        bytes.push(self.keys.len() as u8);
        for key in &self.keys {
            bytes.extend_from_slice(key);
        }
        match &self.timelock {
            Some(lock) => {
                bytes.push(1);
                bytes.extend_from_slice(&lock.delay_secs.to_le_bytes());
                bytes.extend_from_slice(&lock.fallback_key);
            },
            None => bytes.push(0),
        }
        bytes
    }

    /// Hash of the canonical script bytes. Wallets derive the escrow payment address
    /// from this.
    pub fn script_hash(&self) -> [u8; 32] {
        let hash = domain_hasher(LABEL_SCRIPT).chain(&self.to_bytes()).finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&hash[..32]);
        out
    }
}

/// One funding outpoint being spent out of the escrow address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendInput {
    pub txid: String,
    pub index: u32,
    pub amount: u64,
}

/// One party's signature over one spend input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignature {
    pub input_index: u32,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    #[serde(with = "hex::serde")]
    pub signature: [u8; 64],
}

/// A fully-signed spend, ready for the wallet to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendPackage {
    pub script: RedeemScript,
    pub inputs: Vec<SpendInput>,
    pub outputs: Vec<SpendOutput>,
    pub signatures: Vec<InputSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendOutput {
    pub address: String,
    pub amount: u64,
}

fn spend_challenge(script: &RedeemScript, input: &SpendInput, outputs: &[SpendOutput]) -> Vec<u8> {
    let mut hasher = domain_hasher(LABEL_SPEND)
        .chain(&script.to_bytes())
        .chain(input.txid.as_bytes())
        .chain(&input.index.to_le_bytes())
        .chain(&input.amount.to_le_bytes());
    for out in outputs {
        hasher = hasher.chain(out.address.as_bytes()).chain(&out.amount.to_le_bytes());
    }
    hasher.finalize().to_vec()
}

/// Produce one party's signatures over all inputs of a proposed spend.
pub fn sign_multisig(
    secret: &SigningKey,
    script: &RedeemScript,
    inputs: &[SpendInput],
    outputs: &[SpendOutput],
) -> Result<Vec<InputSignature>, KeyManagerError> {
    let public = secret.verifying_key();
    if !script.contains(&public) {
        return Err(KeyManagerError::UnknownSigner);
    }
    if inputs.is_empty() {
        return Err(KeyManagerError::EmptySpend);
    }
    Ok(inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let challenge = spend_challenge(script, input, outputs);
            InputSignature {
                input_index: i as u32,
                public_key: public.to_bytes(),
                signature: secret.sign(&challenge).to_bytes(),
            }
        })
        .collect())
}

/// Combine partial signatures from the parties into a broadcastable spend, verifying
/// every signature and that each input meets the script threshold.
pub fn combine_signatures(
    script: &RedeemScript,
    inputs: Vec<SpendInput>,
    outputs: Vec<SpendOutput>,
    partials: Vec<Vec<InputSignature>>,
) -> Result<SpendPackage, KeyManagerError> {
    if inputs.is_empty() {
        return Err(KeyManagerError::EmptySpend);
    }
    let mut combined: Vec<InputSignature> = Vec::new();
    for (i, input) in inputs.iter().enumerate() {
        let input_index = i as u32;
        let challenge = spend_challenge(script, input, &outputs);
        let mut signers: Vec<[u8; 32]> = Vec::new();
        for partial in &partials {
            for sig in partial.iter().filter(|s| s.input_index == input_index) {
                let key = VerifyingKey::from_bytes(&sig.public_key)
                    .map_err(|_| KeyManagerError::BadSignature(input_index))?;
                if !script.contains(&key) {
                    return Err(KeyManagerError::UnknownSigner);
                }
                key.verify(&challenge, &Signature::from_bytes(&sig.signature))
                    .map_err(|_| KeyManagerError::BadSignature(input_index))?;
                if !signers.contains(&sig.public_key) {
                    signers.push(sig.public_key);
                    combined.push(sig.clone());
                }
            }
        }
        if signers.len() < script.threshold() {
            return Err(KeyManagerError::ThresholdNotMet {
                input: input_index,
                have: signers.len(),
                need: script.threshold(),
            });
        }
    }
    Ok(SpendPackage {
        script: script.clone(),
        inputs,
        outputs,
        signatures: combined,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ChainCode, KeyBranch, KeyManager};

    fn three_parties() -> (Vec<SigningKey>, Vec<VerifyingKey>) {
        let chaincode = ChainCode::from_bytes(&[5u8; 32]).unwrap();
        let secrets: Vec<SigningKey> = (0u8..3)
            .map(|i| {
                KeyManager::new([i + 1; 32], KeyBranch::Escrow)
                    .derive_key(&chaincode, 0)
                    .secret
            })
            .collect();
        let publics = secrets.iter().map(|s| s.verifying_key()).collect();
        (secrets, publics)
    }

    fn spend_fixture() -> (Vec<SpendInput>, Vec<SpendOutput>) {
        let inputs = vec![SpendInput {
            txid: "deadbeef".to_string(),
            index: 0,
            amount: 10_000,
        }];
        let outputs = vec![SpendOutput {
            address: "refund-address".to_string(),
            amount: 9_800,
        }];
        (inputs, outputs)
    }

    #[test]
    fn script_is_canonical_under_key_order() {
        let (_, publics) = three_parties();
        let a = RedeemScript::multisig(2, &publics).unwrap();
        let reversed: Vec<VerifyingKey> = publics.iter().rev().cloned().collect();
        let b = RedeemScript::multisig(2, &reversed).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.script_hash(), b.script_hash());
    }

    #[test]
    fn timelock_changes_script_hash() {
        let (_, publics) = three_parties();
        let plain = RedeemScript::multisig(2, &publics).unwrap();
        let locked = plain.clone().with_timelock(86_400 * 45, &publics[1]);
        assert_ne!(plain.script_hash(), locked.script_hash());
        assert_eq!(locked.timelock().unwrap().delay_secs, 86_400 * 45);
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let (_, publics) = three_parties();
        assert!(matches!(
            RedeemScript::multisig(0, &publics),
            Err(KeyManagerError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            RedeemScript::multisig(4, &publics),
            Err(KeyManagerError::InvalidThreshold { .. })
        ));
        let dup = vec![publics[0], publics[0], publics[1]];
        assert_eq!(RedeemScript::multisig(2, &dup).unwrap_err(), KeyManagerError::DuplicateKey);
    }

    #[test]
    fn two_of_three_combines() {
        let (secrets, publics) = three_parties();
        let script = RedeemScript::multisig(2, &publics).unwrap();
        let (inputs, outputs) = spend_fixture();

        let buyer_sigs = sign_multisig(&secrets[0], &script, &inputs, &outputs).unwrap();
        let vendor_sigs = sign_multisig(&secrets[1], &script, &inputs, &outputs).unwrap();

        let package = combine_signatures(&script, inputs, outputs, vec![buyer_sigs, vendor_sigs]).unwrap();
        assert_eq!(package.signatures.len(), 2);
    }

    #[test]
    fn one_signature_does_not_meet_two_of_three() {
        let (secrets, publics) = three_parties();
        let script = RedeemScript::multisig(2, &publics).unwrap();
        let (inputs, outputs) = spend_fixture();
        let only = sign_multisig(&secrets[2], &script, &inputs, &outputs).unwrap();
        assert!(matches!(
            combine_signatures(&script, inputs, outputs, vec![only]),
            Err(KeyManagerError::ThresholdNotMet { .. })
        ));
    }

    #[test]
    fn outsider_cannot_sign() {
        let (_, publics) = three_parties();
        let script = RedeemScript::multisig(2, &publics).unwrap();
        let (inputs, outputs) = spend_fixture();
        let outsider = KeyManager::new([99u8; 32], KeyBranch::Escrow)
            .derive_key(&ChainCode::random(), 0)
            .secret;
        assert_eq!(
            sign_multisig(&outsider, &script, &inputs, &outputs).unwrap_err(),
            KeyManagerError::UnknownSigner
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let (secrets, publics) = three_parties();
        let script = RedeemScript::multisig(2, &publics).unwrap();
        let (inputs, outputs) = spend_fixture();
        let mut sigs = sign_multisig(&secrets[0], &script, &inputs, &outputs).unwrap();
        sigs[0].signature[0] ^= 0xff;
        let vendor = sign_multisig(&secrets[1], &script, &inputs, &outputs).unwrap();
        assert!(matches!(
            combine_signatures(&script, inputs, outputs, vec![sigs, vendor]),
            Err(KeyManagerError::BadSignature(0))
        ));
    }
}

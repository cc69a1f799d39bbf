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

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{domain_hasher, KeyManagerError};

const LABEL_DERIVE_KEY: &[u8] = b"derive_key";

/// The per-order 32-byte chaincode carried in an order-open message. Both parties
/// derive their per-order subkeys from their own master key and this shared value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCode([u8; 32]);

impl ChainCode {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyManagerError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyManagerError::InvalidChainCode(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Subkey purpose. Distinct branches of the same master key never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBranch {
    /// Per-item rating authorship keys, proven to the vendor without revealing the
    /// buyer's long-term rating key.
    Rating,
    /// Per-order escrow keys used in the multisig payment script.
    Escrow,
}

impl KeyBranch {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            KeyBranch::Rating => b"rating",
            KeyBranch::Escrow => b"escrow",
        }
    }
}

/// A derived child keypair together with the index it was derived at.
#[derive(Debug, Clone)]
pub struct DerivedKeypair {
    pub secret: SigningKey,
    pub public: VerifyingKey,
    pub index: u32,
}

impl DerivedKeypair {
    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        self.secret.sign(message)
    }
}

impl PartialEq for DerivedKeypair {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.public == other.public
    }
}

/// Derives child keys from a 32-byte master key:
/// `child = H(master || branch || chaincode || index)`, hardened in the sense that a
/// child key reveals nothing about its siblings or the master.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyManager {
    master: [u8; 32],
    #[zeroize(skip)]
    branch: KeyBranch,
}

impl KeyManager {
    pub fn new(master: [u8; 32], branch: KeyBranch) -> Self {
        Self { master, branch }
    }

    /// A fresh random master key, for tests and first-run initialization.
    pub fn random(branch: KeyBranch) -> Self {
        let mut master = [0u8; 32];
        OsRng.fill_bytes(&mut master);
        Self::new(master, branch)
    }

    pub fn branch(&self) -> KeyBranch {
        self.branch
    }

    /// Derive the child keypair at `index` for the given order chaincode.
    pub fn derive_key(&self, chaincode: &ChainCode, index: u32) -> DerivedKeypair {
        let hash = domain_hasher(LABEL_DERIVE_KEY)
            .chain(&self.master)
            .chain(self.branch.as_bytes())
            .chain(chaincode.as_bytes())
            .chain(&index.to_le_bytes())
            .finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hash[..32]);
        let secret = SigningKey::from_bytes(&seed);
        let public = secret.verifying_key();
        seed.zeroize();
        DerivedKeypair { secret, public, index }
    }

    /// Derive `n` consecutive child keypairs starting at index 0, one per listed item.
    pub fn derive_keys(&self, chaincode: &ChainCode, n: u32) -> Vec<DerivedKeypair> {
        (0..n).map(|i| self.derive_key(chaincode, i)).collect()
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::Verifier;

    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let master = [7u8; 32];
        let chaincode = ChainCode::from_bytes(&[9u8; 32]).unwrap();
        let km1 = KeyManager::new(master, KeyBranch::Rating);
        let km2 = KeyManager::new(master, KeyBranch::Rating);
        for index in [0, 1, 2, 1000] {
            assert_eq!(km1.derive_key(&chaincode, index), km2.derive_key(&chaincode, index));
        }
    }

    #[test]
    fn branches_do_not_collide() {
        let master = [7u8; 32];
        let chaincode = ChainCode::from_bytes(&[9u8; 32]).unwrap();
        let rating = KeyManager::new(master, KeyBranch::Rating).derive_key(&chaincode, 0);
        let escrow = KeyManager::new(master, KeyBranch::Escrow).derive_key(&chaincode, 0);
        assert_ne!(rating.public, escrow.public);
    }

    #[test]
    fn chaincodes_do_not_collide() {
        let km = KeyManager::new([7u8; 32], KeyBranch::Escrow);
        let a = km.derive_key(&ChainCode::from_bytes(&[1u8; 32]).unwrap(), 0);
        let b = km.derive_key(&ChainCode::from_bytes(&[2u8; 32]).unwrap(), 0);
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn derived_key_signs_verifiably() {
        let km = KeyManager::random(KeyBranch::Rating);
        let chaincode = ChainCode::random();
        let keys = km.derive_keys(&chaincode, 3);
        assert_eq!(keys.len(), 3);
        let sig = keys[1].sign(b"five stars");
        keys[1].public.verify(b"five stars", &sig).unwrap();
        assert!(keys[0].public.verify(b"five stars", &sig).is_err());
    }

    #[test]
    fn invalid_chaincode_length() {
        assert_eq!(
            ChainCode::from_bytes(&[0u8; 31]).unwrap_err(),
            KeyManagerError::InvalidChainCode(31)
        );
    }
}

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

//! Deterministic key derivation and multisig construction for agora orders.
//!
//! Everything in this crate is pure and deterministic given its inputs: the same
//! master key, chaincode and index always produce the same child key, on any machine.
//! No I/O happens here; wallets broadcast what this crate signs.

pub mod error;
pub mod key_manager;
pub mod mnemonic;
pub mod multisig;

pub use error::KeyManagerError;
pub use key_manager::{ChainCode, DerivedKeypair, KeyBranch, KeyManager};
pub use multisig::{InputSignature, RedeemScript, SpendInput, SpendPackage, TimeLock};

use blake2::Blake2b512;
use digest::Digest;

/// Domain separation label for all derivation hashing in this crate.
const HASH_DOMAIN: &[u8] = b"com.agora.key_manager.v1";

/// A domain-separated Blake2b-512 hasher. Every piece of chained data is prefixed
/// with its length so variable-length inputs cannot collide by concatenation.
pub(crate) fn domain_hasher(label: &[u8]) -> DomainHasher {
    let mut digest = Blake2b512::new();
    digest.update((HASH_DOMAIN.len() as u64).to_le_bytes());
    digest.update(HASH_DOMAIN);
    digest.update((label.len() as u64).to_le_bytes());
    digest.update(label);
    DomainHasher { digest }
}

pub(crate) struct DomainHasher {
    digest: Blake2b512,
}

impl DomainHasher {
    pub fn chain(mut self, data: &[u8]) -> Self {
        self.digest.update((data.len() as u64).to_le_bytes());
        self.digest.update(data);
        self
    }

    pub fn finalize(self) -> [u8; 64] {
        self.digest.finalize().into()
    }
}

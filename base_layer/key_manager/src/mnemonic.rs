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

//! Mnemonic encoding of the node master seed. The 24 words are the only backup of a
//! node's identity, escrow and rating keys.

use bip39::{Language, Mnemonic};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::KeyManagerError;

/// Generate a fresh 32-byte master seed and its 24-word mnemonic.
pub fn generate_seed() -> (Zeroizing<[u8; 32]>, String) {
    let mut entropy = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(entropy.as_mut());
    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
        .expect("32 bytes of entropy is always a valid mnemonic");
    (entropy, mnemonic.to_string())
}

/// Recover the 32-byte master seed from a 24-word mnemonic.
pub fn seed_from_mnemonic(words: &str) -> Result<Zeroizing<[u8; 32]>, KeyManagerError> {
    let mnemonic =
        Mnemonic::parse_in(Language::English, words).map_err(|e| KeyManagerError::InvalidMnemonic(e.to_string()))?;
    let (entropy, len) = mnemonic.to_entropy_array();
    if len != 32 {
        return Err(KeyManagerError::InvalidMnemonic(format!(
            "expected 24 words (32 bytes of entropy), got {} bytes",
            len
        )));
    }
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&entropy[..32]);
    Ok(seed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generate_and_recover() {
        let (seed, words) = generate_seed();
        assert_eq!(words.split_whitespace().count(), 24);
        let recovered = seed_from_mnemonic(&words).unwrap();
        assert_eq!(*seed, *recovered);
    }

    #[test]
    fn rejects_garbage() {
        assert!(seed_from_mnemonic("not a mnemonic at all").is_err());
    }

    #[test]
    fn rejects_short_mnemonics() {
        // 12 words is valid bip39 but only 16 bytes of entropy
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &[3u8; 16]).unwrap();
        assert!(seed_from_mnemonic(&mnemonic.to_string()).is_err());
    }
}

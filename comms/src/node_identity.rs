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

use std::{fmt, fs, path::Path};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{error::CommsError, node_id::NodeId};

/// The long-lived identity of a local node: an ed25519 keypair and the node id
/// derived from its public half. Signing is delegated here so the secret key never
/// leaves this struct.
pub struct NodeIdentity {
    secret_key: SigningKey,
    public_key: VerifyingKey,
    node_id: NodeId,
}

impl NodeIdentity {
    pub fn random() -> Self {
        let secret_key = SigningKey::generate(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SigningKey) -> Self {
        let public_key = secret_key.verifying_key();
        let node_id = NodeId::from_public_key(&public_key);
        Self {
            secret_key,
            public_key,
            node_id,
        }
    }

    /// Rebuilds an identity from a 32-byte ed25519 seed, typically derived from a
    /// recovery mnemonic.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_secret_key(SigningKey::from_bytes(seed))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.secret_key.sign(message)
    }

    /// The 32-byte master seed behind this identity. Key managers for the
    /// escrow and rating branches are derived from it.
    pub fn seed_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret_key.to_bytes())
    }

    /// Loads an identity from a JSON file written by [`NodeIdentity::save`].
    pub fn load(path: &Path) -> Result<Self, CommsError> {
        let json = fs::read_to_string(path)?;
        let stored: StoredIdentity = serde_json::from_str(&json)
            .map_err(|e| CommsError::IdentityError(format!("failed to parse identity file: {}", e)))?;
        let seed = Zeroizing::new(
            <[u8; 32]>::try_from(
                hex::decode(&stored.secret_key)
                    .map_err(|e| CommsError::IdentityError(format!("invalid secret key hex: {}", e)))?,
            )
            .map_err(|_| CommsError::IdentityError("secret key must be 32 bytes".to_string()))?,
        );
        Ok(Self::from_seed(&seed))
    }

    /// Writes the identity to a JSON file. On unix the file is created with mode 600.
    pub fn save(&self, path: &Path) -> Result<(), CommsError> {
        let stored = StoredIdentity {
            node_id: self.node_id.to_string(),
            public_key: hex::encode(self.public_key.as_bytes()),
            secret_key: hex::encode(self.secret_key.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| CommsError::IdentityError(format!("failed to serialize identity: {}", e)))?;
        fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    node_id: String,
    public_key: String,
    secret_key: String,
}

#[cfg(test)]
mod test {
    use agora_test_utils::paths::with_temp_dir;

    use super::*;

    #[test]
    fn node_id_matches_public_key() {
        let identity = NodeIdentity::random();
        assert_eq!(identity.node_id(), NodeId::from_public_key(identity.public_key()));
    }

    #[test]
    fn save_and_load() {
        with_temp_dir(|dir| {
            let path = dir.join("identity.json");
            let identity = NodeIdentity::random();
            identity.save(&path).unwrap();
            let loaded = NodeIdentity::load(&path).unwrap();
            assert_eq!(loaded.node_id(), identity.node_id());
            assert_eq!(loaded.public_key(), identity.public_key());
        });
    }

    #[test]
    fn seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = NodeIdentity::from_seed(&seed);
        let b = NodeIdentity::from_seed(&seed);
        assert_eq!(a.node_id(), b.node_id());
    }
}

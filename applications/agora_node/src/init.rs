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

use std::{fs, path::Path};

use agora_common::{configuration::node_config::NodeConfig, exit_codes::ExitError};
use agora_comms::node_identity::NodeIdentity;
use agora_key_manager::mnemonic::{generate_seed, seed_from_mnemonic};

pub const IDENTITY_FILE: &str = "node_identity.json";

/// Creates the data directory with an identity and a default configuration.
/// Prints the recovery mnemonic exactly once when a fresh identity is made.
pub fn run_init(base_dir: &Path, mnemonic: Option<&str>, force: bool) -> Result<(), ExitError> {
    let identity_path = base_dir.join(IDENTITY_FILE);
    if identity_path.exists() && !force {
        return Err(ExitError::IdentityError(format!(
            "{} already exists; pass --force to replace it",
            identity_path.display()
        )));
    }
    fs::create_dir_all(base_dir).map_err(|e| ExitError::DataDirError(e.to_string()))?;

    let (seed, words) = match mnemonic {
        Some(words) => {
            let seed = seed_from_mnemonic(words).map_err(|e| ExitError::IdentityError(e.to_string()))?;
            (seed, None)
        },
        None => {
            let (seed, words) = generate_seed();
            (seed, Some(words))
        },
    };
    let identity = NodeIdentity::from_seed(&seed);
    identity
        .save(&identity_path)
        .map_err(|e| ExitError::IdentityError(e.to_string()))?;

    if !NodeConfig::config_path(base_dir).exists() || force {
        NodeConfig::default()
            .write_to(base_dir)
            .map_err(|e| ExitError::ConfigError(e.to_string()))?;
    }

    println!("Node id: {}", identity.node_id());
    if let Some(words) = words {
        println!("Recovery mnemonic (write this down, it is shown only once):");
        println!("    {}", words);
    }
    println!("Initialized {}", base_dir.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use agora_test_utils::paths::with_temp_dir;

    use super::*;

    #[test]
    fn init_writes_identity_and_config() {
        with_temp_dir(|dir| {
            run_init(dir, None, false).unwrap();
            assert!(dir.join(IDENTITY_FILE).exists());
            assert!(NodeConfig::config_path(dir).exists());

            // A second init must not clobber the identity.
            let err = run_init(dir, None, false).unwrap_err();
            assert!(matches!(err, ExitError::IdentityError(_)));
        });
    }

    #[test]
    fn init_recovers_a_deterministic_identity_from_a_mnemonic() {
        let (seed, words) = generate_seed();
        let expected = NodeIdentity::from_seed(&seed).node_id();
        with_temp_dir(|dir| {
            run_init(dir, Some(&words), false).unwrap();
            let identity = NodeIdentity::load(&dir.join(IDENTITY_FILE)).unwrap();
            assert_eq!(identity.node_id(), expected);
        });
    }
}

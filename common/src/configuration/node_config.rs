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

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{configuration::network::Network, ConfigurationError};

/// Node configuration, persisted as a TOML file named `config` in the data directory.
/// Unknown fields are rejected so that typos fail at startup rather than silently
/// falling back to defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Which network this node participates in.
    pub network: Network,
    /// Interval between walks of the outgoing message queue.
    pub resend_interval_secs: u64,
    /// Per-message direct send timeout.
    pub send_timeout_secs: u64,
    /// Name system resolve timeout.
    pub resolve_timeout_secs: u64,
    /// Content-addressed block fetch timeout.
    pub fetch_timeout_secs: u64,
    /// Number of name system records that must agree on a resolution.
    pub resolve_quorum: usize,
    /// Peer identifiers that are never dialed and whose messages are dropped.
    pub banned_peers: Vec<String>,
    /// Socket address the peer listener binds.
    pub listen_address: String,
    /// Dialable peers, each as `<node id hex>@<host:port>`.
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            resend_interval_secs: 600,
            send_timeout_secs: 60,
            resolve_timeout_secs: 120,
            fetch_timeout_secs: 30,
            resolve_quorum: 2,
            banned_peers: Vec::new(),
            listen_address: "0.0.0.0:18188".to_string(),
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Load the configuration from `<data_dir>/config`.
    pub fn load_from(data_dir: &Path) -> Result<Self, ConfigurationError> {
        let path = Self::config_path(data_dir);
        let raw = fs::read_to_string(&path).map_err(|e| {
            ConfigurationError::new("config", Some(path.to_string_lossy().into_owned()), e.to_string())
        })?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Write this configuration to `<data_dir>/config`, creating the directory if needed.
    pub fn write_to(&self, data_dir: &Path) -> Result<(), ConfigurationError> {
        fs::create_dir_all(data_dir)?;
        let raw = toml::to_string_pretty(self)?;
        fs::write(Self::config_path(data_dir), raw)?;
        Ok(())
    }

    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(crate::DEFAULT_CONFIG)
    }
}

#[cfg(test)]
mod test {
    use agora_test_utils::paths::with_temp_dir;

    use super::*;

    #[test]
    fn round_trip() {
        with_temp_dir(|dir| {
            let mut config = NodeConfig::default();
            config.network = Network::TestNet;
            config.resend_interval_secs = 30;
            config.write_to(dir).unwrap();
            let loaded = NodeConfig::load_from(dir).unwrap();
            assert_eq!(loaded, config);
            assert_eq!(loaded.resend_interval(), Duration::from_secs(30));
        });
    }

    #[test]
    fn unknown_field_is_rejected() {
        with_temp_dir(|dir| {
            std::fs::write(NodeConfig::config_path(dir), "network = \"testnet\"\nbogus = 1\n").unwrap();
            assert!(NodeConfig::load_from(dir).is_err());
        });
    }
}

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

use std::{path::Path, sync::Arc};

use agora_common::{configuration::node_config::NodeConfig, exit_codes::ExitError};
use agora_common_sqlite::connection::DbConnectionUrl;
use agora_comms::{
    ban::BanList,
    node_id::NodeId,
    node_identity::NodeIdentity,
    transport::tcp::{spawn_listener, AddressBook, TcpTransport},
};
use agora_market::{
    publisher::{
        backend::{MemoryBlockStore, MemoryNameSystem},
        PublisherConfig,
    },
    wallet::MemoryWallet,
    Market,
    MarketConfig,
};
use agora_shutdown::Shutdown;
use log::*;
use tokio::net::TcpListener;

use crate::init::IDENTITY_FILE;

const LOG_TARGET: &str = "agora_node";

/// Escrow release fee charged by the in-process wallet backend.
const MEMORY_WALLET_RELEASE_FEE: u64 = 10;

/// Runs the node until SIGINT.
pub async fn run_node(base_dir: &Path) -> Result<(), ExitError> {
    let config = NodeConfig::load_from(base_dir).map_err(|e| ExitError::ConfigError(e.to_string()))?;
    let identity = Arc::new(
        NodeIdentity::load(&base_dir.join(IDENTITY_FILE)).map_err(|e| ExitError::IdentityError(e.to_string()))?,
    );
    let seed = identity.seed_bytes();

    let address_book = AddressBook::new();
    for entry in &config.peers {
        address_book
            .insert_from_str(entry)
            .map_err(|e| ExitError::ConfigError(format!("bad peer entry `{}`: {}", entry, e)))?;
    }
    let banned = config
        .banned_peers
        .iter()
        .map(|s| {
            s.parse::<NodeId>()
                .map_err(|e| ExitError::ConfigError(format!("bad banned peer `{}`: {}", s, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let protocol = config.network.protocol_id();
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .map_err(|e| ExitError::NetworkError(format!("cannot listen on {}: {}", config.listen_address, e)))?;
    let (inbound, listener_handle) = spawn_listener(listener, protocol.to_string());
    let transport = TcpTransport::new(identity.node_id(), protocol, address_book);

    let market_config = MarketConfig {
        content_dir: base_dir.join("content"),
        database_url: DbConnectionUrl::file(base_dir.join("market.sqlite")),
        resend_interval: config.resend_interval(),
        send_timeout: config.send_timeout(),
        publisher: PublisherConfig {
            resolve_timeout: config.resolve_timeout(),
            fetch_timeout: config.fetch_timeout(),
            resolve_quorum: config.resolve_quorum,
        },
    };

    let mut shutdown = Shutdown::new();
    // In-process backends stand in until a real wallet, block store and name
    // system are integrated behind the same traits.
    let market = Market::spawn(
        market_config,
        identity.clone(),
        transport,
        inbound,
        BanList::with_peers(banned),
        MemoryWallet::new(MEMORY_WALLET_RELEASE_FEE),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryNameSystem::new()),
        *seed,
        shutdown.to_signal(),
    )
    .map_err(|e| ExitError::NetworkError(e.to_string()))?;

    info!(
        target: LOG_TARGET,
        "Node {} listening on {} ({})",
        identity.node_id(),
        config.listen_address,
        config.network
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::UnknownError(e.to_string()))?;
    info!(target: LOG_TARGET, "Interrupt received, shutting down");
    shutdown.trigger();
    listener_handle.abort();
    market.join().await;
    Ok(())
}

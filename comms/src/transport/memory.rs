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

//! An in-process transport for tests and local simulations. Nodes register an
//! endpoint on a shared [`MemoryNetwork`]; dialing creates a duplex byte pipe and
//! hands the remote half to the target's inbound channel, exactly as a listener
//! would accept a socket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{
    io::DuplexStream,
    sync::mpsc,
};

use super::PeerTransport;
use crate::{error::CommsError, node_id::NodeId};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;
const INBOUND_CHANNEL_SIZE: usize = 16;

struct Endpoint {
    protocol: String,
    inbound: mpsc::Sender<(NodeId, DuplexStream)>,
}

/// A shared registry of in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<NodeId, Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `node_id` on the network under `protocol` and returns the
    /// transport for outbound dials plus the receiver of accepted inbound streams.
    /// Registering the same node id again replaces the previous endpoint.
    pub fn create_endpoint<P: Into<String>>(
        &self,
        node_id: NodeId,
        protocol: P,
    ) -> (MemoryTransport, mpsc::Receiver<(NodeId, DuplexStream)>) {
        let protocol = protocol.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        self.endpoints.lock().unwrap().insert(node_id, Endpoint {
            protocol: protocol.clone(),
            inbound: inbound_tx,
        });
        let transport = MemoryTransport {
            node_id,
            protocol,
            endpoints: self.endpoints.clone(),
        };
        (transport, inbound_rx)
    }

    /// Removes `node_id` from the network. Dials to it fail afterwards; existing
    /// streams are unaffected.
    pub fn remove_endpoint(&self, node_id: &NodeId) {
        self.endpoints.lock().unwrap().remove(node_id);
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    protocol: String,
    endpoints: Arc<Mutex<HashMap<NodeId, Endpoint>>>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    type Stream = DuplexStream;

    async fn dial(&self, peer: NodeId) -> Result<Self::Stream, CommsError> {
        let inbound = {
            let endpoints = self.endpoints.lock().unwrap();
            let endpoint = endpoints.get(&peer).ok_or_else(|| CommsError::DialFailed {
                peer,
                details: "peer is not reachable".to_string(),
            })?;
            if endpoint.protocol != self.protocol {
                return Err(CommsError::DialFailed {
                    peer,
                    details: format!(
                        "protocol mismatch: ours is '{}', theirs is '{}'",
                        self.protocol, endpoint.protocol
                    ),
                });
            }
            endpoint.inbound.clone()
        };
        let (local, remote) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        inbound
            .send((self.node_id, remote))
            .await
            .map_err(|_| CommsError::DialFailed {
                peer,
                details: "peer stopped accepting streams".to_string(),
            })?;
        Ok(local)
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::node_identity::NodeIdentity;

    #[tokio::test]
    async fn dial_and_exchange_bytes() {
        let network = MemoryNetwork::new();
        let alice = NodeIdentity::random().node_id();
        let bob = NodeIdentity::random().node_id();
        let (alice_transport, _alice_rx) = network.create_endpoint(alice, "/agora/app/1.0.0");
        let (_bob_transport, mut bob_rx) = network.create_endpoint(bob, "/agora/app/1.0.0");

        let mut stream = alice_transport.dial(bob).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let (from, mut accepted) = bob_rx.recv().await.unwrap();
        assert_eq!(from, alice);
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dial_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let alice = NodeIdentity::random().node_id();
        let stranger = NodeIdentity::random().node_id();
        let (transport, _rx) = network.create_endpoint(alice, "/agora/app/1.0.0");
        let err = transport.dial(stranger).await.unwrap_err();
        assert!(matches!(err, CommsError::DialFailed { .. }));
    }

    #[tokio::test]
    async fn protocol_mismatch_fails() {
        let network = MemoryNetwork::new();
        let alice = NodeIdentity::random().node_id();
        let bob = NodeIdentity::random().node_id();
        let (alice_transport, _a) = network.create_endpoint(alice, "/agora/app/1.0.0");
        let (_bob_transport, _b) = network.create_endpoint(bob, "/agora/app/testnet/1.0.0");
        let err = alice_transport.dial(bob).await.unwrap_err();
        assert!(matches!(err, CommsError::DialFailed { .. }));
    }
}

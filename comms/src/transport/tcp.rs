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

//! A TCP transport with a static address book. Dialing looks the peer up in the
//! book and opens a stream prefixed with a hello frame naming the dialer and the
//! protocol. The hello is unauthenticated by design: node ids are self-certifying,
//! so a forged hello yields a stream whose envelopes can never verify.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::SinkExt;
use log::*;
use prost::Message;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

use super::{framed_write, PeerTransport};
use crate::{error::CommsError, node_id::NodeId};

const LOG_TARGET: &str = "comms::transport::tcp";

const INBOUND_CHANNEL_SIZE: usize = 16;
/// More than enough for a protocol string and a node id.
const MAX_HELLO_LENGTH: usize = 1024;

/// The first frame on every connection, sent by the dialer.
#[derive(Clone, PartialEq, prost::Message)]
struct HelloFrame {
    #[prost(string, tag = "1")]
    protocol: String,
    #[prost(bytes = "vec", tag = "2")]
    node_id: Vec<u8>,
}

/// Maps node ids to dialable socket addresses. Entries come from configuration;
/// there is no discovery behind this.
#[derive(Clone, Default)]
pub struct AddressBook {
    entries: Arc<RwLock<HashMap<NodeId, SocketAddr>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&self, peer: NodeId, address: SocketAddr) {
        self.entries.write().unwrap().insert(peer, address);
    }

    pub fn get(&self, peer: &NodeId) -> Option<SocketAddr> {
        self.entries.read().unwrap().get(peer).copied()
    }

    /// Parses an `<node id hex>@<host:port>` entry as found in configuration.
    pub fn insert_from_str(&self, entry: &str) -> Result<NodeId, CommsError> {
        let (id, addr) = entry
            .split_once('@')
            .ok_or_else(|| CommsError::InvalidNodeId(entry.to_string()))?;
        let peer: NodeId = id.parse()?;
        let address: SocketAddr = addr
            .parse()
            .map_err(|_| CommsError::DialFailed {
                peer,
                details: format!("unparseable address `{}`", addr),
            })?;
        self.insert(peer, address);
        Ok(peer)
    }
}

pub struct TcpTransport {
    node_id: NodeId,
    protocol: String,
    address_book: AddressBook,
}

impl TcpTransport {
    pub fn new<P: Into<String>>(node_id: NodeId, protocol: P, address_book: AddressBook) -> Self {
        Self {
            node_id,
            protocol: protocol.into(),
            address_book,
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    type Stream = TcpStream;

    async fn dial(&self, peer: NodeId) -> Result<Self::Stream, CommsError> {
        let address = self.address_book.get(&peer).ok_or_else(|| CommsError::DialFailed {
            peer,
            details: "no known address".to_string(),
        })?;
        let mut stream = TcpStream::connect(address).await.map_err(|e| CommsError::DialFailed {
            peer,
            details: e.to_string(),
        })?;
        let hello = HelloFrame {
            protocol: self.protocol.clone(),
            node_id: self.node_id.to_vec(),
        };
        let mut writer = framed_write(&mut stream);
        writer
            .send(hello.encode_to_vec().into())
            .await
            .map_err(|e| CommsError::DialFailed {
                peer,
                details: format!("hello failed: {}", e),
            })?;
        Ok(stream)
    }
}

/// Accepts connections on `listener`, reads each dialer's hello and hands the
/// identified stream to the returned channel. Runs until the listener errors or
/// the receiver is dropped.
pub fn spawn_listener(
    listener: TcpListener,
    protocol: String,
) -> (mpsc::Receiver<(NodeId, TcpStream)>, JoinHandle<()>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(target: LOG_TARGET, "Accept failed: {}", err);
                    break;
                },
            };
            let inbound_tx = inbound_tx.clone();
            let protocol = protocol.clone();
            tokio::spawn(async move {
                match read_hello(stream, &protocol).await {
                    Ok((peer, stream)) => {
                        if inbound_tx.send((peer, stream)).await.is_err() {
                            debug!(target: LOG_TARGET, "Inbound channel closed, dropping stream");
                        }
                    },
                    Err(err) => {
                        debug!(target: LOG_TARGET, "Rejecting connection from {}: {}", remote, err);
                    },
                }
            });
        }
    });
    (inbound_rx, handle)
}

/// Reads the hello with exact-length reads rather than a buffered codec, so no
/// bytes of the frames that follow are consumed.
async fn read_hello(mut stream: TcpStream, protocol: &str) -> Result<(NodeId, TcpStream), CommsError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_HELLO_LENGTH {
        return Err(CommsError::InvalidNodeId(format!("oversized hello ({} bytes)", len)));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    let hello = HelloFrame::decode(frame.as_slice()).map_err(crate::message::MessageError::from)?;
    if hello.protocol != protocol {
        return Err(CommsError::InvalidNodeId(format!(
            "protocol mismatch: `{}`",
            hello.protocol
        )));
    }
    let peer = NodeId::from_bytes(&hello.node_id)?;
    Ok((peer, stream))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dial_delivers_an_identified_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (mut inbound, _handle) = spawn_listener(listener, "/agora/test/1.0.0".to_string());

        let dialer = crate::node_identity::NodeIdentity::random();
        let book = AddressBook::new();
        let listener_id = crate::node_identity::NodeIdentity::random().node_id();
        book.insert(listener_id, address);
        let transport = TcpTransport::new(dialer.node_id(), "/agora/test/1.0.0", book);

        let _stream = transport.dial(listener_id).await.unwrap();
        let (peer, _accepted) = inbound.recv().await.unwrap();
        assert_eq!(peer, dialer.node_id());
    }

    #[tokio::test]
    async fn protocol_mismatch_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (mut inbound, _handle) = spawn_listener(listener, "/agora/mainnet/1.0.0".to_string());

        let dialer = crate::node_identity::NodeIdentity::random();
        let book = AddressBook::new();
        let listener_id = crate::node_identity::NodeIdentity::random().node_id();
        book.insert(listener_id, address);
        let transport = TcpTransport::new(dialer.node_id(), "/agora/testnet/1.0.0", book);

        // The dial itself succeeds; the listener drops the stream after the hello.
        let _stream = transport.dial(listener_id).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(500), inbound.recv())
            .await
            .expect_err("mismatched protocol must not be accepted");
    }

    #[test]
    fn address_book_parses_config_entries() {
        let book = AddressBook::new();
        let id = crate::node_identity::NodeIdentity::random().node_id();
        let peer = book.insert_from_str(&format!("{}@127.0.0.1:18188", id)).unwrap();
        assert_eq!(peer, id);
        assert_eq!(book.get(&id).unwrap().port(), 18188);
        assert!(book.insert_from_str("garbage").is_err());
    }
}

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
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use agora_shutdown::ShutdownSignal;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::*;
use prost::Message;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::{
    ban::BanList,
    connectivity::{ConnectivityEvent, ConnectivityEvents},
    error::CommsError,
    message::{Envelope, InboundMessage, MessageType},
    node_id::NodeId,
    transport::{framed_read, framed_write, PeerTransport},
};

const LOG_TARGET: &str = "comms::service";

/// After this many consecutive write failures on reused streams, the peer's stream
/// is no longer cached and every message gets a fresh stream.
pub const MAX_REUSE_RESETS: u32 = 3;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors returned by inbound handlers. They are logged, never propagated to the
/// stream loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives verified inbound messages of the types it was registered for.
#[async_trait]
pub trait InboundMessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

struct PeerStreamState<S> {
    writer: Option<FramedWrite<S, LengthDelimitedCodec>>,
    consecutive_resets: u32,
    degraded: bool,
}

impl<S> Default for PeerStreamState<S> {
    fn default() -> Self {
        Self {
            writer: None,
            consecutive_resets: 0,
            degraded: false,
        }
    }
}

/// Sends envelopes to peers over at most one cached outbound stream per peer.
///
/// A stream is opened lazily on first send and reused until a write fails. A
/// failed write invalidates the cached writer; the message is retried once on a
/// fresh stream. Once [`MAX_REUSE_RESETS`] consecutive reused writes have failed,
/// the peer is marked degraded and every subsequent message opens its own stream.
/// Clones share the stream cache, so sends to the same peer are serialized.
pub struct OutboundMessaging<T: PeerTransport> {
    transport: Arc<T>,
    streams: Arc<Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<PeerStreamState<T::Stream>>>>>>,
    ban_list: BanList,
    events: ConnectivityEvents,
    send_timeout: Duration,
}

impl<T: PeerTransport> Clone for OutboundMessaging<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            streams: self.streams.clone(),
            ban_list: self.ban_list.clone(),
            events: self.events.clone(),
            send_timeout: self.send_timeout,
        }
    }
}

impl<T: PeerTransport> OutboundMessaging<T> {
    pub fn new(transport: T, ban_list: BanList, events: ConnectivityEvents) -> Self {
        Self {
            transport: Arc::new(transport),
            streams: Arc::new(Mutex::new(HashMap::new())),
            ban_list,
            events,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sends a single signed envelope to `peer`. Returns once the envelope has
    /// been flushed to the stream, which is not a delivery confirmation.
    pub async fn send_message(&self, peer: NodeId, envelope: &Envelope) -> Result<(), CommsError> {
        if self.ban_list.is_banned(&peer) {
            return Err(CommsError::PeerBanned(peer));
        }
        let frame = Bytes::from(envelope.encode_to_vec());
        let state = self
            .streams
            .lock()
            .unwrap()
            .entry(peer)
            .or_default()
            .clone();
        // Per-peer lock: in-flight writes to a peer are never interleaved, and a
        // reset observed by one sender is seen by the next.
        let mut state = state.lock().await;
        match time::timeout(self.send_timeout, self.send_with_state(peer, &mut state, frame)).await {
            Ok(result) => result,
            Err(_) => {
                state.writer = None;
                Err(CommsError::SendTimeout {
                    peer,
                    timeout_secs: self.send_timeout.as_secs(),
                })
            },
        }
    }

    async fn send_with_state(
        &self,
        peer: NodeId,
        state: &mut PeerStreamState<T::Stream>,
        frame: Bytes,
    ) -> Result<(), CommsError> {
        if let Some(writer) = state.writer.as_mut() {
            match writer.send(frame.clone()).await {
                Ok(_) => {
                    state.consecutive_resets = 0;
                    return Ok(());
                },
                Err(err) => {
                    debug!(
                        target: LOG_TARGET,
                        "Cached stream to peer {} reset ({}), redialing", peer.short_str(), err
                    );
                    state.writer = None;
                    state.consecutive_resets += 1;
                    if !state.degraded && state.consecutive_resets >= MAX_REUSE_RESETS {
                        warn!(
                            target: LOG_TARGET,
                            "Stream to peer {} reset {} consecutive times, switching to one stream per message",
                            peer.short_str(),
                            state.consecutive_resets
                        );
                        state.degraded = true;
                    }
                    self.events.publish(ConnectivityEvent::PeerDisconnected(peer));
                },
            }
        }

        let stream = self.transport.dial(peer).await?;
        self.events.publish(ConnectivityEvent::PeerConnected(peer));
        let mut writer = framed_write(stream);
        writer.send(frame).await?;
        if state.degraded {
            // One stream per message in degraded mode; the writer drops here and
            // closes the stream.
            trace!(target: LOG_TARGET, "Sent to degraded peer {} on a fresh stream", peer.short_str());
        } else {
            state.writer = Some(writer);
        }
        Ok(())
    }

    /// Drops any cached stream for `peer`. The next send will redial.
    pub fn invalidate_stream(&self, peer: &NodeId) {
        if let Some(state) = self.streams.lock().unwrap().get(peer) {
            if let Ok(mut state) = state.try_lock() {
                state.writer = None;
            }
        }
    }
}

/// Reads envelopes from accepted inbound streams and dispatches them to the
/// handlers registered per message type.
///
/// Streams are processed concurrently across peers; within one stream, messages
/// are read and handled strictly sequentially. Banned peers are dropped silently.
/// A handler error is logged and the stream continues; EOF ends it cleanly.
pub struct NetworkService<S> {
    inbound: mpsc::Receiver<(NodeId, S)>,
    handlers: HashMap<MessageType, Arc<dyn InboundMessageHandler>>,
    ban_list: BanList,
    events: ConnectivityEvents,
    shutdown_signal: ShutdownSignal,
}

impl<S> NetworkService<S>
where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    pub fn new(
        inbound: mpsc::Receiver<(NodeId, S)>,
        ban_list: BanList,
        events: ConnectivityEvents,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            inbound,
            handlers: HashMap::new(),
            ban_list,
            events,
            shutdown_signal,
        }
    }

    /// Registers the handler invoked for inbound messages of `message_type`,
    /// replacing any previous registration. Must be called before [`spawn`].
    ///
    /// [`spawn`]: NetworkService::spawn
    pub fn register_handler(&mut self, message_type: MessageType, handler: Arc<dyn InboundMessageHandler>) {
        self.handlers.insert(message_type, handler);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let handlers = Arc::new(self.handlers);
        info!(target: LOG_TARGET, "Network service started");
        loop {
            tokio::select! {
                maybe_stream = self.inbound.recv() => {
                    let (peer, stream) = match maybe_stream {
                        Some(s) => s,
                        None => break,
                    };
                    if self.ban_list.is_banned(&peer) {
                        debug!(target: LOG_TARGET, "Dropping inbound stream from banned peer {}", peer.short_str());
                        continue;
                    }
                    let task = StreamTask {
                        peer,
                        handlers: handlers.clone(),
                        ban_list: self.ban_list.clone(),
                        events: self.events.clone(),
                        shutdown_signal: self.shutdown_signal.clone(),
                    };
                    tokio::spawn(task.run(stream));
                },
                _ = &mut self.shutdown_signal => {
                    break;
                },
            }
        }
        info!(target: LOG_TARGET, "Network service shut down");
    }
}

struct StreamTask {
    peer: NodeId,
    handlers: Arc<HashMap<MessageType, Arc<dyn InboundMessageHandler>>>,
    ban_list: BanList,
    events: ConnectivityEvents,
    shutdown_signal: ShutdownSignal,
}

impl StreamTask {
    async fn run<S>(mut self, stream: S)
    where S: AsyncRead + Unpin + Send {
        let peer = self.peer;
        self.events.publish(ConnectivityEvent::PeerConnected(peer));
        let mut framed = framed_read(stream);
        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = &mut self.shutdown_signal => break,
            };
            match frame {
                Some(Ok(bytes)) => {
                    if self.ban_list.is_banned(&peer) {
                        debug!(target: LOG_TARGET, "Dropping message from banned peer {}", peer.short_str());
                        continue;
                    }
                    self.process_frame(&bytes).await;
                },
                Some(Err(err)) => {
                    warn!(target: LOG_TARGET, "Stream from peer {} errored: {}", peer.short_str(), err);
                    break;
                },
                // EOF
                None => break,
            }
        }
        self.events.publish(ConnectivityEvent::PeerDisconnected(peer));
        debug!(target: LOG_TARGET, "Stream from peer {} closed", peer.short_str());
    }

    async fn process_frame(&self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(env) => env,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    "Discarding undecodable frame from peer {}: {}", self.peer.short_str(), err
                );
                return;
            },
        };
        if let Err(err) = envelope.verify(&self.peer) {
            warn!(
                target: LOG_TARGET,
                "Discarding envelope from peer {}: {}", self.peer.short_str(), err
            );
            return;
        }
        // verify() guarantees the type is known
        let message_type = match envelope.message_type() {
            Ok(mt) => mt,
            Err(_) => return,
        };
        let handler = match self.handlers.get(&message_type) {
            Some(h) => h.clone(),
            None => {
                debug!(
                    target: LOG_TARGET,
                    "No handler registered for {:?} from peer {}", message_type, self.peer.short_str()
                );
                return;
            },
        };
        let message = InboundMessage::new(self.peer, envelope);
        if let Err(err) = handler.handle(message).await {
            warn!(
                target: LOG_TARGET,
                "Handler for {:?} from peer {} failed: {}", message_type, self.peer.short_str(), err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use agora_shutdown::Shutdown;

    use super::*;
    use crate::{
        message::{AckPayload, MessageExt, MESSAGE_ID_LEN},
        node_identity::NodeIdentity,
        transport::memory::{MemoryNetwork, MemoryTransport},
    };

    const PROTOCOL: &str = "/agora/app/1.0.0";

    struct Collector {
        collected: mpsc::UnboundedSender<InboundMessage>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl InboundMessageHandler for Collector {
        async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                return Err("induced failure".into());
            }
            self.collected.send(message).map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    struct Node {
        identity: NodeIdentity,
        outbound: OutboundMessaging<MemoryTransport>,
        received: mpsc::UnboundedReceiver<InboundMessage>,
        ban_list: BanList,
        _shutdown: Shutdown,
    }

    fn spawn_node(network: &MemoryNetwork, fail_first: bool) -> Node {
        let identity = NodeIdentity::random();
        let (transport, inbound_rx) = network.create_endpoint(identity.node_id(), PROTOCOL);
        let ban_list = BanList::new();
        let events = ConnectivityEvents::new();
        let shutdown = Shutdown::new();
        let outbound = OutboundMessaging::new(transport, ban_list.clone(), events.clone());
        let (collected_tx, received) = mpsc::unbounded_channel();
        let mut service = NetworkService::new(inbound_rx, ban_list.clone(), events, shutdown.to_signal());
        service.register_handler(MessageType::Chat, Arc::new(Collector {
            collected: collected_tx,
            fail_first: Mutex::new(fail_first),
        }));
        service.spawn();
        Node {
            identity,
            outbound,
            received,
            ban_list,
            _shutdown: shutdown,
        }
    }

    fn signed_chat(identity: &NodeIdentity, body: &[u8]) -> Envelope {
        let mut env = Envelope::wrap(MessageType::Chat, body.to_vec());
        env.sign(identity);
        env
    }

    #[tokio::test]
    async fn delivers_verified_messages() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let mut bob = spawn_node(&network, false);

        let env = signed_chat(&alice.identity, b"hi bob");
        alice.outbound.send_message(bob.identity.node_id(), &env).await.unwrap();

        let received = bob.received.recv().await.unwrap();
        assert_eq!(received.source_peer, alice.identity.node_id());
        assert_eq!(received.envelope.payload, b"hi bob");
    }

    #[tokio::test]
    async fn stream_is_reused_across_sends() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let mut bob = spawn_node(&network, false);

        for i in 0..5u8 {
            let env = signed_chat(&alice.identity, &[i]);
            alice.outbound.send_message(bob.identity.node_id(), &env).await.unwrap();
        }
        for i in 0..5u8 {
            let received = bob.received.recv().await.unwrap();
            assert_eq!(received.envelope.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_stream() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let mut bob = spawn_node(&network, true);

        let peer = bob.identity.node_id();
        alice
            .outbound
            .send_message(peer, &signed_chat(&alice.identity, b"dropped"))
            .await
            .unwrap();
        alice
            .outbound
            .send_message(peer, &signed_chat(&alice.identity, b"kept"))
            .await
            .unwrap();

        let received = bob.received.recv().await.unwrap();
        assert_eq!(received.envelope.payload, b"kept");
    }

    #[tokio::test]
    async fn forged_sender_is_discarded() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let mut bob = spawn_node(&network, false);

        // Signed by a third identity, sent over alice's stream.
        let mallory = NodeIdentity::random();
        let forged = signed_chat(&mallory, b"forged");
        alice
            .outbound
            .send_message(bob.identity.node_id(), &forged)
            .await
            .unwrap();
        alice
            .outbound
            .send_message(bob.identity.node_id(), &signed_chat(&alice.identity, b"real"))
            .await
            .unwrap();

        let received = bob.received.recv().await.unwrap();
        assert_eq!(received.envelope.payload, b"real");
    }

    #[tokio::test]
    async fn send_to_banned_peer_fails_fast() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let bob = spawn_node(&network, false);

        alice.ban_list.ban(bob.identity.node_id());
        let err = alice
            .outbound
            .send_message(bob.identity.node_id(), &signed_chat(&alice.identity, b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::PeerBanned(_)));
    }

    #[tokio::test]
    async fn inbound_from_banned_peer_is_dropped() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let carol = spawn_node(&network, false);
        let mut bob = spawn_node(&network, false);

        bob.ban_list.ban(alice.identity.node_id());
        alice
            .outbound
            .send_message(bob.identity.node_id(), &signed_chat(&alice.identity, b"banned"))
            .await
            .unwrap();
        carol
            .outbound
            .send_message(bob.identity.node_id(), &signed_chat(&carol.identity, b"welcome"))
            .await
            .unwrap();

        let received = bob.received.recv().await.unwrap();
        assert_eq!(received.source_peer, carol.identity.node_id());
        assert_eq!(received.envelope.payload, b"welcome");
    }

    #[tokio::test]
    async fn send_after_peer_restart_redials() {
        let network = MemoryNetwork::new();
        let alice = spawn_node(&network, false);
        let mut bob = spawn_node(&network, false);
        let peer = bob.identity.node_id();

        alice
            .outbound
            .send_message(peer, &signed_chat(&alice.identity, b"one"))
            .await
            .unwrap();
        assert_eq!(bob.received.recv().await.unwrap().envelope.payload, b"one");

        // Simulate the peer dropping the connection.
        alice.outbound.invalidate_stream(&peer);
        alice
            .outbound
            .send_message(peer, &signed_chat(&alice.identity, b"two"))
            .await
            .unwrap();
        assert_eq!(bob.received.recv().await.unwrap().envelope.payload, b"two");
    }

    #[tokio::test]
    async fn ack_payload_round_trip() {
        let acked = AckPayload {
            acked_id: vec![1; MESSAGE_ID_LEN],
        };
        let bytes = acked.to_encoded_bytes();
        let decoded = AckPayload::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, acked);
    }
}

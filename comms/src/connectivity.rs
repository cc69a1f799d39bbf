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

use std::fmt;

use tokio::sync::broadcast;

use crate::node_id::NodeId;

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// A peer opened an inbound stream to us, or an outbound dial succeeded.
    PeerConnected(NodeId),
    /// The peer's stream reached EOF or errored.
    PeerDisconnected(NodeId),
    /// The peer was added to the ban list while connected.
    PeerBanned(NodeId),
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ConnectivityEvent::*;
        match self {
            PeerConnected(id) => write!(f, "PeerConnected({})", id.short_str()),
            PeerDisconnected(id) => write!(f, "PeerDisconnected({})", id.short_str()),
            PeerBanned(id) => write!(f, "PeerBanned({})", id.short_str()),
        }
    }
}

/// Fan-out of connectivity events to any number of subscribers. Lagging
/// subscribers lose the oldest events, never block the publisher.
#[derive(Clone)]
pub struct ConnectivityEvents {
    sender: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ConnectivityEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.sender.send(event);
    }
}

impl Default for ConnectivityEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_identity::NodeIdentity;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let events = ConnectivityEvents::new();
        let mut rx = events.subscribe();
        let peer = NodeIdentity::random().node_id();
        events.publish(ConnectivityEvent::PeerConnected(peer));
        events.publish(ConnectivityEvent::PeerDisconnected(peer));
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::PeerConnected(peer));
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::PeerDisconnected(peer));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let events = ConnectivityEvents::new();
        events.publish(ConnectivityEvent::PeerBanned(NodeIdentity::random().node_id()));
    }
}

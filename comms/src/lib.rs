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

//! The agora peer communication layer: stable peer identities, signed message
//! envelopes and the network service that multiplexes per-peer streams, dispatches
//! verified messages to registered handlers and tracks connectivity.
//!
//! The underlying byte transport (TCP, relay, in-memory for tests) is abstracted
//! behind [`transport::PeerTransport`]; everything above it is transport-agnostic.

pub mod ban;
pub mod connectivity;
pub mod error;
pub mod message;
pub mod node_id;
pub mod node_identity;
pub mod service;
pub mod transport;

pub use ban::BanList;
pub use connectivity::{ConnectivityEvent, ConnectivityEvents};
pub use error::CommsError;
pub use message::{envelope::Envelope, InboundMessage, MessageExt, MessageType};
pub use node_id::NodeId;
pub use node_identity::NodeIdentity;
pub use service::{InboundMessageHandler, NetworkService, OutboundMessaging};

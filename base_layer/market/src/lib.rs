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

//! The agora market layer: a federated commerce node built on the comms layer.
//!
//! Peers keep their storefront (profile, listings, images, ratings) in a local
//! [`content_store`] and publish signed snapshots of it through the
//! [`publisher`] so other peers can browse it while they are offline. Direct
//! peer-to-peer traffic (chat, follows and the order protocol) rides the
//! reliable, per-class-sequenced [`messaging`] queue, and the
//! [`order_service`] drives purchases through direct, cancelable and moderated
//! escrow payments against a pluggable [`wallet`] backend.
//!
//! [`market::Market`] composes all of it into a running node.

pub mod chat_service;
pub mod content_store;
pub mod follow_service;
pub mod market;
pub mod messaging;
pub mod order_service;
pub mod proto;
pub mod publisher;
pub mod schema;
pub mod storage;
pub mod wallet;

pub use market::{Market, MarketConfig, MarketError};

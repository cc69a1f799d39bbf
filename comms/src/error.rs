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

use thiserror::Error;

use crate::{message::MessageError, node_id::NodeId};

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("Invalid node id: `{0}`")]
    InvalidNodeId(String),
    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),
    #[error("Peer `{0}` is banned")]
    PeerBanned(NodeId),
    #[error("Dial to peer `{peer}` failed: {details}")]
    DialFailed { peer: NodeId, details: String },
    #[error("Send to peer `{peer}` timed out after {timeout_secs}s")]
    SendTimeout { peer: NodeId, timeout_secs: u64 },
    #[error("Connection to peer `{0}` was closed")]
    ConnectionClosed(NodeId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identity file error: {0}")]
    IdentityError(String),
    #[error("The network service has shut down")]
    ServiceShutdown,
}

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

pub mod envelope;
mod error;

pub use envelope::{AckPayload, Envelope, MessageType, MESSAGE_ID_LEN};
pub use error::MessageError;
use prost::Message;

use crate::node_id::NodeId;

/// Convenience encoding for prost messages used as envelope payloads.
pub trait MessageExt: Message {
    fn to_encoded_bytes(&self) -> Vec<u8>
    where Self: Sized {
        self.encode_to_vec()
    }
}

impl<T: Message> MessageExt for T {}

/// A verified envelope together with the transport-level peer it arrived from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source_peer: NodeId,
    pub envelope: Envelope,
}

impl InboundMessage {
    pub fn new(source_peer: NodeId, envelope: Envelope) -> Self {
        Self { source_peer, envelope }
    }

    pub fn message_type(&self) -> Result<MessageType, MessageError> {
        self.envelope.message_type()
    }

    /// Decodes the payload as `T`, mapping decode failures to
    /// [`MessageError::MalformedPayload`].
    pub fn decode_payload<T: Message + Default>(&self) -> Result<T, MessageError> {
        T::decode(self.envelope.payload.as_slice()).map_err(|e| MessageError::MalformedPayload(e.to_string()))
    }
}

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

use agora_common::ApiError;
use agora_comms::{error::CommsError, message::MessageError};
use log::*;
use thiserror::Error;

use crate::storage::MarketStorageError;

const LOG_TARGET: &str = "market::messaging";

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Storage error: {0}")]
    StorageError(#[from] MarketStorageError),
    #[error("Comms error: {0}")]
    CommsError(#[from] CommsError),
    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),
    #[error("Undecodable stored envelope: {0}")]
    DecodeError(#[from] prost::DecodeError),
    #[error("Handler error: {0}")]
    HandlerError(String),
    #[error("An unsequenced envelope cannot be parked")]
    UnsequencedEnvelope,
    #[error("The messenger has shut down")]
    Shutdown,
}

impl From<diesel::result::Error> for MessagingError {
    fn from(err: diesel::result::Error) -> Self {
        MessagingError::StorageError(err.into())
    }
}

impl MessagingError {
    /// True when the failure is a specific peer not responding rather than a
    /// local fault.
    pub fn is_peer_unreachable(&self) -> bool {
        matches!(
            self,
            MessagingError::CommsError(
                CommsError::SendTimeout { .. } | CommsError::DialFailed { .. } | CommsError::ConnectionClosed(_)
            )
        )
    }
}

impl From<MessagingError> for ApiError {
    fn from(err: MessagingError) -> Self {
        if err.is_peer_unreachable() {
            return ApiError::peer_unreachable(err.to_string());
        }
        error!(target: LOG_TARGET, "Internal messaging error: {}", err);
        ApiError::internal(err.to_string())
    }
}

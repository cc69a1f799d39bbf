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
use log::*;
use thiserror::Error;

use crate::{content_store::error::ContentStoreError, storage::MarketStorageError};

const LOG_TARGET: &str = "market::publisher";

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Storage error: {0}")]
    StorageError(#[from] MarketStorageError),
    #[error("Content store error: {0}")]
    ContentStoreError(#[from] ContentStoreError),
    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Invalid name record: {0}")]
    BadRecord(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("No published snapshot found for {0}")]
    NotFound(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("The publisher service has shut down")]
    Shutdown,
}

impl From<PublisherError> for ApiError {
    fn from(err: PublisherError) -> Self {
        match err {
            PublisherError::Timeout(_) => ApiError::peer_unreachable(err.to_string()),
            PublisherError::NotFound(_) => ApiError::not_found(err.to_string()),
            PublisherError::ContentStoreError(inner) => inner.into(),
            other => {
                error!(target: LOG_TARGET, "Internal publisher error: {}", other);
                ApiError::internal(other.to_string())
            },
        }
    }
}

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

use crate::storage::MarketStorageError;

const LOG_TARGET: &str = "market::content_store";

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    StorageError(#[from] MarketStorageError),
    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid listing slug: `{0}`")]
    InvalidSlug(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Listing signature failed verification")]
    BadListingSignature,
    #[error("The transaction was already finished")]
    TransactionFinished,
}

impl From<ContentStoreError> for ApiError {
    fn from(err: ContentStoreError) -> Self {
        match err {
            ContentStoreError::InvalidSlug(_) |
            ContentStoreError::BadListingSignature |
            ContentStoreError::TransactionFinished => ApiError::bad_request(err.to_string()),
            ContentStoreError::NotFound(_) => ApiError::not_found(err.to_string()),
            other => {
                error!(target: LOG_TARGET, "Internal content store error: {}", other);
                ApiError::internal(other.to_string())
            },
        }
    }
}

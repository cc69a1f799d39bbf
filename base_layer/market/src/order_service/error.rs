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
use agora_comms::message::MessageError;
use agora_key_manager::KeyManagerError;
use log::*;
use thiserror::Error;

use crate::{
    content_store::error::ContentStoreError,
    messaging::error::MessagingError,
    storage::{orders::OrderState, MarketStorageError},
    wallet::WalletError,
};

const LOG_TARGET: &str = "market::order_service";

#[derive(Debug, Error)]
pub enum OrderServiceError {
    #[error("Storage error: {0}")]
    StorageError(#[from] MarketStorageError),
    #[error("Messaging error: {0}")]
    MessagingError(#[from] MessagingError),
    #[error("Wallet error: {0}")]
    WalletError(#[from] WalletError),
    #[error("Key error: {0}")]
    KeyManagerError(#[from] KeyManagerError),
    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),
    #[error("Content store error: {0}")]
    ContentStoreError(#[from] ContentStoreError),
    #[error("Stored contract is undecodable: {0}")]
    BadContract(#[from] prost::DecodeError),
    #[error("Order {0} not found")]
    OrderNotFound(String),
    #[error("No dispute case for order {0}")]
    CaseNotFound(String),
    #[error("Order {order_id} is in state {state:?}, cannot {action}")]
    InvalidState {
        order_id: String,
        state: OrderState,
        action: &'static str,
    },
    #[error("Wrong role for {action} on order {order_id}")]
    InvalidRole { order_id: String, action: &'static str },
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Nothing left to refund on order {0}")]
    NothingToRefund(String),
}

impl From<diesel::result::Error> for OrderServiceError {
    fn from(err: diesel::result::Error) -> Self {
        OrderServiceError::StorageError(err.into())
    }
}

impl From<OrderServiceError> for ApiError {
    fn from(err: OrderServiceError) -> Self {
        match err {
            OrderServiceError::BadRequest(_) |
            OrderServiceError::InvalidState { .. } |
            OrderServiceError::InvalidRole { .. } |
            OrderServiceError::NothingToRefund(_) => ApiError::bad_request(err.to_string()),
            OrderServiceError::OrderNotFound(_) | OrderServiceError::CaseNotFound(_) => {
                ApiError::not_found(err.to_string())
            },
            OrderServiceError::WalletError(_) => ApiError::wallet(err.to_string()),
            OrderServiceError::MessagingError(inner) => inner.into(),
            OrderServiceError::ContentStoreError(inner) => inner.into(),
            other => {
                error!(target: LOG_TARGET, "Internal order service error: {}", other);
                ApiError::internal(other.to_string())
            },
        }
    }
}

#[cfg(test)]
mod test {
    use agora_common::ApiErrorKind;

    use super::*;

    #[test]
    fn public_mapping_keeps_the_kind() {
        let err: ApiError = OrderServiceError::OrderNotFound("ord-1".to_string()).into();
        assert_eq!(err.kind, ApiErrorKind::NotFound);
        let err: ApiError = OrderServiceError::BadRequest("overall score out of range".to_string()).into();
        assert_eq!(err.kind, ApiErrorKind::BadRequest);
        let err: ApiError = OrderServiceError::WalletError(WalletError::Backend("no utxos".to_string())).into();
        assert_eq!(err.kind, ApiErrorKind::WalletError);
    }
}

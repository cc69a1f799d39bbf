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

/// The error kinds surfaced to callers of the node's public operations. Internal
/// service errors are mapped onto one of these before leaving the node boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Caller-visible validation failure (missing field, invalid slug, unknown
    /// currency, unknown moderator, invalid state for the requested action).
    BadRequest,
    /// An expected record is missing locally or on the network.
    NotFound,
    /// Timed out awaiting a response from a specific peer.
    PeerUnreachable,
    /// Wrapped error from an external wallet.
    WalletError,
    /// Everything else. Logged at error level at the point of mapping.
    Internal,
}

impl ApiErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ApiErrorKind::BadRequest => "bad-request",
            ApiErrorKind::NotFound => "not-found",
            ApiErrorKind::PeerUnreachable => "peer-unreachable",
            ApiErrorKind::WalletError => "wallet-error",
            ApiErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new<M: Into<String>>(kind: ApiErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request<M: Into<String>>(message: M) -> Self {
        Self::new(ApiErrorKind::BadRequest, message)
    }

    pub fn not_found<M: Into<String>>(message: M) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    pub fn peer_unreachable<M: Into<String>>(message: M) -> Self {
        Self::new(ApiErrorKind::PeerUnreachable, message)
    }

    pub fn wallet<M: Into<String>>(message: M) -> Self {
        Self::new(ApiErrorKind::WalletError, message)
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::new(ApiErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = ApiError::bad_request("slug contains spaces");
        assert_eq!(err.to_string(), "bad-request error: slug contains spaces");
    }
}

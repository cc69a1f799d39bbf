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

/// Errors that terminate the application. The CLI contract is exit code 0 for a clean
/// shutdown and 1 for configuration or startup failures; `as_i32` maps every variant
/// onto 1 while preserving the reason in the message.
#[derive(Debug, Error, PartialEq)]
pub enum ExitError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Data directory error: {0}")]
    DataDirError(String),
    #[error("The application encountered a database error: {0}")]
    DatabaseError(String),
    #[error("Network startup error: {0}")]
    NetworkError(String),
    #[error("Identity error: {0}")]
    IdentityError(String),
    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl ExitError {
    pub fn as_i32(&self) -> i32 {
        1
    }

    pub fn eprint_details(&self) {
        eprintln!("{}", self);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn startup_failures_exit_one() {
        assert_eq!(ExitError::ConfigError("x".to_string()).as_i32(), 1);
        assert_eq!(ExitError::UnknownError("x".to_string()).as_i32(), 1);
    }
}

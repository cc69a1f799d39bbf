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

use diesel::result::Error as DieselError;

/// Asserts that a write affected the expected number of rows, mapping a mismatch of
/// zero rows to `NotFound` so that callers can use their usual not-found handling.
pub trait ExpectedRowsExtension {
    fn num_rows_affected_or_not_found(self, expected: usize) -> Result<usize, DieselError>;
}

impl ExpectedRowsExtension for Result<usize, DieselError> {
    fn num_rows_affected_or_not_found(self, expected: usize) -> Result<usize, DieselError> {
        match self {
            Ok(0) if expected > 0 => Err(DieselError::NotFound),
            Ok(rows) => Ok(rows),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_rows_is_not_found() {
        let res: Result<usize, DieselError> = Ok(0);
        assert!(matches!(
            res.num_rows_affected_or_not_found(1),
            Err(DieselError::NotFound)
        ));
        let res: Result<usize, DieselError> = Ok(1);
        assert_eq!(res.num_rows_affected_or_not_found(1).unwrap(), 1);
    }
}

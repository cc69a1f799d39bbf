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

//! All relational state of a market node lives in one sqlite file. Row types and
//! their operations are grouped per concern below; every operation takes a
//! `&mut SqliteConnection` so that callers can compose them into a single
//! transaction (the parking buffer, the reliable messenger and the order handlers
//! all rely on committing their effects atomically).

pub mod cache;
pub mod chat;
pub mod follow;
pub mod kv;
pub mod messages;
pub mod orders;

use diesel::{Connection, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::*;
use thiserror::Error;

use agora_common_sqlite::{
    connection::{DbConnection, DbConnectionUrl, PooledDbConnection},
    error::SqliteStorageError,
};

const LOG_TARGET: &str = "market::storage";

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[derive(Debug, Error)]
pub enum MarketStorageError {
    #[error("Storage error: {0}")]
    SqliteStorageError(#[from] SqliteStorageError),
    #[error("Database error: {0}")]
    DieselError(#[from] diesel::result::Error),
    #[error("The record was not found")]
    NotFound,
    #[error("Conversion error: {0}")]
    ConversionError(String),
}

/// The pooled, migrated market database.
#[derive(Clone)]
pub struct MarketDatabase {
    connection: DbConnection,
}

impl MarketDatabase {
    /// Opens (creating if necessary) the database and applies pending migrations.
    pub fn connect(url: &DbConnectionUrl) -> Result<Self, MarketStorageError> {
        let connection = DbConnection::connect_url(url)?;
        {
            let mut conn = connection.get_pooled_connection()?;
            let applied = conn
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| SqliteStorageError::DatabaseMigrationError(e.to_string()))?;
            if !applied.is_empty() {
                info!(target: LOG_TARGET, "Applied {} database migration(s)", applied.len());
            }
        }
        Ok(Self { connection })
    }

    pub fn with_connection<T, F>(&self, f: F) -> Result<T, MarketStorageError>
    where F: FnOnce(&mut SqliteConnection) -> Result<T, MarketStorageError> {
        let mut conn = self.connection.get_pooled_connection()?;
        f(&mut conn)
    }

    /// Runs `f` inside a single database transaction. Any error rolls everything
    /// back.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, MarketStorageError>
    where F: FnOnce(&mut SqliteConnection) -> Result<T, MarketStorageError> {
        let mut conn = self.connection.get_pooled_connection()?;
        (&mut *conn).transaction(f)
    }

    /// As [`transaction`], but with the caller's error type so service-level
    /// failures roll the transaction back without being re-wrapped.
    ///
    /// [`transaction`]: MarketDatabase::transaction
    pub fn transaction_with<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<MarketStorageError> + From<diesel::result::Error>,
        F: FnOnce(&mut SqliteConnection) -> Result<T, E>,
    {
        let mut conn = self
            .connection
            .get_pooled_connection()
            .map_err(MarketStorageError::from)?;
        (&mut *conn).transaction(f)
    }
}

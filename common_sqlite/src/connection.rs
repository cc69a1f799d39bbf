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

use std::{
    convert::TryFrom,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use diesel::{
    r2d2::{ConnectionManager, Pool, PooledConnection},
    SqliteConnection,
};
use log::*;

use crate::{connection_options::ConnectionOptions, error::SqliteStorageError};

const LOG_TARGET: &str = "common_sqlite::connection";

const DEFAULT_POOL_SIZE: usize = 16;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the sqlite file lives. `Memory` is used by tests; a shared-cache in-memory
/// database behaves like a file as long as the pool keeps at least one connection open.
#[derive(Debug, Clone)]
pub enum DbConnectionUrl {
    File(PathBuf),
    Memory(String),
}

impl DbConnectionUrl {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        DbConnectionUrl::File(path.as_ref().to_path_buf())
    }

    pub fn memory(name: String) -> Self {
        DbConnectionUrl::Memory(name)
    }

    pub fn to_url_string(&self) -> String {
        match self {
            DbConnectionUrl::File(path) => path.to_string_lossy().into_owned(),
            DbConnectionUrl::Memory(name) => format!("file:{}?mode=memory&cache=shared", name),
        }
    }
}

impl TryFrom<String> for DbConnectionUrl {
    type Error = SqliteStorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(SqliteStorageError::ConversionError("empty database path".to_string()));
        }
        Ok(DbConnectionUrl::File(PathBuf::from(value)))
    }
}

impl fmt::Display for DbConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url_string())
    }
}

/// A backend-agnostic handle to a pooled sqlite connection.
pub trait PooledDbConnection: Send + Sync + Clone {
    type Error;

    fn get_pooled_connection(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, Self::Error>;
}

/// A pool of connections to a single sqlite database file.
#[derive(Clone)]
pub struct DbConnection {
    pool: Pool<ConnectionManager<SqliteConnection>>,
    url: DbConnectionUrl,
}

impl DbConnection {
    /// Connect to the database, creating the pool with WAL and foreign keys enabled.
    pub fn connect_url(url: &DbConnectionUrl) -> Result<Self, SqliteStorageError> {
        Self::connect_with_pool_size(url, DEFAULT_POOL_SIZE)
    }

    pub fn connect_with_pool_size(url: &DbConnectionUrl, pool_size: usize) -> Result<Self, SqliteStorageError> {
        debug!(target: LOG_TARGET, "Connecting to sqlite database '{}'", url);
        let options = ConnectionOptions::new(true, true, DEFAULT_BUSY_TIMEOUT);
        let pool = Pool::builder()
            .max_size(u32::try_from(pool_size)?)
            .min_idle(Some(1))
            .connection_customizer(Box::new(options))
            .build(ConnectionManager::<SqliteConnection>::new(url.to_url_string()))
            .map_err(|e| SqliteStorageError::DieselR2d2Error(e.to_string()))?;
        Ok(Self { pool, url: url.clone() })
    }

    pub fn url(&self) -> &DbConnectionUrl {
        &self.url
    }
}

impl PooledDbConnection for DbConnection {
    type Error = SqliteStorageError;

    fn get_pooled_connection(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, Self::Error> {
        self.pool.get().map_err(|e| {
            warn!(
                target: LOG_TARGET,
                "Connection pool state {:?}: {}",
                self.pool.state(),
                e
            );
            SqliteStorageError::DieselR2d2Error(e.to_string())
        })
    }
}

#[cfg(test)]
mod test {
    use diesel::{connection::SimpleConnection, RunQueryDsl};

    use super::*;

    #[test]
    fn memory_url_round_trip() {
        let url = DbConnectionUrl::memory("connection_test".to_string());
        assert!(url.to_url_string().contains("mode=memory"));
    }

    #[test]
    fn connect_and_query() {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(8));
        let db = DbConnection::connect_url(&url).unwrap();
        let mut conn = db.get_pooled_connection().unwrap();
        conn.batch_execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
            .unwrap();
        let n = diesel::sql_query("INSERT INTO t (v) VALUES ('x')")
            .execute(&mut conn)
            .unwrap();
        assert_eq!(n, 1);
    }
}

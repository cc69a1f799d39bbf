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

use diesel::{prelude::*, SqliteConnection};

use super::MarketStorageError;
use crate::schema::{coupons, kv};

/// Well-known keys in the generic key-value table.
pub const KV_KEY_SEED: &str = "seed";
pub const KV_KEY_MNEMONIC: &str = "mnemonic";
pub const KV_KEY_IDENTITY: &str = "identity";
pub const KV_KEY_NAME_SEQUENCE: &str = "name_sequence";

pub struct KeyValue;

impl KeyValue {
    pub fn set(conn: &mut SqliteConnection, key: &str, value: &[u8]) -> Result<(), MarketStorageError> {
        let updated = diesel::update(kv::table.filter(kv::key.eq(key)))
            .set(kv::value.eq(value))
            .execute(conn)?;
        if updated == 0 {
            diesel::insert_into(kv::table)
                .values((kv::key.eq(key), kv::value.eq(value)))
                .execute(conn)?;
        }
        Ok(())
    }

    pub fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<Vec<u8>>, MarketStorageError> {
        Ok(kv::table
            .filter(kv::key.eq(key))
            .select(kv::value)
            .first(conn)
            .optional()?)
    }
}

/// Private coupon-code storage: the public listing carries only the hash, the code
/// itself stays local so the vendor can match redemptions.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = coupons)]
pub struct CouponSql {
    pub slug: String,
    pub hash: String,
    pub code: String,
}

impl CouponSql {
    pub fn replace_for_slug(
        conn: &mut SqliteConnection,
        slug: &str,
        entries: &[CouponSql],
    ) -> Result<(), MarketStorageError> {
        diesel::delete(coupons::table.filter(coupons::slug.eq(slug))).execute(conn)?;
        for entry in entries {
            diesel::insert_into(coupons::table).values(entry).execute(conn)?;
        }
        Ok(())
    }

    pub fn for_slug(conn: &mut SqliteConnection, slug: &str) -> Result<Vec<Self>, MarketStorageError> {
        Ok(coupons::table
            .filter(coupons::slug.eq(slug))
            .order(coupons::hash.asc())
            .load::<Self>(conn)?)
    }

    pub fn code_for_hash(conn: &mut SqliteConnection, hash: &str) -> Result<Option<String>, MarketStorageError> {
        Ok(coupons::table
            .filter(coupons::hash.eq(hash))
            .select(coupons::code)
            .first(conn)
            .optional()?)
    }
}

#[cfg(test)]
mod test {
    use agora_common_sqlite::connection::DbConnectionUrl;

    use super::*;
    use crate::storage::MarketDatabase;

    fn test_db() -> MarketDatabase {
        let url = DbConnectionUrl::memory(agora_test_utils::random::string(12));
        MarketDatabase::connect(&url).unwrap()
    }

    #[test]
    fn kv_set_get_overwrite() {
        let db = test_db();
        db.with_connection(|conn| {
            assert!(KeyValue::get(conn, KV_KEY_SEED)?.is_none());
            KeyValue::set(conn, KV_KEY_SEED, &[1, 2, 3])?;
            KeyValue::set(conn, KV_KEY_SEED, &[4, 5])?;
            assert_eq!(KeyValue::get(conn, KV_KEY_SEED)?, Some(vec![4, 5]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn coupons_replaced_per_slug() {
        let db = test_db();
        db.with_connection(|conn| {
            let first = vec![CouponSql {
                slug: "hat".to_string(),
                hash: "h1".to_string(),
                code: "SUMMER".to_string(),
            }];
            CouponSql::replace_for_slug(conn, "hat", &first)?;
            let second = vec![CouponSql {
                slug: "hat".to_string(),
                hash: "h2".to_string(),
                code: "WINTER".to_string(),
            }];
            CouponSql::replace_for_slug(conn, "hat", &second)?;
            let stored = CouponSql::for_slug(conn, "hat")?;
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].hash, "h2");
            assert_eq!(CouponSql::code_for_hash(conn, "h2")?, Some("WINTER".to_string()));
            assert_eq!(CouponSql::code_for_hash(conn, "h1")?, None);
            Ok(())
        })
        .unwrap();
    }
}

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

//! The public snapshot on disk, written through staged transactions.
//!
//! A transaction stages every write in memory and applies nothing until
//! `commit()`. Commit writes the disk files first (remembering the previous
//! contents), then runs the staged relational operations in one database
//! transaction; if the relational side fails, the disk writes are reverted
//! best-effort from the rollback cache. A process-wide async mutex makes the
//! store single-writer.

pub mod error;
pub mod records;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use agora_comms::node_identity::NodeIdentity;
use diesel::SqliteConnection;
use log::*;
use tokio::sync::{Mutex, OwnedMutexGuard};

use self::{
    error::ContentStoreError,
    records::{Coupon, CouponInput, Listing, ListingIndexEntry, Profile, Rating, RatingIndexEntry},
};
use crate::storage::{kv::CouponSql, MarketDatabase};

const LOG_TARGET: &str = "market::content_store";

pub const PROFILE_FILE: &str = "profile.json";
pub const FOLLOWERS_FILE: &str = "followers.json";
pub const FOLLOWING_FILE: &str = "following.json";
pub const LISTING_INDEX_FILE: &str = "listings.json";
pub const RATING_INDEX_FILE: &str = "ratings.json";

pub const IMAGE_SIZES: [&str; 5] = ["tiny", "small", "medium", "large", "original"];

type DbOp = Box<dyn FnOnce(&mut SqliteConnection) -> Result<(), ContentStoreError> + Send>;

fn validate_slug(slug: &str) -> Result<(), ContentStoreError> {
    let ok = !slug.is_empty() &&
        !slug.contains(' ') &&
        !slug.contains('/') &&
        !slug.contains('\\') &&
        !slug.contains("..");
    if ok {
        Ok(())
    } else {
        Err(ContentStoreError::InvalidSlug(slug.to_string()))
    }
}

fn listing_path(slug: &str) -> String {
    format!("listings/{}.json", slug)
}

fn rating_path(prefix: &str) -> String {
    format!("ratings/{}.json", prefix)
}

/// The store handle. Clones share the writer lock.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    db: MarketDatabase,
    identity: Arc<NodeIdentity>,
    write_lock: Arc<Mutex<()>>,
}

impl ContentStore {
    /// Opens the store rooted at `<root>/`, creating the directory skeleton.
    pub fn new(root: PathBuf, db: MarketDatabase, identity: Arc<NodeIdentity>) -> Result<Self, ContentStoreError> {
        fs::create_dir_all(root.join("listings"))?;
        fs::create_dir_all(root.join("ratings"))?;
        for size in IMAGE_SIZES {
            fs::create_dir_all(root.join("images").join(size))?;
        }
        Ok(Self {
            root,
            db,
            identity,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begins a staged transaction, waiting for any other writer to finish.
    pub async fn begin(&self) -> StoreTransaction {
        let guard = self.write_lock.clone().lock_owned().await;
        StoreTransaction {
            root: self.root.clone(),
            db: self.db.clone(),
            identity: self.identity.clone(),
            commit_cache: BTreeMap::new(),
            db_ops: Vec::new(),
            finished: false,
            _guard: guard,
        }
    }

    fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, ContentStoreError> {
        match fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn profile(&self) -> Result<Option<Profile>, ContentStoreError> {
        self.read(PROFILE_FILE)?.map(|b| Ok(serde_json::from_slice(&b)?)).transpose()
    }

    pub fn listing(&self, slug: &str) -> Result<Option<Listing>, ContentStoreError> {
        validate_slug(slug)?;
        self.read(&listing_path(slug))?
            .map(|b| Ok(serde_json::from_slice(&b)?))
            .transpose()
    }

    pub fn listing_index(&self) -> Result<Vec<ListingIndexEntry>, ContentStoreError> {
        Ok(self
            .read(LISTING_INDEX_FILE)?
            .map(|b| serde_json::from_slice(&b))
            .transpose()?
            .unwrap_or_default())
    }

    pub fn rating_index(&self) -> Result<Vec<RatingIndexEntry>, ContentStoreError> {
        Ok(self
            .read(RATING_INDEX_FILE)?
            .map(|b| serde_json::from_slice(&b))
            .transpose()?
            .unwrap_or_default())
    }

    /// Every file of the snapshot as `(relative path, contents)`, sorted by path.
    /// This is the publisher's input.
    pub fn snapshot_files(&self) -> Result<Vec<(String, Vec<u8>)>, ContentStoreError> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path
                        .strip_prefix(&self.root)
                        .map_err(|_| ContentStoreError::NotFound(path.display().to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    files.push((rel, fs::read(&path)?));
                }
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

/// A staged write transaction over the snapshot and its private indexes.
pub struct StoreTransaction {
    root: PathBuf,
    db: MarketDatabase,
    identity: Arc<NodeIdentity>,
    /// Staged file contents; `None` stages a deletion.
    commit_cache: BTreeMap<String, Option<Vec<u8>>>,
    db_ops: Vec<DbOp>,
    finished: bool,
    _guard: OwnedMutexGuard<()>,
}

impl StoreTransaction {
    fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, ContentStoreError> {
        if let Some(staged) = self.commit_cache.get(rel) {
            return Ok(staged.clone());
        }
        match fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stage(&mut self, rel: &str, bytes: Vec<u8>) {
        self.commit_cache.insert(rel.to_string(), Some(bytes));
    }

    fn stage_json<T: serde::Serialize>(&mut self, rel: &str, value: &T) -> Result<(), ContentStoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.stage(rel, bytes);
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, rel: &str) -> Result<Option<T>, ContentStoreError> {
        self.read(rel)?.map(|b| Ok(serde_json::from_slice(&b)?)).transpose()
    }

    pub fn get_profile(&self) -> Result<Option<Profile>, ContentStoreError> {
        self.read_json(PROFILE_FILE)
    }

    pub fn set_profile(&mut self, profile: &Profile) -> Result<(), ContentStoreError> {
        self.stage_json(PROFILE_FILE, profile)
    }

    pub fn get_followers(&self) -> Result<Vec<String>, ContentStoreError> {
        Ok(self.read_json(FOLLOWERS_FILE)?.unwrap_or_default())
    }

    pub fn set_followers(&mut self, followers: &[String]) -> Result<(), ContentStoreError> {
        self.stage_json(FOLLOWERS_FILE, &followers)
    }

    pub fn get_following(&self) -> Result<Vec<String>, ContentStoreError> {
        Ok(self.read_json(FOLLOWING_FILE)?.unwrap_or_default())
    }

    pub fn set_following(&mut self, following: &[String]) -> Result<(), ContentStoreError> {
        self.stage_json(FOLLOWING_FILE, &following)
    }

    pub fn get_listing(&self, slug: &str) -> Result<Option<Listing>, ContentStoreError> {
        validate_slug(slug)?;
        self.read_json(&listing_path(slug))
    }

    pub fn get_listing_index(&self) -> Result<Vec<ListingIndexEntry>, ContentStoreError> {
        Ok(self.read_json(LISTING_INDEX_FILE)?.unwrap_or_default())
    }

    /// Stages a listing write. The listing is stamped with the vendor id, its
    /// coupon codes are replaced by hashes (the codes are kept privately), it is
    /// signed with the vendor identity and the listing index is refreshed.
    pub fn set_listing(&mut self, mut listing: Listing, coupons: Vec<CouponInput>) -> Result<(), ContentStoreError> {
        validate_slug(&listing.slug)?;
        listing.vendor_id = self.identity.node_id().to_string();
        listing.coupons = coupons
            .iter()
            .map(|c| Coupon {
                title: c.title.clone(),
                discount: c.discount.clone(),
                hash: c.hash(),
            })
            .collect();
        listing.signature = String::new();
        let signature = self.identity.sign(&listing.signing_bytes()?);
        listing.signature = hex::encode(signature.to_bytes());

        let bytes = serde_json::to_vec_pretty(&listing)?;
        let content_hash = Listing::content_hash(&bytes);
        let slug = listing.slug.clone();
        self.stage(&listing_path(&slug), bytes);

        let mut index = self.get_listing_index()?;
        index.retain(|e| e.slug != slug);
        index.push(ListingIndexEntry {
            slug: slug.clone(),
            title: listing.title.clone(),
            price: listing.price,
            currency: listing.currency.clone(),
            content_hash,
        });
        index.sort_by(|a, b| a.slug.cmp(&b.slug));
        self.stage_json(LISTING_INDEX_FILE, &index)?;

        let rows: Vec<CouponSql> = coupons
            .iter()
            .map(|c| CouponSql {
                slug: slug.clone(),
                hash: c.hash(),
                code: c.code.clone(),
            })
            .collect();
        let op_slug = slug;
        self.db_ops.push(Box::new(move |conn| {
            CouponSql::replace_for_slug(conn, &op_slug, &rows)?;
            Ok(())
        }));
        Ok(())
    }

    pub fn remove_listing(&mut self, slug: &str) -> Result<(), ContentStoreError> {
        validate_slug(slug)?;
        if self.get_listing(slug)?.is_none() {
            return Err(ContentStoreError::NotFound(slug.to_string()));
        }
        self.commit_cache.insert(listing_path(slug), None);
        let mut index = self.get_listing_index()?;
        index.retain(|e| e.slug != slug);
        self.stage_json(LISTING_INDEX_FILE, &index)?;
        let op_slug = slug.to_string();
        self.db_ops.push(Box::new(move |conn| {
            CouponSql::replace_for_slug(conn, &op_slug, &[])?;
            Ok(())
        }));
        Ok(())
    }

    pub fn get_rating(&self, prefix: &str) -> Result<Option<Rating>, ContentStoreError> {
        self.read_json(&rating_path(prefix))
    }

    pub fn get_rating_index(&self) -> Result<Vec<RatingIndexEntry>, ContentStoreError> {
        Ok(self.read_json(RATING_INDEX_FILE)?.unwrap_or_default())
    }

    pub fn set_rating(&mut self, rating: &Rating) -> Result<(), ContentStoreError> {
        let prefix = rating.id_prefix();
        self.stage_json(&rating_path(&prefix), rating)?;
        let mut index = self.get_rating_index()?;
        index.retain(|e| e.id != prefix);
        index.push(RatingIndexEntry {
            id: prefix,
            overall: rating.overall,
        });
        index.sort_by(|a, b| a.id.cmp(&b.id));
        self.stage_json(RATING_INDEX_FILE, &index)
    }

    pub fn get_image(&self, size: &str, name: &str) -> Result<Option<Vec<u8>>, ContentStoreError> {
        self.image_path(size, name).and_then(|rel| self.read(&rel))
    }

    pub fn set_image(&mut self, size: &str, name: &str, bytes: Vec<u8>) -> Result<(), ContentStoreError> {
        let rel = self.image_path(size, name)?;
        self.stage(&rel, bytes);
        Ok(())
    }

    fn image_path(&self, size: &str, name: &str) -> Result<String, ContentStoreError> {
        if !IMAGE_SIZES.contains(&size) {
            return Err(ContentStoreError::InvalidSlug(size.to_string()));
        }
        validate_slug(name)?;
        Ok(format!("images/{}/{}", size, name))
    }

    /// Queues an arbitrary relational operation to run in the commit transaction.
    pub fn push_db_op<F>(&mut self, op: F)
    where F: FnOnce(&mut SqliteConnection) -> Result<(), ContentStoreError> + Send + 'static {
        self.db_ops.push(Box::new(op));
    }

    /// Applies staged disk writes, then the staged relational operations. A
    /// relational failure reverts the disk writes from the rollback cache.
    pub fn commit(mut self) -> Result<(), ContentStoreError> {
        if self.finished {
            return Err(ContentStoreError::TransactionFinished);
        }
        self.finished = true;

        // Previous on-disk contents, captured just before each write.
        let mut rollback_cache: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
        let commit_cache = std::mem::take(&mut self.commit_cache);
        let apply = |root: &Path, rel: &str, value: &Option<Vec<u8>>| -> Result<(), ContentStoreError> {
            let path = root.join(rel);
            match value {
                Some(bytes) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, bytes)?;
                },
                None => {
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                },
            }
            Ok(())
        };

        for (rel, value) in &commit_cache {
            let previous = match fs::read(self.root.join(rel)) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            rollback_cache.insert(rel.clone(), previous);
            apply(&self.root, rel, value)?;
        }

        let db_ops = std::mem::take(&mut self.db_ops);
        if !db_ops.is_empty() {
            let result = self.db.transaction(|conn| {
                for op in db_ops {
                    op(conn).map_err(|e| {
                        crate::storage::MarketStorageError::ConversionError(e.to_string())
                    })?;
                }
                Ok(())
            });
            if let Err(err) = result {
                warn!(
                    target: LOG_TARGET,
                    "Relational commit failed, reverting {} disk write(s): {}",
                    rollback_cache.len(),
                    err
                );
                for (rel, previous) in &rollback_cache {
                    if let Err(revert_err) = apply(&self.root, rel, previous) {
                        error!(target: LOG_TARGET, "Failed to revert '{}': {}", rel, revert_err);
                    }
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Discards all staged writes. Dropping the transaction does the same.
    pub fn rollback(mut self) {
        self.commit_cache.clear();
        self.db_ops.clear();
        self.finished = true;
    }
}

#[cfg(test)]
mod test {
    use agora_common_sqlite::connection::DbConnectionUrl;
    use agora_test_utils::paths::with_temp_dir;

    use super::*;
    use crate::storage::kv::CouponSql;

    fn test_store(root: &Path) -> ContentStore {
        let db = MarketDatabase::connect(&DbConnectionUrl::memory(agora_test_utils::random::string(12))).unwrap();
        ContentStore::new(root.to_path_buf(), db, Arc::new(NodeIdentity::random())).unwrap()
    }

    fn sample_listing(slug: &str) -> Listing {
        Listing {
            slug: slug.to_string(),
            title: "A hat".to_string(),
            description: "Fine headwear".to_string(),
            price: 1000,
            currency: "BTC".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn staged_writes_apply_on_commit_only() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_profile(&Profile {
                    name: "Ron Paul".to_string(),
                    ..Default::default()
                })
                .unwrap();
                // Staged read sees the new value, disk does not.
                assert_eq!(tx.get_profile().unwrap().unwrap().name, "Ron Paul");
                assert!(store.profile().unwrap().is_none());
                tx.commit().unwrap();
            });
            assert_eq!(store.profile().unwrap().unwrap().name, "Ron Paul");
        });
    }

    #[test]
    fn rollback_leaves_disk_untouched() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_followers(&["abc".to_string()]).unwrap();
                tx.rollback();
            });
            assert!(!dir.join(FOLLOWERS_FILE).exists());
        });
    }

    #[test]
    fn repeated_set_reads_latest_staged_value() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_following(&["one".to_string()]).unwrap();
                tx.set_following(&["one".to_string(), "two".to_string()]).unwrap();
                assert_eq!(tx.get_following().unwrap().len(), 2);
                tx.commit().unwrap();
            });
        });
    }

    #[test]
    fn listing_write_signs_hashes_coupons_and_indexes() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            let identity_key = *store.identity.public_key();
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_listing(sample_listing("red-hat"), vec![CouponInput {
                    title: "sale".to_string(),
                    discount: "10%".to_string(),
                    code: "SECRET".to_string(),
                }])
                .unwrap();
                tx.commit().unwrap();
            });

            let listing = store.listing("red-hat").unwrap().unwrap();
            listing.verify(&identity_key).unwrap();
            // The public record carries the hash, never the code.
            assert_eq!(listing.coupons.len(), 1);
            assert!(!listing.coupons[0].hash.contains("SECRET"));

            let index = store.listing_index().unwrap();
            assert_eq!(index.len(), 1);
            assert_eq!(index[0].slug, "red-hat");

            // The code is recoverable privately by hash.
            let code = store
                .db
                .with_connection(|conn| CouponSql::code_for_hash(conn, &listing.coupons[0].hash))
                .unwrap();
            assert_eq!(code, Some("SECRET".to_string()));
        });
    }

    #[test]
    fn invalid_slugs_are_rejected() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                for slug in ["", "has space", "a/b", "a\\b", "dot../dot"] {
                    let err = tx.set_listing(sample_listing(slug), vec![]).unwrap_err();
                    assert!(matches!(err, ContentStoreError::InvalidSlug(_)), "slug {:?}", slug);
                }
                tx.rollback();
            });
        });
    }

    #[test]
    fn failed_relational_commit_reverts_disk() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_profile(&Profile {
                    name: "before".to_string(),
                    ..Default::default()
                })
                .unwrap();
                tx.commit().unwrap();

                let mut tx = store.begin().await;
                tx.set_profile(&Profile {
                    name: "after".to_string(),
                    ..Default::default()
                })
                .unwrap();
                tx.push_db_op(|_conn| Err(ContentStoreError::NotFound("induced".to_string())));
                assert!(tx.commit().is_err());
            });
            // Disk reverted to the committed value.
            assert_eq!(store.profile().unwrap().unwrap().name, "before");
        });
    }

    #[test]
    fn snapshot_files_are_sorted_and_complete() {
        with_temp_dir(|dir| {
            let store = test_store(dir);
            futures::executor::block_on(async {
                let mut tx = store.begin().await;
                tx.set_profile(&Profile::default()).unwrap();
                tx.set_listing(sample_listing("zebra"), vec![]).unwrap();
                tx.set_listing(sample_listing("apple"), vec![]).unwrap();
                tx.commit().unwrap();
            });
            let files = store.snapshot_files().unwrap();
            let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
            assert!(names.contains(&"profile.json"));
            assert!(names.contains(&"listings/apple.json"));
            assert!(names.contains(&"listings/zebra.json"));
            let mut sorted = names.clone();
            sorted.sort();
            assert_eq!(names, sorted);
        });
    }
}

//! Durable backend over the `sled` embedded store.

use std::path::Path;

use super::{space_prefix, Error, RangeFn, Storage};

/// A [`Storage`] implementation sharing one `sled::Db` for every space.
///
/// Spaces map onto key prefixes rather than sled trees so the on-disk
/// layout matches the other backends byte for byte.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(Error::backend)?;
        Ok(SledStorage { db })
    }

    /// Wraps an already-open database handle.
    pub fn with_db(db: sled::Db) -> Self {
        SledStorage { db }
    }

    fn full_key(space: &str, key: &[u8]) -> Vec<u8> {
        let mut full = space_prefix(space);
        full.extend_from_slice(key);
        full
    }

    /// Flushes outstanding writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush().map_err(Error::backend)?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn get(&self, space: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let value = self
            .db
            .get(Self::full_key(space, key))
            .map_err(Error::backend)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn put(&self, space: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.db
            .insert(Self::full_key(space, key), value)
            .map_err(Error::backend)?;
        Ok(())
    }

    fn delete(&self, space: &str, key: &[u8]) -> Result<(), Error> {
        self.db
            .remove(Self::full_key(space, key))
            .map_err(Error::backend)?;
        Ok(())
    }

    fn clear(&self, space: &str) -> Result<(), Error> {
        let prefix = space_prefix(space);
        for entry in self.db.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(Error::backend)?;
            self.db.remove(key).map_err(Error::backend)?;
        }
        Ok(())
    }

    fn range(&self, space: &str, f: &mut RangeFn<'_>) -> Result<(), Error> {
        let prefix = space_prefix(space);
        for entry in self.db.scan_prefix(&prefix) {
            let (key, value) = entry.map_err(Error::backend)?;
            if !f(&key[prefix.len()..], &value) {
                break;
            }
        }
        Ok(())
    }
}

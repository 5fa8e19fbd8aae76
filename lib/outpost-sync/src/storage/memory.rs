//! In-memory backend used by tests and short-lived tooling.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{space_prefix, Error, RangeFn, Storage};

/// A `BTreeMap`-backed [`Storage`] with the same prefixing scheme as the
/// durable backends. Ranges iterate over a snapshot of the space.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(space: &str, key: &[u8]) -> Vec<u8> {
        let mut full = space_prefix(space);
        full.extend_from_slice(key);
        full
    }
}

impl Storage for MemoryStorage {
    fn get(&self, space: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.data.read().get(&Self::full_key(space, key)).cloned())
    }

    fn put(&self, space: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.data
            .write()
            .insert(Self::full_key(space, key), value.to_vec());
        Ok(())
    }

    fn delete(&self, space: &str, key: &[u8]) -> Result<(), Error> {
        self.data.write().remove(&Self::full_key(space, key));
        Ok(())
    }

    fn clear(&self, space: &str) -> Result<(), Error> {
        let prefix = space_prefix(space);
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            data.remove(&key);
        }
        Ok(())
    }

    fn range(&self, space: &str, f: &mut RangeFn<'_>) -> Result<(), Error> {
        let prefix = space_prefix(space);
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_vec(), v.clone()))
            .collect();
        for (key, value) in snapshot {
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

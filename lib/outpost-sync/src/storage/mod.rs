//! Namespaced ordered key-value storage.
//!
//! Every component talks to storage through a logical "space": keys are
//! prefixed `"<space>-"` on disk, and a range over one space never observes
//! keys from another. Backends only need ordered prefix scans.

use std::sync::Arc;

use snafu::Snafu;

mod memory;
mod sled;

pub use self::memory::MemoryStorage;
pub use self::sled::SledStorage;

/// Error raised by a storage backend.
#[derive(Debug, Snafu)]
#[snafu(display("storage backend error: {source}"))]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    pub fn backend<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            source: Box::new(source),
        }
    }
}

/// Continue/stop signal returned by [`Storage::range`] callbacks.
pub type RangeFn<'a> = dyn FnMut(&[u8], &[u8]) -> bool + 'a;

/// Contract every backend implements.
///
/// `range` enumerates all keys within a space in ascending byte order; a
/// snapshot view taken at the start of the scan is sufficient when writes
/// race the iteration.
pub trait Storage: Send + Sync + 'static {
    fn get(&self, space: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn put(&self, space: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn delete(&self, space: &str, key: &[u8]) -> Result<(), Error>;

    fn clear(&self, space: &str) -> Result<(), Error>;

    fn range(&self, space: &str, f: &mut RangeFn<'_>) -> Result<(), Error>;
}

pub(crate) fn space_prefix(space: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(space.len() + 1);
    prefix.extend_from_slice(space.as_bytes());
    prefix.push(b'-');
    prefix
}

/// A storage handle bound to one space.
#[derive(Clone)]
pub(crate) struct SpaceOperation {
    space: String,
    storage: Arc<dyn Storage>,
}

impl SpaceOperation {
    pub(crate) fn new(space: String, storage: Arc<dyn Storage>) -> Self {
        SpaceOperation { space, storage }
    }

    pub(crate) fn space(&self) -> &str {
        &self.space
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.storage.get(&self.space, key)
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.storage.put(&self.space, key, value)
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.storage.delete(&self.space, key)
    }

    pub(crate) fn clear(&self) -> Result<(), Error> {
        self.storage.clear(&self.space)
    }

    pub(crate) fn range(&self, f: &mut RangeFn<'_>) -> Result<(), Error> {
        self.storage.range(&self.space, f)
    }
}

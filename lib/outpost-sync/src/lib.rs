//! Incremental delta synchronization over a namespaced key-value store.
//!
//! The core model: a producer appends `(suid, value)` items to a durable
//! [`DataSet`], fans each id out to per-consumer [`Syncer`] queues, and
//! consumers pull bounded manifest pages, stream the matching items, and
//! replay them in id order against their own dataset, advancing a durable
//! cursor as they go. Consumers can disappear for arbitrarily long and
//! resume from their cursor.

#![deny(missing_debug_implementations)]

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod storage;
pub mod suid;

mod dataset;
mod syncer;

pub use dataset::DataSet;
pub use syncer::Syncer;

use storage::{SpaceOperation, Storage};
use suid::Suid;

const PREFIX: &str = "dsync";

const SPACE_STATE: &str = "state";
const SPACE_DATASET: &str = "dataset";
const SPACE_SYNCER: &str = "syncer";
const SPACE_RELATE: &str = "relate";
const SPACE_TMP: &str = "tmp";

/// Errors surfaced by dataset and syncer operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Replay hit a manifest entry with no staged data; the consumer
    /// should pull a fresh page.
    #[snafu(display("data not match"))]
    DataNotMatch,

    /// A producer-side invariant was violated (for instance an untagged
    /// item with a Nil id).
    #[snafu(display("unexpected state"))]
    UnexpectedState,

    /// The consumer's queue holds nothing past its cursor.
    #[snafu(display("empty manifest"))]
    EmptyManifest,

    /// A tag-only id has no `relate` entry to resolve through.
    #[snafu(display("no entry relates to custom tag {tag:?}"))]
    UnknownRelate { tag: String },

    /// A persisted id failed to parse.
    #[snafu(display("invalid suid: {source}"))]
    InvalidSuid { source: suid::ParseError },

    /// A persisted manifest failed to decode.
    #[snafu(display("invalid manifest: {source}"))]
    Manifest { source: suid::DecodeError },

    /// The storage backend failed.
    #[snafu(display("{source}"))]
    Storage { source: storage::Error },

    /// The consumer's item callback rejected an item.
    #[snafu(display("item callback failed: {source}"))]
    Callback {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// One entry of the replication log.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub uid: Suid,
    #[serde(with = "base64_value")]
    pub value: Vec<u8>,
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("uid", &self.uid)
            .field("value_len", &self.value.len())
            .finish()
    }
}

/// Callback invoked for every item applied during consumer replay.
pub type ItemCallback<'a> =
    dyn FnMut(&Item) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + 'a;

/// One named replication instance over a shared storage handle.
///
/// The instance owns the [`DataSet`] and hands out per-agent [`Syncer`]s
/// that share the instance's spaces. Agent names map to their own mutexes
/// so queue updates for one agent serialize while different agents
/// proceed in parallel.
pub struct Instance {
    name: String,
    storage: Arc<dyn Storage>,
    data_set: Arc<DataSet>,
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("name", &self.name).finish()
    }
}

impl Instance {
    pub fn new(name: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let name = name.into();
        let data_set = Arc::new(DataSet::new(
            SpaceOperation::new(space_name(SPACE_STATE, &name), Arc::clone(&storage)),
            SpaceOperation::new(space_name(SPACE_DATASET, &name), Arc::clone(&storage)),
            SpaceOperation::new(space_name(SPACE_TMP, &name), Arc::clone(&storage)),
            SpaceOperation::new(space_name(SPACE_RELATE, &name), Arc::clone(&storage)),
        ));
        Instance {
            name,
            storage,
            data_set,
            agent_locks: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_set(&self) -> Arc<DataSet> {
        Arc::clone(&self.data_set)
    }

    /// The synchronizer for one named agent.
    pub fn syncer(&self, agent: &str) -> Syncer {
        let lock = self
            .agent_locks
            .entry(agent.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Syncer::new(
            agent.to_owned(),
            lock,
            SpaceOperation::new(space_name(SPACE_SYNCER, &self.name), Arc::clone(&self.storage)),
            SpaceOperation::new(space_name(SPACE_DATASET, &self.name), Arc::clone(&self.storage)),
            SpaceOperation::new(space_name(SPACE_RELATE, &self.name), Arc::clone(&self.storage)),
        )
    }

    /// Wipes every space belonging to this instance.
    pub fn clear(&self) -> Result<(), Error> {
        for space in [
            SPACE_DATASET,
            SPACE_SYNCER,
            SPACE_RELATE,
            SPACE_TMP,
            SPACE_STATE,
        ] {
            self.storage
                .clear(&space_name(space, &self.name))
                .map_err(|source| Error::Storage { source })?;
        }
        Ok(())
    }
}

/// Builds `dsync_<kind>[_<instance>]`, skipping empty segments.
fn space_name(kind: &str, instance: &str) -> String {
    [PREFIX, kind, instance]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

mod base64_value {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::suid::Ksuid;

    #[test]
    fn space_names_skip_empty_segments() {
        assert_eq!(space_name("state", "edge"), "dsync_state_edge");
        assert_eq!(space_name("state", ""), "dsync_state");
    }

    #[test]
    fn item_serializes_value_as_base64() {
        let item = Item {
            uid: Suid::with_custom(Ksuid::from_parts(1, 2u128.to_be_bytes()), "t"),
            value: b"hello".to_vec(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["value"], "aGVsbG8=");
        let back: Item = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn clear_leaves_other_instances_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let a = Instance::new("a", Arc::clone(&storage) as _);
        let b = Instance::new("b", storage as _);

        let item = Item {
            uid: Suid::with_custom(Ksuid::from_parts(1, 1u128.to_be_bytes()), "t"),
            value: b"v".to_vec(),
        };
        a.data_set().add(std::slice::from_ref(&item)).unwrap();
        b.data_set().add(std::slice::from_ref(&item)).unwrap();

        a.clear().unwrap();
        let mut a_count = 0;
        a.data_set()
            .range(&mut |_| {
                a_count += 1;
                true
            })
            .unwrap();
        let mut b_count = 0;
        b.data_set()
            .range(&mut |_| {
                b_count += 1;
                true
            })
            .unwrap();
        assert_eq!((a_count, b_count), (0, 1));
    }
}

//! The authoritative event log and its consumer-side replay machinery.

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::storage::SpaceOperation;
use crate::suid::{AssembleManifest, Ksuid, Suid};
use crate::{Error, InvalidSuidSnafu, Item, ItemCallback, StorageSnafu};

/// Key under which the consumer cursor is persisted in the state space.
const KEY_STATE: &[u8] = b"dsync_state";

/// A durable log of `(suid, value)` items plus the cursor of the local
/// consumer.
///
/// On the producer it holds every observed event together with the
/// `relate` reverse index (custom tag to latest ksuid). On a consumer it
/// additionally stages out-of-order deliveries in the `tmp` space until the
/// pending manifest lets them be applied in ksuid order.
pub struct DataSet {
    state_op: SpaceOperation,
    dataset_op: SpaceOperation,
    tmp_op: SpaceOperation,
    relate_op: SpaceOperation,

    /// Cached cursor; `None` until first read from storage.
    state: Mutex<Option<Suid>>,
    /// The consumer's pending replay plan, held across a whole `sync` walk.
    pending: Mutex<AssembleManifest>,
}

impl std::fmt::Debug for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSet")
            .field("space", &self.dataset_op.space())
            .finish()
    }
}

impl DataSet {
    pub(crate) fn new(
        state_op: SpaceOperation,
        dataset_op: SpaceOperation,
        tmp_op: SpaceOperation,
        relate_op: SpaceOperation,
    ) -> Self {
        DataSet {
            state_op,
            dataset_op,
            tmp_op,
            relate_op,
            state: Mutex::new(None),
            pending: Mutex::new(AssembleManifest::new()),
        }
    }

    /// Resolves a tag-only uid into its full form through the `relate`
    /// index.
    fn complete_uid(&self, uid: &Suid) -> Result<Suid, Error> {
        let Some(tag) = uid.custom() else {
            return Ok(uid.clone());
        };
        let value = self.relate_op.get(tag.as_bytes()).context(StorageSnafu)?;
        let Some(value) = value else {
            return Err(Error::UnknownRelate { tag: tag.to_owned() });
        };
        let ksuid: Ksuid = String::from_utf8_lossy(&value)
            .parse()
            .context(InvalidSuidSnafu)?;
        Ok(Suid::with_custom(ksuid, tag))
    }

    /// Persists and caches a new cursor value.
    pub fn set_state(&self, uid: Suid) -> Result<(), Error> {
        self.state_op
            .put(KEY_STATE, uid.to_string().as_bytes())
            .context(StorageSnafu)?;
        *self.state.lock() = Some(uid);
        Ok(())
    }

    /// The current cursor; Nil when nothing was ever committed.
    pub fn state(&self) -> Suid {
        let mut cached = self.state.lock();
        if let Some(state) = cached.as_ref() {
            return state.clone();
        }
        let state = self
            .state_op
            .get(KEY_STATE)
            .ok()
            .flatten()
            .and_then(|raw| Suid::parse(&String::from_utf8_lossy(&raw)).ok())
            .unwrap_or_default();
        *cached = Some(state.clone());
        state
    }

    /// Fetches one item, resolving tag-only uids first.
    pub fn get(&self, uid: &Suid) -> Result<Item, Error> {
        let uid = self.complete_uid(uid)?;
        let value = self
            .dataset_op
            .get(uid.ksuid().to_string().as_bytes())
            .context(StorageSnafu)?
            .unwrap_or_default();
        Ok(Item { uid, value })
    }

    /// Appends items to the log.
    ///
    /// Tag-only items receive a freshly generated ksuid. Batch order is
    /// producer-declared, so every item is written before the cursor is
    /// compared and advanced; the cursor only ever moves forward.
    pub fn add(&self, items: &[Item]) -> Result<(), Error> {
        for item in items {
            let mut ksuid = item.uid.ksuid();
            if ksuid.is_nil() {
                if !item.uid.is_custom() {
                    return Err(Error::UnexpectedState);
                }
                ksuid = Ksuid::new();
            }

            self.dataset_op
                .put(ksuid.to_string().as_bytes(), &item.value)
                .context(StorageSnafu)?;
            if let Some(tag) = item.uid.custom() {
                // If this write fails the dataset entry is orphaned until
                // the GC reclaims it.
                self.relate_op
                    .put(tag.as_bytes(), ksuid.to_string().as_bytes())
                    .context(StorageSnafu)?;
            }

            if self.state().ksuid() >= ksuid {
                continue;
            }
            let committed = match item.uid.custom() {
                Some(tag) => Suid::with_custom(ksuid, tag),
                None => ksuid.into(),
            };
            self.set_state(committed)?;
        }
        Ok(())
    }

    /// Removes items from the log by uid.
    pub fn del(&self, uids: &[Suid]) -> Result<(), Error> {
        for uid in uids {
            let uid = self.complete_uid(uid)?;
            self.dataset_op
                .delete(uid.ksuid().to_string().as_bytes())
                .context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Drops one `relate` entry. Used by compaction after the dataset
    /// entry it points at has been removed.
    pub fn unrelate(&self, tag: &str) -> Result<(), Error> {
        self.relate_op.delete(tag.as_bytes()).context(StorageSnafu)
    }

    /// Enumerates the log in ksuid order. The callback returns `false` to
    /// stop early.
    pub fn range(&self, f: &mut dyn FnMut(&Item) -> bool) -> Result<(), Error> {
        self.dataset_op
            .range(&mut |key, value| {
                let Ok(uid) = Suid::parse(&String::from_utf8_lossy(key)) else {
                    return true;
                };
                f(&Item {
                    uid,
                    value: value.to_vec(),
                })
            })
            .context(StorageSnafu)
    }

    /// Enumerates the `relate` index as full uids (latest ksuid per tag).
    pub fn range_custom(&self, f: &mut dyn FnMut(&Suid) -> bool) -> Result<(), Error> {
        self.relate_op
            .range(&mut |key, value| {
                let tag = String::from_utf8_lossy(key);
                let Ok(ksuid) = String::from_utf8_lossy(value).parse::<Ksuid>() else {
                    return true;
                };
                f(&Suid::with_custom(ksuid, tag))
            })
            .context(StorageSnafu)
    }

    /// Installs the replay plan for the next [`DataSet::sync`] calls.
    ///
    /// With a committed cursor the plan is filtered down to entries at or
    /// after it; everything earlier was already applied.
    pub fn sync_manifest(&self, manifest: &AssembleManifest) {
        let mut pending = self.pending.lock();
        let state = self.state();
        if state.is_nil() {
            *pending = manifest.clone();
            return;
        }

        let current = state.ksuid();
        let mut filtered = AssembleManifest::new();
        for id in manifest.iter() {
            if id >= current {
                filtered.append_uid(&manifest.get_uid(id));
            }
        }
        *pending = filtered;
    }

    /// Applies delivered items against the pending plan. See
    /// [`DataSet::sync_inner`].
    pub fn sync(&self, items: &[Item], callback: &mut ItemCallback<'_>) -> Result<(), Error> {
        self.sync_inner(items, callback, false)
    }

    /// Like [`DataSet::sync`], but also deletes each applied entry from the
    /// dataset space. Edge nodes use this to bound local storage.
    pub fn sync_and_delete(
        &self,
        items: &[Item],
        callback: &mut ItemCallback<'_>,
    ) -> Result<(), Error> {
        self.sync_inner(items, callback, true)
    }

    /// Stages incoming items, then replays the pending plan in ksuid order.
    ///
    /// Items at or before the cursor are dropped (idempotent replay). The
    /// walk starts at the first plan entry strictly newer than the cursor;
    /// each applied item advances the cursor, so a failure preserves all
    /// progress made so far. A plan entry with no staged value aborts with
    /// [`Error::DataNotMatch`], the signal to pull a fresh page.
    fn sync_inner(
        &self,
        items: &[Item],
        callback: &mut ItemCallback<'_>,
        consume_delete: bool,
    ) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }

        let current = self.state().ksuid();
        let mut staged = 0usize;
        for item in items {
            if item.uid.ksuid() <= current {
                continue;
            }
            self.tmp_op
                .put(item.uid.ksuid().to_string().as_bytes(), &item.value)
                .context(StorageSnafu)?;
            staged += 1;
        }
        if staged == 0 {
            return Ok(());
        }

        let pending = self.pending.lock();
        for id in pending.iter() {
            // Re-read the cursor on every step; it advances as items apply.
            let state = self.state();
            if !state.is_nil() && id <= state.ksuid() {
                continue;
            }

            let key = id.to_string();
            let value = self.tmp_op.get(key.as_bytes()).context(StorageSnafu)?;
            let Some(value) = value else {
                return Err(Error::DataNotMatch);
            };

            let item = Item {
                uid: pending.get_uid(id),
                value,
            };
            self.add(std::slice::from_ref(&item))?;
            callback(&item).map_err(|source| Error::Callback { source })?;

            // Best effort; an orphaned tmp entry is harmless and will be
            // overwritten or cleared later.
            let _ = self.tmp_op.delete(key.as_bytes());
            if consume_delete {
                self.dataset_op
                    .delete(key.as_bytes())
                    .context(StorageSnafu)?;
            }
        }
        Ok(())
    }
}

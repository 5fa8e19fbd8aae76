//! Per-agent outstanding-delta queues.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::storage::SpaceOperation;
use crate::suid::{AssembleManifest, Ksuid, Suid};
use crate::{Error, Item, ManifestSnafu, StorageSnafu};

/// One agent's queue of not-yet-acknowledged ids.
///
/// The queue is persisted as a serialized manifest under the agent's name
/// in the syncer space and is trimmed from the head every time the agent's
/// cursor acknowledges progress. All mutating operations for one agent
/// serialize on a shared per-agent mutex handed out by the instance.
pub struct Syncer {
    name: String,
    lock: Arc<Mutex<()>>,
    syncer_op: SpaceOperation,
    dataset_op: SpaceOperation,
    relate_op: SpaceOperation,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer").field("name", &self.name).finish()
    }
}

impl Syncer {
    pub(crate) fn new(
        name: String,
        lock: Arc<Mutex<()>>,
        syncer_op: SpaceOperation,
        dataset_op: SpaceOperation,
        relate_op: SpaceOperation,
    ) -> Self {
        Syncer {
            name,
            lock,
            syncer_op,
            dataset_op,
            relate_op,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads the stored queue; an absent or empty record is
    /// [`Error::EmptyManifest`].
    fn load(&self) -> Result<AssembleManifest, Error> {
        let value = self
            .syncer_op
            .get(self.name.as_bytes())
            .context(StorageSnafu)?;
        match value {
            Some(raw) if !raw.is_empty() => {
                AssembleManifest::from_bytes(&raw).context(ManifestSnafu)
            }
            _ => Err(Error::EmptyManifest),
        }
    }

    fn load_or_empty(&self) -> Result<AssembleManifest, Error> {
        match self.load() {
            Ok(manifest) => Ok(manifest),
            Err(Error::EmptyManifest) => Ok(AssembleManifest::new()),
            Err(err) => Err(err),
        }
    }

    fn store(&self, manifest: Option<&AssembleManifest>) -> Result<(), Error> {
        let bytes = manifest.map(AssembleManifest::bytes).unwrap_or_default();
        self.syncer_op
            .put(self.name.as_bytes(), &bytes)
            .context(StorageSnafu)
    }

    /// Resolves tag-only uids through `relate`, dropping those no producer
    /// entry exists for yet.
    fn resolve(&self, uids: &[Suid]) -> Result<Vec<Suid>, Error> {
        let mut resolved = Vec::with_capacity(uids.len());
        for uid in uids {
            if !uid.ksuid().is_nil() {
                resolved.push(uid.clone());
                continue;
            }
            let Some(tag) = uid.custom() else {
                continue;
            };
            let Some(value) = self.relate_op.get(tag.as_bytes()).context(StorageSnafu)? else {
                continue;
            };
            let ksuid: Ksuid = String::from_utf8_lossy(&value)
                .parse()
                .map_err(|source| Error::InvalidSuid { source })?;
            if ksuid.is_nil() {
                continue;
            }
            resolved.push(Suid::with_custom(ksuid, tag));
        }
        Ok(resolved)
    }

    /// Enqueues ids for this agent, preserving arrival order.
    pub fn add(&self, uids: &[Suid]) -> Result<(), Error> {
        if uids.is_empty() {
            return Ok(());
        }
        let uids = self.resolve(uids)?;

        let _guard = self.lock.lock();
        let mut manifest = self.load_or_empty()?;
        manifest.append_uids(&uids);
        self.store(Some(&manifest))
    }

    /// Drops ids from the queue.
    pub fn del(&self, uids: &[Suid]) -> Result<(), Error> {
        if uids.is_empty() {
            return Ok(());
        }
        let doomed: HashSet<Ksuid> = uids.iter().map(Suid::ksuid).collect();

        let _guard = self.lock.lock();
        let manifest = self.load_or_empty()?;
        let mut retained = AssembleManifest::new();
        for id in manifest.iter() {
            if !doomed.contains(&id) {
                retained.append_uid(&manifest.get_uid(id));
            }
        }
        self.store(Some(&retained))
    }

    /// Produces the next page for an agent at `cursor`.
    ///
    /// A Nil cursor returns the first `limit` queue entries without
    /// trimming. Otherwise the cursor is appended to the queue, the walk
    /// skips up to and including it, the next `limit` entries form the
    /// page, and everything strictly before the cursor is discarded: the
    /// persisted tail is the cursor plus all later entries, sorted. A tail
    /// of one entry or less means the agent is caught up; the queue record
    /// is cleared and [`Error::EmptyManifest`] tells the caller to
    /// short-circuit. `limit` of zero means unbounded.
    pub fn manifest(&self, cursor: &Suid, limit: usize) -> Result<AssembleManifest, Error> {
        let _guard = self.lock.lock();
        let stored = self.load()?;

        let mut result = AssembleManifest::new();
        let current = cursor.ksuid();

        if current.is_nil() {
            let mut number = 0usize;
            for id in stored.iter() {
                if limit > 0 && number >= limit {
                    break;
                }
                result.append_uid(&stored.get_uid(id));
                number += 1;
            }
            return Ok(result);
        }

        let mut walk = stored;
        walk.append_uid(cursor);

        let mut tail: Vec<Suid> = Vec::new();
        let mut found = false;
        let mut number = 0usize;
        for id in walk.iter() {
            if !found {
                if id == current {
                    found = true;
                    tail.push(walk.get_uid(id));
                }
                continue;
            }
            if limit == 0 || number < limit {
                result.append_uid(&walk.get_uid(id));
                number += 1;
            }
            tail.push(walk.get_uid(id));
        }

        // Nothing past the cursor: the agent is caught up.
        if tail.len() < 2 {
            self.store(None)?;
            return Err(Error::EmptyManifest);
        }

        let mut remaining = AssembleManifest::new();
        remaining.append_uids(&tail);
        remaining.sort();
        self.store(Some(&remaining))?;
        Ok(result)
    }

    /// Fetches the payload for every id in `manifest`.
    ///
    /// Ids with no dataset entry yield empty values; the consumer detects
    /// the gap during replay and retries with a fresh pull.
    pub fn data(&self, manifest: &AssembleManifest) -> Result<Vec<Item>, Error> {
        let mut items = Vec::new();
        for id in manifest.iter() {
            let value = self
                .dataset_op
                .get(id.to_string().as_bytes())
                .context(StorageSnafu)?
                .unwrap_or_default();
            items.push(Item {
                uid: manifest.get_uid(id),
                value,
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::storage::MemoryStorage;
    use crate::suid::{Ksuid, Suid};
    use crate::{Error, Instance, Item};

    fn instance() -> Instance {
        Instance::new("test", Arc::new(MemoryStorage::new()))
    }

    fn uid(ts: u32, n: u128, tag: &str) -> Suid {
        Suid::with_custom(Ksuid::from_parts(ts, n.to_be_bytes()), tag)
    }

    #[test]
    fn empty_queue_short_circuits() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        let err = syncer.manifest(&Suid::default(), 100).unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));
    }

    #[test]
    fn nil_cursor_returns_first_page_without_trimming() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        let uids: Vec<Suid> = (1..=5).map(|i| uid(i, 1, &format!("m{i}"))).collect();
        syncer.add(&uids).unwrap();

        let page = syncer.manifest(&Suid::default(), 3).unwrap();
        let got: Vec<Suid> = page.iter().map(|id| page.get_uid(id)).collect();
        assert_eq!(got, uids[..3].to_vec());

        // No trim happened: the same call yields the same page.
        let again = syncer.manifest(&Suid::default(), 3).unwrap();
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn cursor_slices_exclusively_and_trims_the_head() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        let uids: Vec<Suid> = (1..=5).map(|i| uid(i, 1, &format!("m{i}"))).collect();
        syncer.add(&uids).unwrap();

        let page = syncer.manifest(&uids[1], 2).unwrap();
        let got: Vec<Suid> = page.iter().map(|id| page.get_uid(id)).collect();
        // The page excludes the cursor itself.
        assert_eq!(got, vec![uids[2].clone(), uids[3].clone()]);

        // Entries before the cursor are gone; the tail survives.
        let rest = syncer.manifest(&uids[1], 0).unwrap();
        let got: Vec<Suid> = rest.iter().map(|id| rest.get_uid(id)).collect();
        assert_eq!(got, uids[2..].to_vec());
    }

    #[test]
    fn caught_up_cursor_clears_the_queue() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        let uids: Vec<Suid> = (1..=2).map(|i| uid(i, 1, &format!("m{i}"))).collect();
        syncer.add(&uids).unwrap();

        let err = syncer.manifest(&uids[1], 100).unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));

        // The stored record was cleared as well.
        let err = syncer.manifest(&Suid::default(), 100).unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));
    }

    #[test]
    fn unknown_cursor_past_all_entries_still_trims() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        syncer.add(&[uid(1, 1, "m1")]).unwrap();

        // A cursor newer than everything stored: nothing to send.
        let err = syncer.manifest(&uid(9, 1, "m9"), 100).unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));
    }

    #[test]
    fn add_resolves_tag_only_uids_through_relate() {
        let ins = instance();
        let produced = Item {
            uid: uid(3, 3, "v1,Pod,default/p,1"),
            value: b"payload".to_vec(),
        };
        ins.data_set().add(std::slice::from_ref(&produced)).unwrap();

        let syncer = ins.syncer("edge-1");
        syncer
            .add(&[
                Suid::from_custom("v1,Pod,default/p,1"),
                // Not produced yet: silently dropped.
                Suid::from_custom("v1,Pod,default/ghost,1"),
            ])
            .unwrap();

        let page = syncer.manifest(&Suid::default(), 10).unwrap();
        let got: Vec<Suid> = page.iter().map(|id| page.get_uid(id)).collect();
        assert_eq!(got, vec![produced.uid.clone()]);
    }

    #[test]
    fn del_retains_everything_not_listed() {
        let ins = instance();
        let syncer = ins.syncer("edge-1");
        let uids: Vec<Suid> = (1..=3).map(|i| uid(i, 1, &format!("m{i}"))).collect();
        syncer.add(&uids).unwrap();
        syncer.del(std::slice::from_ref(&uids[1])).unwrap();

        let page = syncer.manifest(&Suid::default(), 10).unwrap();
        let got: Vec<Suid> = page.iter().map(|id| page.get_uid(id)).collect();
        assert_eq!(got, vec![uids[0].clone(), uids[2].clone()]);
    }

    #[test]
    fn data_returns_values_and_empty_for_gaps() {
        let ins = instance();
        let produced = Item {
            uid: uid(1, 1, "m1"),
            value: b"one".to_vec(),
        };
        ins.data_set().add(std::slice::from_ref(&produced)).unwrap();

        let syncer = ins.syncer("edge-1");
        syncer.add(&[produced.uid.clone(), uid(2, 1, "m2")]).unwrap();
        let page = syncer.manifest(&Suid::default(), 10).unwrap();

        let items = syncer.data(&page).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value, b"one".to_vec());
        assert!(items[1].value.is_empty());
    }

    #[test]
    fn queues_are_isolated_per_agent() {
        let ins = instance();
        ins.syncer("edge-1").add(&[uid(1, 1, "m1")]).unwrap();

        let err = ins
            .syncer("edge-2")
            .manifest(&Suid::default(), 10)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyManifest));
    }
}

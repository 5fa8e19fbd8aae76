//! Background compaction of the producer-side dataset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use outpost_sync::suid::Suid;
use outpost_sync::DataSet;

use crate::kubernetes::MetaKey;

/// Runs a compaction pass on every tick until cancelled.
pub async fn run(data_set: Arc<DataSet>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => collect(&data_set),
        }
    }
}

/// One compaction pass: for every logical resource keep only the entry
/// with the numerically largest resource version, dropping the rest from
/// both the dataset and the relate index. Never aborts; individual
/// failures are logged and the scan continues.
pub fn collect(data_set: &DataSet) {
    // Snapshot the relate index first so no dataset lock is held while
    // scanning storage.
    let mut entries: Vec<Suid> = Vec::new();
    if let Err(error) = data_set.range_custom(&mut |uid| {
        entries.push(uid.clone());
        true
    }) {
        warn!(message = "Compaction scan failed.", %error);
        return;
    }

    // logical resource -> (resource version, uid) candidates
    let mut groups: HashMap<String, Vec<(u64, Suid)>> = HashMap::new();
    for uid in entries {
        let Some(tag) = uid.custom() else { continue };
        let Ok(meta) = MetaKey::parse(tag) else {
            warn!(message = "Skipping unparseable tag during compaction.", tag = %tag);
            continue;
        };
        let Ok(version) = meta.resource_version.parse::<u64>() else {
            warn!(
                message = "Skipping non-numeric resource version during compaction.",
                tag = %tag,
            );
            continue;
        };
        groups.entry(meta.logical_key()).or_default().push((version, uid.clone()));
    }

    let mut removed = 0usize;
    for (logical, mut candidates) in groups {
        if candidates.len() < 2 {
            continue;
        }
        candidates.sort_by_key(|(version, _)| *version);
        let keep = match candidates.last() {
            Some((_, uid)) => uid.clone(),
            None => continue,
        };
        for (_, uid) in candidates {
            if uid == keep {
                continue;
            }
            if let Err(error) = data_set.del(std::slice::from_ref(&uid)) {
                warn!(message = "Failed to drop stale entry.", %logical, %error);
                continue;
            }
            if let Some(tag) = uid.custom() {
                if let Err(error) = data_set.unrelate(tag) {
                    warn!(message = "Failed to drop stale relate entry.", %logical, %error);
                    continue;
                }
            }
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(message = "Compaction pass finished.", removed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use outpost_sync::storage::MemoryStorage;
    use outpost_sync::suid::{Ksuid, Suid};
    use outpost_sync::{Instance, Item};

    use super::*;

    fn pod_item(resource_version: u32) -> Item {
        Item {
            uid: Suid::with_custom(
                Ksuid::from_parts(resource_version, 1u128.to_be_bytes()),
                format!("v1,Pod,default/web,{resource_version}"),
            ),
            value: format!("{{\"rv\":{resource_version}}}").into_bytes(),
        }
    }

    fn counts(data_set: &DataSet) -> (usize, usize) {
        let mut dataset = 0;
        data_set
            .range(&mut |_| {
                dataset += 1;
                true
            })
            .unwrap();
        let mut relate = 0;
        data_set
            .range_custom(&mut |_| {
                relate += 1;
                true
            })
            .unwrap();
        (dataset, relate)
    }

    #[test]
    fn keeps_only_the_highest_resource_version() {
        let instance = Instance::new("srv", Arc::new(MemoryStorage::new()));
        let data_set = instance.data_set();
        let items: Vec<Item> = (1..=100).map(pod_item).collect();
        data_set.add(&items).unwrap();
        assert_eq!(counts(&data_set), (100, 100));

        collect(&data_set);

        assert_eq!(counts(&data_set), (1, 1));
        let mut tags = Vec::new();
        data_set
            .range_custom(&mut |uid| {
                tags.push(uid.custom().unwrap_or_default().to_owned());
                true
            })
            .unwrap();
        assert_eq!(tags, vec!["v1,Pod,default/web,100".to_owned()]);
    }

    #[test]
    fn distinct_resources_are_untouched() {
        let instance = Instance::new("srv", Arc::new(MemoryStorage::new()));
        let data_set = instance.data_set();
        for (i, tag) in [
            "v1,Pod,default/a,1",
            "v1,Pod,default/b,1",
            "v1,Pod,other/a,1",
            "apps/v1,Deployment,default/a,1",
        ]
        .iter()
        .enumerate()
        {
            data_set
                .add(&[Item {
                    uid: Suid::with_custom(
                        Ksuid::from_parts(i as u32 + 1, 1u128.to_be_bytes()),
                        *tag,
                    ),
                    value: b"{}".to_vec(),
                }])
                .unwrap();
        }

        collect(&data_set);
        assert_eq!(counts(&data_set), (4, 4));
    }

    #[test]
    fn numeric_ordering_beats_lexicographic() {
        let instance = Instance::new("srv", Arc::new(MemoryStorage::new()));
        let data_set = instance.data_set();
        // "9" sorts after "100" lexicographically but not numerically.
        for (ts, rv) in [(1u32, 9u32), (2, 100)] {
            data_set
                .add(&[Item {
                    uid: Suid::with_custom(
                        Ksuid::from_parts(ts, 1u128.to_be_bytes()),
                        format!("v1,Pod,default/web,{rv}"),
                    ),
                    value: b"{}".to_vec(),
                }])
                .unwrap();
        }

        collect(&data_set);

        let mut tags = Vec::new();
        data_set
            .range_custom(&mut |uid| {
                tags.push(uid.custom().unwrap_or_default().to_owned());
                true
            })
            .unwrap();
        assert_eq!(tags, vec!["v1,Pod,default/web,100".to_owned()]);
    }
}

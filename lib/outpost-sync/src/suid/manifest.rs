//! The manifest exchanged between producer and consumers.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, Snafu};

use super::{CompressedSet, Ksuid, Suid};

/// Separator between the compressed id section and the JSON tag map.
const SEP: &[u8] = b"...";

/// Errors produced while decoding a manifest from its byte form.
#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// The tag-map section is not valid JSON.
    #[snafu(display("invalid manifest tag map: {source}"))]
    TagMap { source: serde_json::Error },

    /// The textual form is not valid base64.
    #[snafu(display("invalid manifest encoding: {source}"))]
    Base64 { source: base64::DecodeError },
}

/// An ordered multiset of [`Suid`]s to be synchronized.
///
/// Untagged ids live in the compressed section; tagged ids live in a
/// `ksuid -> tag` map so the tag can be rehydrated independently of the
/// compressed form. [`AssembleManifest::iter`] yields the union of both in
/// ascending ksuid order with duplicates collapsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssembleManifest {
    cs: CompressedSet,
    set: BTreeMap<Ksuid, String>,
}

impl AssembleManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the `<compressed>...<json-map>` byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut manifest = AssembleManifest::default();
        match find_sep(bytes) {
            Some(at) => {
                manifest.cs = CompressedSet::from_bytes(bytes[..at].to_vec());
                manifest.set =
                    serde_json::from_slice(&bytes[at + SEP.len()..]).context(TagMapSnafu)?;
            }
            None => {
                manifest.cs = CompressedSet::from_bytes(bytes.to_vec());
            }
        }
        Ok(manifest)
    }

    /// Appends untagged ids to the compressed section.
    pub fn append(&mut self, ids: &[Ksuid]) {
        self.cs.append(ids);
    }

    /// Records a tagged id.
    pub fn append_custom(&mut self, id: Ksuid, tag: impl Into<String>) {
        self.set.insert(id, tag.into());
    }

    /// Appends an id, dispatching on whether it carries a tag.
    pub fn append_uid(&mut self, uid: &Suid) {
        match uid.custom() {
            Some(tag) => self.append_custom(uid.ksuid(), tag),
            None => self.append(&[uid.ksuid()]),
        }
    }

    pub fn append_uids<'a>(&mut self, uids: impl IntoIterator<Item = &'a Suid>) {
        for uid in uids {
            self.append_uid(uid);
        }
    }

    /// Rebuilds the id carried by `id`, with its tag when one is known.
    pub fn get_uid(&self, id: Ksuid) -> Suid {
        match self.set.get(&id) {
            Some(tag) => Suid::with_custom(id, tag.clone()),
            None => id.into(),
        }
    }

    /// All ids, ascending, deduplicated.
    pub fn iter(&self) -> impl Iterator<Item = Ksuid> + '_ {
        let mut ids: Vec<Ksuid> = self.cs.iter().chain(self.set.keys().copied()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
    }

    /// Number of distinct ids.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.cs.is_empty() && self.set.is_empty()
    }

    /// Renormalizes the compressed section into a single sorted block.
    pub fn sort(&mut self) {
        let ids: Vec<Ksuid> = self.cs.iter().collect();
        self.cs = CompressedSet::compress(&ids);
    }

    /// The `<compressed>...<json-map>` byte form. The map section is
    /// omitted entirely when no id carries a tag; map keys serialize in
    /// sorted order so equal manifests produce equal bytes.
    pub fn bytes(&self) -> Vec<u8> {
        if self.set.is_empty() {
            return self.cs.as_bytes().to_vec();
        }
        let mut out = self.cs.as_bytes().to_vec();
        out.extend_from_slice(SEP);
        // BTreeMap<Ksuid, String> with string keys cannot fail to encode.
        out.extend_from_slice(&serde_json::to_vec(&self.set).unwrap_or_default());
        out
    }
}

fn find_sep(bytes: &[u8]) -> Option<usize> {
    bytes.windows(SEP.len()).position(|w| w == SEP)
}

impl fmt::Display for AssembleManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.bytes()))
    }
}

impl Serialize for AssembleManifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssembleManifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ManifestVisitor;

        impl Visitor<'_> for ManifestVisitor {
            type Value = AssembleManifest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64-encoded manifest string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<AssembleManifest, E> {
                let bytes = BASE64.decode(v).map_err(de::Error::custom)?;
                AssembleManifest::from_bytes(&bytes).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(ManifestVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &str) -> Suid {
        Suid::with_custom(Ksuid::new(), tag)
    }

    #[test]
    fn iter_is_sorted_and_deduplicated() {
        let a = Ksuid::new();
        let b = Ksuid::new();
        let mut manifest = AssembleManifest::new();
        manifest.append(&[b, a]);
        manifest.append(&[a]);
        manifest.append_custom(b, "tag-b");

        let ids: Vec<Ksuid> = manifest.iter().collect();
        let mut want = vec![a, b];
        want.sort_unstable();
        assert_eq!(ids, want);
    }

    #[test]
    fn get_uid_rehydrates_tags() {
        let uid = tagged("apps/v1,Deployment,default/web,3");
        let mut manifest = AssembleManifest::new();
        manifest.append_uid(&uid);
        assert_eq!(manifest.get_uid(uid.ksuid()), uid);

        let plain = Ksuid::new();
        manifest.append(&[plain]);
        assert_eq!(manifest.get_uid(plain), Suid::from(plain));
    }

    #[test]
    fn bytes_round_trip() {
        let mut manifest = AssembleManifest::new();
        manifest.append(&[Ksuid::new(), Ksuid::new()]);
        manifest.append_uid(&tagged("v1,Pod,default/a,1"));
        manifest.append_uid(&tagged("v1,Pod,default/b,2"));

        let back = AssembleManifest::from_bytes(&manifest.bytes()).unwrap();
        let want: Vec<Ksuid> = manifest.iter().collect();
        let got: Vec<Ksuid> = back.iter().collect();
        assert_eq!(got, want);
        for id in want {
            assert_eq!(back.get_uid(id), manifest.get_uid(id));
        }
    }

    #[test]
    fn bytes_without_tags_has_no_map_section() {
        let mut manifest = AssembleManifest::new();
        manifest.append(&[Ksuid::new()]);
        assert!(find_sep(&manifest.bytes()).is_none());
    }

    #[test]
    fn tags_only_manifest_round_trips() {
        let mut manifest = AssembleManifest::new();
        manifest.append_uid(&tagged("v1,Node,edge-1,77"));
        let back = AssembleManifest::from_bytes(&manifest.bytes()).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn empty_manifest_round_trips_through_serde() {
        let manifest = AssembleManifest::new();
        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(json, "\"\"");
        let back: AssembleManifest = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn serde_round_trip() {
        let mut manifest = AssembleManifest::new();
        manifest.append_uid(&tagged("v1,ConfigMap,kube-system/cm,9"));
        manifest.append(&[Ksuid::new()]);

        let json = serde_json::to_string(&manifest).unwrap();
        let back: AssembleManifest = serde_json::from_str(&json).unwrap();
        let want: Vec<Suid> = manifest.iter().map(|id| manifest.get_uid(id)).collect();
        let got: Vec<Suid> = back.iter().map(|id| back.get_uid(id)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn sort_normalizes_append_order() {
        let a = Ksuid::from_parts(10, 1u128.to_be_bytes());
        let b = Ksuid::from_parts(5, 1u128.to_be_bytes());
        let mut manifest = AssembleManifest::new();
        manifest.append(&[a]);
        manifest.append(&[b]);
        manifest.sort();
        let bytes = manifest.bytes();
        let renormalized = AssembleManifest::from_bytes(&bytes).unwrap();
        assert_eq!(
            renormalized.bytes(),
            {
                let mut m = AssembleManifest::new();
                m.append(&[b, a]);
                m.bytes()
            },
        );
    }
}

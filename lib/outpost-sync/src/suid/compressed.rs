//! Compact binary encoding for sets of ksuids.
//!
//! The encoding is a sequence of tagged blocks over a sorted id list. Each
//! block starts with a tag byte whose top two bits select the block kind and
//! whose low six bits carry the byte length of the block's varint operand:
//!
//! | tag    | kind          | operand                                     |
//! |--------|---------------|---------------------------------------------|
//! | `0b00` | raw ksuid     | none; the full 20 bytes follow              |
//! | `0b01` | time delta    | seconds since previous id, then 16-byte payload |
//! | `0b10` | payload delta | distance from the previous payload          |
//! | `0b11` | payload run   | count of consecutive `+1` payload increments |
//!
//! Varints are minimal big-endian byte strings. Appending ids to an existing
//! set starts a new raw block, so the byte form is append-only; duplicate
//! ids collapse at encode time within one block.

use serde::{Deserialize, Serialize};

use super::{Ksuid, BYTE_LENGTH, PAYLOAD_LENGTH, TIMESTAMP_LENGTH};

const RAW_KSUID: u8 = 0;
const TIME_DELTA: u8 = 1 << 6;
const PAYLOAD_DELTA: u8 = 1 << 7;
const PAYLOAD_RANGE: u8 = (1 << 6) | (1 << 7);

const TAG_MASK: u8 = 0xc0;
const LEN_MASK: u8 = 0x3f;

/// A compressed, append-only set of ksuids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSet(#[serde(with = "serde_bytes_b64")] Vec<u8>);

impl CompressedSet {
    /// Compresses a list of ids into a single sorted block sequence.
    pub fn compress(ids: &[Ksuid]) -> Self {
        let mut set = CompressedSet::default();
        set.append(ids);
        set
    }

    /// Wraps an already-encoded byte form without validating it.
    ///
    /// Malformed trailing bytes terminate iteration early instead of
    /// yielding garbage ids.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        CompressedSet(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends ids as a new block sequence. The ids are sorted among
    /// themselves but not merged into earlier blocks; call sites that need
    /// a globally sorted form re-compress via [`CompressedSet::compress`].
    pub fn append(&mut self, ids: &[Ksuid]) {
        if ids.is_empty() {
            return;
        }
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        compress_into(&mut self.0, &sorted);
    }

    /// Iterates the encoded ids in block order.
    pub fn iter(&self) -> CompressedSetIter<'_> {
        CompressedSetIter {
            content: &self.0,
            offset: 0,
            seq_length: 0,
            timestamp: 0,
            last_value: 0,
        }
    }
}

fn compress_into(out: &mut Vec<u8>, ids: &[Ksuid]) {
    out.push(RAW_KSUID);
    out.extend_from_slice(ids[0].as_bytes());

    let mut timestamp = ids[0].timestamp();
    let mut last = ids[0];
    let mut last_value = ids[0].payload();

    let mut i = 1;
    while i < ids.len() {
        let id = ids[i];
        if id == last {
            i += 1;
            continue;
        }

        let t = id.timestamp();
        let v = id.payload();
        if t != timestamp {
            let delta = t - timestamp;
            push_varint(out, TIME_DELTA, u128::from(delta));
            out.extend_from_slice(&id.as_bytes()[TIMESTAMP_LENGTH..]);
            timestamp = t;
        } else {
            let delta = v.wrapping_sub(last_value);
            if delta == 1 {
                let (run, scanned) = run_length(&ids[i + 1..], t, id, v);
                if run > 0 {
                    // The block covers the current id plus the whole run.
                    push_varint(out, PAYLOAD_RANGE, (run + 1) as u128);
                    last_value = v.wrapping_add(run as u128);
                    last = Ksuid::from_parts(t, last_value.to_be_bytes());
                    i += 1 + scanned;
                    continue;
                }
            }
            push_varint(out, PAYLOAD_DELTA, delta);
        }

        last = id;
        last_value = v;
        i += 1;
    }
}

/// Counts how many of the following sorted ids continue a `+1` payload run
/// within the same timestamp. Returns the run length and the number of
/// elements scanned (run members plus duplicates).
fn run_length(ids: &[Ksuid], timestamp: u32, mut last: Ksuid, mut last_value: u128) -> (usize, usize) {
    let mut run = 0;
    for (scanned, &id) in ids.iter().enumerate() {
        if id == last {
            continue;
        }
        if id.timestamp() != timestamp || id.payload().wrapping_sub(last_value) != 1 {
            return (run, scanned);
        }
        last = id;
        last_value = id.payload();
        run += 1;
    }
    (run, ids.len())
}

fn push_varint(out: &mut Vec<u8>, tag: u8, value: u128) {
    let bytes = value.to_be_bytes();
    let len = ((128 - value.leading_zeros() as usize) + 7) / 8;
    let len = len.max(1);
    out.push(tag | len as u8);
    out.extend_from_slice(&bytes[bytes.len() - len..]);
}

/// Iterator over the ids stored in a [`CompressedSet`].
#[derive(Debug)]
pub struct CompressedSetIter<'a> {
    content: &'a [u8],
    offset: usize,
    seq_length: u64,
    timestamp: u32,
    last_value: u128,
}

impl CompressedSetIter<'_> {
    fn take(&mut self, len: usize) -> Option<&[u8]> {
        let end = self.offset.checked_add(len)?;
        let chunk = self.content.get(self.offset..end)?;
        self.offset = end;
        Some(chunk)
    }

    fn take_varint(&mut self, len: usize) -> Option<u128> {
        if len == 0 || len > PAYLOAD_LENGTH {
            return None;
        }
        let chunk = self.take(len)?;
        let mut value = 0u128;
        for &b in chunk {
            value = value << 8 | u128::from(b);
        }
        Some(value)
    }
}

impl Iterator for CompressedSetIter<'_> {
    type Item = Ksuid;

    fn next(&mut self) -> Option<Ksuid> {
        if self.seq_length > 0 {
            self.seq_length -= 1;
            self.last_value = self.last_value.wrapping_add(1);
            return Some(Ksuid::from_parts(self.timestamp, self.last_value.to_be_bytes()));
        }
        if self.offset >= self.content.len() {
            return None;
        }

        let head = self.content[self.offset];
        self.offset += 1;
        let operand_len = (head & LEN_MASK) as usize;

        match head & TAG_MASK {
            RAW_KSUID => {
                let mut bytes = [0u8; BYTE_LENGTH];
                bytes.copy_from_slice(self.take(BYTE_LENGTH)?);
                let id = Ksuid::from_bytes(bytes);
                self.timestamp = id.timestamp();
                self.last_value = id.payload();
                Some(id)
            }
            TIME_DELTA => {
                let delta = self.take_varint(operand_len)?;
                self.timestamp = self.timestamp.wrapping_add(delta as u32);
                let mut payload = [0u8; PAYLOAD_LENGTH];
                payload.copy_from_slice(self.take(PAYLOAD_LENGTH)?);
                let id = Ksuid::from_parts(self.timestamp, payload);
                self.last_value = id.payload();
                Some(id)
            }
            PAYLOAD_DELTA => {
                let delta = self.take_varint(operand_len)?;
                self.last_value = self.last_value.wrapping_add(delta);
                Some(Ksuid::from_parts(self.timestamp, self.last_value.to_be_bytes()))
            }
            PAYLOAD_RANGE => {
                let count = self.take_varint(operand_len)?;
                if count == 0 {
                    return None;
                }
                self.seq_length = (count as u64) - 1;
                self.last_value = self.last_value.wrapping_add(1);
                Some(Ksuid::from_parts(self.timestamp, self.last_value.to_be_bytes()))
            }
            _ => unreachable!("tag mask covers two bits"),
        }
    }
}

mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

//! Sortable unique identifiers.
//!
//! A [`Ksuid`] is a 20-byte identifier built from a 4-byte big-endian
//! timestamp and 16 random payload bytes, so lexicographic byte order is
//! generation-time order. A [`Suid`] pairs a `Ksuid` with an optional
//! textual custom tag; the string form is the fixed 27-character base62
//! rendering of the `Ksuid`, followed by `.` and the tag when present.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;

mod compressed;
mod manifest;

pub use compressed::{CompressedSet, CompressedSetIter};
pub use manifest::{AssembleManifest, DecodeError};

/// Offset subtracted from the UNIX timestamp so the 4-byte seconds field
/// lasts well past 2100.
const EPOCH_STAMP: u64 = 1_400_000_000;

pub(crate) const TIMESTAMP_LENGTH: usize = 4;
pub(crate) const PAYLOAD_LENGTH: usize = 16;
pub(crate) const BYTE_LENGTH: usize = TIMESTAMP_LENGTH + PAYLOAD_LENGTH;
const STRING_LENGTH: usize = 27;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Errors produced while parsing identifiers from their string form.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseError {
    /// The encoded ksuid part has the wrong length.
    #[snafu(display("valid encoded ksuids are {} characters, got {len}", STRING_LENGTH))]
    Length { len: usize },

    /// The encoded ksuid part contains a byte outside the base62 alphabet.
    #[snafu(display("invalid base62 character {char:?}"))]
    Character { char: char },

    /// The encoded value does not fit in 20 bytes.
    #[snafu(display("encoded value overflows a 20-byte ksuid"))]
    Overflow,
}

/// K-sortable unique identifier: 4-byte timestamp plus 16 random bytes.
///
/// The all-zero value is reserved as [`Ksuid::NIL`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ksuid([u8; BYTE_LENGTH]);

impl Ksuid {
    /// The reserved all-zero identifier.
    pub const NIL: Ksuid = Ksuid([0; BYTE_LENGTH]);

    /// Generates a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let timestamp = now.saturating_sub(EPOCH_STAMP) as u32;
        Self::from_parts(timestamp, rand::random())
    }

    /// Assembles an identifier from an epoch-adjusted timestamp and payload.
    pub fn from_parts(timestamp: u32, payload: [u8; PAYLOAD_LENGTH]) -> Self {
        let mut bytes = [0u8; BYTE_LENGTH];
        bytes[..TIMESTAMP_LENGTH].copy_from_slice(&timestamp.to_be_bytes());
        bytes[TIMESTAMP_LENGTH..].copy_from_slice(&payload);
        Ksuid(bytes)
    }

    pub fn from_bytes(bytes: [u8; BYTE_LENGTH]) -> Self {
        Ksuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BYTE_LENGTH] {
        &self.0
    }

    /// Seconds since the custom epoch.
    pub fn timestamp(&self) -> u32 {
        let mut ts = [0u8; TIMESTAMP_LENGTH];
        ts.copy_from_slice(&self.0[..TIMESTAMP_LENGTH]);
        u32::from_be_bytes(ts)
    }

    /// The 16 payload bytes interpreted as a big-endian integer.
    pub fn payload(&self) -> u128 {
        let mut p = [0u8; PAYLOAD_LENGTH];
        p.copy_from_slice(&self.0[TIMESTAMP_LENGTH..]);
        u128::from_be_bytes(p)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        s.parse()
    }
}

impl fmt::Display for Ksuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base62_encode(&self.0))
    }
}

impl fmt::Debug for Ksuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ksuid({self})")
    }
}

impl FromStr for Ksuid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        base62_decode(s).map(Ksuid)
    }
}

impl Serialize for Ksuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ksuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KsuidVisitor;

        impl Visitor<'_> for KsuidVisitor {
            type Value = Ksuid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base62-encoded ksuid string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Ksuid, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(KsuidVisitor)
    }
}

/// A sortable identifier with an optional custom tag.
///
/// The tag travels with the id on the wire and is used to relate an entry
/// back to the logical resource it describes. Two `Suid`s order by their
/// ksuid part first.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Suid {
    ksuid: Ksuid,
    custom: Option<String>,
}

impl Suid {
    /// A fresh identifier with no custom tag.
    pub fn new() -> Self {
        Suid {
            ksuid: Ksuid::new(),
            custom: None,
        }
    }

    /// A tag-only identifier whose ksuid part is still Nil.
    pub fn from_custom(tag: impl Into<String>) -> Self {
        Self::with_custom(Ksuid::NIL, tag)
    }

    /// Pairs an existing ksuid with a custom tag.
    pub fn with_custom(ksuid: Ksuid, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Suid {
            ksuid,
            custom: if tag.is_empty() { None } else { Some(tag) },
        }
    }

    pub fn ksuid(&self) -> Ksuid {
        self.ksuid
    }

    pub fn custom(&self) -> Option<&str> {
        self.custom.as_deref()
    }

    pub fn is_custom(&self) -> bool {
        self.custom.is_some()
    }

    /// True when the ksuid part is the reserved zero value.
    pub fn is_nil(&self) -> bool {
        self.ksuid.is_nil()
    }

    /// Parses the `<base62>[.<tag>]` form. An empty string is the Nil id.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Ok(Suid::default());
        }
        match s.split_once('.') {
            Some((id, tag)) => Ok(Suid {
                ksuid: id.parse()?,
                custom: if tag.is_empty() {
                    None
                } else {
                    Some(tag.to_owned())
                },
            }),
            None => Ok(Suid {
                ksuid: s.parse()?,
                custom: None,
            }),
        }
    }
}

impl From<Ksuid> for Suid {
    fn from(ksuid: Ksuid) -> Self {
        Suid {
            ksuid,
            custom: None,
        }
    }
}

impl PartialOrd for Suid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Suid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ksuid
            .cmp(&other.ksuid)
            .then_with(|| self.custom.cmp(&other.custom))
    }
}

impl fmt::Display for Suid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.custom {
            Some(tag) => write!(f, "{}.{tag}", self.ksuid),
            None => self.ksuid.fmt(f),
        }
    }
}

impl fmt::Debug for Suid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Suid({self})")
    }
}

impl FromStr for Suid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Suid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Suid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SuidVisitor;

        impl Visitor<'_> for SuidVisitor {
            type Value = Suid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a suid string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Suid, E> {
                Suid::parse(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(SuidVisitor)
    }
}

fn base62_encode(bytes: &[u8; BYTE_LENGTH]) -> String {
    let mut digits = [b'0'; STRING_LENGTH];
    let mut idx = STRING_LENGTH;

    // Repeated divmod, base 256 down to base 62.
    let mut src: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    while !src.is_empty() {
        let mut rem: u32 = 0;
        let mut next = Vec::with_capacity(src.len());
        for &b in &src {
            let acc = rem * 256 + u32::from(b);
            let q = (acc / 62) as u8;
            rem = acc % 62;
            if !next.is_empty() || q != 0 {
                next.push(q);
            }
        }
        idx -= 1;
        digits[idx] = ALPHABET[rem as usize];
        src = next;
    }
    digits.iter().map(|&b| b as char).collect()
}

fn base62_decode(s: &str) -> Result<[u8; BYTE_LENGTH], ParseError> {
    if s.len() != STRING_LENGTH {
        return Err(ParseError::Length { len: s.len() });
    }
    let mut out = [0u8; BYTE_LENGTH];
    for ch in s.bytes() {
        let digit = base62_digit(ch)?;
        let mut carry = u32::from(digit);
        for b in out.iter_mut().rev() {
            let acc = u32::from(*b) * 62 + carry;
            *b = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        if carry != 0 {
            return Err(ParseError::Overflow);
        }
    }
    Ok(out)
}

fn base62_digit(ch: u8) -> Result<u8, ParseError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'A'..=b'Z' => Ok(ch - b'A' + 10),
        b'a'..=b'z' => Ok(ch - b'a' + 36),
        _ => Err(ParseError::Character { char: ch as char }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_renders_as_zeros() {
        assert_eq!(Ksuid::NIL.to_string(), "0".repeat(27));
        assert!(Ksuid::NIL.is_nil());
    }

    #[test]
    fn string_round_trip() {
        for _ in 0..64 {
            let id = Ksuid::new();
            let parsed: Ksuid = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            Ksuid::parse("short"),
            Err(ParseError::Length { len: 5 })
        );
        assert_eq!(
            Ksuid::parse(&"!".repeat(27)),
            Err(ParseError::Character { char: '!' })
        );
        assert_eq!(Ksuid::parse(&"z".repeat(27)), Err(ParseError::Overflow));
    }

    #[test]
    fn byte_order_is_time_order() {
        let early = Ksuid::from_parts(100, [0xff; PAYLOAD_LENGTH]);
        let late = Ksuid::from_parts(101, [0x00; PAYLOAD_LENGTH]);
        assert!(early < late);
        // String order agrees with byte order.
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn custom_tag_round_trip() {
        let id = Ksuid::new();
        let uid = Suid::with_custom(id, "apps/v1,Deployment,default/web,42");
        let parsed = Suid::parse(&uid.to_string()).unwrap();
        assert_eq!(parsed.ksuid(), id);
        assert_eq!(parsed.custom(), Some("apps/v1,Deployment,default/web,42"));
    }

    #[test]
    fn tag_keeps_its_own_dots() {
        let uid = Suid::with_custom(Ksuid::new(), "networking.k8s.io/v1,Ingress,default/x,7");
        let parsed = Suid::parse(&uid.to_string()).unwrap();
        assert_eq!(parsed.custom(), Some("networking.k8s.io/v1,Ingress,default/x,7"));
    }

    #[test]
    fn tag_only_suid_is_nil() {
        let uid = Suid::from_custom("some-tag");
        assert!(uid.is_nil());
        assert!(uid.is_custom());
    }

    #[test]
    fn empty_string_parses_to_nil() {
        let uid = Suid::parse("").unwrap();
        assert!(uid.is_nil());
        assert!(!uid.is_custom());
    }

    #[test]
    fn serde_uses_string_form() {
        let uid = Suid::with_custom(Ksuid::new(), "v1,Pod,default/p,1");
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{uid}\""));
        let back: Suid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }
}

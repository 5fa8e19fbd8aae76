//! The envelope stored as the value of every published dataset item.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// What happened to the wrapped resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// A watch event and the raw JSON of the resource it concerns.
///
/// The resource bytes pass through untouched so agents apply exactly what
/// the cluster reported.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Box<RawValue>,
}

impl Envelope {
    pub fn new(kind: EventKind, data: Box<RawValue>) -> Self {
        Envelope { kind, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&EventKind::Added).unwrap(), "\"ADDED\"");
        assert_eq!(
            serde_json::to_string(&EventKind::Modified).unwrap(),
            "\"MODIFIED\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::Deleted).unwrap(),
            "\"DELETED\""
        );
    }

    #[test]
    fn resource_bytes_pass_through_unchanged() {
        let raw = r#"{"metadata":{"name":"web","resourceVersion":"42"}}"#;
        let envelope = Envelope::new(
            EventKind::Modified,
            RawValue::from_string(raw.to_owned()).unwrap(),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, format!(r#"{{"type":"MODIFIED","data":{raw}}}"#));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, EventKind::Modified);
        assert_eq!(back.data.get(), raw);
    }
}

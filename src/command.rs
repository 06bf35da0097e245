/*!
 * Log Entry Codec
 *
 * Mutations travel through the replicated log as small JSON documents:
 * `{"op":"SET","key":"a","value":"1"}`. Decoding is deliberately lenient:
 * missing fields fall back to empty defaults and unknown operation tags are
 * kept verbatim so the state machine can reject them itself.
 */

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Operation carried by a logged command
///
/// Tags are matched case-insensitively on decode and always written in
/// upper case. Anything else is preserved in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set,
    Del,
    Unknown(String),
}

impl Operation {
    /// Map a raw tag to an operation, ignoring ASCII case
    pub fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("SET") {
            Operation::Set
        } else if tag.eq_ignore_ascii_case("DEL") {
            Operation::Del
        } else {
            Operation::Unknown(tag.to_string())
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            Operation::Set => "SET",
            Operation::Del => "DEL",
            Operation::Unknown(tag) => tag,
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Unknown(String::new())
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(d)?;
        Ok(Operation::from_tag(&tag))
    }
}

/// A key-value mutation as stored in the replicated log
///
/// GET never becomes a command; reads are served locally.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueCommand {
    pub op: Operation,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl KeyValueCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Operation::Set,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op: Operation::Del,
            key: key.into(),
            value: None,
        }
    }

    /// Serialize for proposal to the log
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a committed log entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_del_survive_the_log() {
        for cmd in [
            KeyValueCommand::set("a", "1"),
            KeyValueCommand::set("empty", ""),
            KeyValueCommand::set("unicode ключ", "värde"),
            KeyValueCommand::del("a"),
        ] {
            let bytes = cmd.encode().unwrap();
            assert_eq!(KeyValueCommand::decode(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn wire_shape_is_stable() {
        let bytes = KeyValueCommand::set("k", "v").encode().unwrap();
        assert_eq!(bytes, br#"{"op":"SET","key":"k","value":"v"}"#);

        let bytes = KeyValueCommand::del("k").encode().unwrap();
        assert_eq!(bytes, br#"{"op":"DEL","key":"k"}"#);
    }

    #[test]
    fn missing_fields_default_instead_of_failing() {
        let cmd = KeyValueCommand::decode(b"{}").unwrap();
        assert_eq!(cmd.op, Operation::Unknown(String::new()));
        assert_eq!(cmd.key, "");
        assert_eq!(cmd.value, None);

        let cmd = KeyValueCommand::decode(br#"{"op":"set","key":"x","extra":1}"#).unwrap();
        assert_eq!(cmd.op, Operation::Set);
        assert_eq!(cmd.key, "x");
        assert_eq!(cmd.value, None);
    }

    #[test]
    fn foreign_tags_are_kept() {
        let cmd = KeyValueCommand::decode(br#"{"op":"INCR","key":"x"}"#).unwrap();
        assert_eq!(cmd.op, Operation::Unknown("INCR".into()));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(KeyValueCommand::decode(b"not json").is_err());
        assert!(KeyValueCommand::decode(br#"{"op":42}"#).is_err());
    }
}

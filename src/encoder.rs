use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::errinput;

/// Codec for user-defined object values.
///
/// Object records embed the encoder's tag ahead of the encoded bytes, so a
/// reopened store can find the right codec again. Tags must be non-empty and
/// at most 50 bytes.
pub trait Encoder: Send + Sync {
    /// Stable identifier written into every record this encoder produces.
    fn tag(&self) -> &str;

    /// Encodes the value. The value's concrete type is whatever the caller
    /// handed to `put_object`; a mismatch is an input error.
    fn encode(&self, value: &dyn Any) -> Result<Vec<u8>>;

    /// Decodes a value previously produced by [Encoder::encode].
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>>;
}

/// Built-in codec for `HashSet<String>` values, registered in every store.
pub struct StringSetEncoder;

impl StringSetEncoder {
    pub const TAG: &'static str = "StringSet";
}

impl Encoder for StringSetEncoder {
    fn tag(&self) -> &str {
        Self::TAG
    }

    fn encode(&self, value: &dyn Any) -> Result<Vec<u8>> {
        let set = value
            .downcast_ref::<HashSet<String>>()
            .ok_or_else(|| crate::error::Error::InvalidInput("not a string set".into()))?;
        Ok(bincode::serialize(set)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
        let set: HashSet<String> = bincode::deserialize(bytes)?;
        Ok(Box::new(set))
    }
}

/// Tag to codec mapping. Duplicate tags are logged and dropped; the
/// string-set codec is always present.
#[derive(Clone)]
pub struct Registry {
    map: HashMap<String, Arc<dyn Encoder>>,
}

impl Registry {
    pub fn new(encoders: Vec<Arc<dyn Encoder>>) -> Self {
        let mut map: HashMap<String, Arc<dyn Encoder>> = HashMap::new();
        for encoder in encoders {
            let tag = encoder.tag().to_string();
            if map.contains_key(&tag) {
                tracing::error!(tag = %tag, "duplicate encoder tag");
            } else {
                map.insert(tag, encoder);
            }
        }
        map.entry(StringSetEncoder::TAG.to_string())
            .or_insert_with(|| Arc::new(StringSetEncoder));
        Registry { map }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Encoder>> {
        self.map.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.map.contains_key(tag)
    }

    /// Validates a tag for `put_object`.
    pub fn check_tag(&self, tag: &str) -> Result<()> {
        if tag.is_empty() || tag.len() > 50 {
            return errinput!("invalid encoder tag: {tag:?}");
        }
        if !self.contains(tag) {
            return errinput!("encoder {tag:?} has not been registered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Session {
        pub user: String,
        pub expires_at: i64,
    }

    pub struct SessionEncoder;

    impl Encoder for SessionEncoder {
        fn tag(&self) -> &str {
            "Session"
        }

        fn encode(&self, value: &dyn Any) -> Result<Vec<u8>> {
            let session = value
                .downcast_ref::<Session>()
                .ok_or_else(|| crate::error::Error::InvalidInput("not a session".into()))?;
            Ok(bincode::serialize(session)?)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
            let session: Session = bincode::deserialize(bytes)?;
            Ok(Box::new(session))
        }
    }

    #[test]
    fn test_string_set_round_trip() {
        let encoder = StringSetEncoder;
        let set: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let bytes = encoder.encode(&set).unwrap();
        let decoded = encoder.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<HashSet<String>>().unwrap(), &set);
    }

    #[test]
    fn test_custom_encoder_round_trip() {
        let encoder = SessionEncoder;
        let session = Session {
            user: "ada".into(),
            expires_at: 1_700_000_000,
        };

        let bytes = encoder.encode(&session).unwrap();
        let decoded = encoder.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Session>().unwrap(), &session);
    }

    #[test]
    fn test_registry_always_has_string_set() {
        let registry = Registry::new(vec![]);
        assert!(registry.contains(StringSetEncoder::TAG));
    }

    #[test]
    fn test_registry_drops_duplicates() {
        let registry = Registry::new(vec![Arc::new(SessionEncoder), Arc::new(SessionEncoder)]);
        assert!(registry.get("Session").is_some());
    }

    #[test]
    fn test_check_tag() {
        let registry = Registry::new(vec![Arc::new(SessionEncoder)]);
        assert!(registry.check_tag("Session").is_ok());
        assert!(registry.check_tag("").is_err());
        assert!(registry.check_tag(&"x".repeat(51)).is_err());
        assert!(registry.check_tag("Unknown").is_err());
    }
}

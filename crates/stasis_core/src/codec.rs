//! Entity payload codecs.
//!
//! A manager never inspects entity bytes itself. It hands entities to an
//! [`EntityCodec`] when building change envelopes and gets them back when
//! replaying a bomb file or a trace, so the codec must round-trip exactly.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Serializes entities for change envelopes.
///
/// # Invariants
///
/// - `decode(encode(e))` equals `e`
/// - The encoding does not depend on process state, so a bomb file written
///   by one process is readable by the next
pub trait EntityCodec<T>: Send + Sync {
    /// Encodes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the entity cannot be serialized.
    fn encode(&self, entity: &T) -> CoreResult<Vec<u8>>;

    /// Decodes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the bytes are not a valid entity.
    fn decode(&self, bytes: &[u8]) -> CoreResult<T>;
}

/// CBOR codec for any serde entity.
pub struct CborCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    /// Creates a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CborCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CborCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CborCodec")
    }
}

impl<T> EntityCodec<T> for CborCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, entity: &T) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(entity, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> CoreResult<T> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn cbor_roundtrip() {
        let codec = CborCodec::<Sample>::new();
        let sample = Sample {
            id: 9,
            name: "nine".into(),
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = codec.encode(&sample).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample);
    }

    #[test]
    fn cbor_is_deterministic() {
        let codec = CborCodec::<Sample>::new();
        let sample = Sample {
            id: 1,
            name: String::new(),
            tags: Vec::new(),
        };
        assert_eq!(codec.encode(&sample).unwrap(), codec.encode(&sample).unwrap());
    }

    #[test]
    fn cbor_rejects_garbage() {
        let codec = CborCodec::<Sample>::new();
        let result = codec.decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Codec { .. })));
    }
}

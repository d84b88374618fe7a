//! Pending changes and their wire format.
//!
//! ## Change envelope
//!
//! ```text
//! ┌──────────────────┬─────────┬────────────────────────────┐
//! │ entity payload   │ op (1B) │ N x u64 LE dirty words      │
//! └──────────────────┴─────────┴────────────────────────────┘
//! ```
//!
//! `N = ceil(field_count / 64)`. The payload has no length prefix: it is
//! everything before the fixed-size tail. The same bytes are written to
//! bomb files and published on the trace feed.
//!
//! ## Fail-queue framing
//!
//! ```text
//! u32 LE count, then per change: u32 LE envelope length, envelope bytes
//! ```

use crate::bitmap::DirtyBitmap;
use crate::codec::EntityCodec;
use crate::error::{CoreError, CoreResult};
use crate::types::Op;
use stasis_storage::Record;
use std::borrow::Borrow;

/// One queued mutation, owned by exactly one queue at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange<T> {
    /// Entity state to write.
    pub entity: T,
    /// Kind of write.
    pub op: Op,
    /// Fields changed since the last durable write.
    pub dirty: DirtyBitmap,
}

impl<T: Record> PendingChange<T> {
    /// Creates an insert; inserts always write the full row.
    pub fn insert(entity: T) -> Self {
        Self {
            entity,
            op: Op::Insert,
            dirty: DirtyBitmap::all(T::field_count()),
        }
    }

    /// Creates an update of the fields marked in `dirty`.
    pub fn update(entity: T, dirty: DirtyBitmap) -> Self {
        Self {
            entity,
            op: Op::Update,
            dirty,
        }
    }

    /// Creates a full-row update.
    pub fn update_all(entity: T) -> Self {
        Self::update(entity, DirtyBitmap::all(T::field_count()))
    }

    /// Creates a delete.
    pub fn delete(entity: T) -> Self {
        Self {
            entity,
            op: Op::Delete,
            dirty: DirtyBitmap::new(T::field_count()),
        }
    }

    /// Returns the entity's primary key.
    pub fn key(&self) -> T::Key {
        self.entity.primary_key()
    }
}

/// A parsed envelope whose payload has not been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnvelope<'a> {
    /// Entity payload bytes.
    pub payload: &'a [u8],
    /// Kind of write.
    pub op: Op,
    /// Dirty bitmap.
    pub dirty: DirtyBitmap,
}

impl<'a> RawEnvelope<'a> {
    /// Splits an envelope into payload, op and bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidEnvelope`] if the envelope is shorter than
    /// its fixed tail or carries an unknown op byte.
    pub fn parse(bytes: &'a [u8], field_count: usize) -> CoreResult<Self> {
        let word_count = DirtyBitmap::words_for(field_count);
        let tail = 1 + word_count * 8;
        if bytes.len() < tail {
            return Err(CoreError::invalid_envelope(format!(
                "envelope is {} bytes, tail alone needs {tail}",
                bytes.len()
            )));
        }

        let split = bytes.len() - tail;
        let op_byte = bytes[split];
        let op = Op::from_byte(op_byte)
            .ok_or_else(|| CoreError::invalid_envelope(format!("unknown op byte {op_byte}")))?;

        let words = bytes[split + 1..]
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        let dirty = DirtyBitmap::from_words(field_count, words)
            .ok_or_else(|| CoreError::invalid_envelope("bitmap word count mismatch"))?;

        Ok(Self {
            payload: &bytes[..split],
            op,
            dirty,
        })
    }
}

/// Serializes one change into an envelope.
///
/// # Errors
///
/// Returns an error if the codec fails.
pub fn encode_change<T>(
    codec: &dyn EntityCodec<T>,
    change: &PendingChange<T>,
) -> CoreResult<Vec<u8>> {
    let payload = codec.encode(&change.entity)?;
    let words = change.dirty.words();
    let mut bytes = Vec::with_capacity(payload.len() + 1 + words.len() * 8);
    bytes.extend_from_slice(&payload);
    bytes.push(change.op.as_byte());
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    Ok(bytes)
}

/// Parses an envelope back into a change.
///
/// # Errors
///
/// Returns an error if the envelope is malformed or the codec fails.
pub fn decode_change<T>(
    codec: &dyn EntityCodec<T>,
    bytes: &[u8],
    field_count: usize,
) -> CoreResult<PendingChange<T>> {
    let raw = RawEnvelope::parse(bytes, field_count)?;
    Ok(PendingChange {
        entity: codec.decode(raw.payload)?,
        op: raw.op,
        dirty: raw.dirty,
    })
}

/// Serializes an ordered list of changes with fail-queue framing.
///
/// # Errors
///
/// Returns an error if the codec fails or a count overflows `u32`.
pub fn encode_fail_queue<T>(
    codec: &dyn EntityCodec<T>,
    changes: impl IntoIterator<Item = impl Borrow<PendingChange<T>>>,
) -> CoreResult<Vec<u8>> {
    let mut frames = Vec::new();
    let mut count: u32 = 0;
    for change in changes {
        let envelope = encode_change(codec, change.borrow())?;
        let len = u32::try_from(envelope.len())
            .map_err(|_| CoreError::invalid_envelope("envelope larger than 4 GiB"))?;
        frames.extend_from_slice(&len.to_le_bytes());
        frames.extend_from_slice(&envelope);
        count = count
            .checked_add(1)
            .ok_or_else(|| CoreError::invalid_envelope("more than u32::MAX changes"))?;
    }

    let mut bytes = Vec::with_capacity(4 + frames.len());
    bytes.extend_from_slice(&count.to_le_bytes());
    bytes.extend_from_slice(&frames);
    Ok(bytes)
}

/// Splits fail-queue framing into envelope slices, in order.
///
/// # Errors
///
/// Returns [`CoreError::InvalidBombFile`] on truncated frames, a count that
/// disagrees with the frames, or trailing bytes.
pub fn split_fail_queue(bytes: &[u8]) -> CoreResult<Vec<&[u8]>> {
    let count = read_u32(bytes, 0)
        .ok_or_else(|| CoreError::invalid_bomb_file("payload shorter than its count"))?;

    let mut frames = Vec::new();
    let mut offset = 4;
    for index in 0..count {
        let len = read_u32(bytes, offset).ok_or_else(|| {
            CoreError::invalid_bomb_file(format!("change {index}: truncated length"))
        })? as usize;
        offset += 4;
        let frame = bytes.get(offset..offset + len).ok_or_else(|| {
            CoreError::invalid_bomb_file(format!("change {index}: truncated envelope"))
        })?;
        frames.push(frame);
        offset += len;
    }

    if offset != bytes.len() {
        return Err(CoreError::invalid_bomb_file(format!(
            "{} trailing bytes after {count} changes",
            bytes.len() - offset
        )));
    }
    Ok(frames)
}

/// Parses fail-queue framing into changes, in order.
///
/// # Errors
///
/// Returns an error if the framing, an envelope or the codec fails.
pub fn decode_fail_queue<T>(
    codec: &dyn EntityCodec<T>,
    bytes: &[u8],
    field_count: usize,
) -> CoreResult<Vec<PendingChange<T>>> {
    split_fail_queue(bytes)?
        .into_iter()
        .map(|frame| decode_change(codec, frame, field_count))
        .collect()
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Some(u32::from_le_bytes(buf))
}

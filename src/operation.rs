//! Immutable edit operations, the smallest unit the engine reasons about.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::clock::{next_logical_clock, site_id};
use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Delete,
}

/// For INSERT the payload is the inserted text; for DELETE it is the length
/// (in chars) to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Len(u32),
}

/// An immutable edit, carrying enough identity (`logical_clock`, `site_id`,
/// `author`) that the transform pipeline can reposition it via
/// [`Operation::with_position`]/[`Operation::with_length`] without minting a
/// new clock value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: u32,
    pub payload: Payload,
    pub author: UserId,
    pub logical_clock: u64,
    pub site_id: i32,
    pub wall_time: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Operation {
    pub fn insert(position: u32, text: String, author: UserId) -> Self {
        let site_id = site_id(&author);
        Self {
            kind: OpKind::Insert,
            position,
            payload: Payload::Text(text),
            author,
            logical_clock: next_logical_clock(),
            site_id,
            wall_time: now_millis(),
        }
    }

    pub fn delete(position: u32, length: u32, author: UserId) -> Self {
        let site_id = site_id(&author);
        Self {
            kind: OpKind::Delete,
            position,
            payload: Payload::Len(length),
            author,
            logical_clock: next_logical_clock(),
            site_id,
            wall_time: now_millis(),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete)
    }

    /// `text.len()` (in chars) for INSERT, `length` for DELETE.
    pub fn payload_length(&self) -> u32 {
        match &self.payload {
            Payload::Text(text) => text.chars().count() as u32,
            Payload::Len(length) => *length,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Len(_) => None,
        }
    }

    pub fn length(&self) -> Option<u32> {
        match &self.payload {
            Payload::Len(length) => Some(*length),
            Payload::Text(_) => None,
        }
    }

    /// Returns a new operation repositioned to `position`, keeping identity
    /// (clock, author, site, wall_time) unchanged.
    #[must_use]
    pub fn with_position(&self, position: u32) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// Returns a new DELETE operation with `length` set to `length`, keeping
    /// identity unchanged. No-op on INSERT operations, since an insert's
    /// payload is text, not a length.
    #[must_use]
    pub fn with_length(&self, length: u32) -> Self {
        match &self.payload {
            Payload::Len(_) => Self {
                payload: Payload::Len(length),
                ..self.clone()
            },
            Payload::Text(_) => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length_matches_kind() {
        let ins = Operation::insert(0, "hello".into(), "alice".into());
        assert_eq!(ins.payload_length(), 5);

        let del = Operation::delete(0, 3, "alice".into());
        assert_eq!(del.payload_length(), 3);
    }

    #[test]
    fn with_position_preserves_identity() {
        let op = Operation::insert(0, "x".into(), "alice".into());
        let moved = op.with_position(5);
        assert_eq!(moved.position, 5);
        assert_eq!(moved.logical_clock, op.logical_clock);
        assert_eq!(moved.site_id, op.site_id);
        assert_eq!(moved.author, op.author);
    }

    #[test]
    fn with_length_only_affects_delete() {
        let del = Operation::delete(2, 4, "bob".into());
        let shrunk = del.with_length(1);
        assert_eq!(shrunk.length(), Some(1));
        assert_eq!(shrunk.logical_clock, del.logical_clock);

        let ins = Operation::insert(0, "x".into(), "bob".into());
        let unchanged = ins.with_length(9);
        assert_eq!(unchanged, ins);
    }
}

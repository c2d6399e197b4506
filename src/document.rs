//! Per-document authoritative state: text buffer, bounded history,
//! participant set, and dirty flag.
//!
//! A [`Document`] owns a single exclusive write-lock (`parking_lot::RwLock`)
//! guarding content/history/dirty. The participant set has its own lock so
//! that join/leave bookkeeping never has to wait on a concurrent edit, per
//! the concurrency model in the specification.

use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::operation::Operation;
use crate::transform::{self, transform_batch};
use crate::{FileId, UserId};

/// The outcome of an `insert`/`delete` call: whether the caller's arguments
/// could be placed at all (only false under resource exhaustion, since the
/// engine clamps everything else), and the position the engine actually
/// applied the operation at, which may differ from the requested position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedResult {
    pub success: bool,
    pub applied_position: u32,
}

/// The outcome of a `delete` call: whether the operation was applied at all
/// (a `false` here includes the case where concurrent history fully subsumed
/// the requested range, per the zero-length-DELETE-is-dropped rule), and the
/// position/length the engine actually deleted, which may differ from the
/// caller's arguments after clamping and transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub success: bool,
    pub applied_position: u32,
    pub applied_length: u32,
}

struct DocumentState {
    content: String,
    history: VecDeque<Operation>,
    history_capacity: usize,
    dirty: bool,
    last_modified: u64,
}

impl DocumentState {
    fn char_len(&self) -> u32 {
        self.content.chars().count() as u32
    }

    fn push_history(&mut self, op: Operation) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(op);
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.last_modified = now_millis();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A point-in-time snapshot with no shared mutable state; handed to a
/// session without holding the document lock for the duration of a socket
/// write.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub file_id: FileId,
    pub file_name: String,
    pub content: String,
    pub participants: Vec<UserId>,
}

pub struct Document {
    pub file_id: FileId,
    pub file_name: String,
    pub creator: UserId,
    state: RwLock<DocumentState>,
    participants: Mutex<HashSet<UserId>>,
}

impl Document {
    pub fn create(file_id: FileId, file_name: String, creator: UserId, history_capacity: usize) -> Self {
        Self {
            file_id,
            file_name,
            creator,
            state: RwLock::new(DocumentState {
                content: String::new(),
                history: VecDeque::new(),
                history_capacity,
                dirty: false,
                last_modified: now_millis(),
            }),
            participants: Mutex::new(HashSet::new()),
        }
    }

    /// Rehydrates a document from persisted content (used by FILE_OPEN when
    /// the document is not currently resident in memory).
    pub fn from_content(
        file_id: FileId,
        file_name: String,
        creator: UserId,
        content: String,
        history_capacity: usize,
    ) -> Self {
        let doc = Self::create(file_id, file_name, creator, history_capacity);
        doc.state.write().content = content;
        doc
    }

    pub fn content(&self) -> String {
        self.state.read().content.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn mark_saved(&self) {
        self.state.write().dirty = false;
    }

    pub fn last_modified(&self) -> u64 {
        self.state.read().last_modified
    }

    /// Returns at most `k` newest history entries, in history (applied)
    /// order.
    pub fn recent_ops(&self, k: usize) -> Vec<Operation> {
        let state = self.state.read();
        let len = state.history.len();
        let start = len.saturating_sub(k);
        state.history.iter().skip(start).cloned().collect()
    }

    pub fn add_participant(&self, user: UserId) {
        self.participants.lock().insert(user);
    }

    pub fn remove_participant(&self, user: &UserId) {
        self.participants.lock().remove(user);
    }

    pub fn participants(&self) -> Vec<UserId> {
        self.participants.lock().iter().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    /// Produces a snapshot with no shared mutable state.
    pub fn copy(&self) -> DocumentSnapshot {
        let content = self.state.read().content.clone();
        DocumentSnapshot {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            content,
            participants: self.participants(),
        }
    }

    /// Clamps `position` into `[0, len]`, transforms against the last
    /// `window` history entries, applies the resulting operation, appends it
    /// to history, and marks the document dirty. Returns the position the
    /// engine actually applied the insert at.
    pub fn insert(&self, position: u32, text: String, author: UserId, window: usize) -> AppliedResult {
        let mut state = self.state.write();
        let len = state.char_len();
        let clamped_position = position.min(len);

        let op = Operation::insert(clamped_position, text, author);
        let recent: Vec<Operation> = {
            let hist_len = state.history.len();
            let start = hist_len.saturating_sub(window);
            state.history.iter().skip(start).cloned().collect()
        };

        let transformed = match transform::transform_against(op, &recent) {
            Some(op) => op,
            None => {
                return AppliedResult {
                    success: false,
                    applied_position: clamped_position,
                }
            }
        };

        let applied_position = transformed.position;
        match transform::apply(&state.content, &transformed) {
            Ok(new_content) => {
                state.content = new_content;
                state.push_history(transformed);
                state.touch();
                AppliedResult {
                    success: true,
                    applied_position,
                }
            }
            Err(_) => AppliedResult {
                success: false,
                applied_position,
            },
        }
    }

    /// Clamps `position` into `[0, len)` and `length` into `[1, len -
    /// position]`, transforms, applies, and appends to history. Zero-length
    /// results (the client's delete was fully subsumed by concurrent server
    /// history) are dropped and report `false`. Returns the position/length
    /// actually applied, which the caller must use for broadcast — not the
    /// arguments it was called with — since both may have moved under
    /// transformation (boundary scenario S4).
    pub fn delete(&self, position: u32, length: u32, author: UserId, window: usize) -> DeleteResult {
        let mut state = self.state.write();
        let len = state.char_len();
        if len == 0 {
            return DeleteResult {
                success: false,
                applied_position: position,
                applied_length: length,
            };
        }
        let clamped_position = position.min(len.saturating_sub(1));
        let max_length = len - clamped_position;
        let clamped_length = length.max(1).min(max_length);
        if clamped_length == 0 {
            return DeleteResult {
                success: false,
                applied_position: clamped_position,
                applied_length: 0,
            };
        }

        let op = Operation::delete(clamped_position, clamped_length, author);
        let recent: Vec<Operation> = {
            let hist_len = state.history.len();
            let start = hist_len.saturating_sub(window);
            state.history.iter().skip(start).cloned().collect()
        };

        let transformed = match transform::transform_against(op, &recent) {
            Some(op) => op,
            None => {
                return DeleteResult {
                    success: false,
                    applied_position: clamped_position,
                    applied_length: clamped_length,
                }
            }
        };

        let applied_position = transformed.position;
        let applied_length = transformed.length().unwrap_or(0);
        match transform::apply(&state.content, &transformed) {
            Ok(new_content) => {
                state.content = new_content;
                state.push_history(transformed);
                state.touch();
                DeleteResult {
                    success: true,
                    applied_position,
                    applied_length,
                }
            }
            Err(_) => DeleteResult {
                success: false,
                applied_position,
                applied_length,
            },
        }
    }

    /// Applies a batch of already-constructed client operations in one
    /// critical section, used by tests exercising [`transform_batch`]
    /// end-to-end against a live document.
    #[cfg(test)]
    pub fn apply_batch(&self, ops: Vec<Operation>, window: usize) -> Vec<Operation> {
        let mut state = self.state.write();
        let hist_len = state.history.len();
        let start = hist_len.saturating_sub(window);
        let recent: Vec<Operation> = state.history.iter().skip(start).cloned().collect();
        let transformed = transform_batch(ops, &recent);
        for op in &transformed {
            if let Ok(new_content) = transform::apply(&state.content, op) {
                state.content = new_content;
                state.push_history(op.clone());
            }
        }
        state.touch();
        transformed
    }
}

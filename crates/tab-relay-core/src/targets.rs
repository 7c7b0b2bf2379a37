//! Attached-target bookkeeping.
//!
//! The registry mirrors what the extension has a debugger attached to. It is
//! pure data; protocol-level invariants (when to insert, when to sweep) are
//! the caller's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One attached browser target (typically a tab) exposed to automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Multiplexing key used on the wire between relay and clients.
    pub session_id: String,
    /// Stable browser-assigned tab identity.
    pub target_id: String,
    /// Descriptive metadata mirrored from the browser (url, title, type, ...).
    pub target_info: Value,
}

/// In-memory table of attached targets, keyed by session id.
///
/// Kept in insertion order so "the first registered target" is well defined.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the target for `session_id`.
    pub fn upsert(&mut self, session_id: String, target_id: String, target_info: Value) {
        let target = Target { session_id, target_id, target_info };
        match self.targets.iter_mut().find(|t| t.session_id == target.session_id) {
            Some(existing) => *existing = target,
            None => self.targets.push(target),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.session_id == session_id)
    }

    pub fn find_by_target_id(&self, target_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.target_id == target_id)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Target> {
        let idx = self.targets.iter().position(|t| t.session_id == session_id)?;
        Some(self.targets.remove(idx))
    }

    pub fn remove_by_target_id(&mut self, target_id: &str) -> Option<Target> {
        let idx = self.targets.iter().position(|t| t.target_id == target_id)?;
        Some(self.targets.remove(idx))
    }

    /// Refresh the mirrored metadata of the target with `target_id`.
    pub fn update_info(&mut self, target_id: &str, target_info: Value) {
        if let Some(target) = self.targets.iter_mut().find(|t| t.target_id == target_id) {
            target.target_info = target_info;
        }
    }

    pub fn first(&self) -> Option<&Target> {
        self.targets.first()
    }

    pub fn all(&self) -> &[Target] {
        &self.targets
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

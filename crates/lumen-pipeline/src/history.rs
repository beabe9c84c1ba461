//! The editing session: the ordered module list, the edit history, and
//! the session-wide flags pipelines watch while they compute.
//!
//! Pipelines read the history only while holding its lock, and always
//! take that lock before their own busy lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::registry::StageRegistry;

/// One edit: a full parameter snapshot for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Operation the edit applies to.
    pub op: String,
    /// Stage parameter blob.
    #[serde(default)]
    pub params: Vec<u8>,
    /// Blend parameter blob.
    #[serde(default)]
    pub blend_params: Vec<u8>,
    /// Whether the module is on after this edit.
    pub enabled: bool,
}

impl HistoryItem {
    /// An enabled edit with default blending.
    #[must_use]
    pub fn new(op: impl Into<String>, params: Vec<u8>) -> Self {
        Self {
            op: op.into(),
            params,
            blend_params: Vec::new(),
            enabled: true,
        }
    }

    /// Attach a blend blob.
    #[must_use]
    pub fn with_blend(mut self, blend_params: Vec<u8>) -> Self {
        self.blend_params = blend_params;
        self
    }

    /// Mark the edit as switching the module off.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Module order plus edits. Items past `end` are undone but kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// Operation names in pipeline order.
    pub modules: Vec<String>,
    /// Edits, oldest first.
    pub items: Vec<HistoryItem>,
    /// Number of items in effect.
    pub end: usize,
}

impl History {
    /// Items currently in effect.
    #[must_use]
    pub fn active(&self) -> &[HistoryItem] {
        &self.items[..self.end.min(self.items.len())]
    }

    /// The most recent item in effect.
    #[must_use]
    pub fn top(&self) -> Option<&HistoryItem> {
        self.active().last()
    }
}

/// Flags describing the state of the editing session.
#[derive(Debug, Default)]
pub struct SessionFlags {
    image_reloading: AtomicBool,
    preview_loading: AtomicBool,
    leaving: AtomicBool,
}

impl SessionFlags {
    /// A new image is being loaded into the full pipeline.
    pub fn set_image_reloading(&self, value: bool) {
        self.image_reloading.store(value, Ordering::Release);
    }

    /// The preview's base image is not ready yet.
    pub fn set_preview_loading(&self, value: bool) {
        self.preview_loading.store(value, Ordering::Release);
    }

    /// The session is being closed.
    pub fn set_leaving(&self, value: bool) {
        self.leaving.store(value, Ordering::Release);
    }

    /// See [`set_image_reloading`](Self::set_image_reloading).
    #[must_use]
    pub fn image_reloading(&self) -> bool {
        self.image_reloading.load(Ordering::Acquire)
    }

    /// See [`set_preview_loading`](Self::set_preview_loading).
    #[must_use]
    pub fn preview_loading(&self) -> bool {
        self.preview_loading.load(Ordering::Acquire)
    }

    /// See [`set_leaving`](Self::set_leaving).
    #[must_use]
    pub fn leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }
}

/// An editing session shared by the pipelines showing it.
#[derive(Debug)]
pub struct Develop {
    registry: Arc<StageRegistry>,
    history: Mutex<History>,
    session: SessionFlags,
}

impl Develop {
    /// Start a session with `modules` in pipeline order and no edits.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, modules: Vec<String>) -> Self {
        Self {
            registry,
            history: Mutex::new(History {
                modules,
                ..History::default()
            }),
            session: SessionFlags::default(),
        }
    }

    /// Stage constructors.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Session flags.
    #[must_use]
    pub const fn session(&self) -> &SessionFlags {
        &self.session
    }

    /// Take the history lock.
    pub fn lock_history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an edit, discarding any undone items.
    pub fn push(&self, item: HistoryItem) {
        let mut history = self.lock_history();
        let end = history.end.min(history.items.len());
        history.items.truncate(end);
        history.items.push(item);
        history.end = history.items.len();
    }

    /// Move the undo position.
    pub fn set_end(&self, end: usize) {
        let mut history = self.lock_history();
        history.end = end.min(history.items.len());
    }

    /// Replace the module order.
    pub fn set_modules(&self, modules: Vec<String>) {
        self.lock_history().modules = modules;
    }

    /// Snapshot of the current history.
    #[must_use]
    pub fn snapshot(&self) -> History {
        self.lock_history().clone()
    }
}

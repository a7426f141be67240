use std::sync::{Arc, Mutex};

use shared::domain::{StatusSnapshot, TestItemKey, TestStatus};
use tracing::debug;

use crate::subscription::{lock, ListenerSet, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub key: TestItemKey,
    pub previous: TestStatus,
    pub current: TestStatus,
}

/// Outcome of writing one status into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusWrite {
    Unchanged,
    /// First sighting of a key as `untested`. Stored without notifying
    /// watchers, but new to anyone mirroring the key set.
    Inserted,
    Changed(StatusChange),
}

impl StatusWrite {
    pub fn change(self) -> Option<StatusChange> {
        match self {
            Self::Changed(change) => Some(change),
            Self::Unchanged | Self::Inserted => None,
        }
    }

    /// True when the stored key set or value moved.
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusNotice {
    /// Full state at the moment the watcher registered.
    Replay(StatusSnapshot),
    Changed(StatusChange),
}

/// Latest status per test item, with change notifications.
///
/// Entries are never removed. A key that was never seen behaves as if it
/// were `untested`, so the first `untested` for it is stored without a
/// watcher notification; `write` still reports it as `Inserted`.
///
/// Watchers run while the registry holds its dispatch lock; they may read
/// (`snapshot`, `get`) but must not call `apply`, `write`, `merge` or `watch`.
#[derive(Default)]
pub struct StatusRegistry {
    entries: Mutex<StatusSnapshot>,
    dispatch: Mutex<()>,
    listeners: ListenerSet<StatusNotice>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, key: TestItemKey, status: TestStatus) -> Option<StatusChange> {
        self.write(key, status).change()
    }

    /// Like `apply`, but also reports a silent first insert.
    pub fn write(&self, key: TestItemKey, status: TestStatus) -> StatusWrite {
        let _dispatch = lock(&self.dispatch);
        let outcome = self.store(key, status);
        if let StatusWrite::Changed(change) = &outcome {
            debug!(
                key = %change.key,
                previous = %change.previous,
                current = %change.current,
                "status changed"
            );
            self.listeners.emit(&StatusNotice::Changed(change.clone()));
        }
        outcome
    }

    /// Applies every entry of a replayed snapshot. Keys missing from
    /// `snapshot` keep their current value.
    pub fn merge(&self, snapshot: StatusSnapshot) -> Vec<StatusChange> {
        let _dispatch = lock(&self.dispatch);
        let mut changes = Vec::new();
        for (key, status) in snapshot {
            if let Some(change) = self.store(key, status).change() {
                self.listeners.emit(&StatusNotice::Changed(change.clone()));
                changes.push(change);
            }
        }
        changes
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        lock(&self.entries).clone()
    }

    pub fn get(&self, key: &TestItemKey) -> Option<TestStatus> {
        lock(&self.entries).get(key).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Delivers `Replay` with the current snapshot, then every later change.
    pub fn watch(&self, callback: impl Fn(&StatusNotice) + Send + Sync + 'static) -> Subscription {
        let callback = Arc::new(callback);
        let _dispatch = lock(&self.dispatch);
        callback(&StatusNotice::Replay(self.snapshot()));
        self.listeners.insert(move |notice| callback(notice))
    }

    fn store(&self, key: TestItemKey, status: TestStatus) -> StatusWrite {
        let mut entries = lock(&self.entries);
        let previous = match entries.get(&key) {
            Some(previous) if *previous == status => return StatusWrite::Unchanged,
            Some(previous) => *previous,
            None if status == TestStatus::Untested => {
                entries.insert(key, status);
                return StatusWrite::Inserted;
            }
            None => TestStatus::Untested,
        };
        entries.insert(key.clone(), status);
        StatusWrite::Changed(StatusChange {
            key,
            previous,
            current: status,
        })
    }
}

#[cfg(test)]
#[path = "tests/status_registry_tests.rs"]
mod tests;

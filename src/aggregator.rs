//! Change-Set Aggregator (spec §4.7): folds a raw event stream into
//! per-root normalized created/modified/deleted sets, with a cancel-and-
//! reschedule idle-flush timer built directly on [`crate::debouncer::Debouncer`].

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::warn;

use crate::{
    debouncer::Debouncer,
    pipeline::{ChangeKind, DirectoryChangeEvent, Listener, PipelineError},
};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("cannot normalize an OVERFLOW event into a change set")]
    Overflow,
}

/// Per-root normalized event set (spec §3 "ChangeSet").
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub created: HashSet<PathBuf>,
    pub modified: HashSet<PathBuf>,
    pub deleted: HashSet<PathBuf>,
}

impl ChangeSet {
    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Apply the state-transition table from spec §4.7.
    fn apply(&mut self, path: PathBuf, kind: ChangeKind) {
        let was_created = self.created.remove(&path);
        let was_modified = self.modified.remove(&path);
        let was_deleted = self.deleted.remove(&path);

        match (was_created, was_modified, was_deleted, kind) {
            (false, false, false, ChangeKind::Create) => {
                self.created.insert(path);
            }
            (false, false, false, ChangeKind::Modify) => {
                self.modified.insert(path);
            }
            (false, false, false, ChangeKind::Delete) => {
                self.deleted.insert(path);
            }
            (true, _, _, ChangeKind::Create) => {
                self.created.insert(path);
            }
            (true, _, _, ChangeKind::Modify) => {
                self.created.insert(path);
            }
            (true, _, _, ChangeKind::Delete) => {
                // created then deleted before consumption: net no-op
            }
            (_, true, _, ChangeKind::Create) => {
                self.modified.insert(path);
            }
            (_, true, _, ChangeKind::Modify) => {
                self.modified.insert(path);
            }
            (_, true, _, ChangeKind::Delete) => {
                self.deleted.insert(path);
            }
            (_, _, true, ChangeKind::Modify) => {
                // illegal transition per spec table; ignore
                self.deleted.insert(path);
            }
            (_, _, true, ChangeKind::Create) => {
                self.modified.insert(path);
            }
            (_, _, true, ChangeKind::Delete) => {
                self.deleted.insert(path);
            }
            (false, false, false, ChangeKind::Overflow) => {}
            _ => unreachable!("path cannot occupy two sets at once"),
        }
    }
}

struct Inner {
    by_root: HashMap<PathBuf, ChangeSet>,
    event_count: u64,
}

/// Client callback invoked when the idle timer fires (spec §4.7 "Idle
/// flush").
pub trait IdleFlushCallback: Send {
    fn on_idle_flush(&mut self, event_count: u64);
}

pub struct ChangeSetAggregator {
    inner: Arc<Mutex<Inner>>,
    /// `Debouncer` is single-shot by design (see `debouncer.rs`: once its
    /// timeout fires it never accepts another bump). An idle-flush timer
    /// that must keep firing for the whole life of the watcher therefore
    /// holds the *current* one behind a lock and rotates in a fresh one
    /// after every fire, rather than reusing a single instance.
    idle: Option<(std::time::Duration, Arc<Mutex<Arc<Debouncer>>>)>,
}

impl ChangeSetAggregator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                by_root: HashMap::new(),
                event_count: 0,
            })),
            idle: None,
        }
    }

    /// Enable the idle-flush timer. `timeout` is the single-shot delay after
    /// the last event before the flush callback fires; each new event
    /// cancels and reschedules it.
    pub fn with_idle_timeout(timeout: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                by_root: HashMap::new(),
                event_count: 0,
            })),
            idle: Some((timeout, Arc::new(Mutex::new(Arc::new(Debouncer::new(timeout)))))),
        }
    }

    /// Spawn the background task that waits on the debouncer and invokes
    /// `callback` each time it fires, for as long as the aggregator is alive
    /// and a new `on_idle` keeps bumping the timer.
    pub fn spawn_idle_flush(&self, mut callback: Box<dyn IdleFlushCallback>) {
        let Some((timeout, cell)) = self.idle.clone() else {
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let current = cell.lock().expect("idle cell lock poisoned").clone();
                current.debounce().await;
                let count = inner.lock().expect("aggregator lock poisoned").event_count;
                callback.on_idle_flush(count);
                *cell.lock().expect("idle cell lock poisoned") = Arc::new(Debouncer::new(timeout));
            }
        });
    }

    /// Atomically return the accumulated per-root sets and reset the
    /// builder (spec §4.7 "Consumption semantics").
    pub fn take(&self) -> HashMap<PathBuf, ChangeSet> {
        let mut inner = self.inner.lock().expect("aggregator lock poisoned");
        std::mem::take(&mut inner.by_root)
    }
}

impl Default for ChangeSetAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener for ChangeSetAggregator {
    fn on_event(&mut self, event: DirectoryChangeEvent) {
        if event.kind == ChangeKind::Overflow {
            warn!("aggregator received OVERFLOW; batch cannot be normalized");
            return;
        }
        let Some(root) = event.root.clone() else {
            return;
        };
        let Some(path) = event.path.clone() else {
            return;
        };
        let mut inner = self.inner.lock().expect("aggregator lock poisoned");
        inner.event_count += 1;
        let set = inner.by_root.entry(root).or_default();
        set.apply(path, event.kind);
    }

    fn on_exception(&mut self, cause: PipelineError) {
        warn!("aggregator pipeline exception: {}", cause);
    }

    fn on_idle(&mut self, _event_count_so_far: u64) {
        if let Some((_, cell)) = &self.idle {
            let current = cell.lock().expect("idle cell lock poisoned").clone();
            current.bump();
        }
    }
}

/// Raised by a consumer that explicitly rejects an OVERFLOW batch, per spec
/// §4.8 ("the Aggregator refuses to process it... and surfaces an error").
pub fn reject_overflow(event: &DirectoryChangeEvent) -> Result<(), AggregatorError> {
    if event.kind == ChangeKind::Overflow {
        Err(AggregatorError::Overflow)
    } else {
        Ok(())
    }
}

#[allow(dead_code)]
fn assert_changeset_invariants(set: &ChangeSet) {
    debug_assert!(set.created.is_disjoint(&set.modified));
    debug_assert!(set.created.is_disjoint(&set.deleted));
    debug_assert!(set.modified.is_disjoint(&set.deleted));
    let _ = set.is_empty();
}

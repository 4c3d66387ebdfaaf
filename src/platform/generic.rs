//! Non-macOS backend: a thin wrapper around `notify`'s platform-specific raw
//! watcher (inotify on Linux, `ReadDirectoryChangesW` on Windows).
//!
//! Registration is deliberately always non-recursive on non-Windows targets,
//! even though `notify`'s own inotify implementation could walk the tree for
//! us: the whole point of §4.5's Recursive Registration Manager is to own
//! that walk itself, so this backend reports `NativeRecursive` as
//! unsupported on every platform except Windows, where
//! `ReadDirectoryChangesW`'s `bWatchSubtree` flag gives genuine kernel-level
//! recursion (grounded in the teacher's `watch_recursively` /
//! `manually_add_recursive_watches` split in `lib.rs`).

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use notify::{
    event::{ModifyKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use tracing::{trace, warn};

use super::{PlatformError, PlatformWatcher, RawEvent, RawEventKind, RecursiveIntent, RegistrationOutcome};
use crate::path_state::RegistrationKey;

pub struct NotifyBackend {
    inner: RecommendedWatcher,
    receiver: mpsc::Receiver<notify::Result<Event>>,
    directories: HashMap<PathBuf, RegistrationKey>,
    next_key: u64,
    pending: VecDeque<RawEvent>,
}

impl NotifyBackend {
    pub fn new() -> Result<Self, PlatformError> {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| PlatformError::Other(e.to_string()))?;
        Ok(Self {
            inner: watcher,
            receiver: rx,
            directories: HashMap::new(),
            next_key: 0,
            pending: VecDeque::new(),
        })
    }

    fn allocate_key(&mut self) -> RegistrationKey {
        let key = RegistrationKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Attribute an event path to whichever registered directory is its
    /// direct parent (the non-recursive case) or, failing that, the nearest
    /// registered ancestor (the Windows recursive case).
    fn key_for_path(&self, path: &Path) -> Option<RegistrationKey> {
        if let Some(parent) = path.parent() {
            if let Some(key) = self.directories.get(parent) {
                return Some(*key);
            }
        }
        self.directories
            .iter()
            .filter(|(dir, _)| path.starts_with(dir.as_path()))
            .max_by_key(|(dir, _)| dir.as_os_str().len())
            .map(|(_, key)| *key)
    }

    fn translate(&mut self, event: Event) {
        let Some(first_path) = event.paths.first() else {
            return;
        };
        let Some(key) = self.key_for_path(first_path) else {
            trace!("dropping event for unregistered path: {:?}", event.paths);
            return;
        };

        let mut push = |kind: RawEventKind, path: PathBuf| {
            self.pending.push_back(RawEvent {
                key: Some(key),
                kind,
                path: Some(path),
                count: 0,
            });
        };

        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    push(RawEventKind::Create, path);
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    push(RawEventKind::Delete, path);
                }
            }
            // notify has no way to associate the two sides of a rename
            // across separate callbacks on some platforms; where it can
            // (`Both`), treat it as a delete-then-create pair, matching how
            // the pipeline already reasons about races between those two
            // kinds.
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(path) = event.paths.into_iter().next() {
                    push(RawEventKind::Delete, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(path) = event.paths.into_iter().next() {
                    push(RawEventKind::Create, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut iter = event.paths.into_iter();
                if let Some(from) = iter.next() {
                    self.pending.push_back(RawEvent {
                        key: Some(key),
                        kind: RawEventKind::Delete,
                        path: Some(from),
                        count: 0,
                    });
                }
                if let Some(to) = iter.next() {
                    self.pending.push_back(RawEvent {
                        key: Some(key),
                        kind: RawEventKind::Create,
                        path: Some(to),
                        count: 0,
                    });
                }
            }
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                for path in event.paths {
                    push(RawEventKind::Modify, path);
                }
            }
            EventKind::Access(_) => {}
        }
    }
}

impl PlatformWatcher for NotifyBackend {
    fn register(
        &mut self,
        directory: &Path,
        intent: RecursiveIntent,
    ) -> Result<RegistrationOutcome, PlatformError> {
        let native_recursive_honored =
            cfg!(windows) && matches!(intent, RecursiveIntent::NativeRecursive);
        let mode = if native_recursive_honored {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.inner
            .watch(directory, mode)
            .map_err(|e| PlatformError::Other(e.to_string()))?;
        let key = self.allocate_key();
        self.directories.insert(directory.to_path_buf(), key);
        Ok(RegistrationOutcome {
            key,
            native_recursive_honored,
        })
    }

    fn unregister(&mut self, key: RegistrationKey) -> Result<(), PlatformError> {
        let directory = self
            .directories
            .iter()
            .find(|(_, k)| **k == key)
            .map(|(d, _)| d.clone());
        match directory {
            Some(dir) => {
                self.directories.remove(&dir);
                self.inner
                    .unwatch(&dir)
                    .map_err(|e| PlatformError::Other(e.to_string()))
            }
            None => Err(PlatformError::InvalidKey),
        }
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Option<RawEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            let received = match timeout {
                Some(t) => self.receiver.recv_timeout(t).ok(),
                None => self.receiver.recv().ok(),
            };
            match received {
                Some(Ok(event)) => {
                    self.translate(event);
                    if let Some(event) = self.pending.pop_front() {
                        return Some(event);
                    }
                }
                Some(Err(e)) => {
                    warn!("platform watcher error: {}", e);
                    // notify does not expose a discard count across
                    // backends; see DESIGN.md for the resolved open
                    // question on OVERFLOW bookkeeping.
                    return Some(RawEvent {
                        key: None,
                        kind: RawEventKind::Overflow,
                        path: None,
                        count: 0,
                    });
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::platform::RecursiveIntent;

    #[test]
    fn register_and_observe_create() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = NotifyBackend::new().unwrap();
        let outcome = backend
            .register(tmp.path(), RecursiveIntent::NonRecursive)
            .unwrap();
        assert!(!outcome.native_recursive_honored || cfg!(windows));

        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut saw_create = false;
        while std::time::Instant::now() < deadline {
            if let Some(event) = backend.poll(Some(Duration::from_millis(200))) {
                if matches!(event.kind, RawEventKind::Create) {
                    saw_create = true;
                    break;
                }
            }
        }
        assert!(saw_create, "expected a Create event for a.txt");
    }
}

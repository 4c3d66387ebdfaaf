//! Recursive Registration Manager (spec §4.5): keeps sub-tree registrations
//! in sync with the tree, preferring a kernel-native recursive mode and
//! falling back to manual per-directory registration otherwise.
//!
//! Grounded in the teacher's `manually_add_recursive_watches` /
//! `watch_recursively` feature-gated pair in `lib.rs`, generalized from a
//! compile-time feature flag into a runtime probe cached on the backend.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::{debug, warn};

use crate::{
    path_state::{PathState, RegistrationKey},
    platform::{PlatformError, PlatformWatcher, RecursiveIntent},
    visitor::TreeVisitor,
};

/// Process-wide cache of whether the active backend honors a native
/// recursive modifier. Populated by the first registration attempt and
/// never re-probed, per spec §9 "Feature probe for native recursion".
static NATIVE_RECURSIVE_PROBED: AtomicBool = AtomicBool::new(false);
static NATIVE_RECURSIVE_RESULT: AtomicBool = AtomicBool::new(false);

fn probe_result() -> Option<bool> {
    if NATIVE_RECURSIVE_PROBED.load(Ordering::Acquire) {
        Some(NATIVE_RECURSIVE_RESULT.load(Ordering::Acquire))
    } else {
        None
    }
}

fn cache_probe_result(native_recursive: bool) {
    NATIVE_RECURSIVE_RESULT.store(native_recursive, Ordering::Release);
    NATIVE_RECURSIVE_PROBED.store(true, Ordering::Release);
}

/// Resets the process-wide native-recursive probe cache. Exposed only for
/// tests, which otherwise leak state across independently-constructed
/// managers within the same test binary.
#[cfg(test)]
pub(crate) fn reset_probe_cache_for_tests() {
    NATIVE_RECURSIVE_PROBED.store(false, Ordering::Release);
}

pub struct RegistrationManager {
    /// `None` until the first `register_root` call resolves it (either from
    /// the process-wide cache or a fresh probe).
    native_recursive: Option<bool>,
}

impl RegistrationManager {
    pub fn new() -> Self {
        Self {
            native_recursive: probe_result(),
        }
    }

    pub fn native_recursive(&self) -> Option<bool> {
        self.native_recursive
    }

    /// Register `user_root` and every descendant directory the backend
    /// needs explicit registration for. Returns the set of registration
    /// keys created (one if native-recursive, one-per-directory otherwise).
    pub fn register_root(
        &mut self,
        user_root: &Path,
        backend: &mut dyn PlatformWatcher,
        state: &mut PathState,
        visitor: &dyn TreeVisitor,
    ) -> Result<Vec<RegistrationKey>, PlatformError> {
        let native_recursive = match self.native_recursive {
            Some(known) => known,
            None => {
                let outcome = backend.register(user_root, RecursiveIntent::NativeRecursive);
                return match outcome {
                    Ok(outcome) => {
                        self.native_recursive = Some(outcome.native_recursive_honored);
                        cache_probe_result(outcome.native_recursive_honored);
                        state.register(outcome.key, user_root.to_path_buf(), user_root.to_path_buf());
                        debug!(
                            native_recursive = outcome.native_recursive_honored,
                            root = %user_root.display(),
                            "probed native recursive registration"
                        );
                        if outcome.native_recursive_honored {
                            Ok(vec![outcome.key])
                        } else {
                            let mut keys = vec![outcome.key];
                            keys.extend(self.register_descendants(
                                user_root,
                                user_root,
                                backend,
                                state,
                                visitor,
                            )?);
                            Ok(keys)
                        }
                    }
                    Err(PlatformError::UnsupportedOperation) => {
                        self.native_recursive = Some(false);
                        cache_probe_result(false);
                        debug!(root = %user_root.display(), "native recursive unsupported; falling back to manual registration");
                        self.register_manual(user_root, backend, state, visitor)
                    }
                    Err(e) => Err(e),
                };
            }
            // fallthrough handled below once native_recursive is known
        };

        if native_recursive {
            let outcome = backend.register(user_root, RecursiveIntent::NativeRecursive)?;
            state.register(outcome.key, user_root.to_path_buf(), user_root.to_path_buf());
            Ok(vec![outcome.key])
        } else {
            self.register_manual(user_root, backend, state, visitor)
        }
    }

    fn register_manual(
        &mut self,
        user_root: &Path,
        backend: &mut dyn PlatformWatcher,
        state: &mut PathState,
        visitor: &dyn TreeVisitor,
    ) -> Result<Vec<RegistrationKey>, PlatformError> {
        let root_outcome = backend.register(user_root, RecursiveIntent::NonRecursive)?;
        state.register(root_outcome.key, user_root.to_path_buf(), user_root.to_path_buf());
        let mut keys = vec![root_outcome.key];
        keys.extend(self.register_descendants(user_root, user_root, backend, state, visitor)?);
        Ok(keys)
    }

    fn register_descendants(
        &mut self,
        user_root: &Path,
        start: &Path,
        backend: &mut dyn PlatformWatcher,
        state: &mut PathState,
        visitor: &dyn TreeVisitor,
    ) -> Result<Vec<RegistrationKey>, PlatformError> {
        let mut keys = Vec::new();
        let mut dirs = Vec::new();
        visitor.walk(
            start,
            &mut |dir| {
                if dir != start {
                    dirs.push(dir.to_path_buf());
                }
            },
            &mut |_file| {},
            &mut |failure| {
                warn!(
                    path = %failure.path.display(),
                    "walk failure while registering descendants: {:?}",
                    failure.error
                );
            },
        );
        for dir in dirs {
            match backend.register(&dir, RecursiveIntent::NonRecursive) {
                Ok(outcome) => {
                    state.register(outcome.key, dir.clone(), user_root.to_path_buf());
                    keys.push(outcome.key);
                }
                Err(e) => {
                    warn!(path = %dir.display(), "failed to register descendant directory: {}", e);
                }
            }
        }
        Ok(keys)
    }

    /// Register a single newly-created directory discovered by the Event
    /// Pipeline (spec §4.6 CREATE handling, "when native-recursive is off,
    /// register it").
    pub fn register_created_directory(
        &mut self,
        user_root: &Path,
        directory: &Path,
        backend: &mut dyn PlatformWatcher,
        state: &mut PathState,
    ) -> Result<Option<RegistrationKey>, PlatformError> {
        if self.native_recursive == Some(true) {
            return Ok(None);
        }
        let outcome = backend.register(directory, RecursiveIntent::NonRecursive)?;
        state.register(outcome.key, directory.to_path_buf(), user_root.to_path_buf());
        Ok(Some(outcome.key))
    }

    /// Drop the registration for `key`, returning the directory it covered.
    /// When this empties the registration table, the caller's loop should
    /// terminate (spec §4.5 step 3).
    pub fn invalidate(&mut self, key: RegistrationKey, state: &mut PathState) -> Option<PathBuf> {
        state.unregister(key)
    }
}

impl Default for RegistrationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform::generic::NotifyBackend, visitor::DefaultVisitor};

    #[test]
    fn manual_registration_covers_existing_subdirectories() {
        reset_probe_cache_for_tests();
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let mut backend = NotifyBackend::new().unwrap();
        let mut state = PathState::new();
        let visitor = DefaultVisitor;
        let mut manager = RegistrationManager::new();
        // Force manual mode for this test regardless of what the generic
        // backend would have reported, by asserting a concrete platform
        // behavior is irrelevant here: we only check that descendants are
        // discovered and registered when the probe result is `false`.
        manager.native_recursive = Some(false);

        let keys = manager
            .register_manual(tmp.path(), &mut backend, &mut state, &visitor)
            .unwrap();

        assert_eq!(keys.len(), 2);
        assert_eq!(state.registered_directory(keys[0]), Some(tmp.path()));
        assert_eq!(state.registered_directory(keys[1]), Some(sub.as_path()));
    }

    #[test]
    fn invalidate_removes_mapping() {
        let mut state = PathState::new();
        let key = RegistrationKey(7);
        state.register(key, PathBuf::from("/root/sub"), PathBuf::from("/root"));
        let mut manager = RegistrationManager::new();
        let removed = manager.invalidate(key, &mut state);
        assert_eq!(removed, Some(PathBuf::from("/root/sub")));
        assert!(!state.has_registrations());
    }
}

//! Event Pipeline (spec §4.6): the single loop that drives everything.
//! Consumes raw platform events, applies hash deduplication against
//! [`PathState`], re-walks created directories to cover races, and emits
//! [`DirectoryChangeEvent`] to the listener.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    hash::{FileHasher, Hash},
    path_state::PathState,
    platform::{PlatformWatcher, RawEventKind},
    registry::RegistrationManager,
    visitor::TreeVisitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Overflow,
}

/// Externally visible event shape (spec §6 "DirectoryChangeEvent").
#[derive(Debug, Clone)]
pub struct DirectoryChangeEvent {
    pub kind: ChangeKind,
    pub path: Option<PathBuf>,
    pub is_directory: bool,
    pub hash: Option<Hash>,
    pub root: Option<PathBuf>,
    pub count: u64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("event for unknown registration key")]
    UnknownRegistration,
    #[error("platform watcher error: {0}")]
    Platform(#[from] crate::platform::PlatformError),
}

/// Capability set a listener exposes to the loop (spec §9 "model as a
/// capability set passed by value" instead of an object-identity listener).
pub trait Listener: Send {
    fn on_event(&mut self, event: DirectoryChangeEvent);
    fn on_exception(&mut self, cause: PipelineError) {
        warn!("watcher exception: {}", cause);
    }
    fn on_idle(&mut self, _event_count_so_far: u64) {}
    fn should_continue(&self) -> bool {
        true
    }
}

pub struct Pipeline<'a> {
    pub backend: &'a mut dyn PlatformWatcher,
    pub state: &'a mut PathState,
    pub registry: &'a mut RegistrationManager,
    pub visitor: &'a dyn TreeVisitor,
    pub hasher: Option<&'a dyn FileHasher>,
    manual_recursive_synthesize_creates: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        backend: &'a mut dyn PlatformWatcher,
        state: &'a mut PathState,
        registry: &'a mut RegistrationManager,
        visitor: &'a dyn TreeVisitor,
        hasher: Option<&'a dyn FileHasher>,
    ) -> Self {
        Self {
            backend,
            state,
            registry,
            visitor,
            hasher,
            // On non-macOS, manually-registered directories race the
            // watcher: files created between `register` and the kernel
            // actually delivering events must be discovered by a re-walk
            // (spec §4.6 CREATE handling, "on non-macOS systems, re-walk").
            manual_recursive_synthesize_creates: !cfg!(target_os = "macos"),
        }
    }

    /// Run the loop until the listener signals it should stop or every
    /// registration has been invalidated. Blocking; callers wanting async
    /// behavior spawn this on a blocking task (see `lib.rs::watch_async`).
    ///
    /// Polls with no timeout, per spec §4.6, when `poll_tick` is `None`.
    /// `lib.rs` passes a short tick instead so `close()` can interrupt the
    /// loop between events without a backend-level cancellation primitive;
    /// `on_idle` still fires at most once per idle period regardless of how
    /// many ticks that period spans.
    pub fn run(&mut self, listener: &mut dyn Listener, poll_tick: Option<std::time::Duration>) {
        let mut event_count: u64 = 0;
        let mut idle_signaled = false;
        loop {
            if !listener.should_continue() {
                break;
            }
            if !self.state.has_registrations() {
                break;
            }

            match self.backend.poll(poll_tick) {
                None => {
                    if !idle_signaled {
                        listener.on_idle(event_count);
                        idle_signaled = true;
                    }
                    continue;
                }
                Some(raw) => {
                    idle_signaled = false;
                    if let Err(e) = self.process_one(raw, listener, &mut event_count) {
                        listener.on_exception(e);
                    }
                }
            }
        }
    }

    fn process_one(
        &mut self,
        raw: crate::platform::RawEvent,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) -> Result<(), PipelineError> {
        if raw.kind == RawEventKind::Overflow {
            listener.on_event(DirectoryChangeEvent {
                kind: ChangeKind::Overflow,
                path: None,
                is_directory: false,
                hash: None,
                root: None,
                count: raw.count,
            });
            *event_count += 1;
            return Ok(());
        }

        let key = raw.key.ok_or(PipelineError::UnknownRegistration)?;
        let registered_path = self
            .state
            .registered_directory(key)
            .ok_or(PipelineError::UnknownRegistration)?
            .to_path_buf();
        let user_root = self
            .state
            .owning_root(&registered_path)
            .ok_or(PipelineError::UnknownRegistration)?
            .to_path_buf();

        let child_path = raw.path.clone().unwrap_or_else(|| registered_path.clone());

        match raw.kind {
            RawEventKind::Create => {
                self.handle_create(&user_root, &child_path, listener, event_count)?;
            }
            RawEventKind::Modify => {
                self.handle_modify(&user_root, &child_path, listener, event_count);
            }
            RawEventKind::Delete => {
                self.handle_delete(&user_root, &child_path, listener, event_count);
            }
            RawEventKind::Overflow => unreachable!("handled above"),
        }

        Ok(())
    }

    fn handle_create(
        &mut self,
        user_root: &Path,
        child_path: &Path,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) -> Result<(), PipelineError> {
        let is_directory = child_path.is_dir();

        if is_directory {
            if self.registry.native_recursive() == Some(false) {
                if let Err(e) = self.registry.register_created_directory(
                    user_root,
                    child_path,
                    self.backend,
                    self.state,
                ) {
                    warn!(path = %child_path.display(), "failed to register new directory: {}", e);
                }
            }
            if self.manual_recursive_synthesize_creates {
                self.synthesize_creates_for(user_root, child_path, listener, event_count);
            }
        }

        self.unified_create(user_root, child_path, is_directory, listener, event_count);
        Ok(())
    }

    /// Re-walk a freshly (re-)registered directory and run every entry
    /// through the unified create path, so files created in the window
    /// between registration and kernel delivery are not lost.
    fn synthesize_creates_for(
        &mut self,
        user_root: &Path,
        directory: &Path,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) {
        let mut discovered = Vec::new();
        self.visitor.walk(
            directory,
            &mut |dir| discovered.push((dir.to_path_buf(), true)),
            &mut |file| discovered.push((file.to_path_buf(), false)),
            &mut |failure| {
                trace!("synthesize-create walk failure at {}: {:?}", failure.path.display(), failure.error);
            },
        );
        for (path, is_dir) in discovered {
            if path == directory {
                continue;
            }
            self.unified_create(user_root, &path, is_dir, listener, event_count);
        }
    }

    /// Spec §4.6 "Unified create-notification path".
    fn unified_create(
        &mut self,
        user_root: &Path,
        path: &Path,
        is_directory: bool,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) {
        match self.hasher {
            None => {
                if is_directory {
                    self.state.put(path.to_path_buf(), Hash::Directory);
                }
                self.emit(listener, event_count, ChangeKind::Create, path, is_directory, None, user_root, 0);
            }
            Some(hasher) => {
                let hash = hasher.hash(path, is_directory);
                match hash {
                    Some(hash) => {
                        if !self.state.contains(path) {
                            self.state.put(path.to_path_buf(), hash.clone());
                            self.emit(
                                listener,
                                event_count,
                                ChangeKind::Create,
                                path,
                                is_directory,
                                Some(hash),
                                user_root,
                                0,
                            );
                        }
                        // already seen: suppresses the create-then-modify burst
                    }
                    None => {
                        if path.exists() {
                            // locked or transiently unreadable; must not lose the create
                            self.emit(listener, event_count, ChangeKind::Create, path, is_directory, None, user_root, 0);
                        }
                        // else: raced with a delete, drop
                    }
                }
            }
        }
    }

    fn handle_modify(
        &mut self,
        user_root: &Path,
        path: &Path,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) {
        let is_directory = self.state.is_known_directory(path);
        match self.hasher {
            None => {
                self.emit(listener, event_count, ChangeKind::Modify, path, is_directory, None, user_root, 0);
            }
            Some(hasher) => {
                let Some(new_hash) = hasher.hash(path, is_directory) else {
                    return;
                };
                let changed = self.state.get(path) != Some(&new_hash);
                if changed {
                    self.state.put(path.to_path_buf(), new_hash.clone());
                    self.emit(
                        listener,
                        event_count,
                        ChangeKind::Modify,
                        path,
                        is_directory,
                        Some(new_hash),
                        user_root,
                        0,
                    );
                }
            }
        }
    }

    fn handle_delete(
        &mut self,
        user_root: &Path,
        path: &Path,
        listener: &mut dyn Listener,
        event_count: &mut u64,
    ) {
        if self.hasher.is_none() {
            let is_directory = self.state.is_known_directory(path);
            self.state.remove(path);
            self.emit(listener, event_count, ChangeKind::Delete, path, is_directory, None, user_root, 0);
            return;
        }

        let subtree: Vec<PathBuf> = self.state.subtree(path).map(|(p, _)| p.to_path_buf()).collect();
        for entry in subtree {
            let is_directory = self.state.is_known_directory(&entry);
            self.state.remove(&entry);
            self.emit(listener, event_count, ChangeKind::Delete, &entry, is_directory, None, user_root, 0);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        listener: &mut dyn Listener,
        event_count: &mut u64,
        kind: ChangeKind,
        path: &Path,
        is_directory: bool,
        hash: Option<Hash>,
        root: &Path,
        count: u64,
    ) {
        *event_count += 1;
        listener.on_event(DirectoryChangeEvent {
            kind,
            path: Some(path.to_path_buf()),
            is_directory,
            hash,
            root: Some(root.to_path_buf()),
            count,
        });
    }
}

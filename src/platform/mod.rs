//! Platform Watcher: "register a directory; deliver raw events keyed by a
//! watch handle" (spec §4.4), backed by the native kernel facility per OS.

pub mod generic;
#[cfg(target_os = "macos")]
pub mod macos;

use std::{
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

use crate::path_state::RegistrationKey;

/// Whether the caller is asking for kernel-native recursive delivery, or
/// explicitly registering a single directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursiveIntent {
    NativeRecursive,
    NonRecursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Create,
    Modify,
    Delete,
    Overflow,
}

/// A single event delivered by a backend, not yet deduplicated by content
/// hash — that happens in the [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// `None` when the backend cannot attribute the event to a specific
    /// registration — only ever the case for `Overflow`.
    pub key: Option<RegistrationKey>,
    pub kind: RawEventKind,
    /// Absolute path the event concerns. `None` only for `Overflow`.
    pub path: Option<PathBuf>,
    /// Number of events discarded; only meaningful for `Overflow`.
    pub count: u64,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("native recursive watching is not supported by this backend")]
    UnsupportedOperation,
    #[error("registration key is no longer valid")]
    InvalidKey,
    #[error("platform watcher io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("platform watcher error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrationOutcome {
    pub key: RegistrationKey,
    /// Whether the backend actually delivers events for the whole subtree
    /// from this single registration. When `false`, the registration manager
    /// must register descendant directories itself (spec §4.5).
    pub native_recursive_honored: bool,
}

/// Abstract contract satisfied by each OS backend.
pub trait PlatformWatcher: Send {
    fn register(
        &mut self,
        directory: &std::path::Path,
        intent: RecursiveIntent,
    ) -> Result<RegistrationOutcome, PlatformError>;

    fn unregister(&mut self, key: RegistrationKey) -> Result<(), PlatformError>;

    /// Block until at least one raw event is ready, or `timeout` elapses.
    /// A `timeout` of `None` blocks with no timeout, matching the pipeline's
    /// "poll with no timeout" contract (spec §4.6).
    fn poll(&mut self, timeout: Option<Duration>) -> Option<RawEvent>;
}

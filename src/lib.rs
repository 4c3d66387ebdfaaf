//! Recursive, cross-platform directory-change notification with
//! content-hash deduplication.
//!
//! A client registers one or more root directories via [`WatcherBuilder`];
//! the resulting [`DirectoryWatcher`] delivers a stream of CREATE / MODIFY /
//! DELETE / OVERFLOW events for every file and subdirectory below each root
//! until the client calls [`DirectoryWatcher::close`] or the listener signals
//! it should stop.

pub mod aggregator;
pub mod debouncer;
pub mod hash;
pub mod path_state;
pub mod pipeline;
pub mod platform;
pub mod registry;
pub mod visitor;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use aggregator::{ChangeSet, ChangeSetAggregator};
pub use hash::{FileHasher, Hash, MtimeHasher, Xxh3Hasher};
pub use pipeline::{ChangeKind, DirectoryChangeEvent, Listener, PipelineError};
pub use platform::{PlatformError, PlatformWatcher};
pub use visitor::{DefaultVisitor, TreeVisitor, WalkFailure};

use path_state::PathState;
use pipeline::Pipeline;
use registry::RegistrationManager;

/// Poll tick the event loop uses internally so `close()` can interrupt it
/// between raw events. Does not change `on_idle` semantics — see
/// `Pipeline::run`.
const POLL_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher has already been closed")]
    IllegalState,
    #[error("failed to register root {path}: {source}")]
    Registration {
        path: PathBuf,
        #[source]
        source: PlatformError,
    },
    #[error("failed to construct platform watcher: {0}")]
    BackendInit(String),
}

/// No-op listener used when a caller does not supply one, matching the
/// builder's default (spec §6 "listener: no-op").
pub struct NoopListener;

impl Listener for NoopListener {
    fn on_event(&mut self, _event: DirectoryChangeEvent) {}
}

/// Builder-configurable options (spec §6).
pub struct WatcherBuilder {
    paths: Vec<PathBuf>,
    file_hashing: bool,
    file_hasher: Option<Arc<dyn FileHasher>>,
    watch_service: Option<Box<dyn PlatformWatcher>>,
    file_tree_visitor: Arc<dyn TreeVisitor>,
}

impl WatcherBuilder {
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            file_hashing: true,
            file_hasher: None,
            watch_service: None,
            file_tree_visitor: Arc::new(DefaultVisitor),
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.paths.extend(paths);
        self
    }

    /// Toggle the default hasher on or off. Equivalent to passing
    /// `file_hasher(None)` when `false`.
    pub fn file_hashing(mut self, enabled: bool) -> Self {
        self.file_hashing = enabled;
        self
    }

    /// Install a custom hasher, or disable hashing with `None`. `None` is
    /// realized internally as [`hash::CountingHasher`], matching spec §4.4's
    /// "substitute an ever-incrementing counter".
    pub fn file_hasher(mut self, hasher: Option<Arc<dyn FileHasher>>) -> Self {
        self.file_hasher = hasher;
        self.file_hashing = self.file_hasher.is_some();
        self
    }

    pub fn watch_service(mut self, service: Box<dyn PlatformWatcher>) -> Self {
        self.watch_service = Some(service);
        self
    }

    pub fn file_tree_visitor(mut self, visitor: Arc<dyn TreeVisitor>) -> Self {
        self.file_tree_visitor = visitor;
        self
    }

    pub fn build(self) -> DirectoryWatcher {
        let hasher: Option<Arc<dyn FileHasher>> = if self.file_hashing {
            Some(
                self.file_hasher
                    .unwrap_or_else(|| Arc::new(Xxh3Hasher) as Arc<dyn FileHasher>),
            )
        } else {
            None
        };
        DirectoryWatcher {
            paths: self.paths,
            hasher,
            visitor: self.file_tree_visitor,
            custom_backend: Mutex::new(self.watch_service),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }
}

impl Default for WatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The constructed watcher. `watch` / `watch_async` each drain the whole
/// lifecycle of one loop; `close` is safe to call from any thread at any
/// point (spec §5 "Cancellation").
pub struct DirectoryWatcher {
    paths: Vec<PathBuf>,
    hasher: Option<Arc<dyn FileHasher>>,
    visitor: Arc<dyn TreeVisitor>,
    custom_backend: Mutex<Option<Box<dyn PlatformWatcher>>>,
    closed: AtomicBool,
    started: AtomicBool,
}

/// Wraps a caller's [`Listener`] so the loop also observes the watcher's
/// `closed` flag, without requiring every listener implementation to know
/// about it.
struct CloseAwareListener<'a> {
    inner: &'a mut dyn Listener,
    closed: &'a AtomicBool,
}

impl<'a> Listener for CloseAwareListener<'a> {
    fn on_event(&mut self, event: DirectoryChangeEvent) {
        self.inner.on_event(event)
    }
    fn on_exception(&mut self, cause: PipelineError) {
        self.inner.on_exception(cause)
    }
    fn on_idle(&mut self, event_count_so_far: u64) {
        self.inner.on_idle(event_count_so_far)
    }
    fn should_continue(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.inner.should_continue()
    }
}

#[cfg(target_os = "macos")]
fn new_default_backend() -> Result<Box<dyn PlatformWatcher>, WatchError> {
    Ok(Box::new(platform::macos::MacosBackend::default()))
}

#[cfg(not(target_os = "macos"))]
fn new_default_backend() -> Result<Box<dyn PlatformWatcher>, WatchError> {
    platform::generic::NotifyBackend::new()
        .map(|b| Box::new(b) as Box<dyn PlatformWatcher>)
        .map_err(|e| WatchError::BackendInit(e.to_string()))
}

impl DirectoryWatcher {
    /// Blocking: run the full watch loop on the calling thread. Returns once
    /// every registration has been invalidated, `close()` was called, or the
    /// listener's `should_continue()` returns `false`.
    pub fn watch(&self, mut listener: impl Listener) -> Result<(), WatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WatchError::IllegalState);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WatchError::IllegalState);
        }

        let mut backend = match self.custom_backend.lock().expect("lock poisoned").take() {
            Some(backend) => backend,
            None => new_default_backend()?,
        };

        let mut state = PathState::new();
        let mut registry = RegistrationManager::new();

        for path in &self.paths {
            registry
                .register_root(path, backend.as_mut(), &mut state, self.visitor.as_ref())
                .map_err(|e| WatchError::Registration {
                    path: path.clone(),
                    source: e,
                })?;
            debug!(path = %path.display(), "registered watch root");
        }

        let mut pipeline = Pipeline::new(
            backend.as_mut(),
            &mut state,
            &mut registry,
            self.visitor.as_ref(),
            self.hasher.as_deref(),
        );

        let mut wrapped = CloseAwareListener {
            inner: &mut listener,
            closed: &self.closed,
        };
        pipeline.run(&mut wrapped, Some(POLL_TICK));

        // Loop exited either because every registration became invalid, or
        // because it was closed externally — either way this is now a
        // closed watcher (spec §5 "implicit close").
        self.closed.store(true, Ordering::Release);
        info!("watch loop exited");
        Ok(())
    }

    /// Spawn the watch loop on a blocking task and return a handle whose
    /// `join` completes when the loop exits (spec §6 "watch_async").
    pub fn watch_async(self: Arc<Self>, listener: impl Listener + 'static) -> WatchHandle {
        let watcher = self.clone();
        let join = tokio::task::spawn_blocking(move || watcher.watch(listener));
        WatchHandle { watcher: self, join }
    }

    /// Idempotent. Safe to call from any thread, including from inside a
    /// listener callback running on the loop's own thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("watcher close requested");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handle returned by [`DirectoryWatcher::watch_async`].
pub struct WatchHandle {
    watcher: Arc<DirectoryWatcher>,
    join: tokio::task::JoinHandle<Result<(), WatchError>>,
}

impl WatchHandle {
    pub fn close(&self) {
        self.watcher.close();
    }

    /// Await loop completion. Startup failures (bad registration) complete
    /// exceptionally, per spec §7's propagation policy. The one deliberate
    /// exception is `IllegalState` from racing a `close()`: spec P7 calls for
    /// `watch_async().get()` after `close()` to "return normally" even
    /// though the synchronous `watch()` call that hit the same race returns
    /// an error.
    pub async fn join(self) -> Result<(), WatchError> {
        match self.join.await {
            Ok(Err(WatchError::IllegalState)) => Ok(()),
            Ok(result) => result,
            Err(e) => {
                warn!("watch task panicked: {}", e);
                Ok(())
            }
        }
    }
}

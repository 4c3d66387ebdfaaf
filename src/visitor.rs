//! Recursive filesystem walker used to seed and re-scan watched subtrees.

use std::path::Path;

use walkdir::WalkDir;

/// A per-entry failure encountered while walking. The default policy logs
/// and continues; a custom [`TreeVisitor`] may surface these however it
/// likes.
#[derive(Debug)]
pub struct WalkFailure {
    pub path: std::path::PathBuf,
    pub error: walkdir::Error,
}

/// Recursive pre-order walker contract.
///
/// `on_dir` and `on_file` are invoked in pre-order (a directory before its
/// children). A per-entry I/O failure never aborts the walk — it is passed to
/// `on_failure` instead.
pub trait TreeVisitor: Send + Sync {
    fn walk(
        &self,
        root: &Path,
        on_dir: &mut dyn FnMut(&Path),
        on_file: &mut dyn FnMut(&Path),
        on_failure: &mut dyn FnMut(WalkFailure),
    );
}

/// Default visitor: `walkdir`-based, does not follow symlinks when
/// classifying an entry as file/directory (consistent with treating a
/// symlink itself as the watched object, per the open question in spec.md
/// §9 — this implementation picks `NOFOLLOW_LINKS` at walk time and
/// `FOLLOW_LINKS` only inside the default hasher, which reads file contents
/// through the symlink).
#[derive(Debug, Default)]
pub struct DefaultVisitor;

impl TreeVisitor for DefaultVisitor {
    fn walk(
        &self,
        root: &Path,
        on_dir: &mut dyn FnMut(&Path),
        on_file: &mut dyn FnMut(&Path),
        on_failure: &mut dyn FnMut(WalkFailure),
    ) {
        walk(root, on_dir, on_file, on_failure)
    }
}

/// Free function used both by [`DefaultVisitor`] and internally wherever a
/// one-off re-walk is needed (e.g. synthesizing creates for a directory that
/// raced the registration manager).
pub fn walk(
    root: &Path,
    on_dir: &mut dyn FnMut(&Path),
    on_file: &mut dyn FnMut(&Path),
    on_failure: &mut dyn FnMut(WalkFailure),
) {
    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_dir() {
                    on_dir(entry.path());
                } else {
                    on_file(entry.path());
                }
            }
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                on_failure(WalkFailure { path, error: err });
            }
        }
    }
}

//! Ordered path→hash map plus the bookkeeping the registration manager and
//! event pipeline need to attribute raw platform events back to a user root.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    path::{Path, PathBuf},
};

use crate::hash::Hash;

/// Opaque handle correlating a platform registration to the directory it
/// covers. Backends hand these out; the registration manager and pipeline
/// never inspect the internal value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, std::hash::Hash, PartialOrd, Ord)]
pub struct RegistrationKey(pub(crate) u64);

/// Ordered mapping `absolute path -> Hash`, the set of known directories,
/// and the registration bookkeeping from spec §4.5.
///
/// Mutated only by the event-loop thread; externally exposed only through
/// [`PathState::path_hashes`], which is read-only by construction rather than
/// by a runtime check (see DESIGN.md — this is a deliberate departure from
/// the Java original's `UnsupportedOperationException` pattern in favor of
/// Rust's ownership model).
#[derive(Debug, Default)]
pub struct PathState {
    entries: BTreeMap<PathBuf, Hash>,
    directories: HashSet<PathBuf>,
    registrations: HashMap<RegistrationKey, PathBuf>,
    owning_root: HashMap<PathBuf, PathBuf>,
}

impl PathState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, path: PathBuf, hash: Hash) {
        if hash.is_directory() {
            self.directories.insert(path.clone());
        }
        self.entries.insert(path, hash);
    }

    pub fn get(&self, path: &Path) -> Option<&Hash> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<Hash> {
        self.directories.remove(path);
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// All entries whose path starts with `prefix` followed by a path
    /// separator, or is equal to `prefix`, in path order. Realized as a
    /// `BTreeMap` range bounded by `[prefix, prefix + MAX_CHAR)` (see
    /// GLOSSARY): the upper bound is `prefix` with an extra trailing
    /// component consisting solely of `\u{10FFFF}`, which sorts after every
    /// real descendant of `prefix` but before any sibling whose name merely
    /// shares `prefix`'s final component as a prefix (e.g. `dir` vs `dir2`).
    pub fn subtree(&self, prefix: &Path) -> impl Iterator<Item = (&Path, &Hash)> {
        let upper = subtree_upper_bound(prefix);
        let lower = Bound::Included(prefix.to_path_buf());
        let upper = match upper {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        self.entries
            .range((lower, upper))
            .map(|(p, h)| (p.as_path(), h))
    }

    pub fn known_directories(&self) -> &HashSet<PathBuf> {
        &self.directories
    }

    pub fn is_known_directory(&self, path: &Path) -> bool {
        self.directories.contains(path)
    }

    /// Read-only view handed to clients. No mutating methods exist on the
    /// returned type.
    pub fn path_hashes(&self) -> PathHashesView<'_> {
        PathHashesView(self)
    }

    pub fn register(&mut self, key: RegistrationKey, directory: PathBuf, user_root: PathBuf) {
        self.owning_root.insert(directory.clone(), user_root);
        self.registrations.insert(key, directory);
    }

    /// Drop the registration for `key`. Returns the directory that was
    /// registered, if any. The reverse `directory -> user_root` mapping is
    /// left alone: multiple registration keys (e.g. a re-registration after
    /// a transient failure) may share a directory during the handoff.
    pub fn unregister(&mut self, key: RegistrationKey) -> Option<PathBuf> {
        self.registrations.remove(&key)
    }

    pub fn registered_directory(&self, key: RegistrationKey) -> Option<&Path> {
        self.registrations.get(&key).map(PathBuf::as_path)
    }

    pub fn owning_root(&self, directory: &Path) -> Option<&Path> {
        self.owning_root.get(directory).map(PathBuf::as_path)
    }

    pub fn has_registrations(&self) -> bool {
        !self.registrations.is_empty()
    }

    pub fn forget_root(&mut self, user_root: &Path) {
        self.owning_root.retain(|_, root| root != user_root);
    }
}

/// `prefix` with a new trailing component appended (not the last existing
/// component's name extended), so it sorts after every descendant of
/// `prefix` without swallowing siblings that share a name prefix.
fn subtree_upper_bound(prefix: &Path) -> Option<PathBuf> {
    Some(prefix.join("\u{10FFFF}"))
}

/// Read-only view over a [`PathState`]'s path→hash map.
#[derive(Clone, Copy)]
pub struct PathHashesView<'a>(&'a PathState);

impl<'a> PathHashesView<'a> {
    pub fn get(&self, path: &Path) -> Option<&'a Hash> {
        self.0.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a Path, &'a Hash)> {
        self.0.entries.iter().map(|(p, h)| (p.as_path(), h))
    }

    pub fn subtree(&self, prefix: &Path) -> impl Iterator<Item = (&'a Path, &'a Hash)> {
        self.0.subtree(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn subtree_includes_prefix_and_descendants_only() {
        let mut state = PathState::new();
        state.put(path("/root"), Hash::Directory);
        state.put(path("/root/dir"), Hash::Directory);
        state.put(path("/root/dir/a.txt"), Hash::Content([1; 16]));
        state.put(path("/root/dir/sub"), Hash::Directory);
        state.put(path("/root/dir/sub/b.txt"), Hash::Content([2; 16]));
        state.put(path("/root/dir2"), Hash::Directory);
        state.put(path("/root/dir2/c.txt"), Hash::Content([3; 16]));

        let found: Vec<_> = state
            .subtree(Path::new("/root/dir"))
            .map(|(p, _)| p.to_path_buf())
            .collect();

        assert_eq!(
            found,
            vec![
                path("/root/dir"),
                path("/root/dir/a.txt"),
                path("/root/dir/sub"),
                path("/root/dir/sub/b.txt"),
            ]
        );
    }

    #[test]
    fn subtree_excludes_sibling_whose_name_shares_a_prefix() {
        let mut state = PathState::new();
        state.put(path("/root/a"), Hash::Directory);
        state.put(path("/root/a/x.txt"), Hash::Content([1; 16]));
        state.put(path("/root/ab"), Hash::Directory);
        state.put(path("/root/ab/y.txt"), Hash::Content([2; 16]));

        let found: Vec<_> = state
            .subtree(Path::new("/root/a"))
            .map(|(p, _)| p.to_path_buf())
            .collect();

        assert_eq!(found, vec![path("/root/a"), path("/root/a/x.txt")]);
    }

    #[test]
    fn known_directories_tracks_put_and_remove() {
        let mut state = PathState::new();
        state.put(path("/root"), Hash::Directory);
        assert!(state.is_known_directory(&path("/root")));
        state.remove(&path("/root"));
        assert!(!state.is_known_directory(&path("/root")));
    }

    #[test]
    fn path_hashes_view_exposes_read_only_access() {
        let mut state = PathState::new();
        state.put(path("/root/a.txt"), Hash::Content([9; 16]));
        let view = state.path_hashes();
        assert_eq!(view.get(&path("/root/a.txt")), Some(&Hash::Content([9; 16])));
        assert_eq!(view.iter().count(), 1);
    }

    #[test]
    fn registration_roundtrip() {
        let mut state = PathState::new();
        let key = RegistrationKey(1);
        state.register(key, path("/root/sub"), path("/root"));
        assert_eq!(state.registered_directory(key), Some(path("/root/sub").as_path()));
        assert_eq!(state.owning_root(&path("/root/sub")), Some(path("/root").as_path()));
        assert!(state.has_registrations());
        state.unregister(key);
        assert!(!state.has_registrations());
    }
}

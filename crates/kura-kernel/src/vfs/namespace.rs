//! In-memory path table.
//!
//! The namespace maps absolute paths to inodes. It is purely synchronous:
//! every mutation appends events to an internal journal which the engine
//! drains and publishes once the namespace lock is released.
//!
//! Deletions leave a [`Tombstone`] behind. Tombstones let replica merges be
//! order independent: an upsert older than a remembered deletion is rejected.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use kura_cas::Digest;

use crate::flows::{FsEvent, OpSource};
use crate::path::{self, ROOT};
use crate::vfs::types::{Inode, Tombstone};

/// Path → inode table with event journal and tombstone memory.
#[derive(Debug)]
pub struct Namespace {
    inodes: BTreeMap<String, Inode>,
    tombstones: HashMap<String, Tombstone>,
    journal: Vec<FsEvent>,
    source: OpSource,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Namespace holding only the root directory.
    pub fn new() -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT.to_string(), Inode::dir(0, 0));
        Self {
            inodes,
            tombstones: HashMap::new(),
            journal: Vec::new(),
            source: OpSource::Local,
        }
    }

    /// Rebuild a namespace from persisted state. No events are recorded.
    pub fn from_parts(
        inodes: impl IntoIterator<Item = (String, Inode)>,
        tombstones: impl IntoIterator<Item = (String, Tombstone)>,
    ) -> Self {
        let mut ns = Self::new();
        for (path, inode) in inodes {
            if path != ROOT {
                ns.inodes.insert(path, inode);
            }
        }
        ns.tombstones.extend(tombstones);
        ns
    }

    /// Look up an inode.
    pub fn get(&self, path: &str) -> Option<&Inode> {
        self.inodes.get(path)
    }

    /// Returns true if `path` is present.
    pub fn contains(&self, path: &str) -> bool {
        self.inodes.contains_key(path)
    }

    /// Returns true if `path` is a regular file.
    pub fn is_file(&self, path: &str) -> bool {
        self.get(path).is_some_and(Inode::is_file)
    }

    /// Returns true if `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        self.get(path).is_some_and(Inode::is_dir)
    }

    /// Number of inodes, root included.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Always false: root is always present.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Iterate over every inode in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Inode)> {
        self.inodes.iter()
    }

    /// Origin stamped on recorded events.
    pub fn source(&self) -> OpSource {
        self.source
    }

    /// Insert or replace an inode.
    ///
    /// Emits `write-inode` and forgets any tombstone at `path`. Writes to root
    /// are ignored: root is fixed, never persisted, never announced.
    pub fn set(&mut self, path: &str, inode: Inode) {
        if path == ROOT {
            return;
        }
        trace!(path, kind = %inode.kind(), "set inode");
        self.tombstones.remove(path);
        self.inodes.insert(path.to_string(), inode.clone());
        self.record(FsEvent::WriteInode {
            path: path.to_string(),
            inode,
            source: self.source,
        });
    }

    /// Remove an inode, leaving a tombstone stamped `at`.
    ///
    /// Emits `delete-inode`. Root is never removed.
    pub fn remove(&mut self, path: &str, at: i64) -> Option<Inode> {
        if path == ROOT {
            return None;
        }
        let inode = self.inodes.remove(path)?;
        let tombstone = Tombstone::at(at);
        self.remember(path, tombstone);
        self.record(FsEvent::DeleteInode {
            path: path.to_string(),
            tombstone,
            source: self.source,
        });
        Some(inode)
    }

    /// Names of the direct children of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(path);
        self.inodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// `path` (if present) and every descendant, sorted.
    ///
    /// Ancestors sort before descendants, so iterating in reverse is a
    /// post-order walk.
    pub fn paths_under(&self, path: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(path);
        let mut paths: Vec<String> = Vec::new();
        if self.contains(path) && path != prefix {
            paths.push(path.to_string());
        }
        paths.extend(
            self.inodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone()),
        );
        paths
    }

    /// Run `action` on every path matching `predicate`.
    ///
    /// Matches are collected before the first action runs, so actions may
    /// mutate the namespace.
    pub fn for_each_path<P, A>(&mut self, mut predicate: P, mut action: A)
    where
        P: FnMut(&str, &Inode) -> bool,
        A: FnMut(&mut Self, &str),
    {
        let matched: Vec<String> = self
            .inodes
            .iter()
            .filter(|(path, inode)| predicate(path, inode))
            .map(|(path, _)| path.clone())
            .collect();
        for path in matched {
            action(self, &path);
        }
    }

    /// Every digest referenced by a live inode.
    pub fn referenced_digests(&self) -> HashSet<Digest> {
        self.inodes
            .values()
            .flat_map(|inode| inode.blocks().iter().cloned())
            .collect()
    }

    /// Remembered deletion at `path`.
    pub fn tombstone(&self, path: &str) -> Option<Tombstone> {
        self.tombstones.get(path).copied()
    }

    /// Every remembered deletion.
    pub fn tombstones(&self) -> impl Iterator<Item = (&String, &Tombstone)> {
        self.tombstones.iter()
    }

    /// Forget deletions recorded before `cutoff`. Returns the paths whose
    /// tombstone was dropped, sorted.
    pub fn forget_tombstones(&mut self, cutoff: i64) -> Vec<String> {
        let mut forgotten: Vec<String> = self
            .tombstones
            .iter()
            .filter(|(_, t)| t.mtime < cutoff)
            .map(|(p, _)| p.clone())
            .collect();
        forgotten.sort();
        for path in &forgotten {
            self.tombstones.remove(path);
        }
        forgotten
    }

    /// Largest timestamp held anywhere in the table.
    pub fn max_timestamp(&self) -> i64 {
        let inodes = self.inodes.values().map(|i| i.cdate().max(i.mdate()));
        let tombs = self.tombstones.values().map(|t| t.ctime.max(t.mtime));
        inodes.chain(tombs).max().unwrap_or(0)
    }

    /// Queue an event for publication.
    pub fn record(&mut self, event: FsEvent) {
        self.journal.push(event);
    }

    /// Take every event recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<FsEvent> {
        std::mem::take(&mut self.journal)
    }

    fn remember(&mut self, path: &str, tombstone: Tombstone) {
        self.tombstones
            .entry(path.to_string())
            .and_modify(|t| {
                if tombstone.mtime > t.mtime {
                    *t = tombstone;
                }
            })
            .or_insert(tombstone);
    }

    fn as_remote<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = std::mem::replace(&mut self.source, OpSource::Remote);
        let out = f(self);
        self.source = prev;
        out
    }

    /// Apply an upsert received from a peer.
    ///
    /// Accepted when nothing local is newer: the incoming `mdate` must be
    /// strictly greater than the local inode's (ties keep local) and than any
    /// remembered deletion. The parent need not exist yet: a child can
    /// arrive in an earlier frame than its directory. Returns true if the
    /// namespace changed.
    pub fn merge_upsert(&mut self, path: &str, inode: Inode) -> bool {
        if path == ROOT || !path::is_absolute(path) || path::normalize(path) != path {
            debug!(path, "rejecting upsert for invalid path");
            return false;
        }
        let mdate = inode.mdate();
        match self.get(path) {
            Some(local) if mdate <= local.mdate() => return false,
            None if self.tombstone(path).is_some_and(|t| t.mtime >= mdate) => return false,
            _ => {}
        }
        if !path::is_root(path) && !self.is_dir(&path::parent(path)) {
            // Frames may arrive out of order; the parent record follows
            debug!(path, "accepting upsert ahead of its parent directory");
        }

        self.as_remote(|ns| {
            // A directory replaced by a file takes its subtree with it
            if inode.is_file() && ns.is_dir(path) {
                let prefix = path::descendant_prefix(path);
                for child in ns.paths_under(path).into_iter().rev() {
                    if child.starts_with(&prefix) {
                        ns.remove(&child, mdate);
                    }
                }
            }
            ns.set(path, inode);
        });
        true
    }

    /// Apply a deletion received from a peer.
    ///
    /// The tombstone is always remembered. If the local inode is not newer
    /// than the deletion it is removed together with its subtree. Returns true
    /// if the namespace changed.
    pub fn merge_tombstone(&mut self, path: &str, tombstone: Tombstone) -> bool {
        if path == ROOT || !path::is_absolute(path) {
            return false;
        }
        let live = self.get(path).map(Inode::mdate);
        let changed = match live {
            Some(mdate) if mdate <= tombstone.mtime => {
                self.as_remote(|ns| {
                    for victim in ns.paths_under(path).into_iter().rev() {
                        ns.remove(&victim, tombstone.mtime);
                    }
                });
                true
            }
            _ => false,
        };
        self.remember(path, tombstone);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_with(paths: &[(&str, Inode)]) -> Namespace {
        let mut ns = Namespace::new();
        for (path, inode) in paths {
            ns.set(path, inode.clone());
        }
        ns.drain_events();
        ns
    }

    fn file(mdate: i64) -> Inode {
        Inode::file(mdate, mdate, 0, vec![], "text/plain", None)
    }

    #[test]
    fn test_root_is_fixed() {
        let mut ns = Namespace::new();
        assert!(ns.is_dir("/"));
        ns.set("/", file(5));
        assert!(ns.is_dir("/"));
        assert!(ns.remove("/", 5).is_none());
        assert!(ns.drain_events().is_empty());
    }

    #[test]
    fn test_set_and_remove_emit() {
        let mut ns = Namespace::new();
        ns.set("/a", Inode::dir(1, 1));
        ns.remove("/a", 2);

        let events = ns.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], FsEvent::WriteInode { path, .. } if path == "/a"));
        assert!(
            matches!(&events[1], FsEvent::DeleteInode { tombstone, .. } if tombstone.mtime == 2)
        );
        assert_eq!(ns.tombstone("/a"), Some(Tombstone::at(2)));

        ns.set("/a", Inode::dir(3, 3));
        assert_eq!(ns.tombstone("/a"), None);
    }

    #[test]
    fn test_children_and_paths_under() {
        let ns = ns_with(&[
            ("/a", Inode::dir(1, 1)),
            ("/a/x", file(1)),
            ("/a/y", Inode::dir(1, 1)),
            ("/a/y/z", file(1)),
            ("/a b", file(1)),
            ("/ab", file(1)),
            ("@u", Inode::dir(1, 1)),
        ]);

        assert_eq!(ns.children("/a"), vec!["x", "y"]);
        assert_eq!(ns.children("/"), vec!["a", "a b", "ab"]);
        assert_eq!(ns.children("@u"), Vec::<String>::new());
        assert_eq!(ns.paths_under("/a"), vec!["/a", "/a/x", "/a/y", "/a/y/z"]);
        assert_eq!(ns.paths_under("@u"), vec!["@u"]);
        assert!(ns.paths_under("/nope").is_empty());
        assert_eq!(ns.paths_under("/").len(), 7);
    }

    #[test]
    fn test_for_each_path_may_mutate() {
        let mut ns = ns_with(&[("/a", file(1)), ("/b", file(1)), ("/c", Inode::dir(1, 1))]);
        ns.for_each_path(|_, inode| inode.is_file(), |ns, path| {
            ns.remove(path, 9);
        });
        assert_eq!(ns.children("/"), vec!["c"]);
    }

    #[test]
    fn test_referenced_digests() {
        let ns = ns_with(&[
            ("/a", Inode::file(1, 1, 2, vec!["x".into(), "y".into()], "a/b", None)),
            ("/b", Inode::file(1, 1, 1, vec!["x".into()], "a/b", None)),
        ]);
        let refs = ns.referenced_digests();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("y"));
    }

    #[test]
    fn test_merge_upsert_last_writer_wins() {
        let mut ns = ns_with(&[("/f", file(10))]);

        assert!(!ns.merge_upsert("/f", file(10)), "ties keep local");
        assert!(!ns.merge_upsert("/f", file(9)));
        assert!(ns.merge_upsert("/f", file(11)));
        assert_eq!(ns.get("/f").unwrap().mdate(), 11);

        let events = ns.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source(), OpSource::Remote);
        assert_eq!(ns.source(), OpSource::Local);
    }

    #[test]
    fn test_merge_upsert_rejects_bad_paths() {
        let mut ns = Namespace::new();
        assert!(!ns.merge_upsert("/", Inode::dir(1, 1)));
        assert!(!ns.merge_upsert("relative", file(1)));
        assert!(!ns.merge_upsert("/a/../b", file(1)));
        assert!(ns.merge_upsert("@u", Inode::dir(1, 1)));
        assert!(ns.merge_upsert("@u/f", file(1)));
    }

    #[test]
    fn test_merge_upsert_ahead_of_parent() {
        let mut ns = Namespace::new();
        assert!(ns.merge_upsert("/d/e", Inode::dir(2, 2)));
        assert!(ns.is_dir("/d/e"));
        assert!(!ns.contains("/d"));

        assert!(ns.merge_upsert("/d", Inode::dir(1, 1)));
        assert_eq!(ns.children("/d"), vec!["e"]);
    }

    #[test]
    fn test_tombstone_then_older_upsert() {
        let mut ns = Namespace::new();
        assert!(!ns.merge_tombstone("/f", Tombstone::at(20)));
        assert!(!ns.merge_upsert("/f", file(10)));
        assert!(!ns.merge_upsert("/f", file(20)));
        assert!(ns.merge_upsert("/f", file(21)));
    }

    #[test]
    fn test_tombstone_deletes_subtree() {
        let mut ns = ns_with(&[
            ("/d", Inode::dir(1, 1)),
            ("/d/a", file(1)),
            ("/d/e", Inode::dir(1, 1)),
            ("/d/e/b", file(1)),
        ]);
        assert!(ns.merge_tombstone("/d", Tombstone::at(5)));
        assert_eq!(ns.len(), 1);

        let deleted: Vec<String> = ns
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                FsEvent::DeleteInode { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["/d/e/b", "/d/e", "/d/a", "/d"]);
    }

    #[test]
    fn test_newer_local_survives_tombstone() {
        let mut ns = ns_with(&[("/f", file(10))]);
        assert!(!ns.merge_tombstone("/f", Tombstone::at(9)));
        assert!(ns.contains("/f"));
        assert!(ns.merge_tombstone("/f", Tombstone::at(10)));
        assert!(!ns.contains("/f"));
    }

    #[test]
    fn test_file_replacing_dir_drops_subtree() {
        let mut ns = ns_with(&[("/d", Inode::dir(1, 1)), ("/d/a", file(1))]);
        assert!(ns.merge_upsert("/d", file(5)));
        assert!(ns.is_file("/d"));
        assert!(!ns.contains("/d/a"));
    }

    #[test]
    fn test_forget_tombstones() {
        let mut ns = Namespace::new();
        ns.merge_tombstone("/old", Tombstone::at(5));
        ns.merge_tombstone("/new", Tombstone::at(50));

        assert_eq!(ns.forget_tombstones(10), vec!["/old"]);
        assert_eq!(ns.tombstone("/old"), None);
        assert_eq!(ns.tombstone("/new"), Some(Tombstone::at(50)));

        // A forgotten deletion no longer blocks an older upsert
        assert!(ns.merge_upsert("/old", file(3)));
    }

    #[test]
    fn test_from_parts_keeps_fixed_root() {
        let ns = Namespace::from_parts(
            vec![("/".to_string(), file(3)), ("/a".to_string(), file(7))],
            vec![("/gone".to_string(), Tombstone::at(9))],
        );
        assert!(ns.is_dir("/"));
        assert!(ns.is_file("/a"));
        assert_eq!(ns.max_timestamp(), 9);
    }
}

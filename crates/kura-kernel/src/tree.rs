//! Tree operations over the namespace.
//!
//! Every operation takes absolute, normalized paths and the timestamp to stamp
//! new or modified inodes with. Preconditions are checked before the first
//! mutation, so a failed operation leaves the namespace untouched.

use tracing::debug;

use crate::flows::FsEvent;
use crate::path;
use crate::vfs::{FsError, FsResult, Inode, Namespace};

impl Namespace {
    /// Create a directory, or refresh the `mdate` of an existing one.
    ///
    /// # Errors
    ///
    /// `NotFound` if the parent is not a directory, `AlreadyExists` if a file
    /// occupies `path`.
    pub fn mkdir(&mut self, path: &str, now: i64) -> FsResult<()> {
        let parent = path::parent(path);
        if !self.is_dir(&parent) {
            return Err(FsError::not_found(format!("parent directory not found: {parent}")));
        }
        match self.get(path) {
            Some(Inode::File { .. }) => Err(FsError::already_exists(path)),
            Some(existing @ Inode::Dir { .. }) => {
                let refreshed = existing.touched(now);
                self.set(path, refreshed);
                Ok(())
            }
            None => {
                debug!(path, "mkdir");
                self.set(path, Inode::dir(now, now));
                self.record(FsEvent::CreateDir {
                    path: path.to_string(),
                    source: self.source(),
                });
                Ok(())
            }
        }
    }

    /// Remove a file.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `IsADirectory` for directories.
    pub fn rm(&mut self, path: &str, now: i64) -> FsResult<()> {
        match self.get(path) {
            None => Err(FsError::not_found(path)),
            Some(Inode::Dir { .. }) => Err(FsError::is_a_directory(path)),
            Some(Inode::File { .. }) => {
                self.remove(path, now);
                self.record(FsEvent::DeleteFile {
                    path: path.to_string(),
                    source: self.source(),
                });
                Ok(())
            }
        }
    }

    /// Remove a directory and everything beneath it, deepest first.
    ///
    /// Root keeps itself and loses its content.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `NotADirectory` for files.
    pub fn rmdir(&mut self, path: &str, now: i64) -> FsResult<()> {
        match self.get(path) {
            None => return Err(FsError::not_found(path)),
            Some(Inode::File { .. }) => return Err(FsError::not_a_directory(path)),
            Some(Inode::Dir { .. }) => {}
        }

        for victim in self.paths_under(path).into_iter().rev() {
            let Some(inode) = self.remove(&victim, now) else {
                continue;
            };
            let source = self.source();
            self.record(match inode {
                Inode::Dir { .. } => FsEvent::DeleteDir { path: victim, source },
                Inode::File { .. } => FsEvent::DeleteFile { path: victim, source },
            });
        }
        Ok(())
    }

    /// Shared preconditions of move and copy.
    fn check_relocation(&self, src: &str, dest: &str) -> FsResult<()> {
        if !self.contains(src) {
            return Err(FsError::not_found(src));
        }
        if self.contains(dest) {
            return Err(FsError::already_exists(dest));
        }
        let parent = path::parent(dest);
        if path::is_root(dest) || !self.is_dir(&parent) {
            return Err(FsError::not_found(format!("parent directory not found: {parent}")));
        }
        if path::is_strictly_within(dest, src) {
            return Err(FsError::invalid_argument(format!(
                "cannot place {src} inside itself at {dest}"
            )));
        }
        Ok(())
    }

    /// Copy a file or directory tree to a new path.
    ///
    /// Copies get fresh timestamps.
    ///
    /// # Errors
    ///
    /// `NotFound` if `src` is absent or `dest`'s parent is not a directory,
    /// `AlreadyExists` if `dest` is occupied, `InvalidArgument` if `dest` lies
    /// inside `src`.
    pub fn copy(&mut self, src: &str, dest: &str, now: i64) -> FsResult<()> {
        self.check_relocation(src, dest)?;

        for from in self.paths_under(src) {
            if let Some(inode) = self.get(&from) {
                let copy = inode.restamped(now, now);
                self.set(&path::rebase(&from, src, dest), copy);
            }
        }
        self.record(FsEvent::Copy {
            src: src.to_string(),
            dest: dest.to_string(),
            source: self.source(),
        });
        Ok(())
    }

    /// Move a file or directory tree to a new path.
    ///
    /// Moved inodes keep their `cdate` and take `now` as `mdate`. The whole
    /// move is applied under one namespace borrow, so no reader sees a
    /// half-moved tree.
    ///
    /// # Errors
    ///
    /// As [`Namespace::copy`].
    pub fn move_path(&mut self, src: &str, dest: &str, now: i64) -> FsResult<()> {
        self.check_relocation(src, dest)?;

        if self.is_file(src) {
            if let Some(inode) = self.remove(src, now) {
                self.set(dest, inode.touched(now));
            }
        } else {
            self.clone_subtree(src, dest, now);
            self.remove_subtree(src, now);
        }
        self.record(FsEvent::Move {
            src: src.to_string(),
            dest: dest.to_string(),
            source: self.source(),
        });
        Ok(())
    }

    /// Make the subtree at `dest` an exact copy of the one at `src`.
    ///
    /// Every path at or under `dest` without a counterpart under `src` is
    /// deleted. Copies keep `cdate` and take `now` as `mdate`, so peers
    /// accept them over older deletions.
    ///
    /// # Errors
    ///
    /// `NotFound` if `src` is absent or a non-root `dest` has no parent
    /// directory, `InvalidArgument` if `dest` lies inside `src`.
    pub fn transfer(&mut self, src: &str, dest: &str, now: i64) -> FsResult<()> {
        if !self.contains(src) {
            return Err(FsError::not_found(src));
        }
        if src == dest {
            return Ok(());
        }
        if path::is_strictly_within(dest, src) {
            return Err(FsError::invalid_argument(format!(
                "cannot transfer {src} into itself at {dest}"
            )));
        }
        let parent = path::parent(dest);
        if !path::is_root(dest) && !self.is_dir(&parent) {
            return Err(FsError::not_found(format!("parent directory not found: {parent}")));
        }

        let mut garbage: std::collections::BTreeSet<String> =
            self.paths_under(dest).into_iter().collect();
        for written in self.clone_subtree(src, dest, now) {
            garbage.remove(&written);
        }
        for victim in garbage.into_iter().rev() {
            self.remove(&victim, now);
        }

        debug!(src, dest, "transfer");
        self.record(FsEvent::CreateTree {
            src: src.to_string(),
            dest: dest.to_string(),
            source: self.source(),
        });
        Ok(())
    }

    /// Clone every inode under `src` to the same place under `dest`,
    /// returning the paths written.
    fn clone_subtree(&mut self, src: &str, dest: &str, now: i64) -> Vec<String> {
        let sources: Vec<(String, Inode)> = self
            .paths_under(src)
            .into_iter()
            .filter_map(|p| self.get(&p).cloned().map(|inode| (p, inode)))
            .collect();

        let mut written = Vec::with_capacity(sources.len());
        for (from, inode) in sources {
            let to = path::rebase(&from, src, dest);
            self.set(&to, inode.touched(now));
            written.push(to);
        }
        written
    }

    /// Remove `path` and all descendants without checks.
    ///
    /// Returns true if anything existed. Root itself stays.
    pub fn delete_tree(&mut self, path: &str, now: i64) -> bool {
        if !self.remove_subtree(path, now) {
            return false;
        }
        self.record(FsEvent::DeleteTree {
            path: path.to_string(),
            source: self.source(),
        });
        true
    }

    /// Remove `path` and its descendants, deepest first, announcing only the
    /// inode deletions.
    fn remove_subtree(&mut self, path: &str, now: i64) -> bool {
        let victims = self.paths_under(path);
        if victims.is_empty() {
            return false;
        }
        for victim in victims.into_iter().rev() {
            self.remove(&victim, now);
        }
        true
    }
}

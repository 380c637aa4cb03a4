//! Universes: independent trees rooted at `@name`.
//!
//! The default universe is rooted at `/`. Every other universe is created by
//! cloning an existing one and is fully materialized: it shares blocks with its
//! source but no inodes, so later changes on either side stay isolated.

use std::collections::BTreeSet;

use crate::path::{self, ROOT, UNIVERSE_MARKER};
use crate::vfs::{FsError, FsResult, Namespace};

/// Normalize a universe name to its root path.
///
/// `""` and `"/"` name the default universe; `"x"`, `"/x"` and `"@x"` all name
/// `@x`.
///
/// ```
/// use kura_kernel::universe::universe_root;
/// assert_eq!(universe_root("branch").unwrap(), "@branch");
/// assert_eq!(universe_root("/").unwrap(), "/");
/// assert!(universe_root("a/b").is_err());
/// ```
pub fn universe_root(name: &str) -> FsResult<String> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(ROOT.to_string());
    }
    let bare = trimmed.strip_prefix(UNIVERSE_MARKER).unwrap_or(trimmed);
    if bare.is_empty() || bare.contains('/') || bare == "." || bare == ".." {
        return Err(FsError::invalid_argument(format!("invalid universe name: {name}")));
    }
    Ok(format!("{UNIVERSE_MARKER}{bare}"))
}

impl Namespace {
    /// Root paths of every universe present, `/` first.
    pub fn list_universes(&self) -> Vec<String> {
        let roots: BTreeSet<String> = self
            .iter()
            .map(|(p, _)| path::universe_of(p).to_string())
            .collect();
        roots.into_iter().collect()
    }

    /// Replace universe `dest` with a copy of universe `src`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for bad names or `src == dest`, `NotFound` if `src`
    /// does not exist.
    pub fn clone_universe(&mut self, src: &str, dest: &str, now: i64) -> FsResult<()> {
        let src = universe_root(src)?;
        let dest = universe_root(dest)?;
        if src == dest {
            return Err(FsError::invalid_argument(format!("cannot clone {src} onto itself")));
        }
        if !self.contains(&src) {
            return Err(FsError::not_found(format!("universe not found: {src}")));
        }
        self.transfer(&src, &dest, now)
    }

    /// Delete a universe. Deleting `/` empties it. Returns true if anything
    /// existed.
    pub fn delete_universe(&mut self, name: &str, now: i64) -> FsResult<bool> {
        let root = universe_root(name)?;
        Ok(self.delete_tree(&root, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Inode;

    #[test]
    fn test_universe_root() {
        assert_eq!(universe_root("").unwrap(), "/");
        assert_eq!(universe_root("x").unwrap(), "@x");
        assert_eq!(universe_root("/x").unwrap(), "@x");
        assert_eq!(universe_root("@x").unwrap(), "@x");
        assert_eq!(universe_root("@").unwrap_err().code(), "EINVAL");
        assert_eq!(universe_root("..").unwrap_err().code(), "EINVAL");
    }

    #[test]
    fn test_clone_list_delete() {
        let mut ns = Namespace::new();
        ns.mkdir("/docs", 1).unwrap();
        ns.set("/docs/a", Inode::file(1, 1, 1, vec!["d".into()], "text/plain", None));

        ns.clone_universe("/", "branch", 2).unwrap();
        assert_eq!(ns.list_universes(), vec!["/", "@branch"]);
        assert!(ns.is_file("@branch/docs/a"));

        // Isolation: changing the clone leaves the source alone
        ns.rm("@branch/docs/a", 3).unwrap();
        assert!(ns.is_file("/docs/a"));

        assert!(ns.delete_universe("@branch", 4).unwrap());
        assert!(!ns.delete_universe("@branch", 4).unwrap());
        assert_eq!(ns.list_universes(), vec!["/"]);
    }

    #[test]
    fn test_clone_errors() {
        let mut ns = Namespace::new();
        assert_eq!(ns.clone_universe("missing", "b", 1).unwrap_err().code(), "ENOENT");
        assert_eq!(ns.clone_universe("/", "/", 1).unwrap_err().code(), "EINVAL");
    }

    #[test]
    fn test_clone_replaces_existing_universe() {
        let mut ns = Namespace::new();
        ns.mkdir("/keep", 1).unwrap();
        ns.clone_universe("/", "b", 2).unwrap();
        ns.mkdir("@b/extra", 3).unwrap();

        ns.clone_universe("/", "b", 4).unwrap();
        assert!(ns.is_dir("@b/keep"));
        assert!(!ns.contains("@b/extra"));
    }
}

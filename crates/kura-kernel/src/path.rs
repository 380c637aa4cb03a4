//! Path resolution.
//!
//! Pure string algebra over slash-separated paths; nothing here touches the
//! namespace. Two kinds of path are absolute:
//!
//! - `/…` lives in the default universe rooted at `/`;
//! - `@name/…` lives in the universe rooted at `@name`.
//!
//! `.` and `..` are resolved lexically. `..` never climbs above a root: the
//! excess is dropped, and a leading `@name` segment is never popped.

/// The default universe root.
pub const ROOT: &str = "/";

/// Prefix marking a universe root segment.
pub const UNIVERSE_MARKER: char = '@';

/// Returns true if `path` is absolute (rooted at `/` or at a universe).
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with(UNIVERSE_MARKER)
}

/// Returns true if `path` is a root: `/` or a bare `@name`.
pub fn is_root(path: &str) -> bool {
    path == ROOT || (path.starts_with(UNIVERSE_MARKER) && !path.contains('/'))
}

/// Normalize a path.
///
/// ```
/// use kura_kernel::path::normalize;
/// assert_eq!(normalize("/a/./b/../c/"), "/a/c");
/// assert_eq!(normalize("x/../../y"), "y");
/// assert_eq!(normalize("@branch/../a"), "@branch/a");
/// ```
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut floor = 0;

    for (i, part) in path.split('/').enumerate() {
        match part {
            "" | "." => {}
            ".." => {
                if parts.len() > floor {
                    parts.pop();
                }
            }
            _ => {
                if i == 0 && part.starts_with(UNIVERSE_MARKER) {
                    floor = 1;
                }
                parts.push(part);
            }
        }
    }

    let joined = parts.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Join two paths and normalize the result.
pub fn join(root: &str, path: &str) -> String {
    normalize(&format!("{root}/{path}"))
}

/// Resolve `path` against `cwd` unless it is already absolute.
pub fn abspath(path: &str, cwd: &str) -> String {
    if is_absolute(path) {
        normalize(path)
    } else {
        join(cwd, path)
    }
}

/// The universe root an absolute path belongs to.
pub fn universe_of(path: &str) -> &str {
    if path.starts_with(UNIVERSE_MARKER) {
        path.split('/').next().unwrap_or(path)
    } else {
        ROOT
    }
}

/// Prefix shared by every strict descendant of `path`.
pub fn descendant_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{path}/")
    }
}

/// Returns true if `candidate` is `ancestor` or lies beneath it.
pub fn is_within(candidate: &str, ancestor: &str) -> bool {
    candidate == ancestor || is_strictly_within(candidate, ancestor)
}

/// Returns true if `candidate` lies strictly beneath `ancestor`.
pub fn is_strictly_within(candidate: &str, ancestor: &str) -> bool {
    candidate != ancestor && candidate.starts_with(&descendant_prefix(ancestor))
}

/// Move `path` from under `from` to the corresponding place under `to`.
///
/// `path` must be within `from`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let rest = &path[descendant_prefix(from).len()..];
    join(to, rest)
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Minimal relative path leading from directory `target` to `path`.
///
/// Both arguments are treated as absolute. Paths in different universes have
/// no relative form; the absolute `path` is returned instead.
pub fn relpath(path: &str, target: &str) -> String {
    let path = normalize(path);
    let target = normalize(target);
    if universe_of(&path) != universe_of(&target) {
        return path;
    }

    let p = segments(&path);
    let t = segments(&target);
    let common = p.iter().zip(&t).take_while(|(a, b)| a == b).count();

    let mut out: Vec<&str> = vec![".."; t.len() - common];
    out.extend_from_slice(&p[common..]);
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Split a path into `(parent, name)`.
///
/// Roots split into themselves and an empty name.
pub fn split(path: &str) -> (String, String) {
    let path = normalize(path);
    if is_root(&path) {
        return (path, String::new());
    }
    match path.rfind('/') {
        Some(0) => (ROOT.to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => (String::new(), path),
    }
}

/// Parent directory of a path (a root is its own parent).
pub fn parent(path: &str) -> String {
    split(path).0
}

/// Split a path into `(stem, extension)`.
///
/// The extension keeps its dot and comes from the final component only; it is
/// empty when that component has no dot.
pub fn splitext(path: &str) -> (String, String) {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(i) => {
            let at = name_start + i;
            (path[..at].to_string(), path[at..].to_string())
        }
        None => (path.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize("x/../../y"), "y");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//"), "/");
        assert_eq!(normalize("/.."), "/");
        assert_eq!(normalize("/a//b/"), "/a/b");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_universe_root_is_a_floor() {
        assert_eq!(normalize("@b/../../x"), "@b/x");
        assert_eq!(normalize("@b/"), "@b");
        // Only a leading segment marks a universe
        assert_eq!(normalize("/@b/.."), "/");
    }

    #[test]
    fn test_abspath() {
        assert_eq!(abspath("c", "/a/b"), "/a/b/c");
        assert_eq!(abspath("../c", "/a/b"), "/a/c");
        assert_eq!(abspath("/x/./y", "/a"), "/x/y");
        assert_eq!(abspath("@u/f", "/a"), "@u/f");
        assert_eq!(abspath("..", "@u"), "@u");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "/b"), "/a/b");
        assert_eq!(join("@u", "x/y"), "@u/x/y");
    }

    #[test]
    fn test_relpath() {
        assert_eq!(relpath("/a/c", "/a/b"), "../c");
        assert_eq!(relpath("/a/b", "/a/b"), ".");
        assert_eq!(relpath("/a/b/c", "/a"), "b/c");
        assert_eq!(relpath("/x", "/a/b"), "../../x");
        assert_eq!(relpath("/", "/a/b"), "../..");
        assert_eq!(relpath("@u/a", "/a"), "@u/a");
    }

    #[test]
    fn test_relpath_is_inverse_of_join() {
        let paths = ["/", "/a", "/a/b/c", "/x/y", "/a/bb", "/a/b"];
        for path in paths {
            for target in paths {
                let rel = relpath(path, target);
                assert_eq!(join(target, &rel), path, "path={path} target={target} rel={rel}");
            }
        }
    }

    #[test]
    fn test_split() {
        assert_eq!(split("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(split("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(split("/"), ("/".to_string(), String::new()));
        assert_eq!(split("@u"), ("@u".to_string(), String::new()));
        assert_eq!(split("@u/f"), ("@u".to_string(), "f".to_string()));
        assert_eq!(split("name"), (String::new(), "name".to_string()));
    }

    #[test]
    fn test_splitext() {
        assert_eq!(splitext("/a/file.txt"), ("/a/file".to_string(), ".txt".to_string()));
        assert_eq!(splitext("archive.tar.gz"), ("archive.tar".to_string(), ".gz".to_string()));
        assert_eq!(splitext("/a.d/noext"), ("/a.d/noext".to_string(), String::new()));
        assert_eq!(splitext(".bashrc"), (String::new(), ".bashrc".to_string()));
    }

    #[test]
    fn test_rebase_and_within() {
        assert_eq!(rebase("/a/x/y", "/a", "/b"), "/b/x/y");
        assert_eq!(rebase("/a", "/a", "/b"), "/b");
        assert_eq!(rebase("/", "/", "@u"), "@u");
        assert_eq!(rebase("/f", "/", "@u"), "@u/f");
        assert_eq!(rebase("@u/f", "@u", "/"), "/f");

        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_strictly_within("/a", "/"));
        assert!(!is_strictly_within("@u", "/"));
    }

    #[test]
    fn test_roots() {
        assert!(is_root("/"));
        assert!(is_root("@main"));
        assert!(!is_root("@main/x"));
        assert!(!is_root("/a"));
        assert_eq!(universe_of("@main/x"), "@main");
        assert_eq!(universe_of("/x"), "/");
    }
}

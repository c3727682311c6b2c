//! Workspace root and path confinement.
//!
//! Every handler that turns client input into a filesystem path (file
//! operations, directory listing, search, git file arguments and the
//! terminal working directory) goes through [`Workspace::resolve`]. No other
//! code performs this check.
//!
//! Resolution is lexical: symlinks are never followed. A symlink inside the
//! workspace that points outside it is accepted, and reads or writes through
//! it reach the target. Anyone who can create such a link (for example via
//! the terminal) is not confined by the resolver.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// A client-supplied path resolved outside the workspace root
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("access denied")]
pub struct AccessDenied;

/// The directory every filesystem operation is confined to
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Canonicalize `root` once. Later resolutions compare against this
    /// form and never touch the filesystem.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .with_context(|| format!("workspace root {} is not accessible", root.display()))?;
        if !canonical.is_dir() {
            bail!("workspace root {} is not a directory", canonical.display());
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `relative` onto the root, collapse `.` and `..` lexically, and
    /// reject the result unless it is the root or lies beneath it.
    ///
    /// A leading `/` is treated as the workspace root, so `"/src"` and
    /// `"src"` name the same directory. The empty string and `"."` resolve to
    /// the root itself.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, AccessDenied> {
        let mut joined = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {}
                other => joined.push(other),
            }
        }

        let normalized = normalize_path(&joined);
        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(AccessDenied)
        }
    }

    /// Path of `path` relative to the root, for reporting back to clients
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            c => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_root_is_canonical() {
        let (dir, ws) = workspace();
        assert_eq!(ws.root(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Workspace::new(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_resolve_root_aliases() {
        let (_dir, ws) = workspace();
        for input in ["", ".", "/", "./", "a/.."] {
            assert_eq!(ws.resolve(input).unwrap(), ws.root(), "input {:?}", input);
        }
    }

    #[test]
    fn test_resolve_nested_paths() {
        let (_dir, ws) = workspace();
        assert_eq!(
            ws.resolve("src/main.rs").unwrap(),
            ws.root().join("src").join("main.rs")
        );
        assert_eq!(
            ws.resolve("a/./b//c/../d").unwrap(),
            ws.root().join("a").join("b").join("d")
        );

        let deep = (0..50).map(|i| format!("d{}", i)).collect::<Vec<_>>().join("/");
        let resolved = ws.resolve(&deep).unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert_eq!(resolved.components().count(), ws.root().components().count() + 50);
    }

    #[test]
    fn test_leading_slash_stays_inside() {
        let (_dir, ws) = workspace();
        assert_eq!(
            ws.resolve("/etc/passwd").unwrap(),
            ws.root().join("etc").join("passwd")
        );
    }

    #[test]
    fn test_parent_escapes_denied() {
        let (_dir, ws) = workspace();
        for input in [
            "..",
            "../",
            "../etc/passwd",
            "a/../../b",
            "a/b/../../../c",
            "/../..",
            "./../x",
            "../../../../../../../../../../etc",
        ] {
            assert_eq!(ws.resolve(input), Err(AccessDenied), "input {:?}", input);
        }
    }

    #[test]
    fn test_escape_back_into_root_allowed() {
        let (_dir, ws) = workspace();
        let name = ws.root().file_name().unwrap().to_string_lossy().to_string();
        // "../<root name>/x" leaves and re-enters the root
        let resolved = ws.resolve(&format!("../{}/x", name)).unwrap();
        assert_eq!(resolved, ws.root().join("x"));
    }

    #[test]
    fn test_sibling_with_shared_prefix_denied() {
        let parent = TempDir::new().unwrap();
        std::fs::create_dir(parent.path().join("work")).unwrap();
        std::fs::create_dir(parent.path().join("work2")).unwrap();
        let ws = Workspace::new(parent.path().join("work")).unwrap();
        assert_eq!(ws.resolve("../work2/secret"), Err(AccessDenied));
    }

    #[test]
    fn test_resolve_does_no_io() {
        let (_dir, ws) = workspace();
        // Nothing under the root exists, yet resolution succeeds
        let resolved = ws.resolve("does/not/exist.txt").unwrap();
        assert!(!resolved.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let (dir, ws) = workspace();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        // The link is judged by its name, not its target
        let resolved = ws.resolve("link/secret.txt").unwrap();
        assert_eq!(resolved, ws.root().join("link/secret.txt"));
        assert_eq!(std::fs::read_to_string(&resolved).unwrap(), "s");
    }

    #[test]
    fn test_relative() {
        let (_dir, ws) = workspace();
        let path = ws.resolve("src/lib.rs").unwrap();
        assert_eq!(ws.relative(&path).unwrap(), Path::new("src/lib.rs"));
        assert!(ws.relative(Path::new("/elsewhere")).is_none());
    }
}

//! Directory jail for path-taking tools.
//!
//! Every agent process is launched with a `sandbox_root`; path operands are
//! resolved through this guard before any filesystem access. Rejected
//! outright: `..` components, absolute paths outside the root, and symlinks
//! whose targets escape the root.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Path guard rooted at `sandbox_root`.
#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: PathBuf,
}

impl SandboxGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a requested path to an absolute path inside the jail.
    ///
    /// Relative paths resolve against the root; absolute paths must already
    /// be inside it. The deepest existing ancestor is canonicalized so a
    /// symlink pointing outside the root is caught even for paths that do
    /// not exist yet (writes).
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let requested_path = Path::new(requested);

        for component in requested_path.components() {
            match component {
                Component::ParentDir => {
                    return Err(Error::SandboxViolation(format!(
                        "path '{}' contains a parent traversal",
                        requested
                    )));
                }
                Component::CurDir => {
                    return Err(Error::SandboxViolation(format!(
                        "path '{}' is not normalized",
                        requested
                    )));
                }
                _ => {}
            }
        }

        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.root.join(requested_path)
        };

        let canonical_root = self.root.canonicalize().map_err(|e| {
            Error::SandboxViolation(format!(
                "sandbox root '{}' is not resolvable: {}",
                self.root.display(),
                e
            ))
        })?;

        // Canonicalize the deepest existing ancestor, then re-attach the
        // not-yet-existing tail. This follows symlinks in the existing part
        // of the path.
        let resolved = canonicalize_prefix(&joined)?;

        if !resolved.starts_with(&canonical_root) {
            return Err(Error::SandboxViolation(format!(
                "path '{}' escapes the sandbox root",
                requested
            )));
        }

        Ok(resolved)
    }
}

fn canonicalize_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut result = canonical;
                for part in tail.iter().rev() {
                    result.push(part);
                }
                return Ok(result);
            }
            Err(_) => {
                let Some(name) = existing.file_name() else {
                    return Err(Error::SandboxViolation(format!(
                        "path '{}' has no resolvable ancestor",
                        path.display()
                    )));
                };
                tail.push(name.to_os_string());
                existing = existing
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                if existing.as_os_str().is_empty() {
                    return Err(Error::SandboxViolation(format!(
                        "path '{}' has no resolvable ancestor",
                        path.display()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (tempfile::TempDir, SandboxGuard) {
        let dir = tempfile::tempdir().unwrap();
        let guard = SandboxGuard::new(dir.path());
        (dir, guard)
    }

    #[test]
    fn test_relative_path_resolves_inside_root() {
        let (dir, guard) = guard();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let resolved = guard.resolve("notes.txt").unwrap();
        assert!(resolved.ends_with("notes.txt"));
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, guard) = guard();
        let err = guard.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(_)));
        assert!(guard.resolve("a/../b").is_err());
    }

    #[test]
    fn test_absolute_path_outside_root_rejected() {
        let (_dir, guard) = guard();
        let err = guard.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(_)));
    }

    #[test]
    fn test_absolute_path_inside_root_allowed() {
        let (dir, guard) = guard();
        let inside = dir.path().join("file.txt");
        std::fs::write(&inside, "x").unwrap();
        assert!(guard.resolve(inside.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_nonexistent_target_allowed_for_writes() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("new_dir/new_file.txt");
        assert!(resolved.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_escaping_symlink_rejected() {
        let (dir, guard) = guard();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = guard.resolve("link/secret").unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(_)));
    }
}

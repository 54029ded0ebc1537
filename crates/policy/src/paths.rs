//! Path canonicalization and workspace containment.
//!
//! The check is prefix comparison on the canonical form (symlinks
//! resolved, `.`/`..` eliminated, no trailing separators) — never
//! string matching, so `/work` does not contain `/workspace2`.

use std::path::{Component, Path, PathBuf};

/// Canonicalize `raw` and verify it stays under `root`.
///
/// Non-existent paths are allowed (a tool may be about to create them):
/// the deepest existing ancestor is canonicalized and the remaining
/// components are appended after lexical cleaning, rejecting any `..`
/// that would climb out.
pub fn canonicalize_within(root: &Path, raw: &str) -> Result<PathBuf, String> {
    let root = root
        .canonicalize()
        .map_err(|e| format!("workspace root unavailable: {e}"))?;

    let candidate = Path::new(raw);
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = resolve_lenient(&absolute)?;

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(format!(
            "{} escapes the workspace root {}",
            resolved.display(),
            root.display()
        ))
    }
}

/// Canonicalize as much of the path as exists, then append the rest
/// lexically (`.` dropped, `..` popped — erroring if it pops past the
/// resolved base).
fn resolve_lenient(path: &Path) -> Result<PathBuf, String> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for component in tail.iter().rev() {
                let part = Path::new(component);
                match part.components().next() {
                    Some(Component::ParentDir) => {
                        if !resolved.pop() {
                            return Err("path climbs past the filesystem root".into());
                        }
                    }
                    Some(Component::CurDir) | None => {}
                    _ => resolved.push(part),
                }
            }
            return Ok(resolved);
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => return Err(format!("cannot resolve {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_file_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(canonicalize_within(dir.path(), file.to_str().unwrap()).is_ok());
    }

    #[test]
    fn nonexistent_path_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("sub/new.txt");
        assert!(canonicalize_within(dir.path(), missing.to_str().unwrap()).is_ok());
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sneaky = dir.path().join("sub/../../outside.txt");
        assert!(canonicalize_within(dir.path(), sneaky.to_str().unwrap()).is_err());
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(canonicalize_within(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn sibling_prefix_is_not_containment() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("work");
        let sibling = parent.path().join("workspace2");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();
        // "/…/workspace2" starts with the string "/…/work" but is not inside it.
        assert!(canonicalize_within(&root, sibling.to_str().unwrap()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        let through = link.join("file.txt");
        assert!(canonicalize_within(dir.path(), through.to_str().unwrap()).is_err());
    }

    #[test]
    fn relative_path_is_rooted_at_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = canonicalize_within(dir.path(), "notes/today.md").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }
}

//! Path normalization for consistent keys across invocations.
//!
//! Every component keys records by project path and file path, and the same
//! file reaches us spelled several ways (absolute from the host, relative from
//! a shell command, with or without trailing slashes). Everything goes through
//! these helpers before it becomes part of a key.

use std::path::{Component, Path, PathBuf};

/// Strips trailing slashes except for root. A path of only slashes is root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        }
    } else {
        trimmed.to_string()
    }
}

/// Lexically resolves `.` and `..` without touching the filesystem.
fn clean_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Returns the key used for a file within a project: relative to the project
/// root when the file lives inside it, otherwise the cleaned absolute path.
pub fn file_key(file_path: &str, project_path: &str) -> String {
    let project = PathBuf::from(normalize_path(project_path));
    let raw = Path::new(file_path);
    let absolute = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        project.join(raw)
    };
    let cleaned = clean_components(&absolute);

    match cleaned.strip_prefix(&project) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            relative.to_string_lossy().to_string()
        }
        _ => normalize_path(&cleaned.to_string_lossy()),
    }
}

/// Walks up from `start` to the nearest directory containing `.git`.
/// Falls back to `start` itself when no repository encloses it.
pub fn project_root_for(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}

/// md5 hex of the normalized project path, used to scope file-backend keys.
pub fn project_key(project_path: &str) -> String {
    format!("{:x}", md5::compute(normalize_path(project_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_path_strips_trailing_slash() {
        assert_eq!(normalize_path("/project/"), "/project");
        assert_eq!(normalize_path("/project"), "/project");
    }

    #[test]
    fn test_normalize_path_preserves_root() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn test_file_key_relative_inside_project() {
        assert_eq!(file_key("/repo/src/lib.rs", "/repo"), "src/lib.rs");
        assert_eq!(file_key("src/lib.rs", "/repo/"), "src/lib.rs");
        assert_eq!(file_key("./src/../src/lib.rs", "/repo"), "src/lib.rs");
    }

    #[test]
    fn test_file_key_outside_project_stays_absolute() {
        assert_eq!(file_key("/etc/hosts", "/repo"), "/etc/hosts");
    }

    #[test]
    fn test_project_root_walks_up_to_git_dir() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("repo");
        let nested = root.join("crates/core/src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();

        assert_eq!(project_root_for(&nested), root);
    }

    #[test]
    fn test_project_root_without_git_returns_start() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("plain");
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(project_root_for(&dir), dir);
    }

    #[test]
    fn test_project_key_ignores_trailing_slash() {
        assert_eq!(project_key("/repo/"), project_key("/repo"));
    }
}

use semiont_core::paths::PROJECT_FILE;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `SEMIONT_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `semiont.json`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_project_root(&cwd).unwrap_or(cwd)
}

fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_FILE).is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        let result = resolve_root(Some(dir.path()));
        assert_eq!(result, dir.path());
    }

    #[test]
    fn finds_nearest_project_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROJECT_FILE), "{}").unwrap();
        let subdir = dir.path().join("apps/backend/src");
        std::fs::create_dir_all(&subdir).unwrap();

        assert_eq!(find_project_root(&subdir).unwrap(), dir.path());
    }

    #[test]
    fn nested_project_shadows_outer_one() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROJECT_FILE), "{}").unwrap();
        let inner = dir.path().join("inner");
        std::fs::create_dir_all(inner.join("deep")).unwrap();
        std::fs::write(inner.join(PROJECT_FILE), "{}").unwrap();

        assert_eq!(find_project_root(&inner.join("deep")).unwrap(), inner);
    }

    #[test]
    fn directory_named_like_project_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(PROJECT_FILE)).unwrap();
        let found = find_project_root(dir.path());
        assert_ne!(found.as_deref(), Some(dir.path()));
    }
}

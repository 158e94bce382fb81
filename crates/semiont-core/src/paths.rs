use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PROJECT_FILE: &str = "semiont.json";
pub const ENVIRONMENTS_DIR: &str = "environments";
pub const STATE_DIR: &str = ".semiont";
pub const LOGS_DIR: &str = ".semiont/logs";
pub const BACKUPS_DIR: &str = ".semiont/backups";
pub const DATA_DIR: &str = "data";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn project_file(root: &Path) -> PathBuf {
    root.join(PROJECT_FILE)
}

pub fn environments_dir(root: &Path) -> PathBuf {
    root.join(ENVIRONMENTS_DIR)
}

pub fn environment_file(root: &Path, environment: &str) -> PathBuf {
    environments_dir(root).join(format!("{environment}.json"))
}

pub fn log_file(root: &Path, environment: &str, service: &str) -> PathBuf {
    root.join(LOGS_DIR)
        .join(environment)
        .join(format!("{service}.log"))
}

pub fn backups_dir(root: &Path, environment: &str) -> PathBuf {
    root.join(BACKUPS_DIR).join(environment)
}

pub fn backup_file(root: &Path, environment: &str, backup_id: &str, extension: &str) -> PathBuf {
    backups_dir(root, environment).join(format!("{backup_id}.{extension}"))
}

pub fn data_dir(root: &Path, environment: &str) -> PathBuf {
    root.join(DATA_DIR).join(environment)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

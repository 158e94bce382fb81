use crate::error::{Result, SemiontError};
use crate::paths;
use crate::types::Platform;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const ENVIRONMENT_VAR: &str = "SEMIONT_ENV";

// ---------------------------------------------------------------------------
// AwsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackNames {
    #[serde(default = "default_data_stack")]
    pub data: String,
    #[serde(default = "default_app_stack")]
    pub app: String,
}

fn default_data_stack() -> String {
    "SemiontDataStack".to_string()
}

fn default_app_stack() -> String {
    "SemiontAppStack".to_string()
}

impl Default for StackNames {
    fn default() -> Self {
        Self {
            data: default_data_stack(),
            app: default_app_stack(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub stacks: StackNames,
    /// AWS Backup vault used for EFS backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_vault: Option<String>,
}

// ---------------------------------------------------------------------------
// EnvironmentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Platform>,
}

/// Resolved configuration for one environment: `semiont.json` defaults with
/// `environments/<env>.json` layered on top.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub platform: PlatformDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-service config objects, in file order.
    #[serde(default)]
    pub services: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    defaults: Option<Value>,
}

impl EnvironmentConfig {
    pub fn load(root: &Path, environment: &str) -> Result<Self> {
        let env_path = paths::environment_file(root, environment);
        if !env_path.exists() {
            return Err(SemiontError::EnvironmentNotFound {
                name: environment.to_string(),
                available: available_list(root),
            });
        }

        let (project, mut merged) = match read_project_file(root)? {
            Some(p) => (p.project, p.defaults.unwrap_or_else(|| Value::Object(Map::new()))),
            None => (None, Value::Object(Map::new())),
        };

        let data = std::fs::read_to_string(&env_path)?;
        let overlay: Value = serde_json::from_str(&data)?;
        if !overlay.is_object() {
            return Err(SemiontError::InvalidConfig(format!(
                "{} must contain a JSON object",
                env_path.display()
            )));
        }
        deep_merge(&mut merged, &overlay);

        let mut cfg: EnvironmentConfig = serde_json::from_value(merged)?;
        cfg.name = environment.to_string();
        if cfg.project.is_none() {
            cfg.project = project;
        }
        tracing::debug!(environment, services = cfg.services.len(), "loaded environment config");
        Ok(cfg)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(|k| k.as_str()).collect()
    }

    /// Platform for a service: `services.<name>.platform.type`, else the
    /// environment default.
    pub fn platform_for(&self, service: &str) -> Result<Platform> {
        let declared = self
            .services
            .get(service)
            .and_then(|s| s.get("platform"))
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str());
        match (declared, self.platform.default) {
            (Some(t), _) => t.parse(),
            (None, Some(p)) => Ok(p),
            (None, None) => Err(SemiontError::InvalidConfig(format!(
                "service '{service}' has no platform.type and environment '{}' has no platform.default",
                self.name
            ))),
        }
    }
}

fn read_project_file(root: &Path) -> Result<Option<ProjectFile>> {
    let path = paths::project_file(root);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

// ---------------------------------------------------------------------------
// Environment discovery
// ---------------------------------------------------------------------------

/// Environment names found under `environments/`, sorted.
pub fn list_environments(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(paths::environments_dir(root)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}

fn available_list(root: &Path) -> String {
    let names = list_environments(root);
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Pick the environment name.
///
/// Priority:
/// 1. `--environment` flag (passed in as `explicit`)
/// 2. `SEMIONT_ENV`
/// 3. Error listing the environments that exist under `root`
pub fn resolve_environment_name(explicit: Option<&str>, root: &Path) -> Result<String> {
    if let Some(name) = explicit.filter(|s| !s.is_empty()) {
        return Ok(name.to_string());
    }
    match std::env::var(ENVIRONMENT_VAR) {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => Err(SemiontError::NoEnvironment(available_list(root))),
    }
}

// ---------------------------------------------------------------------------
// JSON merging
// ---------------------------------------------------------------------------

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

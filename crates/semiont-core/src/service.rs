use crate::config::EnvironmentConfig;
use crate::error::{Result, SemiontError};
use crate::requirements::ServiceRequirements;
use crate::types::{Platform, ServiceName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ServicePlatformInfo
// ---------------------------------------------------------------------------

/// One resolved target: a configured service name, the platform that runs
/// it, and its merged config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlatformInfo {
    pub name: String,
    pub platform: Platform,
    pub config: Value,
}

// ---------------------------------------------------------------------------
// ServiceSelector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSelector {
    All,
    Named(String),
}

impl ServiceSelector {
    pub fn parse(s: &str) -> Self {
        match s {
            "" | "all" => ServiceSelector::All,
            name => ServiceSelector::Named(name.to_string()),
        }
    }
}

impl std::fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceSelector::All => f.write_str("all"),
            ServiceSelector::Named(n) => f.write_str(n),
        }
    }
}

/// Resolve the services targeted by `selector`, in config order.
///
/// Environment-level `env` vars are folded beneath each service's own
/// `env` object so handlers see a single merged map.
pub fn resolve_services(
    config: &EnvironmentConfig,
    selector: &ServiceSelector,
) -> Result<Vec<ServicePlatformInfo>> {
    let names: Vec<&str> = match selector {
        ServiceSelector::All => config.service_names(),
        ServiceSelector::Named(name) => {
            if !config.services.contains_key(name) {
                return Err(SemiontError::ServiceNotConfigured {
                    name: name.clone(),
                    environment: config.name.clone(),
                    available: config.service_names().join(", "),
                });
            }
            vec![name.as_str()]
        }
    };

    names
        .into_iter()
        .map(|name| {
            let platform = config.platform_for(name)?;
            let mut service_cfg = config
                .services
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            merge_environment_vars(&mut service_cfg, &config.env);
            if let Some(aws) = &config.aws {
                if let Value::Object(map) = &mut service_cfg {
                    map.entry("aws").or_insert(serde_json::to_value(aws)?);
                }
            }
            Ok(ServicePlatformInfo {
                name: name.to_string(),
                platform,
                config: service_cfg,
            })
        })
        .collect()
}

fn merge_environment_vars(service_cfg: &mut Value, env: &BTreeMap<String, String>) {
    let Value::Object(map) = service_cfg else {
        return;
    };
    let entry = map
        .entry("env")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(service_env) = entry {
        for (k, v) in env {
            service_env
                .entry(k.clone())
                .or_insert_with(|| Value::String(v.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub verbose: bool,
    pub quiet: bool,
    pub dry_run: bool,
}

/// Everything a handler needs to know about the one service it acts on.
/// Built fresh for every service of every command and then dropped.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub name: ServiceName,
    pub environment: String,
    pub platform: Platform,
    pub config: Value,
    pub project_root: PathBuf,
    pub flags: ContextFlags,
    requirements: ServiceRequirements,
}

impl ServiceContext {
    pub fn new(
        info: &ServicePlatformInfo,
        environment: &str,
        project_root: &Path,
        flags: ContextFlags,
    ) -> Result<Self> {
        let name: ServiceName = info.name.parse()?;
        let requirements = ServiceRequirements::resolve(name, info.config.get("requirements"))?;
        Ok(Self {
            name,
            environment: environment.to_string(),
            platform: info.platform,
            config: info.config.clone(),
            project_root: project_root.to_path_buf(),
            flags,
            requirements,
        })
    }

    pub fn dry_run(&self) -> bool {
        self.flags.dry_run
    }

    pub fn verbose(&self) -> bool {
        self.flags.verbose
    }

    pub fn quiet(&self) -> bool {
        self.flags.quiet
    }

    pub fn requirements(&self) -> &ServiceRequirements {
        &self.requirements
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    /// Configured `port`, else the first port from the requirements.
    pub fn port(&self) -> Option<u16> {
        self.config_u64("port")
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| self.requirements.primary_port())
    }

    pub fn image(&self) -> String {
        if let Some(image) = self.config_str("image") {
            return image.to_string();
        }
        match self.name {
            ServiceName::Database => "postgres:15-alpine".to_string(),
            ServiceName::Filesystem => "busybox:latest".to_string(),
            name => format!("semiont-{name}:latest"),
        }
    }

    pub fn command(&self) -> Option<String> {
        if let Some(cmd) = self.config_str("command") {
            return Some(cmd.to_string());
        }
        match self.name {
            ServiceName::Frontend | ServiceName::Backend => Some("npm run dev".to_string()),
            ServiceName::Mcp => Some("npm run mcp".to_string()),
            ServiceName::Agent => Some("npm run agent".to_string()),
            ServiceName::Database | ServiceName::Filesystem => None,
        }
    }

    /// Service directory relative to the project root (`apps/<name>` unless
    /// `path` is configured).
    pub fn working_dir(&self) -> PathBuf {
        match self.config_str("path") {
            Some(p) => self.project_root.join(p),
            None => self.project_root.join("apps").join(self.name.as_str()),
        }
    }

    /// Environment passed to whatever runs the service: configured `env`
    /// (environment-level vars already folded in) plus `SEMIONT_ENV`,
    /// `SEMIONT_SERVICE` and `PORT`.
    pub fn environment_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if let Some(Value::Object(env)) = self.config.get("env") {
            for (k, v) in env {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                vars.insert(k.clone(), value);
            }
        }
        vars.insert("SEMIONT_ENV".to_string(), self.environment.clone());
        vars.insert("SEMIONT_SERVICE".to_string(), self.name.to_string());
        if let Some(port) = self.port() {
            vars.entry("PORT".to_string())
                .or_insert_with(|| port.to_string());
        }
        vars
    }

    /// Container / resource name shared by the container and process
    /// platforms: `semiont-<service>-<env>`.
    pub fn resource_name(&self) -> String {
        format!("semiont-{}-{}", self.name, self.environment)
    }

    pub fn timeout_secs(&self, default: u64) -> u64 {
        self.config_u64("timeout").unwrap_or(default)
    }
}

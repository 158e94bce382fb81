//! Declarative per-service requirements.
//!
//! Requirements describe what a service needs (storage, network, compute,
//! build inputs, security posture, dependencies) independently of the
//! platform that runs it. Handlers read them; nothing mutates them after
//! resolution.

use crate::config::deep_merge;
use crate::error::Result;
use crate::types::ServiceName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequirement {
    pub persistent: bool,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequirements {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub needs_load_balancer: bool,
    #[serde(default)]
    pub custom_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: None,
            memory: None,
            replicas: default_replicas(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// The image is pulled as-is rather than built from source.
    #[serde(default)]
    pub prebuilt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRequirements {
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub run_as_non_root: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependencies {
    #[serde(default)]
    pub services: Vec<ServiceName>,
    #[serde(default)]
    pub external: Vec<ExternalDependency>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequirements {
    #[serde(default)]
    pub storage: Vec<StorageRequirement>,
    #[serde(default)]
    pub network: NetworkRequirements,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub build: BuildRequirements,
    #[serde(default)]
    pub security: SecurityRequirements,
    #[serde(default)]
    pub dependencies: Dependencies,
}

impl ServiceRequirements {
    /// Built-in requirements for a service.
    pub fn defaults_for(name: ServiceName) -> Self {
        match name {
            ServiceName::Frontend => Self {
                network: web_network(3000, "/api/health", true),
                resources: sized("256", "512"),
                build: dockerfile("apps/frontend/Dockerfile"),
                security: secrets(&["NEXTAUTH_SECRET"]),
                dependencies: depends_on(&[ServiceName::Backend]),
                ..Default::default()
            },
            ServiceName::Backend => Self {
                network: web_network(4000, "/api/health", true),
                resources: sized("512", "1024"),
                build: dockerfile("apps/backend/Dockerfile"),
                security: secrets(&["JWT_SECRET", "DATABASE_URL"]),
                dependencies: depends_on(&[ServiceName::Database, ServiceName::Filesystem]),
                ..Default::default()
            },
            ServiceName::Database => Self {
                storage: vec![StorageRequirement {
                    persistent: true,
                    mount_path: "/var/lib/postgresql/data".into(),
                    size: Some("20Gi".into()),
                    volume_name: Some("semiont-database-data".into()),
                }],
                network: NetworkRequirements {
                    ports: vec![5432],
                    ..Default::default()
                },
                resources: sized("512", "1024"),
                build: BuildRequirements {
                    prebuilt: true,
                    ..Default::default()
                },
                security: secrets(&["POSTGRES_PASSWORD"]),
                ..Default::default()
            },
            ServiceName::Filesystem => Self {
                storage: vec![StorageRequirement {
                    persistent: true,
                    mount_path: "/data".into(),
                    size: Some("10Gi".into()),
                    volume_name: Some("semiont-filesystem-data".into()),
                }],
                build: BuildRequirements {
                    prebuilt: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            ServiceName::Agent => Self {
                resources: sized("256", "512"),
                build: dockerfile("apps/agent/Dockerfile"),
                dependencies: depends_on(&[ServiceName::Backend]),
                ..Default::default()
            },
            ServiceName::Mcp => Self {
                network: web_network(8585, "/health", false),
                resources: sized("256", "512"),
                build: dockerfile("apps/mcp/Dockerfile"),
                dependencies: depends_on(&[ServiceName::Backend]),
                ..Default::default()
            },
        }
    }

    /// Built-in requirements overlaid with the `requirements` object of a
    /// service's config, when present.
    pub fn resolve(name: ServiceName, overrides: Option<&serde_json::Value>) -> Result<Self> {
        let defaults = Self::defaults_for(name);
        let Some(overrides) = overrides else {
            return Ok(defaults);
        };
        let mut merged = serde_json::to_value(&defaults)?;
        deep_merge(&mut merged, overrides);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn primary_port(&self) -> Option<u16> {
        self.network.ports.first().copied()
    }

    pub fn persistent_storage(&self) -> impl Iterator<Item = &StorageRequirement> {
        self.storage.iter().filter(|s| s.persistent)
    }
}

fn web_network(port: u16, health_path: &str, load_balanced: bool) -> NetworkRequirements {
    NetworkRequirements {
        ports: vec![port],
        health_check: Some(HealthCheck {
            path: Some(health_path.into()),
            port: Some(port),
            interval_secs: default_interval(),
        }),
        needs_load_balancer: load_balanced,
        custom_domains: Vec::new(),
    }
}

fn sized(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        cpu: Some(cpu.into()),
        memory: Some(memory.into()),
        replicas: 1,
    }
}

fn dockerfile(path: &str) -> BuildRequirements {
    BuildRequirements {
        dockerfile: Some(path.into()),
        context: Some(".".into()),
        ..Default::default()
    }
}

fn secrets(names: &[&str]) -> SecurityRequirements {
    SecurityRequirements {
        secrets: names.iter().map(|s| s.to_string()).collect(),
        run_as_non_root: true,
        read_only_root_filesystem: false,
    }
}

fn depends_on(services: &[ServiceName]) -> Dependencies {
    Dependencies {
        services: services.to_vec(),
        external: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn database_defaults_have_persistent_volume() {
        let req = ServiceRequirements::defaults_for(ServiceName::Database);
        let volumes: Vec<_> = req.persistent_storage().collect();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].mount_path, "/var/lib/postgresql/data");
        assert_eq!(req.primary_port(), Some(5432));
        assert!(req.build.prebuilt);
    }

    #[test]
    fn overrides_replace_only_named_fields() {
        let overrides = json!({
            "network": { "ports": [8080] },
            "resources": { "replicas": 3 }
        });
        let req = ServiceRequirements::resolve(ServiceName::Backend, Some(&overrides)).unwrap();
        assert_eq!(req.network.ports, vec![8080]);
        assert_eq!(req.resources.replicas, 3);
        // untouched fields keep their defaults
        assert_eq!(req.resources.memory.as_deref(), Some("1024"));
        assert!(req.network.needs_load_balancer);
        assert_eq!(
            req.dependencies.services,
            vec![ServiceName::Database, ServiceName::Filesystem]
        );
    }

    #[test]
    fn filesystem_exposes_no_ports() {
        let req = ServiceRequirements::defaults_for(ServiceName::Filesystem);
        assert_eq!(req.primary_port(), None);
    }
}

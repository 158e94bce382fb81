//! Typed per-service results and the `CommandResults` envelope every
//! command returns.

use crate::types::{Command, Platform, ServiceName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Metadata = Map<String, Value>;

// ---------------------------------------------------------------------------
// ServiceResult
// ---------------------------------------------------------------------------

/// Outcome of one operation against one service. `D` carries the
/// operation-specific fields and is flattened into the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult<D> {
    pub entity: String,
    pub platform: Platform,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub details: D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

impl<D: Default> ServiceResult<D> {
    /// Failure synthesized outside any handler: unexpected errors, missing
    /// handlers, unknown services.
    pub fn failure(entity: impl Into<String>, platform: Platform, error: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            platform,
            success: false,
            timestamp: Utc::now(),
            details: D::default(),
            error: Some(error.into()),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl<D> ServiceResult<D> {
    pub fn from_output(entity: ServiceName, platform: Platform, output: HandlerOutput<D>) -> Self {
        Self {
            entity: entity.to_string(),
            platform,
            success: output.success,
            timestamp: Utc::now(),
            details: output.details,
            error: output.error,
            warnings: output.warnings,
            metadata: output.metadata,
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// HandlerOutput
// ---------------------------------------------------------------------------

/// What a handler (or a directly-implemented strategy operation) reports.
/// The strategy stamps entity, platform and timestamp on top of it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput<D> {
    pub success: bool,
    pub details: D,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub metadata: Metadata,
}

impl<D> HandlerOutput<D> {
    pub fn ok(details: D) -> Self {
        Self {
            success: true,
            details,
            error: None,
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn failed(details: D, error: impl Into<String>) -> Self {
        Self {
            success: false,
            details,
            error: Some(error.into()),
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

impl<D: Default> HandlerOutput<D> {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::failed(D::default(), error)
    }

    /// Successful no-op reported when `--dry-run` suppressed the side effect.
    pub fn dry_run(action: impl Into<String>) -> Self {
        Self::ok(D::default())
            .with_metadata("dryRun", true)
            .with_metadata("wouldRun", action.into())
    }
}

// ---------------------------------------------------------------------------
// Operation details
// ---------------------------------------------------------------------------

/// Platform-specific identifiers for what a handler created or found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum PlatformResources {
    Process {
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Container {
        #[serde(rename = "containerName")]
        container_name: String,
        #[serde(rename = "containerId", skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Aws {
        #[serde(skip_serializing_if = "Option::is_none")]
        arn: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    External {
        endpoint: String,
    },
    Mock {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PlatformResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub graceful: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDetails {
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PlatformResources>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    Restart,
    Rolling,
    Recreate,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDetails {
    pub strategy: UpdateStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downtime_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub destroyed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecDetails {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDetails {
    #[serde(default)]
    pub suite: String,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn line(message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            source: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsDetails {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDetails {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

pub type StartResult = ServiceResult<StartDetails>;
pub type StopResult = ServiceResult<StopDetails>;
pub type CheckResult = ServiceResult<CheckDetails>;
pub type UpdateResult = ServiceResult<UpdateDetails>;
pub type ProvisionResult = ServiceResult<ProvisionDetails>;
pub type PublishResult = ServiceResult<PublishDetails>;
pub type BackupResult = ServiceResult<BackupDetails>;
pub type RestoreResult = ServiceResult<RestoreDetails>;
pub type ExecResult = ServiceResult<ExecDetails>;
pub type TestResult = ServiceResult<TestDetails>;
pub type LogsResult = ServiceResult<LogsDetails>;
pub type SecretResult = ServiceResult<SecretDetails>;

// ---------------------------------------------------------------------------
// CommandResults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub warnings: usize,
}

impl Summary {
    pub fn from_results<D>(results: &[ServiceResult<D>]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            warnings: results.iter().filter(|r| r.has_warnings()).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub user: String,
    pub working_directory: String,
    pub dry_run: bool,
}

impl ExecutionContext {
    pub fn current(dry_run: bool) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let working_directory = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            user,
            working_directory,
            dry_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResults<D> {
    pub command: Command,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    pub results: Vec<ServiceResult<D>>,
    pub summary: Summary,
    pub execution_context: ExecutionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<D> CommandResults<D> {
    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool, warn: bool) -> StartResult {
        let mut out = if success {
            HandlerOutput::ok(StartDetails::default())
        } else {
            HandlerOutput::failure("nope")
        };
        if warn {
            out = out.with_warning("careful");
        }
        ServiceResult::from_output(ServiceName::Backend, Platform::Mock, out)
    }

    #[test]
    fn summary_counts_are_consistent() {
        let results = vec![result(true, false), result(false, true), result(true, true)];
        let s = Summary::from_results(&results);
        assert_eq!(s.total, 3);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.warnings, 2);
        assert_eq!(s.succeeded + s.failed, s.total);
    }

    #[test]
    fn details_are_flattened_when_serialized() {
        let out = HandlerOutput::ok(CheckDetails {
            status: ServiceStatus::Running,
            ..Default::default()
        });
        let r = ServiceResult::from_output(ServiceName::Database, Platform::Container, out);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["entity"], "database");
        assert_eq!(v["platform"], "container");
        assert_eq!(v["status"], "running");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn dry_run_output_succeeds_with_marker() {
        let out: HandlerOutput<StopDetails> = HandlerOutput::dry_run("docker stop x");
        assert!(out.success);
        assert_eq!(out.metadata["dryRun"], true);
        assert_eq!(out.metadata["wouldRun"], "docker stop x");
    }

    #[test]
    fn resources_tag_by_platform() {
        let r = PlatformResources::Container {
            container_name: "semiont-backend-local".into(),
            container_id: Some("abc".into()),
            image: None,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["platform"], "container");
        assert_eq!(v["containerName"], "semiont-backend-local");
    }
}

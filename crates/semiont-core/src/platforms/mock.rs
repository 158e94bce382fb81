//! In-memory platform used by tests and by `semiont` runs against a `mock`
//! environment. Nothing leaves the process.

use crate::error::{Result, SemiontError};
use crate::results::{
    BackupDetails, BackupResult, CheckDetails, CheckResult, ExecDetails, ExecResult, HandlerOutput,
    HealthInfo, LogEntry, LogsDetails, LogsResult, PlatformResources, ProvisionDetails,
    ProvisionResult, PublishDetails, PublishResult, RestoreDetails, RestoreResult, SecretDetails,
    SecretResult, ServiceResult, ServiceStatus, StartDetails, StartResult, StopDetails,
    StopResult, TestDetails, TestResult, UpdateDetails, UpdateResult, UpdateStrategy,
};
use crate::service::ServiceContext;
use crate::strategy::{
    ExecOptions, LogOptions, PlatformStrategy, ProvisionOptions, PublishOptions, SecretAction,
    TestOptions,
};
use crate::types::{Command, Platform, ServiceName, ServiceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct MockInstance {
    id: String,
    started_at: DateTime<Utc>,
    port: Option<u16>,
    version: u32,
}

#[derive(Debug, Clone)]
struct MockBackup {
    service: ServiceName,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MockPlatform {
    instances: Mutex<HashMap<ServiceName, MockInstance>>,
    backups: Mutex<HashMap<String, MockBackup>>,
    secrets: Mutex<BTreeMap<String, String>>,
    faults: HashSet<(Command, ServiceName)>,
    counter: AtomicU64,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `command` return `Err` for `service`, as a crashed handler would.
    pub fn fail_on(mut self, command: Command, service: ServiceName) -> Self {
        self.faults.insert((command, service));
        self
    }

    pub async fn is_running(&self, service: ServiceName) -> bool {
        self.instances.lock().await.contains_key(&service)
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn inject(&self, command: Command, service: &ServiceContext) -> Result<()> {
        if self.faults.contains(&(command, service.name)) {
            return Err(SemiontError::Injected(format!("{command} failed for {}", service.name)));
        }
        Ok(())
    }

    fn wrap<D>(service: &ServiceContext, output: HandlerOutput<D>) -> ServiceResult<D> {
        ServiceResult::from_output(service.name, Platform::Mock, output)
    }

    fn secret_key(service: &ServiceContext, name: &str) -> String {
        format!("{}/{}/{}", service.environment, service.name, name)
    }
}

#[async_trait]
impl PlatformStrategy for MockPlatform {
    fn platform(&self) -> Platform {
        Platform::Mock
    }

    fn determine_service_type(&self, _service: &ServiceContext) -> ServiceType {
        ServiceType::Generic
    }

    async fn start(&self, service: &ServiceContext) -> Result<StartResult> {
        self.inject(Command::Start, service)?;
        let port = service.port();
        let endpoint = port.map(|p| format!("http://localhost:{p}"));
        if service.dry_run() {
            return Ok(Self::wrap(service, HandlerOutput::dry_run(format!("start {}", service.name))));
        }

        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&service.name) {
            let output = HandlerOutput::ok(StartDetails {
                start_time: Some(existing.started_at),
                endpoint,
                resources: Some(PlatformResources::Mock {
                    id: existing.id.clone(),
                }),
            })
            .with_warning(format!("{} is already running", service.name))
            .with_metadata("alreadyRunning", true);
            return Ok(Self::wrap(service, output));
        }

        let instance = MockInstance {
            id: format!("mock-{}-{}", service.name, self.next()),
            started_at: Utc::now(),
            port,
            version: 1,
        };
        tracing::debug!(service = %service.name, id = %instance.id, "mock start");
        let details = StartDetails {
            start_time: Some(instance.started_at),
            endpoint,
            resources: Some(PlatformResources::Mock {
                id: instance.id.clone(),
            }),
        };
        instances.insert(service.name, instance);
        Ok(Self::wrap(service, HandlerOutput::ok(details)))
    }

    async fn stop(&self, service: &ServiceContext) -> Result<StopResult> {
        self.inject(Command::Stop, service)?;
        let mut instances = self.instances.lock().await;
        let was_running = if service.dry_run() {
            instances.contains_key(&service.name)
        } else {
            instances.remove(&service.name).is_some()
        };
        let mut output = HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        })
        .with_metadata("wasRunning", was_running);
        if service.dry_run() {
            output = output.with_metadata("dryRun", true);
        }
        Ok(Self::wrap(service, output))
    }

    async fn check(&self, service: &ServiceContext) -> Result<CheckResult> {
        self.inject(Command::Check, service)?;
        let instances = self.instances.lock().await;
        let details = match instances.get(&service.name) {
            Some(instance) => CheckDetails {
                status: ServiceStatus::Running,
                health: Some(HealthInfo {
                    healthy: true,
                    endpoint: instance.port.map(|p| format!("http://localhost:{p}")),
                    response_time_ms: Some(0),
                    ..Default::default()
                }),
                resources: Some(PlatformResources::Mock {
                    id: instance.id.clone(),
                }),
            },
            None => CheckDetails {
                status: ServiceStatus::Stopped,
                ..Default::default()
            },
        };
        Ok(Self::wrap(service, HandlerOutput::ok(details)))
    }

    async fn update(&self, service: &ServiceContext) -> Result<UpdateResult> {
        self.inject(Command::Update, service)?;
        if service.dry_run() {
            return Ok(Self::wrap(service, HandlerOutput::dry_run(format!("update {}", service.name))));
        }
        let mut instances = self.instances.lock().await;
        let Some(instance) = instances.get_mut(&service.name) else {
            return Ok(Self::wrap(
                service,
                HandlerOutput::failure(format!("{} is not running", service.name)),
            ));
        };
        let previous = instance.version;
        instance.version += 1;
        let output = HandlerOutput::ok(UpdateDetails {
            strategy: UpdateStrategy::Rolling,
            previous_version: Some(format!("v{previous}")),
            new_version: Some(format!("v{}", instance.version)),
            downtime_ms: Some(0),
        });
        Ok(Self::wrap(service, output))
    }

    async fn provision(
        &self,
        service: &ServiceContext,
        options: &ProvisionOptions,
    ) -> Result<ProvisionResult> {
        self.inject(Command::Provision, service)?;
        let details = ProvisionDetails {
            resources: vec![format!("mock-{}-{}", service.name, service.environment)],
            dependencies: service
                .requirements()
                .dependencies
                .services
                .iter()
                .map(ToString::to_string)
                .collect(),
            destroyed: options.destroy,
        };
        Ok(Self::wrap(service, HandlerOutput::ok(details)))
    }

    async fn publish(&self, service: &ServiceContext, options: &PublishOptions) -> Result<PublishResult> {
        self.inject(Command::Publish, service)?;
        let version = options
            .tag
            .clone()
            .unwrap_or_else(|| format!("mock-{}", self.next()));
        let mut details = PublishDetails {
            version: Some(version.clone()),
            ..Default::default()
        };
        details
            .artifacts
            .insert("image".into(), format!("semiont-{}:{version}", service.name));
        if !options.no_push {
            details.destinations.push("mock://registry".into());
        }
        Ok(Self::wrap(service, HandlerOutput::ok(details)))
    }

    async fn backup(&self, service: &ServiceContext) -> Result<BackupResult> {
        self.inject(Command::Backup, service)?;
        let backup_id = format!("mock-backup-{}-{}", service.name, self.next());
        let created_at = Utc::now();
        self.backups.lock().await.insert(
            backup_id.clone(),
            MockBackup {
                service: service.name,
                created_at,
            },
        );
        let output = HandlerOutput::ok(BackupDetails {
            backup_id: Some(backup_id.clone()),
            location: Some(format!("mock://backups/{backup_id}")),
            size_bytes: Some(0),
        })
        .with_metadata("createdAt", created_at.to_rfc3339());
        Ok(Self::wrap(service, output))
    }

    async fn restore(&self, service: &ServiceContext, backup_id: &str) -> Result<RestoreResult> {
        self.inject(Command::Restore, service)?;
        let backups = self.backups.lock().await;
        let Some(backup) = backups.get(backup_id) else {
            return Ok(Self::wrap(
                service,
                HandlerOutput::failure(format!("backup '{backup_id}' not found")),
            ));
        };
        let mut output = HandlerOutput::ok(RestoreDetails {
            backup_id: Some(backup_id.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(service.name.to_string()),
        })
        .with_metadata("backupCreatedAt", backup.created_at.to_rfc3339());
        if backup.service != service.name {
            output = output.with_warning(format!(
                "backup '{backup_id}' was taken from {}",
                backup.service
            ));
        }
        Ok(Self::wrap(service, output))
    }

    async fn exec(
        &self,
        service: &ServiceContext,
        command: &str,
        _options: &ExecOptions,
    ) -> Result<ExecResult> {
        self.inject(Command::Exec, service)?;
        let output = HandlerOutput::ok(ExecDetails {
            command: command.to_string(),
            exit_code: Some(0),
            stdout: format!("mock exec on {}: {command}", service.name),
            stderr: String::new(),
            duration_ms: 0,
        });
        Ok(Self::wrap(service, output))
    }

    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult> {
        self.inject(Command::Test, service)?;
        let output = HandlerOutput::ok(TestDetails {
            suite: options.suite.clone().unwrap_or_else(|| "all".into()),
            passed: 1,
            failed: 0,
            skipped: 0,
            exit_code: Some(0),
        });
        Ok(Self::wrap(service, output))
    }

    async fn collect_logs(&self, service: &ServiceContext, options: &LogOptions) -> Result<LogsResult> {
        self.inject(Command::Logs, service)?;
        let instances = self.instances.lock().await;
        let entries = match instances.get(&service.name) {
            Some(instance) => vec![
                LogEntry {
                    timestamp: Some(instance.started_at),
                    source: Some(instance.id.clone()),
                    message: format!("{} started", service.name),
                },
                LogEntry {
                    timestamp: Some(Utc::now()),
                    source: Some(instance.id.clone()),
                    message: format!("{} running version v{}", service.name, instance.version),
                },
            ],
            None => Vec::new(),
        };
        let skip = entries.len().saturating_sub(options.tail);
        let details = LogsDetails {
            entries: entries.into_iter().skip(skip).collect(),
        };
        Ok(Self::wrap(service, HandlerOutput::ok(details)))
    }

    async fn manage_secret(&self, service: &ServiceContext, action: &SecretAction) -> Result<SecretResult> {
        self.inject(Command::Secret, service)?;
        let mut secrets = self.secrets.lock().await;
        let mut details = SecretDetails {
            action: action.as_str().to_string(),
            secret: action.name().map(str::to_string),
            ..Default::default()
        };
        let output = match action {
            SecretAction::Get { name } => match secrets.get(&Self::secret_key(service, name)) {
                Some(value) => {
                    details.value = Some(value.clone());
                    HandlerOutput::ok(details)
                }
                None => HandlerOutput::failed(details, format!("secret '{name}' not found")),
            },
            SecretAction::Set { name, value } => {
                if !service.dry_run() {
                    secrets.insert(Self::secret_key(service, name), value.clone());
                }
                HandlerOutput::ok(details)
            }
            SecretAction::List => {
                let prefix = Self::secret_key(service, "");
                details.names = secrets
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect();
                HandlerOutput::ok(details)
            }
            SecretAction::Delete { name } => {
                let key = Self::secret_key(service, name);
                if service.dry_run() || secrets.remove(&key).is_some() {
                    HandlerOutput::ok(details)
                } else {
                    HandlerOutput::failed(details, format!("secret '{name}' not found"))
                }
            }
        };
        Ok(Self::wrap(service, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use serde_json::json;
    use std::path::Path;

    fn ctx(name: &str, dry_run: bool) -> ServiceContext {
        let info = ServicePlatformInfo {
            name: name.into(),
            platform: Platform::Mock,
            config: json!({}),
        };
        let flags = ContextFlags {
            dry_run,
            ..Default::default()
        };
        ServiceContext::new(&info, "test", Path::new("/p"), flags).unwrap()
    }

    #[tokio::test]
    async fn start_then_check_reports_running() {
        let mock = MockPlatform::new();
        let started = mock.start(&ctx("backend", false)).await.unwrap();
        assert!(started.success);
        assert_eq!(started.details.endpoint.as_deref(), Some("http://localhost:4000"));

        let checked = mock.check(&ctx("backend", false)).await.unwrap();
        assert_eq!(checked.details.status, ServiceStatus::Running);
        let stopped = mock.check(&ctx("frontend", false)).await.unwrap();
        assert_eq!(stopped.details.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn second_stop_sees_nothing_running() {
        let mock = MockPlatform::new();
        mock.start(&ctx("database", false)).await.unwrap();

        let first = mock.stop(&ctx("database", false)).await.unwrap();
        assert!(first.success);
        assert_eq!(first.metadata["wasRunning"], true);

        let second = mock.stop(&ctx("database", false)).await.unwrap();
        assert!(second.success);
        assert_eq!(second.metadata["wasRunning"], false);
    }

    #[tokio::test]
    async fn dry_run_stop_keeps_state() {
        let mock = MockPlatform::new();
        mock.start(&ctx("backend", false)).await.unwrap();

        let result = mock.stop(&ctx("backend", true)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["wasRunning"], true);
        assert!(mock.is_running(ServiceName::Backend).await);
    }

    #[tokio::test]
    async fn restore_requires_a_known_backup() {
        let mock = MockPlatform::new();
        let backup = mock.backup(&ctx("database", false)).await.unwrap();
        let id = backup.details.backup_id.unwrap();

        let restored = mock.restore(&ctx("database", false), &id).await.unwrap();
        assert!(restored.success);
        assert!(restored.warnings.is_empty());

        let missing = mock.restore(&ctx("database", false), "nope").await.unwrap();
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn injected_fault_is_an_error() {
        let mock = MockPlatform::new().fail_on(Command::Restore, ServiceName::Frontend);
        let err = mock.restore(&ctx("frontend", false), "x").await.unwrap_err();
        assert!(matches!(err, SemiontError::Injected(_)));
        assert!(mock.restore(&ctx("database", false), "x").await.is_ok());
    }

    #[tokio::test]
    async fn update_bumps_version_of_running_service() {
        let mock = MockPlatform::new();
        let not_running = mock.update(&ctx("mcp", false)).await.unwrap();
        assert!(!not_running.success);

        mock.start(&ctx("mcp", false)).await.unwrap();
        let updated = mock.update(&ctx("mcp", false)).await.unwrap();
        assert_eq!(updated.details.previous_version.as_deref(), Some("v1"));
        assert_eq!(updated.details.new_version.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn secrets_are_scoped_per_service() {
        let mock = MockPlatform::new();
        let set = SecretAction::Set {
            name: "DB_PASSWORD".into(),
            value: "hunter2".into(),
        };
        mock.manage_secret(&ctx("backend", false), &set).await.unwrap();

        let got = mock
            .manage_secret(&ctx("backend", false), &SecretAction::Get { name: "DB_PASSWORD".into() })
            .await
            .unwrap();
        assert_eq!(got.details.value.as_deref(), Some("hunter2"));

        let listed = mock.manage_secret(&ctx("frontend", false), &SecretAction::List).await.unwrap();
        assert!(listed.details.names.is_empty());
        let listed = mock.manage_secret(&ctx("backend", false), &SecretAction::List).await.unwrap();
        assert_eq!(listed.details.names, vec!["DB_PASSWORD".to_string()]);
    }

    #[tokio::test]
    async fn logs_respect_tail() {
        let mock = MockPlatform::new();
        mock.start(&ctx("agent", false)).await.unwrap();
        let logs = mock
            .collect_logs(&ctx("agent", false), &LogOptions { tail: 1, since: None })
            .await
            .unwrap();
        assert_eq!(logs.details.entries.len(), 1);
        assert!(logs.details.entries[0].message.contains("version v1"));
    }
}

//! AWS: ECS Fargate services, RDS, EFS, Lambda and S3 + CloudFront sites,
//! all driven through the `aws` CLI. Resource identifiers come from the
//! outputs of the environment's CloudFormation stacks unless a service's
//! config names them directly.

use super::{command_error, new_backup_id};
use crate::config::AwsConfig;
use crate::error::Result;
use crate::handler::{
    DiscoveredResources, Handler, HandlerContext, HandlerDescriptor, HandlerKind, OperationArgs,
};
use crate::registry::HandlerRegistry;
use crate::results::{
    BackupDetails, BackupResult, CheckDetails, CheckResult, ExecDetails, ExecResult, HandlerOutput,
    HealthInfo, LogEntry, LogsDetails, LogsResult, PlatformResources, ProvisionDetails,
    ProvisionResult, PublishDetails, PublishResult, RestoreDetails, RestoreResult, SecretDetails,
    SecretResult, ServiceResult, ServiceStatus, StartDetails, StartResult, StopDetails, StopResult,
    TestDetails, TestResult, UpdateDetails, UpdateResult, UpdateStrategy,
};
use crate::runner::{CommandRunner, Invocation};
use crate::service::ServiceContext;
use crate::strategy::{
    Dispatcher, ExecOptions, LogOptions, PlatformStrategy, ProvisionOptions, PublishOptions,
    ResourceDiscovery, SecretAction, TestOptions,
};
use crate::types::{Platform, ServiceName, ServiceType};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_REGION: &str = "us-east-1";
const DEPLOY_TIMEOUT_SECS: u64 = 600;
const DEPLOY_POLL_SECS: u64 = 5;
const IMAGE_PULL_GRACE: Duration = Duration::from_secs(300);
const CDK_TIMEOUT: Duration = Duration::from_secs(45 * 60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(1800);

pub fn handlers() -> Vec<HandlerDescriptor> {
    let p = Platform::Aws;
    let ecs = ServiceType::EcsFargate;
    let rds = ServiceType::Rds;
    let efs = ServiceType::Efs;
    let lambda = ServiceType::Lambda;
    let site = ServiceType::S3Cloudfront;

    let mut descriptors: Vec<HandlerDescriptor> = [
        HandlerDescriptor::new(p, ecs, Handler::Start(start_ecs)),
        HandlerDescriptor::new(p, ecs, Handler::Stop(stop_ecs)),
        ecs_check_descriptor(),
        HandlerDescriptor::new(p, ecs, Handler::Update(update_ecs)),
        HandlerDescriptor::new(p, ecs, Handler::Publish(publish_ecs)),
        HandlerDescriptor::new(p, ecs, Handler::Logs(logs_ecs)),
        HandlerDescriptor::new(p, rds, Handler::Start(start_rds)),
        HandlerDescriptor::new(p, rds, Handler::Stop(stop_rds)),
        HandlerDescriptor::new(p, rds, Handler::Check(check_rds)),
        HandlerDescriptor::new(p, rds, Handler::Backup(backup_rds)),
        HandlerDescriptor::new(p, rds, Handler::Restore(restore_rds)),
        HandlerDescriptor::new(p, efs, Handler::Check(check_efs)),
        HandlerDescriptor::new(p, efs, Handler::Backup(backup_efs)),
        HandlerDescriptor::new(p, lambda, Handler::Check(check_lambda)),
        HandlerDescriptor::new(p, lambda, Handler::Update(update_lambda)),
        HandlerDescriptor::new(p, site, Handler::Check(check_site)),
        HandlerDescriptor::new(p, site, Handler::Publish(publish_site)),
    ]
    .into_iter()
    .map(HandlerDescriptor::with_discovery)
    .collect();

    // provisioning creates the stacks discovery would read
    for ty in [ecs, rds, efs, lambda, site] {
        descriptors.push(HandlerDescriptor::new(p, ty, Handler::Provision(provision_stack)));
    }
    descriptors
}

/// The ECS Fargate health check.
pub fn ecs_check_descriptor() -> HandlerDescriptor {
    HandlerDescriptor::new(Platform::Aws, ServiceType::EcsFargate, Handler::Check(check_ecs))
        .with_discovery()
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

/// The service's `aws` config block with defaults applied.
struct AwsTarget {
    region: String,
    config: AwsConfig,
}

impl AwsTarget {
    fn of(service: &ServiceContext) -> Self {
        let config = service
            .config
            .get("aws")
            .cloned()
            .and_then(|v| serde_json::from_value::<AwsConfig>(v).ok())
            .unwrap_or_else(|| AwsConfig {
                region: String::new(),
                account_id: None,
                stacks: Default::default(),
                backup_vault: None,
            });
        let region = if config.region.is_empty() {
            service
                .environment_variables()
                .get("AWS_REGION")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REGION.to_string())
        } else {
            config.region.clone()
        };
        Self { region, config }
    }
}

fn aws<I, S>(region: &str, args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Invocation::new("aws")
        .args(args)
        .args(["--region", region, "--output", "json"])
}

/// Run an `aws` call that must succeed and parse its JSON output.
async fn aws_json(runner: &dyn CommandRunner, region: &str, args: &[&str]) -> Result<Value> {
    let out = runner
        .run(&aws(region, args.iter().copied()))
        .await?
        .require_success("aws")?;
    if out.stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    out.json()
}

/// A config override or else a stack output.
fn lookup(ctx: &HandlerContext<'_>, config_key: &str, output_key: &str) -> Option<String> {
    ctx.service
        .config_str(config_key)
        .map(str::to_string)
        .or_else(|| ctx.discovered.get(output_key).map(str::to_string))
}

fn output_key(service: ServiceName, suffix: &str) -> String {
    format!("{}{suffix}", service.title())
}

fn missing(what: &str, key: &str) -> String {
    format!("{what} not found: set it in the service config or export '{key}' from the stack")
}

fn aws_resources(arn: Option<String>, id: Option<String>, region: &str) -> Option<PlatformResources> {
    Some(PlatformResources::Aws {
        arn,
        id,
        region: Some(region.to_string()),
    })
}

fn str_at(v: &Value, pointer: &str) -> Option<String> {
    v.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------------
// CloudFormation discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacks {
    #[serde(default)]
    stacks: Vec<Stack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Stack {
    #[serde(default)]
    outputs: Vec<StackOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutput {
    output_key: String,
    output_value: String,
}

/// Reads the outputs of the data and app stacks. A stack that cannot be
/// described contributes nothing; handlers report whichever output they
/// needed and did not get.
pub struct StackOutputs {
    runner: Arc<dyn CommandRunner>,
}

impl StackOutputs {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ResourceDiscovery for StackOutputs {
    async fn discover(&self, service: &ServiceContext) -> Result<DiscoveredResources> {
        let target = AwsTarget::of(service);
        let mut found = DiscoveredResources::new();
        for stack in [&target.config.stacks.data, &target.config.stacks.app] {
            let inv = aws(
                &target.region,
                ["cloudformation", "describe-stacks", "--stack-name", stack.as_str()],
            );
            let out = self.runner.run(&inv).await?;
            if !out.success() {
                tracing::warn!(stack = %stack, error = %out.error_text(), "stack outputs unavailable");
                continue;
            }
            let described: DescribeStacks = out.json()?;
            for output in described.stacks.into_iter().flat_map(|s| s.outputs) {
                found.insert(output.output_key, output.output_value);
            }
        }
        tracing::debug!(service = %service.name, outputs = found.len(), "discovered stack outputs");
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct AwsPlatform {
    dispatcher: Dispatcher,
    discovery: StackOutputs,
}

impl AwsPlatform {
    pub fn new(registry: Arc<HandlerRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            discovery: StackOutputs::new(runner.clone()),
            dispatcher: Dispatcher::new(Platform::Aws, registry, runner),
        }
    }

    async fn dispatch<D: HandlerKind>(
        &self,
        service: &ServiceContext,
        args: &OperationArgs,
    ) -> Result<ServiceResult<D>> {
        self.dispatcher
            .dispatch(service, self.determine_service_type(service), args, &self.discovery)
            .await
    }

    fn secret_id(service: &ServiceContext, name: &str) -> String {
        format!("semiont/{}/{}/{name}", service.environment, service.name)
    }
}

#[async_trait]
impl PlatformStrategy for AwsPlatform {
    fn platform(&self) -> Platform {
        Platform::Aws
    }

    fn determine_service_type(&self, service: &ServiceContext) -> ServiceType {
        if let Some(ty) = service.config_str("serviceType").and_then(|s| s.parse().ok()) {
            return ty;
        }
        match service.name {
            ServiceName::Frontend | ServiceName::Backend | ServiceName::Mcp => ServiceType::EcsFargate,
            ServiceName::Database => ServiceType::Rds,
            ServiceName::Filesystem => ServiceType::Efs,
            ServiceName::Agent => ServiceType::Lambda,
        }
    }

    async fn start(&self, service: &ServiceContext) -> Result<StartResult> {
        self.dispatch(service, &OperationArgs::default()).await
    }

    async fn stop(&self, service: &ServiceContext) -> Result<StopResult> {
        self.dispatch(service, &OperationArgs::default()).await
    }

    async fn check(&self, service: &ServiceContext) -> Result<CheckResult> {
        self.dispatch(service, &OperationArgs::default()).await
    }

    async fn update(&self, service: &ServiceContext) -> Result<UpdateResult> {
        self.dispatch(service, &OperationArgs::default()).await
    }

    async fn provision(
        &self,
        service: &ServiceContext,
        options: &ProvisionOptions,
    ) -> Result<ProvisionResult> {
        let args = OperationArgs {
            provision: options.clone(),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn publish(&self, service: &ServiceContext, options: &PublishOptions) -> Result<PublishResult> {
        let args = OperationArgs {
            publish: options.clone(),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn backup(&self, service: &ServiceContext) -> Result<BackupResult> {
        self.dispatch(service, &OperationArgs::default()).await
    }

    async fn restore(&self, service: &ServiceContext, backup_id: &str) -> Result<RestoreResult> {
        let args = OperationArgs {
            backup_id: Some(backup_id.to_string()),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn exec(
        &self,
        service: &ServiceContext,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult> {
        let wrap = |output: HandlerOutput<ExecDetails>| {
            ServiceResult::from_output(service.name, Platform::Aws, output)
        };
        if self.determine_service_type(service) != ServiceType::EcsFargate {
            return Ok(wrap(HandlerOutput::failure(format!(
                "exec is only supported for ECS services, not {}",
                self.determine_service_type(service)
            ))));
        }
        let target = AwsTarget::of(service);
        let discovered = self.discovery.discover(service).await?;
        let cluster = service
            .config_str("cluster")
            .or_else(|| discovered.get("ClusterName"))
            .map(str::to_string);
        let ecs_key = output_key(service.name, "ServiceName");
        let ecs_service = service
            .config_str("ecsService")
            .or_else(|| discovered.get(&ecs_key))
            .map(str::to_string);
        let (Some(cluster), Some(ecs_service)) = (cluster, ecs_service) else {
            return Ok(wrap(HandlerOutput::failure(missing("ECS service", &ecs_key))));
        };

        let tasks = aws_json(
            self.dispatcher.runner(),
            &target.region,
            &["ecs", "list-tasks", "--cluster", cluster.as_str(), "--service-name", ecs_service.as_str()],
        )
        .await?;
        let Some(task) = tasks
            .pointer("/taskArns/0")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(wrap(HandlerOutput::failure(format!(
                "no running tasks for {ecs_service}"
            ))));
        };

        let mut inv = Invocation::new("aws").args([
            "ecs",
            "execute-command",
            "--cluster",
            cluster.as_str(),
            "--task",
            task.as_str(),
            "--container",
            service.name.as_str(),
            "--interactive",
            "--command",
            command,
            "--region",
            target.region.as_str(),
        ]);
        if let Some(limit) = options.timeout {
            inv = inv.timeout(limit);
        }
        if service.dry_run() {
            return Ok(wrap(HandlerOutput::dry_run(inv.display())));
        }
        let started = Instant::now();
        let out = self.dispatcher.runner().run(&inv).await?;
        let details = ExecDetails {
            command: command.to_string(),
            exit_code: Some(out.status),
            stdout: out.stdout.clone(),
            stderr: out.stderr.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let output = if out.success() {
            HandlerOutput::ok(details)
        } else {
            HandlerOutput::failed(details, command_error("ecs execute-command", &out))
        };
        Ok(wrap(output.with_metadata("task", task)))
    }

    /// Smoke test: the deployed service must pass its check.
    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult> {
        let checked = self.check(service).await?;
        let healthy = checked.success && checked.details.status == ServiceStatus::Running;
        let details = TestDetails {
            suite: options.suite.clone().unwrap_or_else(|| "smoke".into()),
            passed: u32::from(healthy),
            failed: u32::from(!healthy),
            skipped: 0,
            exit_code: None,
        };
        let output = if healthy {
            HandlerOutput::ok(details)
        } else {
            let reason = checked
                .error
                .unwrap_or_else(|| format!("service is {}", checked.details.status));
            HandlerOutput::failed(details, reason)
        };
        Ok(ServiceResult::from_output(service.name, Platform::Aws, output))
    }

    async fn collect_logs(&self, service: &ServiceContext, options: &LogOptions) -> Result<LogsResult> {
        let args = OperationArgs {
            logs: options.clone(),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn manage_secret(&self, service: &ServiceContext, action: &SecretAction) -> Result<SecretResult> {
        let target = AwsTarget::of(service);
        let runner = self.dispatcher.runner();
        let region = target.region.as_str();
        let mut details = SecretDetails {
            action: action.as_str().to_string(),
            secret: action.name().map(str::to_string),
            ..Default::default()
        };

        let output = match action {
            SecretAction::Get { name } => {
                let id = Self::secret_id(service, name);
                let out = runner
                    .run(&aws(region, ["secretsmanager", "get-secret-value", "--secret-id", id.as_str()]))
                    .await?;
                if out.success() {
                    details.value = str_at(&out.json::<Value>()?, "/SecretString");
                    HandlerOutput::ok(details)
                } else {
                    HandlerOutput::failed(details, command_error("get-secret-value", &out))
                }
            }
            SecretAction::Set { name, value } => {
                let id = Self::secret_id(service, name);
                let put = aws(
                    region,
                    ["secretsmanager", "put-secret-value", "--secret-id", id.as_str(), "--secret-string", value.as_str()],
                );
                if service.dry_run() {
                    HandlerOutput::dry_run(format!("secretsmanager put-secret-value --secret-id {id}"))
                } else {
                    let out = runner.run(&put).await?;
                    if out.success() {
                        HandlerOutput::ok(details)
                    } else if out.error_text().contains("ResourceNotFoundException") {
                        let created = runner
                            .run(&aws(
                                region,
                                ["secretsmanager", "create-secret", "--name", id.as_str(), "--secret-string", value.as_str()],
                            ))
                            .await?;
                        if created.success() {
                            HandlerOutput::ok(details).with_metadata("created", true)
                        } else {
                            HandlerOutput::failed(details, command_error("create-secret", &created))
                        }
                    } else {
                        HandlerOutput::failed(details, command_error("put-secret-value", &out))
                    }
                }
            }
            SecretAction::List => {
                let prefix = Self::secret_id(service, "");
                let filter = format!("Key=name,Values={prefix}");
                let listed = aws_json(
                    runner,
                    region,
                    &["secretsmanager", "list-secrets", "--filters", filter.as_str()],
                )
                .await?;
                details.names = listed
                    .get("SecretList")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|s| s.get("Name").and_then(Value::as_str))
                    .filter_map(|n| n.strip_prefix(&prefix).map(str::to_string))
                    .collect();
                HandlerOutput::ok(details)
            }
            SecretAction::Delete { name } => {
                let id = Self::secret_id(service, name);
                let inv = aws(
                    region,
                    ["secretsmanager", "delete-secret", "--secret-id", id.as_str(), "--recovery-window-in-days", "7"],
                );
                if service.dry_run() {
                    HandlerOutput::dry_run(inv.display())
                } else {
                    let out = runner.run(&inv).await?;
                    if out.success() {
                        HandlerOutput::ok(details)
                    } else {
                        HandlerOutput::failed(details, command_error("delete-secret", &out))
                    }
                }
            }
        };
        Ok(ServiceResult::from_output(service.name, Platform::Aws, output))
    }
}

// ---------------------------------------------------------------------------
// ECS Fargate
// ---------------------------------------------------------------------------

struct EcsTarget {
    cluster: String,
    service: String,
    region: String,
}

fn ecs_target(ctx: &HandlerContext<'_>) -> std::result::Result<EcsTarget, String> {
    let cluster = lookup(ctx, "cluster", "ClusterName").ok_or_else(|| missing("ECS cluster", "ClusterName"))?;
    let key = output_key(ctx.service.name, "ServiceName");
    let service = lookup(ctx, "ecsService", &key).ok_or_else(|| missing("ECS service", &key))?;
    Ok(EcsTarget {
        cluster,
        service,
        region: AwsTarget::of(ctx.service).region,
    })
}

async fn describe_ecs(ctx: &HandlerContext<'_>, t: &EcsTarget) -> Result<Option<Value>> {
    let described = aws_json(
        ctx.runner,
        &t.region,
        &["ecs", "describe-services", "--cluster", t.cluster.as_str(), "--services", t.service.as_str()],
    )
    .await?;
    Ok(described.pointer("/services/0").cloned())
}

fn primary_deployment(service: &Value) -> Option<&Value> {
    service
        .get("deployments")?
        .as_array()?
        .iter()
        .find(|d| d.get("status").and_then(Value::as_str) == Some("PRIMARY"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rollout {
    Completed,
    Failed(String),
    InProgress { image_pull: bool },
}

/// Where the primary deployment of a `describe-services` entry stands.
pub(crate) fn rollout_state(service: &Value) -> Rollout {
    let Some(primary) = primary_deployment(service) else {
        return Rollout::InProgress { image_pull: false };
    };
    match primary.get("rolloutState").and_then(Value::as_str) {
        Some("COMPLETED") => return Rollout::Completed,
        Some("FAILED") => {
            return Rollout::Failed(
                str_at(primary, "/rolloutStateReason").unwrap_or_else(|| "deployment failed".into()),
            )
        }
        Some(_) => {}
        None => {
            let single = service
                .get("deployments")
                .and_then(Value::as_array)
                .is_some_and(|d| d.len() == 1);
            let running = primary.get("runningCount").and_then(Value::as_u64);
            let desired = primary.get("desiredCount").and_then(Value::as_u64);
            if single && running.is_some() && running == desired {
                return Rollout::Completed;
            }
        }
    }
    let image_pull = service
        .get("events")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .take(5)
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .any(|m| m.to_lowercase().contains("pull"));
    Rollout::InProgress { image_pull }
}

/// Wait deadline that may be pushed back exactly once.
pub(crate) struct Deadline {
    at: Instant,
    extended: bool,
}

impl Deadline {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            extended: false,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub(crate) fn extend_once(&mut self, by: Duration) -> bool {
        if self.extended {
            return false;
        }
        self.at += by;
        self.extended = true;
        true
    }
}

fn start_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let t = match ecs_target(ctx) {
            Ok(t) => t,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let desired = ctx
            .service
            .config_u64("desiredCount")
            .unwrap_or(u64::from(ctx.service.requirements().resources.replicas))
            .to_string();
        let args = [
            "ecs", "update-service", "--cluster", t.cluster.as_str(), "--service", t.service.as_str(), "--desired-count", desired.as_str(),
        ];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&t.region, args).display()));
        }
        let updated = aws_json(ctx.runner, &t.region, &args).await?;
        let endpoint = lookup(ctx, "url", &output_key(ctx.service.name, "Url"));
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint,
            resources: aws_resources(str_at(&updated, "/service/serviceArn"), Some(t.service), &t.region),
        })
        .with_metadata("desiredCount", desired))
    })
}

fn stop_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        let t = match ecs_target(ctx) {
            Ok(t) => t,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let args = ["ecs", "update-service", "--cluster", t.cluster.as_str(), "--service", t.service.as_str(), "--desired-count", "0"];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&t.region, args).display()));
        }
        aws_json(ctx.runner, &t.region, &args).await?;
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        }))
    })
}

fn check_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let t = match ecs_target(ctx) {
            Ok(t) => t,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let Some(desc) = describe_ecs(ctx, &t).await? else {
            return Ok(HandlerOutput::failure(format!(
                "ECS service {} not found in cluster {}",
                t.service, t.cluster
            )));
        };
        let running = desc.get("runningCount").and_then(Value::as_u64).unwrap_or(0);
        let desired = desc.get("desiredCount").and_then(Value::as_u64).unwrap_or(0);
        let active = desc.get("status").and_then(Value::as_str) == Some("ACTIVE");
        let status = if !active || desired == 0 {
            ServiceStatus::Stopped
        } else if running >= desired {
            ServiceStatus::Running
        } else {
            ServiceStatus::Unhealthy
        };
        let mut health = HealthInfo {
            healthy: status == ServiceStatus::Running,
            ..Default::default()
        };
        health.details.insert("runningCount".into(), running.into());
        health.details.insert("desiredCount".into(), desired.into());

        let rollout = primary_deployment(&desc)
            .and_then(|d| d.get("rolloutState"))
            .cloned()
            .unwrap_or(Value::Null);
        let deployments = desc
            .get("deployments")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: Some(health),
            resources: aws_resources(str_at(&desc, "/serviceArn"), Some(t.service), &t.region),
        })
        .with_metadata("rolloutState", rollout)
        .with_metadata("deployments", deployments)
        .with_metadata("taskDefinition", desc.get("taskDefinition").cloned().unwrap_or(Value::Null)))
    })
}

fn update_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<UpdateDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let t = match ecs_target(ctx) {
            Ok(t) => t,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let args = ["ecs", "update-service", "--cluster", t.cluster.as_str(), "--service", t.service.as_str(), "--force-new-deployment"];
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&t.region, args).display()));
        }

        let previous = describe_ecs(ctx, &t)
            .await?
            .as_ref()
            .and_then(primary_deployment)
            .and_then(|d| str_at(d, "/id"));
        let began = Instant::now();
        let updated = aws_json(ctx.runner, &t.region, &args).await?;
        let new = updated
            .get("service")
            .and_then(primary_deployment)
            .and_then(|d| str_at(d, "/id"));
        let details = UpdateDetails {
            strategy: UpdateStrategy::Rolling,
            previous_version: previous,
            new_version: new,
            downtime_ms: Some(0),
        };
        if svc.config_bool("wait") == Some(false) {
            return Ok(HandlerOutput::ok(details).with_warning("not waiting for the deployment to finish"));
        }

        let timeout = Duration::from_secs(svc.timeout_secs(DEPLOY_TIMEOUT_SECS));
        let poll = Duration::from_secs(svc.config_u64("pollInterval").unwrap_or(DEPLOY_POLL_SECS));
        let mut deadline = Deadline::new(timeout);
        let mut polls = 0u32;
        loop {
            polls += 1;
            let Some(desc) = describe_ecs(ctx, &t).await? else {
                return Ok(HandlerOutput::failed(details, format!("ECS service {} disappeared", t.service)));
            };
            match rollout_state(&desc) {
                Rollout::Completed => break,
                Rollout::Failed(reason) => return Ok(HandlerOutput::failed(details, reason)),
                Rollout::InProgress { image_pull } => {
                    if image_pull && deadline.extend_once(IMAGE_PULL_GRACE) {
                        tracing::info!(service = %svc.name, "image pull in progress; extending deployment wait");
                    }
                }
            }
            if deadline.expired() {
                return Ok(HandlerOutput::failed(
                    details,
                    format!("timed out after {}s waiting for deployment of {}", began.elapsed().as_secs(), t.service),
                ));
            }
            tracing::debug!(service = %svc.name, polls, "deployment in progress");
            tokio::time::sleep(poll).await;
        }
        Ok(HandlerOutput::ok(details)
            .with_metadata("waitedMs", began.elapsed().as_millis() as u64)
            .with_metadata("polls", polls))
    })
}

fn publish_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<PublishDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let opts = &ctx.args.publish;
        let region = AwsTarget::of(svc).region;
        let key = output_key(svc.name, "RepositoryUri");
        let Some(repository) = lookup(ctx, "repository", &key) else {
            return Ok(HandlerOutput::failure(missing("ECR repository", &key)));
        };
        let tag = opts
            .tag
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y%m%d%H%M%S").to_string());
        let image = format!("{repository}:{tag}");
        let runtime = svc.config_str("runtime").unwrap_or("docker");
        let build = &svc.requirements().build;
        let context = match &build.context {
            Some(c) => svc.project_root.join(c),
            None => svc.working_dir(),
        };
        let dockerfile = match &build.dockerfile {
            Some(f) => svc.project_root.join(f),
            None => context.join("Dockerfile"),
        };
        let build_cmd = Invocation::new(runtime)
            .args(["build", "--platform", "linux/amd64", "-t", image.as_str(), "-f"])
            .arg(dockerfile.display().to_string())
            .arg(context.display().to_string())
            .timeout(PUSH_TIMEOUT);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(build_cmd.display()));
        }

        let built = ctx.runner.run(&build_cmd).await?;
        if !built.success() {
            return Ok(HandlerOutput::failure(command_error("build", &built)));
        }
        let mut details = PublishDetails {
            version: Some(tag),
            ..Default::default()
        };
        details.artifacts.insert("image".into(), image.clone());
        if opts.no_push {
            return Ok(HandlerOutput::ok(details));
        }

        let password = ctx
            .runner
            .run(&Invocation::new("aws").args(["ecr", "get-login-password", "--region", region.as_str()]))
            .await?
            .require_success("aws ecr get-login-password")?;
        let registry = repository.split('/').next().unwrap_or(&repository).to_string();
        let login = ctx
            .runner
            .run(
                &Invocation::new(runtime)
                    .args(["login", "--username", "AWS", "--password-stdin", registry.as_str()])
                    .stdin(password.stdout.trim()),
            )
            .await?;
        if !login.success() {
            return Ok(HandlerOutput::failed(details, command_error("login", &login)));
        }
        let pushed = ctx
            .runner
            .run(&Invocation::new(runtime).args(["push", image.as_str()]).timeout(PUSH_TIMEOUT))
            .await?;
        if !pushed.success() {
            return Ok(HandlerOutput::failed(details, command_error("push", &pushed)));
        }
        details.destinations.push(image);
        Ok(HandlerOutput::ok(details))
    })
}

/// `since` as RFC 3339 or a relative `30s` / `10m` / `2h` / `1d`.
fn parse_since(since: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(since) {
        return Some(t.with_timezone(&Utc));
    }
    let unit = since.chars().last()?;
    let amount: i64 = since[..since.len() - unit.len_utf8()].parse().ok()?;
    let span = match unit {
        's' => chrono::Duration::seconds(amount),
        'm' => chrono::Duration::minutes(amount),
        'h' => chrono::Duration::hours(amount),
        'd' => chrono::Duration::days(amount),
        _ => return None,
    };
    Some(now - span)
}

fn logs_ecs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<LogsDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let opts = &ctx.args.logs;
        let region = AwsTarget::of(svc).region;
        let group = lookup(ctx, "logGroup", &output_key(svc.name, "LogGroup"))
            .unwrap_or_else(|| format!("/ecs/semiont-{}-{}", svc.environment, svc.name));
        let limit = opts.tail.to_string();
        let mut args = vec!["logs", "filter-log-events", "--log-group-name", group.as_str(), "--limit", limit.as_str()];
        let start = match &opts.since {
            Some(since) => match parse_since(since, Utc::now()) {
                Some(t) => Some(t.timestamp_millis().to_string()),
                None => return Ok(HandlerOutput::failure(format!("cannot parse --since '{since}'"))),
            },
            None => None,
        };
        if let Some(start) = &start {
            args.extend(["--start-time", start.as_str()]);
        }
        let events = aws_json(ctx.runner, &region, &args).await?;
        let mut entries: Vec<LogEntry> = events
            .get("events")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|e| LogEntry {
                timestamp: e
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                source: str_at(e, "/logStreamName"),
                message: str_at(e, "/message").unwrap_or_default().trim_end().to_string(),
            })
            .collect();
        let skip = entries.len().saturating_sub(opts.tail);
        entries.drain(..skip);
        Ok(HandlerOutput::ok(LogsDetails { entries }).with_metadata("logGroup", group))
    })
}

// ---------------------------------------------------------------------------
// RDS
// ---------------------------------------------------------------------------

fn rds_instance(ctx: &HandlerContext<'_>) -> std::result::Result<String, String> {
    lookup(ctx, "instanceId", "DatabaseInstanceId")
        .ok_or_else(|| missing("RDS instance", "DatabaseInstanceId"))
}

fn start_rds<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let id = match rds_instance(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let inv = aws(&region, ["rds", "start-db-instance", "--db-instance-identifier", id.as_str()]);
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        let arn = if out.success() {
            str_at(&out.json::<Value>()?, "/DBInstance/DBInstanceArn")
        } else {
            None
        };
        let details = StartDetails {
            start_time: Some(Utc::now()),
            endpoint: None,
            resources: aws_resources(arn, Some(id), &region),
        };
        if out.success() {
            return Ok(HandlerOutput::ok(details));
        }
        if out.error_text().contains("InvalidDBInstanceState") {
            return Ok(HandlerOutput::ok(details).with_warning("instance is not stopped; nothing to start"));
        }
        Ok(HandlerOutput::failure(command_error("rds start-db-instance", &out)))
    })
}

fn stop_rds<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        let id = match rds_instance(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let inv = aws(&region, ["rds", "stop-db-instance", "--db-instance-identifier", id.as_str()]);
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        let details = StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        };
        if out.success() {
            return Ok(HandlerOutput::ok(details).with_metadata("wasRunning", true));
        }
        if out.error_text().contains("InvalidDBInstanceState") {
            return Ok(HandlerOutput::ok(details).with_metadata("wasRunning", false));
        }
        Ok(HandlerOutput::failure(command_error("rds stop-db-instance", &out)))
    })
}

fn check_rds<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let id = match rds_instance(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let described = aws_json(
            ctx.runner,
            &region,
            &["rds", "describe-db-instances", "--db-instance-identifier", id.as_str()],
        )
        .await?;
        let Some(instance) = described.pointer("/DBInstances/0") else {
            return Ok(HandlerOutput::failure(format!("RDS instance {id} not found")));
        };
        let state = str_at(instance, "/DBInstanceStatus").unwrap_or_default();
        let status = match state.as_str() {
            "available" => ServiceStatus::Running,
            "stopped" | "stopping" => ServiceStatus::Stopped,
            "failed" | "incompatible-parameters" | "storage-full" => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Unknown,
        };
        let endpoint = match (str_at(instance, "/Endpoint/Address"), instance.pointer("/Endpoint/Port").and_then(Value::as_u64)) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}")),
            (Some(host), None) => Some(host),
            _ => None,
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: Some(HealthInfo {
                healthy: status == ServiceStatus::Running,
                endpoint,
                ..Default::default()
            }),
            resources: aws_resources(str_at(instance, "/DBInstanceArn"), Some(id), &region),
        })
        .with_metadata("instanceStatus", state))
    })
}

fn backup_rds<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let id = match rds_instance(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let snapshot = new_backup_id(ctx.service);
        let args = [
            "rds", "create-db-snapshot", "--db-instance-identifier", id.as_str(), "--db-snapshot-identifier", snapshot.as_str(),
        ];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&region, args).display()));
        }
        let created = aws_json(ctx.runner, &region, &args).await?;
        Ok(HandlerOutput::ok(BackupDetails {
            backup_id: Some(snapshot),
            location: str_at(&created, "/DBSnapshot/DBSnapshotArn"),
            size_bytes: created
                .pointer("/DBSnapshot/AllocatedStorage")
                .and_then(Value::as_u64)
                .map(|gib| gib * 1024 * 1024 * 1024),
        }))
    })
}

fn restore_rds<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<RestoreDetails>>> {
    Box::pin(async move {
        let id = match rds_instance(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let Some(snapshot) = ctx.args.backup_id.as_deref() else {
            return Ok(HandlerOutput::failure("restore requires a backup id"));
        };
        let region = AwsTarget::of(ctx.service).region;
        let target = format!("{id}-restored-{}", Utc::now().format("%Y%m%d%H%M%S"));
        let args = [
            "rds",
            "restore-db-instance-from-db-snapshot",
            "--db-instance-identifier",
            target.as_str(),
            "--db-snapshot-identifier",
            snapshot,
        ];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&region, args).display()));
        }
        aws_json(ctx.runner, &region, &args).await?;
        Ok(HandlerOutput::ok(RestoreDetails {
            backup_id: Some(snapshot.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(target.clone()),
        })
        .with_warning(format!(
            "restored into new instance {target}; point the application at it once available"
        )))
    })
}

// ---------------------------------------------------------------------------
// EFS
// ---------------------------------------------------------------------------

fn efs_id(ctx: &HandlerContext<'_>) -> std::result::Result<String, String> {
    lookup(ctx, "fileSystemId", "FileSystemId").ok_or_else(|| missing("EFS file system", "FileSystemId"))
}

async fn describe_efs(ctx: &HandlerContext<'_>, id: &str, region: &str) -> Result<Option<Value>> {
    let described = aws_json(
        ctx.runner,
        region,
        &["efs", "describe-file-systems", "--file-system-id", id],
    )
    .await?;
    Ok(described.pointer("/FileSystems/0").cloned())
}

fn check_efs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let id = match efs_id(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let Some(fs) = describe_efs(ctx, &id, &region).await? else {
            return Ok(HandlerOutput::failure(format!("EFS file system {id} not found")));
        };
        let state = str_at(&fs, "/LifeCycleState").unwrap_or_default();
        let status = match state.as_str() {
            "available" => ServiceStatus::Running,
            "deleting" | "deleted" => ServiceStatus::Stopped,
            "error" => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Unknown,
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: None,
            resources: aws_resources(str_at(&fs, "/FileSystemArn"), Some(id), &region),
        })
        .with_metadata("lifeCycleState", state)
        .with_metadata(
            "sizeBytes",
            fs.pointer("/SizeInBytes/Value").cloned().unwrap_or(Value::Null),
        ))
    })
}

fn backup_efs<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let id = match efs_id(ctx) {
            Ok(id) => id,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let target = AwsTarget::of(ctx.service);
        let Some(vault) = target.config.backup_vault.clone() else {
            return Ok(HandlerOutput::failure("no backup vault configured (aws.backupVault)"));
        };
        let Some(role) = lookup(ctx, "backupRoleArn", "BackupRoleArn") else {
            return Ok(HandlerOutput::failure(missing("backup IAM role", "BackupRoleArn")));
        };
        let Some(fs) = describe_efs(ctx, &id, &target.region).await? else {
            return Ok(HandlerOutput::failure(format!("EFS file system {id} not found")));
        };
        let Some(arn) = str_at(&fs, "/FileSystemArn") else {
            return Ok(HandlerOutput::failure(format!("EFS file system {id} has no ARN")));
        };
        let args = [
            "backup",
            "start-backup-job",
            "--backup-vault-name",
            vault.as_str(),
            "--resource-arn",
            arn.as_str(),
            "--iam-role-arn",
            role.as_str(),
        ];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&target.region, args).display()));
        }
        let job = aws_json(ctx.runner, &target.region, &args).await?;
        Ok(HandlerOutput::ok(BackupDetails {
            backup_id: str_at(&job, "/BackupJobId"),
            location: Some(format!("backup-vault://{vault}")),
            size_bytes: None,
        })
        .with_metadata("recoveryPointArn", job.get("RecoveryPointArn").cloned().unwrap_or(Value::Null)))
    })
}

// ---------------------------------------------------------------------------
// Lambda
// ---------------------------------------------------------------------------

fn lambda_function(ctx: &HandlerContext<'_>) -> std::result::Result<String, String> {
    let key = output_key(ctx.service.name, "FunctionName");
    lookup(ctx, "functionName", &key).ok_or_else(|| missing("Lambda function", &key))
}

fn check_lambda<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let name = match lambda_function(ctx) {
            Ok(n) => n,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let function = aws_json(ctx.runner, &region, &["lambda", "get-function", "--function-name", name.as_str()]).await?;
        let state = str_at(&function, "/Configuration/State").unwrap_or_default();
        let status = match state.as_str() {
            "Active" => ServiceStatus::Running,
            "Inactive" => ServiceStatus::Stopped,
            "Failed" => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Unknown,
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: None,
            resources: aws_resources(str_at(&function, "/Configuration/FunctionArn"), Some(name), &region),
        })
        .with_metadata("state", state)
        .with_metadata(
            "lastUpdateStatus",
            function.pointer("/Configuration/LastUpdateStatus").cloned().unwrap_or(Value::Null),
        ))
    })
}

fn update_lambda<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<UpdateDetails>>> {
    Box::pin(async move {
        let name = match lambda_function(ctx) {
            Ok(n) => n,
            Err(e) => return Ok(HandlerOutput::failure(e)),
        };
        let region = AwsTarget::of(ctx.service).region;
        let key = output_key(ctx.service.name, "RepositoryUri");
        let image = match ctx.service.config_str("imageUri") {
            Some(uri) => uri.to_string(),
            None => match ctx.discovered.get(&key) {
                Some(repo) => format!("{repo}:latest"),
                None => return Ok(HandlerOutput::failure(missing("function image", &key))),
            },
        };
        let args = ["lambda", "update-function-code", "--function-name", name.as_str(), "--image-uri", image.as_str()];
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(aws(&region, args).display()));
        }
        let before = aws_json(ctx.runner, &region, &["lambda", "get-function", "--function-name", name.as_str()]).await?;
        let after = aws_json(ctx.runner, &region, &args).await?;
        Ok(HandlerOutput::ok(UpdateDetails {
            strategy: UpdateStrategy::Rolling,
            previous_version: str_at(&before, "/Configuration/CodeSha256"),
            new_version: str_at(&after, "/CodeSha256"),
            downtime_ms: Some(0),
        }))
    })
}

// ---------------------------------------------------------------------------
// S3 + CloudFront static sites
// ---------------------------------------------------------------------------

fn check_site<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let key = output_key(ctx.service.name, "BucketName");
        let Some(bucket) = lookup(ctx, "bucket", &key) else {
            return Ok(HandlerOutput::failure(missing("S3 bucket", &key)));
        };
        let region = AwsTarget::of(ctx.service).region;
        let out = ctx
            .runner
            .run(&aws(&region, ["s3api", "head-bucket", "--bucket", bucket.as_str()]))
            .await?;
        let status = if out.success() {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        };
        let endpoint = lookup(ctx, "url", &output_key(ctx.service.name, "Url"));
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: Some(HealthInfo {
                healthy: out.success(),
                endpoint,
                ..Default::default()
            }),
            resources: aws_resources(Some(format!("arn:aws:s3:::{bucket}")), Some(bucket), &region),
        }))
    })
}

fn publish_site<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<PublishDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let key = output_key(svc.name, "BucketName");
        let Some(bucket) = lookup(ctx, "bucket", &key) else {
            return Ok(HandlerOutput::failure(missing("S3 bucket", &key)));
        };
        let distribution = lookup(ctx, "distributionId", &output_key(svc.name, "DistributionId"));
        let region = AwsTarget::of(svc).region;
        let build_dir = svc.working_dir().join(svc.config_str("buildDir").unwrap_or("out"));
        let destination = format!("s3://{bucket}");
        let sync = Invocation::new("aws")
            .args(["s3", "sync"])
            .arg(build_dir.display().to_string())
            .args([destination.as_str(), "--delete", "--region", region.as_str()])
            .timeout(PUSH_TIMEOUT);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(sync.display()));
        }
        if !build_dir.is_dir() {
            return Ok(HandlerOutput::failure(format!(
                "build output {} not found; build the site first",
                build_dir.display()
            )));
        }
        let synced = ctx.runner.run(&sync).await?;
        if !synced.success() {
            return Ok(HandlerOutput::failure(command_error("s3 sync", &synced)));
        }
        let mut details = PublishDetails {
            version: ctx.args.publish.tag.clone(),
            destinations: vec![destination],
            ..Default::default()
        };
        details
            .artifacts
            .insert("build".into(), build_dir.display().to_string());
        if let Some(distribution) = distribution {
            let invalidation = aws_json(
                ctx.runner,
                &region,
                &["cloudfront", "create-invalidation", "--distribution-id", distribution.as_str(), "--paths", "/*"],
            )
            .await?;
            if let Some(id) = str_at(&invalidation, "/Invalidation/Id") {
                details.artifacts.insert("invalidation".into(), id);
            }
        }
        Ok(HandlerOutput::ok(details))
    })
}

// ---------------------------------------------------------------------------
// Provisioning (CDK)
// ---------------------------------------------------------------------------

fn provision_stack<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<ProvisionDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let target = AwsTarget::of(svc);
        let destroy = ctx.args.provision.destroy;
        let stack = match ctx.service_type {
            ServiceType::Rds | ServiceType::Efs => target.config.stacks.data.clone(),
            _ => target.config.stacks.app.clone(),
        };
        let mut inv = Invocation::new("npx").args(["cdk", if destroy { "destroy" } else { "deploy" }, stack.as_str()]);
        inv = if destroy {
            inv.arg("--force")
        } else {
            inv.args(["--require-approval", "never"])
        };
        let cdk_dir = match svc.config_str("cdkPath") {
            Some(p) => svc.project_root.join(p),
            None => svc.project_root.clone(),
        };
        inv = inv
            .cwd(cdk_dir)
            .env("AWS_REGION", target.region.as_str())
            .env("CDK_DEFAULT_REGION", target.region.as_str())
            .env("SEMIONT_ENV", svc.environment.as_str())
            .env("SEMIONT_ROOT", svc.project_root.display().to_string())
            .timeout(CDK_TIMEOUT);
        if let Some(account) = &target.config.account_id {
            inv = inv.env("CDK_DEFAULT_ACCOUNT", account.as_str());
        }
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }

        tracing::info!(stack = %stack, destroy, "running cdk");
        let out = ctx.runner.run(&inv).await?;
        let details = ProvisionDetails {
            resources: vec![stack],
            dependencies: svc
                .requirements()
                .dependencies
                .services
                .iter()
                .map(ToString::to_string)
                .collect(),
            destroyed: destroy,
        };
        Ok(if out.success() {
            HandlerOutput::ok(details)
        } else {
            HandlerOutput::failed(details, command_error("cdk", &out))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::CommandOutput;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use serde_json::json;
    use std::path::Path;

    fn platform(runner: Arc<ScriptedRunner>) -> AwsPlatform {
        let mut registry = HandlerRegistry::new();
        registry.register_handlers(Platform::Aws, handlers()).unwrap();
        AwsPlatform::new(Arc::new(registry), runner)
    }

    fn ctx(name: &str, mut config: Value, dry_run: bool) -> ServiceContext {
        config["aws"] = json!({"region": "eu-west-1", "accountId": "123456789012"});
        let info = ServicePlatformInfo {
            name: name.into(),
            platform: Platform::Aws,
            config,
        };
        let flags = ContextFlags {
            dry_run,
            ..Default::default()
        };
        ServiceContext::new(&info, "production", Path::new("/srv/semiont"), flags).unwrap()
    }

    fn stacks() -> ScriptedRunner {
        let app = json!({"Stacks": [{"Outputs": [
            {"OutputKey": "ClusterName", "OutputValue": "semiont-cluster"},
            {"OutputKey": "BackendServiceName", "OutputValue": "semiont-backend"},
        ]}]});
        let data = json!({"Stacks": [{"Outputs": [
            {"OutputKey": "DatabaseInstanceId", "OutputValue": "semiont-db"},
            {"OutputKey": "FileSystemId", "OutputValue": "fs-1234"},
        ]}]});
        ScriptedRunner::new()
            .on("--stack-name SemiontAppStack", CommandOutput::ok(app.to_string()))
            .on("--stack-name SemiontDataStack", CommandOutput::ok(data.to_string()))
    }

    fn ecs_service(rollout: &str, running: u64, desired: u64) -> CommandOutput {
        CommandOutput::ok(
            json!({"services": [{
                "serviceArn": "arn:aws:ecs:eu-west-1:123:service/semiont-backend",
                "status": "ACTIVE",
                "runningCount": running,
                "desiredCount": desired,
                "taskDefinition": "semiont-backend:7",
                "deployments": [{"id": "ecs-svc/2", "status": "PRIMARY", "rolloutState": rollout}],
                "events": [],
            }]})
            .to_string(),
        )
    }

    #[test]
    fn ecs_check_is_registered_for_fargate_only() {
        let mut registry = HandlerRegistry::new();
        registry.register_handlers(Platform::Aws, handlers()).unwrap();
        let found = registry
            .get_handler_for_command(crate::types::Command::Check, Platform::Aws, ServiceType::EcsFargate)
            .unwrap();
        let expected = ecs_check_descriptor();
        assert_eq!(found.key(), expected.key());
        assert_eq!(found.platform, expected.platform);
        assert!(found.requires_discovery);
        assert!(registry.get(Platform::Aws, "check:nonexistent").is_none());
        assert!(registry.get(Platform::Aws, "check-ecs-fargate").is_some());
    }

    #[test]
    fn service_type_mapping_and_override() {
        let p = platform(Arc::new(ScriptedRunner::new()));
        assert_eq!(p.determine_service_type(&ctx("backend", json!({}), false)), ServiceType::EcsFargate);
        assert_eq!(p.determine_service_type(&ctx("mcp", json!({}), false)), ServiceType::EcsFargate);
        assert_eq!(p.determine_service_type(&ctx("database", json!({}), false)), ServiceType::Rds);
        assert_eq!(p.determine_service_type(&ctx("filesystem", json!({}), false)), ServiceType::Efs);
        assert_eq!(p.determine_service_type(&ctx("agent", json!({}), false)), ServiceType::Lambda);
        assert_eq!(
            p.determine_service_type(&ctx("frontend", json!({"serviceType": "s3-cloudfront"}), false)),
            ServiceType::S3Cloudfront
        );
    }

    #[tokio::test]
    async fn ecs_check_uses_stack_outputs() {
        let runner = Arc::new(stacks().on("describe-services", ecs_service("COMPLETED", 2, 2)));
        let result = platform(runner.clone())
            .check(&ctx("backend", json!({}), false))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.details.status, ServiceStatus::Running);
        assert_eq!(result.metadata["rolloutState"], "COMPLETED");
        assert!(runner.calls().iter().any(|c| c.contains(
            "ecs describe-services --cluster semiont-cluster --services semiont-backend --region eu-west-1 --output json"
        )));
    }

    #[tokio::test]
    async fn ecs_check_reports_degraded_service() {
        let runner = Arc::new(stacks().on("describe-services", ecs_service("IN_PROGRESS", 1, 2)));
        let result = platform(runner).check(&ctx("backend", json!({}), false)).await.unwrap();
        assert_eq!(result.details.status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn missing_stack_output_is_a_soft_failure() {
        let runner = Arc::new(ScriptedRunner::new().on("describe-stacks", CommandOutput::failed(255, "Stack does not exist")));
        let result = platform(runner).check(&ctx("backend", json!({}), false)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ClusterName"));
    }

    #[tokio::test]
    async fn update_waits_for_rollout_to_complete() {
        let runner = Arc::new(stacks().on_sequence(
            "describe-services",
            vec![
                ecs_service("COMPLETED", 2, 2),
                ecs_service("IN_PROGRESS", 1, 2),
                ecs_service("COMPLETED", 2, 2),
            ],
        ));
        let result = platform(runner.clone())
            .update(&ctx("backend", json!({"pollInterval": 0}), false))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.details.strategy, UpdateStrategy::Rolling);
        assert_eq!(result.metadata["polls"], 2);
        assert!(runner.calls().iter().any(|c| c.contains("--force-new-deployment")));
    }

    #[tokio::test]
    async fn update_surfaces_failed_rollout() {
        let failed = CommandOutput::ok(
            json!({"services": [{"status": "ACTIVE", "deployments": [
                {"id": "d", "status": "PRIMARY", "rolloutState": "FAILED", "rolloutStateReason": "circuit breaker"}
            ]}]})
            .to_string(),
        );
        let runner = Arc::new(stacks().on("describe-services", failed));
        let result = platform(runner)
            .update(&ctx("backend", json!({"pollInterval": 0}), false))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("circuit breaker"));
    }

    #[test]
    fn rollout_detects_image_pulls() {
        let desc = json!({
            "deployments": [{"status": "PRIMARY", "rolloutState": "IN_PROGRESS"}],
            "events": [{"message": "(service semiont-backend) is pulling image 123.dkr.ecr/semiont:v2"}],
        });
        assert_eq!(rollout_state(&desc), Rollout::InProgress { image_pull: true });

        let legacy = json!({"deployments": [{"status": "PRIMARY", "runningCount": 2, "desiredCount": 2}]});
        assert_eq!(rollout_state(&legacy), Rollout::Completed);
    }

    #[test]
    fn deadline_extends_only_once() {
        let mut deadline = Deadline::new(Duration::ZERO);
        assert!(deadline.expired());
        assert!(deadline.extend_once(Duration::from_secs(300)));
        assert!(!deadline.expired());
        assert!(!deadline.extend_once(Duration::from_secs(300)));
    }

    #[test]
    fn since_accepts_relative_and_absolute_times() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_since("10m", now), Some(Utc.with_ymd_and_hms(2026, 1, 1, 11, 50, 0).unwrap()));
        assert_eq!(parse_since("2h", now), Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap()));
        assert_eq!(
            parse_since("2026-01-01T00:00:00Z", now),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_since("soon", now), None);
    }

    #[tokio::test]
    async fn rds_backup_creates_a_snapshot() {
        let snapshot = CommandOutput::ok(
            json!({"DBSnapshot": {"DBSnapshotArn": "arn:aws:rds:eu-west-1:123:snapshot:x", "AllocatedStorage": 20}})
                .to_string(),
        );
        let runner = Arc::new(stacks().on("create-db-snapshot", snapshot));
        let result = platform(runner.clone()).backup(&ctx("database", json!({}), false)).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        let id = result.details.backup_id.unwrap();
        assert!(id.starts_with("database-production-"), "{id}");
        assert_eq!(result.details.location.as_deref(), Some("arn:aws:rds:eu-west-1:123:snapshot:x"));
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.contains("--db-instance-identifier semiont-db")));
    }

    #[tokio::test]
    async fn efs_backup_requires_a_vault() {
        let runner = Arc::new(stacks());
        let result = platform(runner).backup(&ctx("filesystem", json!({}), false)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("backup vault"));
    }

    #[tokio::test]
    async fn lambda_has_no_start_handler() {
        let result = platform(Arc::new(stacks()))
            .start(&ctx("agent", json!({}), false))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("start handler for service type 'lambda' not found on platform 'aws'")
        );
    }

    #[tokio::test]
    async fn provision_runs_cdk_without_discovery() {
        let runner = Arc::new(ScriptedRunner::new());
        let result = platform(runner.clone())
            .provision(&ctx("database", json!({}), false), &ProvisionOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.details.resources, vec!["SemiontDataStack".to_string()]);
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        let cdk = &invocations[0];
        assert_eq!(cdk.display(), "npx cdk deploy SemiontDataStack --require-approval never");
        assert_eq!(cdk.env["CDK_DEFAULT_ACCOUNT"], "123456789012");
        assert_eq!(cdk.env["AWS_REGION"], "eu-west-1");
        assert_eq!(cdk.env["SEMIONT_ENV"], "production");
    }

    #[tokio::test]
    async fn secret_set_creates_missing_secret() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "put-secret-value",
            CommandOutput::failed(254, "An error occurred (ResourceNotFoundException)"),
        ));
        let action = SecretAction::Set {
            name: "JWT_SECRET".into(),
            value: "s3cret".into(),
        };
        let result = platform(runner.clone())
            .manage_secret(&ctx("backend", json!({}), false), &action)
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.metadata["created"], true);
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.contains("create-secret --name semiont/production/backend/JWT_SECRET")));
    }
}

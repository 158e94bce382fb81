//! Docker / Podman containers. The runtime binary is detected once per
//! strategy and handed to handlers through resource discovery under the
//! `runtime` key.

use super::{command_error, new_backup_id};
use crate::error::{Result, SemiontError};
use crate::handler::{
    DiscoveredResources, Handler, HandlerContext, HandlerDescriptor, HandlerKind, OperationArgs,
};
use crate::paths;
use crate::registry::HandlerRegistry;
use crate::requirements::StorageRequirement;
use crate::results::{
    BackupDetails, BackupResult, CheckDetails, CheckResult, ExecDetails, ExecResult, HandlerOutput,
    HealthInfo, LogEntry, LogsDetails, LogsResult, PlatformResources, ProvisionDetails,
    ProvisionResult, PublishDetails, PublishResult, RestoreDetails, RestoreResult, SecretResult,
    ServiceResult, ServiceStatus, StartDetails, StartResult, StopDetails, StopResult, TestDetails,
    TestResult, UpdateDetails, UpdateResult, UpdateStrategy,
};
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::service::ServiceContext;
use crate::strategy::{
    Dispatcher, ExecOptions, LogOptions, PlatformStrategy, ProvisionOptions, PublishOptions,
    ResourceDiscovery, SecretAction, TestOptions,
};
use crate::types::{Platform, ServiceName, ServiceType};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

const RUNTIME_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const BUILD_TIMEOUT: Duration = Duration::from_secs(1800);
const RUNTIMES: [&str; 2] = ["docker", "podman"];

pub fn handlers() -> Vec<HandlerDescriptor> {
    let p = Platform::Container;
    let mut descriptors = Vec::new();
    for ty in [ServiceType::Web, ServiceType::Generic, ServiceType::Database] {
        descriptors.extend([
            HandlerDescriptor::new(p, ty, Handler::Start(start_container)),
            HandlerDescriptor::new(p, ty, Handler::Stop(stop_container)),
            HandlerDescriptor::new(p, ty, Handler::Check(check_container)),
            HandlerDescriptor::new(p, ty, Handler::Update(update_container)),
            HandlerDescriptor::new(p, ty, Handler::Provision(provision_container)),
            HandlerDescriptor::new(p, ty, Handler::Logs(logs_container)),
        ]);
    }
    for ty in [ServiceType::Web, ServiceType::Generic] {
        descriptors.push(HandlerDescriptor::new(p, ty, Handler::Publish(publish_image)));
    }
    let db = ServiceType::Database;
    descriptors.extend([
        HandlerDescriptor::new(p, db, Handler::Backup(backup_database)),
        HandlerDescriptor::new(p, db, Handler::Restore(restore_database)),
    ]);
    let fs = ServiceType::Filesystem;
    descriptors.extend([
        HandlerDescriptor::new(p, fs, Handler::Start(start_volume)),
        HandlerDescriptor::new(p, fs, Handler::Stop(stop_volume)),
        HandlerDescriptor::new(p, fs, Handler::Check(check_volume)),
        HandlerDescriptor::new(p, fs, Handler::Provision(provision_container)),
        HandlerDescriptor::new(p, fs, Handler::Backup(backup_volume)),
        HandlerDescriptor::new(p, fs, Handler::Restore(restore_volume)),
    ]);
    descriptors.into_iter().map(HandlerDescriptor::with_discovery).collect()
}

// ---------------------------------------------------------------------------
// Runtime detection
// ---------------------------------------------------------------------------

/// Finds the container runtime: the service's `runtime` config wins,
/// otherwise the first of docker/podman that is on `PATH` and answers
/// `--version`. Detection runs at most once.
pub struct ContainerRuntime {
    runner: Arc<dyn CommandRunner>,
    detected: OnceCell<String>,
}

impl ContainerRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            detected: OnceCell::new(),
        }
    }

    pub async fn resolve(&self, service: &ServiceContext) -> Result<String> {
        if let Some(runtime) = service.config_str("runtime") {
            return Ok(runtime.to_string());
        }
        let detected = self
            .detected
            .get_or_try_init(|| detect_runtime(self.runner.as_ref()))
            .await?;
        Ok(detected.clone())
    }
}

async fn detect_runtime(runner: &dyn CommandRunner) -> Result<String> {
    for candidate in RUNTIMES {
        if which::which(candidate).is_err() {
            continue;
        }
        let probe = Invocation::new(candidate)
            .arg("--version")
            .timeout(RUNTIME_PROBE_TIMEOUT);
        match runner.run(&probe).await {
            Ok(out) if out.success() => {
                tracing::debug!(runtime = candidate, version = %out.stdout.trim(), "container runtime detected");
                return Ok(candidate.to_string());
            }
            Ok(out) => tracing::debug!(runtime = candidate, status = out.status, "runtime probe failed"),
            Err(e) => tracing::debug!(runtime = candidate, error = %e, "runtime probe failed"),
        }
    }
    Err(SemiontError::NoContainerRuntime)
}

#[async_trait]
impl ResourceDiscovery for ContainerRuntime {
    async fn discover(&self, service: &ServiceContext) -> Result<DiscoveredResources> {
        Ok(DiscoveredResources::new().with("runtime", self.resolve(service).await?))
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

enum ExecOutcome {
    DryRun(String),
    Ran(CommandOutput, u64),
}

pub struct ContainerPlatform {
    dispatcher: Dispatcher,
    runtime: ContainerRuntime,
}

impl ContainerPlatform {
    pub fn new(registry: Arc<HandlerRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runtime: ContainerRuntime::new(runner.clone()),
            dispatcher: Dispatcher::new(Platform::Container, registry, runner),
        }
    }

    async fn dispatch<D: HandlerKind>(
        &self,
        service: &ServiceContext,
        args: &OperationArgs,
    ) -> Result<ServiceResult<D>> {
        self.dispatcher
            .dispatch(service, self.determine_service_type(service), args, &self.runtime)
            .await
    }

    /// `<runtime> exec` against the service container, shared by exec and
    /// test.
    async fn exec_in_container(
        &self,
        service: &ServiceContext,
        script: &str,
        interactive: bool,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome> {
        let runtime = self.runtime.resolve(service).await?;
        let mut inv = Invocation::new(runtime).arg("exec");
        if interactive {
            inv = inv.arg("-i");
        }
        inv = inv.args([service.resource_name().as_str(), "sh", "-c", script]);
        if let Some(limit) = timeout {
            inv = inv.timeout(limit);
        }
        if service.dry_run() {
            return Ok(ExecOutcome::DryRun(inv.display()));
        }
        let started = Instant::now();
        let out = self.dispatcher.runner().run(&inv).await?;
        Ok(ExecOutcome::Ran(out, started.elapsed().as_millis() as u64))
    }
}

#[async_trait]
impl PlatformStrategy for ContainerPlatform {
    fn platform(&self) -> Platform {
        Platform::Container
    }

    fn determine_service_type(&self, service: &ServiceContext) -> ServiceType {
        match service.name {
            ServiceName::Database => ServiceType::Database,
            ServiceName::Filesystem => ServiceType::Filesystem,
            ServiceName::Frontend | ServiceName::Backend => ServiceType::Web,
            ServiceName::Agent | ServiceName::Mcp => ServiceType::Generic,
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
        let output = match self
            .exec_in_container(service, command, options.interactive, options.timeout)
            .await?
        {
            ExecOutcome::DryRun(would_run) => HandlerOutput::dry_run(would_run),
            ExecOutcome::Ran(out, duration_ms) => {
                let details = ExecDetails {
                    command: command.to_string(),
                    exit_code: Some(out.status),
                    stdout: out.stdout.clone(),
                    stderr: out.stderr.clone(),
                    duration_ms,
                };
                if out.success() {
                    HandlerOutput::ok(details)
                } else {
                    HandlerOutput::failed(details, command_error(command, &out))
                }
            }
        };
        Ok(ServiceResult::from_output(service.name, Platform::Container, output))
    }

    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult> {
        let script = match (service.config_str("testCommand"), &options.suite) {
            (Some(cmd), _) => cmd.to_string(),
            (None, Some(suite)) => format!("npm run test:{suite}"),
            (None, None) => "npm test".to_string(),
        };
        let output = match self.exec_in_container(service, &script, false, None).await? {
            ExecOutcome::DryRun(would_run) => HandlerOutput::dry_run(would_run),
            ExecOutcome::Ran(out, _) => {
                let details = TestDetails {
                    suite: options.suite.clone().unwrap_or_else(|| "all".into()),
                    passed: u32::from(out.success()),
                    failed: u32::from(!out.success()),
                    skipped: 0,
                    exit_code: Some(out.status),
                };
                if out.success() {
                    HandlerOutput::ok(details)
                } else {
                    HandlerOutput::failed(details, command_error(&script, &out))
                }
            }
        };
        Ok(ServiceResult::from_output(service.name, Platform::Container, output))
    }

    async fn collect_logs(&self, service: &ServiceContext, options: &LogOptions) -> Result<LogsResult> {
        let args = OperationArgs {
            logs: options.clone(),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn manage_secret(&self, service: &ServiceContext, action: &SecretAction) -> Result<SecretResult> {
        Ok(ServiceResult::failure(
            service.name.as_str(),
            Platform::Container,
            format!(
                "secret {} is not supported on the container platform; pass values through env",
                action.as_str()
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn runtime<'a>(ctx: &'a HandlerContext<'a>) -> &'a str {
    ctx.discovered.get("runtime").unwrap_or("docker")
}

fn rt<'a>(ctx: &'a HandlerContext<'a>) -> Invocation {
    Invocation::new(runtime(ctx))
}

fn volume_name(svc: &ServiceContext, storage: &StorageRequirement) -> String {
    storage
        .volume_name
        .clone()
        .unwrap_or_else(|| format!("{}-data", svc.resource_name()))
}

fn network_name(svc: &ServiceContext) -> String {
    svc.config_str("network")
        .map(str::to_string)
        .unwrap_or_else(|| format!("semiont-{}", svc.environment))
}

fn db_user(svc: &ServiceContext) -> &str {
    svc.config_str("user").unwrap_or("postgres")
}

fn db_name(svc: &ServiceContext) -> &str {
    svc.config_str("database").unwrap_or("semiont")
}

/// The first element of `<runtime> inspect <name>`, or `None` when no such
/// container exists.
async fn inspect(ctx: &HandlerContext<'_>, name: &str) -> Result<Option<Value>> {
    let out = ctx.runner.run(&rt(ctx).args(["inspect", name])).await?;
    if !out.success() {
        return Ok(None);
    }
    let mut entries: Vec<Value> = out.json()?;
    Ok(if entries.is_empty() {
        None
    } else {
        Some(entries.swap_remove(0))
    })
}

fn container_status(state: &Value) -> (ServiceStatus, Option<HealthInfo>) {
    let status = state
        .pointer("/State/Status")
        .and_then(Value::as_str)
        .unwrap_or("");
    let health_status = state
        .pointer("/State/Health/Status")
        .and_then(Value::as_str);
    let health = health_status.map(|h| {
        let mut info = HealthInfo {
            healthy: h == "healthy",
            ..Default::default()
        };
        info.details.insert("status".into(), h.into());
        info
    });
    let mapped = match (status, health_status) {
        ("running", Some("unhealthy")) => ServiceStatus::Unhealthy,
        ("running", _) => ServiceStatus::Running,
        ("exited" | "created" | "paused" | "dead", _) => ServiceStatus::Stopped,
        _ => ServiceStatus::Unknown,
    };
    (mapped, health)
}

fn run_args(ctx: &HandlerContext<'_>) -> Vec<String> {
    let svc = ctx.service;
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        svc.resource_name(),
        "--label".into(),
        format!("semiont.environment={}", svc.environment),
        "--label".into(),
        format!("semiont.service={}", svc.name),
    ];
    if let Some(host_port) = svc.port() {
        let container_port = svc.requirements().primary_port().unwrap_or(host_port);
        args.push("-p".into());
        args.push(format!("{host_port}:{container_port}"));
    }

    let mut vars = svc.environment_variables();
    if ctx.service_type == ServiceType::Database {
        vars.entry("POSTGRES_USER".into())
            .or_insert_with(|| db_user(svc).to_string());
        vars.entry("POSTGRES_DB".into())
            .or_insert_with(|| db_name(svc).to_string());
        if !vars.contains_key("POSTGRES_PASSWORD") {
            vars.insert("POSTGRES_HOST_AUTH_METHOD".into(), "trust".into());
        }
    }
    for (k, v) in vars {
        args.push("-e".into());
        args.push(format!("{k}={v}"));
    }

    for storage in svc.requirements().persistent_storage() {
        args.push("-v".into());
        args.push(format!("{}:{}", volume_name(svc, storage), storage.mount_path));
    }
    if let Some(network) = svc.config_str("network") {
        args.push("--network".into());
        args.push(network.to_string());
    }
    args.push(svc.image());
    if let Some(command) = svc.config_str("command") {
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
    }
    args
}

/// `repo:tag` → `repo`, leaving registry ports (`host:5000/repo`) intact.
fn image_repository(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    }
}

// ---------------------------------------------------------------------------
// web / generic / database containers
// ---------------------------------------------------------------------------

fn start_container<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let name = svc.resource_name();
        let image = svc.image();
        let endpoint = svc.port().map(|p| match ctx.service_type {
            ServiceType::Database => format!("postgresql://localhost:{p}/{}", db_name(svc)),
            _ => format!("http://localhost:{p}"),
        });
        let run = rt(ctx).args(run_args(ctx));
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(run.display()));
        }

        if let Some(state) = inspect(ctx, &name).await? {
            let (status, _) = container_status(&state);
            if status == ServiceStatus::Running {
                return Ok(HandlerOutput::ok(StartDetails {
                    start_time: None,
                    endpoint,
                    resources: Some(PlatformResources::Container {
                        container_name: name.clone(),
                        container_id: state.get("Id").and_then(Value::as_str).map(str::to_string),
                        image: Some(image),
                    }),
                })
                .with_warning(format!("container {name} is already running")));
            }
            ctx.runner.run(&rt(ctx).args(["rm", "-f", name.as_str()])).await?;
        }

        let out = ctx.runner.run(&run).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error(&format!("{} run", runtime(ctx)), &out)));
        }
        let container_id = out.stdout.trim().to_string();
        tracing::info!(service = %svc.name, container = %name, "container started");
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint,
            resources: Some(PlatformResources::Container {
                container_name: name,
                container_id: Some(container_id),
                image: Some(image),
            }),
        }))
    })
}

fn stop_container<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let name = svc.resource_name();
        let stop = rt(ctx).args(["stop", "-t", "10", name.as_str()]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(stop.display()));
        }
        if inspect(ctx, &name).await?.is_none() {
            return Ok(HandlerOutput::ok(StopDetails {
                stop_time: Some(Utc::now()),
                graceful: true,
            })
            .with_metadata("wasRunning", false));
        }
        let stopped = ctx.runner.run(&stop).await?;
        let removed = ctx.runner.run(&rt(ctx).args(["rm", "-f", name.as_str()])).await?;
        if !removed.success() {
            return Ok(HandlerOutput::failure(command_error(&format!("{} rm", runtime(ctx)), &removed)));
        }
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: stopped.success(),
        })
        .with_metadata("wasRunning", true))
    })
}

fn check_container<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let name = ctx.service.resource_name();
        let Some(state) = inspect(ctx, &name).await? else {
            return Ok(HandlerOutput::ok(CheckDetails {
                status: ServiceStatus::Stopped,
                ..Default::default()
            })
            .with_metadata("exists", false));
        };
        let (status, health) = container_status(&state);
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health,
            resources: Some(PlatformResources::Container {
                container_name: name,
                container_id: state.get("Id").and_then(Value::as_str).map(str::to_string),
                image: state
                    .pointer("/Config/Image")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
        })
        .with_metadata("exists", true))
    })
}

fn update_container<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<UpdateDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let image = svc.image();
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!(
                "{rt} pull {image} && recreate {}",
                svc.resource_name(),
                rt = runtime(ctx)
            )));
        }
        let previous = inspect(ctx, &svc.resource_name())
            .await?
            .and_then(|s| s.get("Image").and_then(Value::as_str).map(str::to_string));

        let mut warnings = Vec::new();
        if !svc.requirements().build.prebuilt && svc.config_str("image").is_none() {
            warnings.push(format!("{image} is built locally; skipping pull"));
        } else {
            let pulled = ctx.runner.run(&rt(ctx).args(["pull", image.as_str()])).await?;
            if !pulled.success() {
                warnings.push(format!("pull of {image} failed: {}", pulled.error_text()));
            }
        }

        let began = Instant::now();
        let stopped = stop_container(ctx).await?;
        if !stopped.success {
            return Ok(HandlerOutput::failure(stopped.error.unwrap_or_default()));
        }
        let started = start_container(ctx).await?;
        let current = inspect(ctx, &svc.resource_name())
            .await?
            .and_then(|s| s.get("Image").and_then(Value::as_str).map(str::to_string));
        let details = UpdateDetails {
            strategy: UpdateStrategy::Recreate,
            previous_version: previous,
            new_version: current,
            downtime_ms: Some(began.elapsed().as_millis() as u64),
        };
        let mut output = match started.error {
            None => HandlerOutput::ok(details),
            Some(err) => HandlerOutput::failed(details, err),
        };
        for w in warnings {
            output = output.with_warning(w);
        }
        Ok(output)
    })
}

fn provision_container<'a>(
    ctx: &'a HandlerContext<'a>,
) -> BoxFuture<'a, Result<HandlerOutput<ProvisionDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let destroy = ctx.args.provision.destroy;
        let network = network_name(svc);
        let mut steps: Vec<(String, Invocation)> = svc
            .requirements()
            .persistent_storage()
            .map(|s| {
                let volume = volume_name(svc, s);
                let action = if destroy { "rm" } else { "create" };
                (format!("volume/{volume}"), rt(ctx).args(["volume", action, volume.as_str()]))
            })
            .collect();
        let action = if destroy { "rm" } else { "create" };
        steps.push((format!("network/{network}"), rt(ctx).args(["network", action, network.as_str()])));

        if svc.dry_run() {
            let plan: Vec<String> = steps.iter().map(|(_, inv)| inv.display()).collect();
            return Ok(HandlerOutput::dry_run(plan.join(" && ")));
        }

        let mut details = ProvisionDetails {
            destroyed: destroy,
            dependencies: svc
                .requirements()
                .dependencies
                .services
                .iter()
                .map(ToString::to_string)
                .collect(),
            ..Default::default()
        };
        let mut warnings = Vec::new();
        for (resource, inv) in steps {
            let out = ctx.runner.run(&inv).await?;
            let text = out.error_text();
            if out.success() {
                details.resources.push(resource);
            } else if text.contains("already exists") || text.contains("not found") || text.contains("no such") {
                warnings.push(format!("{resource}: {text}"));
            } else {
                return Ok(HandlerOutput::failed(details, command_error(&inv.display(), &out)));
            }
        }
        let mut output = HandlerOutput::ok(details);
        for w in warnings {
            output = output.with_warning(w);
        }
        Ok(output)
    })
}

fn publish_image<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<PublishDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let opts = &ctx.args.publish;
        let build = &svc.requirements().build;
        if build.prebuilt {
            return Ok(HandlerOutput::ok(PublishDetails::default())
                .with_warning(format!("{} uses a prebuilt image; nothing to publish", svc.name)));
        }

        let tag = opts.tag.clone().unwrap_or_else(|| "latest".into());
        let image = svc.image();
        let local = format!("{}:{tag}", image_repository(&image));
        let context = match &build.context {
            Some(c) => svc.project_root.join(c),
            None => svc.working_dir(),
        };
        let dockerfile = match &build.dockerfile {
            Some(f) => svc.project_root.join(f),
            None => context.join("Dockerfile"),
        };
        let mut build_cmd = rt(ctx)
            .args(["build", "-t", local.as_str(), "-f"])
            .arg(dockerfile.display().to_string())
            .timeout(BUILD_TIMEOUT);
        for (k, v) in &build.build_args {
            build_cmd = build_cmd.arg("--build-arg").arg(format!("{k}={v}"));
        }
        build_cmd = build_cmd.arg(context.display().to_string());

        let registry = svc.config_str("registry");
        let remote = registry.map(|r| format!("{r}/{local}"));
        if svc.dry_run() {
            let mut plan = build_cmd.display();
            if let (Some(remote), false) = (&remote, opts.no_push) {
                plan.push_str(&format!(" && {} push {remote}", runtime(ctx)));
            }
            return Ok(HandlerOutput::dry_run(plan));
        }

        let out = ctx.runner.run(&build_cmd).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error(&format!("{} build", runtime(ctx)), &out)));
        }
        let mut details = PublishDetails {
            version: Some(tag),
            ..Default::default()
        };
        details.artifacts.insert("image".into(), local.clone());

        let mut output_warning = None;
        match (remote, opts.no_push) {
            (_, true) => {}
            (None, false) => {
                output_warning = Some("no registry configured; image kept local".to_string());
            }
            (Some(remote), false) => {
                let tagged = ctx
                    .runner
                    .run(&rt(ctx).args(["tag", local.as_str(), remote.as_str()]))
                    .await?;
                if !tagged.success() {
                    return Ok(HandlerOutput::failed(details, command_error("tag", &tagged)));
                }
                let pushed = ctx
                    .runner
                    .run(&rt(ctx).args(["push", remote.as_str()]).timeout(BUILD_TIMEOUT))
                    .await?;
                if !pushed.success() {
                    return Ok(HandlerOutput::failed(details, command_error("push", &pushed)));
                }
                details.destinations.push(remote);
            }
        }
        let mut output = HandlerOutput::ok(details);
        if let Some(w) = output_warning {
            output = output.with_warning(w);
        }
        Ok(output)
    })
}

fn logs_container<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<LogsDetails>>> {
    Box::pin(async move {
        let opts = &ctx.args.logs;
        let mut inv = rt(ctx).args(["logs".to_string(), "--tail".to_string(), opts.tail.to_string()]);
        if let Some(since) = &opts.since {
            inv = inv.args(["--since", since.as_str()]);
        }
        inv = inv.arg(ctx.service.resource_name());
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("logs", &out)));
        }
        let stream = |text: &str, source: &str| -> Vec<LogEntry> {
            text.lines()
                .map(|l| LogEntry {
                    timestamp: None,
                    source: Some(source.to_string()),
                    message: l.to_string(),
                })
                .collect()
        };
        let mut entries = stream(&out.stdout, "stdout");
        entries.extend(stream(&out.stderr, "stderr"));
        Ok(HandlerOutput::ok(LogsDetails { entries }))
    })
}

fn backup_database<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let backup_id = new_backup_id(svc);
        let file = paths::backup_file(&svc.project_root, &svc.environment, &backup_id, "sql");
        let name = svc.resource_name();
        let dump = rt(ctx).args(["exec", name.as_str(), "pg_dump", "-U", db_user(svc), "-d", db_name(svc)]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("{} > {}", dump.display(), file.display())));
        }
        let out = ctx.runner.run(&dump).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("pg_dump", &out)));
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, out.stdout.as_bytes()).await?;
        Ok(HandlerOutput::ok(BackupDetails {
            backup_id: Some(backup_id),
            location: Some(file.display().to_string()),
            size_bytes: Some(out.stdout.len() as u64),
        }))
    })
}

fn restore_database<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<RestoreDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(backup_id) = ctx.args.backup_id.as_deref() else {
            return Ok(HandlerOutput::failure("restore requires a backup id"));
        };
        let file = paths::backup_file(&svc.project_root, &svc.environment, backup_id, "sql");
        if !file.exists() {
            return Ok(HandlerOutput::failure(format!("backup file not found: {}", file.display())));
        }
        let name = svc.resource_name();
        let psql = rt(ctx).args([
            "exec",
            "-i",
            name.as_str(),
            "psql",
            "-U",
            db_user(svc),
            "-d",
            db_name(svc),
            "-v",
            "ON_ERROR_STOP=1",
        ]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("{} < {}", psql.display(), file.display())));
        }
        let out = ctx
            .runner
            .run(&psql.stdin(tokio::fs::read_to_string(&file).await?))
            .await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("psql", &out)));
        }
        Ok(HandlerOutput::ok(RestoreDetails {
            backup_id: Some(backup_id.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(name),
        }))
    })
}

// ---------------------------------------------------------------------------
// filesystem (a named volume)
// ---------------------------------------------------------------------------

fn fs_volume(svc: &ServiceContext) -> String {
    svc.requirements()
        .persistent_storage()
        .next()
        .map(|s| volume_name(svc, s))
        .unwrap_or_else(|| format!("{}-data", svc.resource_name()))
}

fn volume_resources(volume: String) -> Option<PlatformResources> {
    Some(PlatformResources::Container {
        container_name: volume,
        container_id: None,
        image: None,
    })
}

fn start_volume<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let volume = fs_volume(ctx.service);
        let create = rt(ctx).args(["volume", "create", volume.as_str()]);
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(create.display()));
        }
        let out = ctx.runner.run(&create).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("volume create", &out)));
        }
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint: None,
            resources: volume_resources(volume),
        }))
    })
}

fn stop_volume<'a>(_ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        })
        .with_warning("volumes are not stopped; data is kept"))
    })
}

fn check_volume<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let volume = fs_volume(ctx.service);
        let out = ctx
            .runner
            .run(&rt(ctx).args(["volume", "inspect", volume.as_str()]))
            .await?;
        let status = if out.success() {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: None,
            resources: volume_resources(volume),
        }))
    })
}

fn backup_volume<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let volume = fs_volume(svc);
        let backup_id = new_backup_id(svc);
        let dir = paths::backups_dir(&svc.project_root, &svc.environment);
        let archive = format!("/backup/{backup_id}.tar.gz");
        let inv = rt(ctx)
            .args(["run", "--rm", "-v"])
            .arg(format!("{volume}:/data:ro"))
            .arg("-v")
            .arg(format!("{}:/backup", dir.display()))
            .args(["busybox", "tar", "czf", archive.as_str(), "-C", "/data", "."]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        tokio::fs::create_dir_all(&dir).await?;
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("tar", &out)));
        }
        let file = paths::backup_file(&svc.project_root, &svc.environment, &backup_id, "tar.gz");
        let size_bytes = tokio::fs::metadata(&file).await.ok().map(|m| m.len());
        Ok(HandlerOutput::ok(BackupDetails {
            backup_id: Some(backup_id),
            location: Some(file.display().to_string()),
            size_bytes,
        }))
    })
}

fn restore_volume<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<RestoreDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(backup_id) = ctx.args.backup_id.as_deref() else {
            return Ok(HandlerOutput::failure("restore requires a backup id"));
        };
        let file = paths::backup_file(&svc.project_root, &svc.environment, backup_id, "tar.gz");
        if !file.exists() {
            return Ok(HandlerOutput::failure(format!("backup file not found: {}", file.display())));
        }
        let volume = fs_volume(svc);
        let dir = paths::backups_dir(&svc.project_root, &svc.environment);
        let archive = format!("/backup/{backup_id}.tar.gz");
        let inv = rt(ctx)
            .args(["run", "--rm", "-v"])
            .arg(format!("{volume}:/data"))
            .arg("-v")
            .arg(format!("{}:/backup:ro", dir.display()))
            .args(["busybox", "tar", "xzf", archive.as_str(), "-C", "/data"]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("tar", &out)));
        }
        Ok(HandlerOutput::ok(RestoreDetails {
            backup_id: Some(backup_id.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(volume),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn platform(runner: Arc<ScriptedRunner>) -> ContainerPlatform {
        let mut registry = HandlerRegistry::new();
        registry
            .register_handlers(Platform::Container, handlers())
            .unwrap();
        ContainerPlatform::new(Arc::new(registry), runner)
    }

    fn ctx(root: &Path, name: &str, mut config: Value, dry_run: bool) -> ServiceContext {
        config["runtime"] = json!("podman");
        let info = ServicePlatformInfo {
            name: name.into(),
            platform: Platform::Container,
            config,
        };
        let flags = ContextFlags {
            dry_run,
            ..Default::default()
        };
        ServiceContext::new(&info, "local", root, flags).unwrap()
    }

    fn inspect_json(status: &str, health: Option<&str>) -> CommandOutput {
        let mut state = json!({"Status": status});
        if let Some(h) = health {
            state["Health"] = json!({"Status": h});
        }
        CommandOutput::ok(
            json!([{"Id": "c0ffee", "Image": "sha256:abc", "State": state, "Config": {"Image": "postgres:15-alpine"}}])
                .to_string(),
        )
    }

    #[test]
    fn every_container_handler_requires_discovery() {
        assert!(handlers().iter().all(|d| d.requires_discovery));
    }

    #[test]
    fn image_repository_strips_tag_only() {
        assert_eq!(image_repository("semiont-backend:latest"), "semiont-backend");
        assert_eq!(image_repository("localhost:5000/semiont"), "localhost:5000/semiont");
        assert_eq!(image_repository("localhost:5000/semiont:v2"), "localhost:5000/semiont");
        assert_eq!(image_repository("busybox"), "busybox");
    }

    #[tokio::test]
    async fn start_runs_with_configured_runtime_ports_env_and_volume() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("inspect", CommandOutput::failed(1, "Error: no such object"))
                .on(" run ", CommandOutput::ok("deadbeef\n")),
        );
        let p = platform(runner.clone());

        let result = p
            .start(&ctx(dir.path(), "database", json!({"port": 5433}), false))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.details.endpoint.as_deref(),
            Some("postgresql://localhost:5433/semiont")
        );

        let run = runner
            .invocations()
            .into_iter()
            .find(|i| i.args.first().map(String::as_str) == Some("run"))
            .unwrap();
        assert_eq!(run.program, "podman");
        let rendered = run.display();
        assert!(rendered.contains("--name semiont-database-local"), "{rendered}");
        assert!(rendered.contains("-p 5433:5432"), "{rendered}");
        assert!(rendered.contains("-e POSTGRES_DB=semiont"), "{rendered}");
        assert!(rendered.contains("-v semiont-database-data:/var/lib/postgresql/data"), "{rendered}");
        assert!(rendered.ends_with("postgres:15-alpine"), "{rendered}");
    }

    #[tokio::test]
    async fn start_of_running_container_warns_and_skips_run() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("inspect", inspect_json("running", None)));
        let p = platform(runner.clone());

        let result = p.start(&ctx(dir.path(), "backend", json!({}), false)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(!runner.calls().iter().any(|c| c.starts_with("podman run")));
    }

    #[tokio::test]
    async fn check_reads_state_and_health() {
        let dir = TempDir::new().unwrap();
        for (status, health, expected) in [
            ("running", None, ServiceStatus::Running),
            ("running", Some("unhealthy"), ServiceStatus::Unhealthy),
            ("running", Some("starting"), ServiceStatus::Running),
            ("exited", None, ServiceStatus::Stopped),
        ] {
            let runner = Arc::new(ScriptedRunner::new().on("inspect", inspect_json(status, health)));
            let result = platform(runner)
                .check(&ctx(dir.path(), "database", json!({}), false))
                .await
                .unwrap();
            assert_eq!(result.details.status, expected, "{status} {health:?}");
        }

        let runner = Arc::new(ScriptedRunner::new().on("inspect", CommandOutput::failed(1, "no such")));
        let missing = platform(runner)
            .check(&ctx(dir.path(), "database", json!({}), false))
            .await
            .unwrap();
        assert_eq!(missing.details.status, ServiceStatus::Stopped);
        assert_eq!(missing.metadata["exists"], false);
    }

    #[tokio::test]
    async fn stop_stops_and_removes() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("inspect", inspect_json("running", None)));
        let p = platform(runner.clone());

        let result = p.stop(&ctx(dir.path(), "frontend", json!({}), false)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["wasRunning"], true);
        let calls = runner.calls();
        assert!(calls.contains(&"podman stop -t 10 semiont-frontend-local".to_string()));
        assert!(calls.contains(&"podman rm -f semiont-frontend-local".to_string()));
    }

    #[tokio::test]
    async fn backup_streams_pg_dump_into_backups_dir() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("pg_dump", CommandOutput::ok("-- dump\n")));
        let result = platform(runner)
            .backup(&ctx(dir.path(), "database", json!({}), false))
            .await
            .unwrap();
        assert!(result.success);
        let location = result.details.location.unwrap();
        assert!(location.contains(".semiont/backups/local"), "{location}");
        assert_eq!(std::fs::read_to_string(location).unwrap(), "-- dump\n");
    }

    #[tokio::test]
    async fn publish_builds_then_pushes_to_registry() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let p = platform(runner.clone());
        let svc = ctx(dir.path(), "backend", json!({"registry": "ghcr.io/acme"}), false);

        let result = p
            .publish(&svc, &PublishOptions { tag: Some("v3".into()), no_push: false })
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.details.destinations, vec!["ghcr.io/acme/semiont-backend:v3".to_string()]);
        let calls = runner.calls();
        assert!(calls[0].starts_with("podman build -t semiont-backend:v3"), "{}", calls[0]);
        assert!(calls.contains(&"podman push ghcr.io/acme/semiont-backend:v3".to_string()));

        let local_only = p
            .publish(&svc, &PublishOptions { tag: None, no_push: true })
            .await
            .unwrap();
        assert!(local_only.details.destinations.is_empty());
        assert!(local_only.warnings.is_empty());
    }

    #[tokio::test]
    async fn provision_tolerates_existing_network() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new().on("network create", CommandOutput::failed(1, "network with name semiont-local already exists")),
        );
        let result = platform(runner)
            .provision(&ctx(dir.path(), "database", json!({}), false), &ProvisionOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.details.resources, vec!["volume/semiont-database-data".to_string()]);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn logs_merge_both_streams() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            "logs --tail 5",
            CommandOutput {
                status: 0,
                stdout: "listening\n".into(),
                stderr: "warn: slow\n".into(),
            },
        ));
        let result = platform(runner)
            .collect_logs(&ctx(dir.path(), "backend", json!({}), false), &LogOptions { tail: 5, since: None })
            .await
            .unwrap();
        let sources: Vec<_> = result
            .details
            .entries
            .iter()
            .map(|e| e.source.as_deref().unwrap())
            .collect();
        assert_eq!(sources, vec!["stdout", "stderr"]);
    }

    #[tokio::test]
    async fn exec_runs_inside_the_container() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("exec", CommandOutput::ok("42\n")));
        let p = platform(runner.clone());
        let result = p
            .exec(&ctx(dir.path(), "backend", json!({}), false), "echo 42", &ExecOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.details.stdout, "42\n");
        assert_eq!(runner.calls()[0], "podman exec semiont-backend-local sh -c echo 42");
    }
}

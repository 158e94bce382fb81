//! Local OS processes: `npm` apps spawned in the background, a `pg_ctl`
//! managed PostgreSQL cluster, and a plain data directory for filesystem.

use super::probe::{http_health, tcp_reachable, PROBE_TIMEOUT};
use super::{command_error, new_backup_id};
use crate::error::Result;
use crate::handler::{Handler, HandlerContext, HandlerDescriptor, HandlerKind, OperationArgs};
use crate::paths;
use crate::registry::HandlerRegistry;
use crate::results::{
    BackupDetails, BackupResult, CheckDetails, CheckResult, ExecDetails, ExecResult, HandlerOutput,
    LogEntry, LogsDetails, LogsResult, PlatformResources, ProvisionDetails, ProvisionResult,
    PublishDetails, PublishResult, RestoreDetails, RestoreResult, SecretResult, ServiceResult,
    ServiceStatus, StartDetails, StartResult, StopDetails, StopResult, TestDetails, TestResult,
    UpdateDetails, UpdateResult, UpdateStrategy,
};
use crate::runner::{CommandRunner, Invocation};
use crate::service::ServiceContext;
use crate::strategy::{
    Dispatcher, ExecOptions, LogOptions, NoDiscovery, PlatformStrategy, ProvisionOptions,
    PublishOptions, SecretAction, TestOptions,
};
use crate::types::{Platform, ServiceName, ServiceType};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOCALHOST: &str = "127.0.0.1";
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const PORT_RELEASE_WAIT: Duration = Duration::from_secs(10);

pub fn handlers() -> Vec<HandlerDescriptor> {
    let p = Platform::Process;
    let mut descriptors = Vec::new();
    for ty in [ServiceType::Web, ServiceType::Generic] {
        descriptors.extend([
            HandlerDescriptor::new(p, ty, Handler::Start(start_app)),
            HandlerDescriptor::new(p, ty, Handler::Stop(stop_app)),
            HandlerDescriptor::new(p, ty, Handler::Check(check_app)),
            HandlerDescriptor::new(p, ty, Handler::Update(update_app)),
            HandlerDescriptor::new(p, ty, Handler::Provision(provision_app)),
            HandlerDescriptor::new(p, ty, Handler::Publish(publish_app)),
            HandlerDescriptor::new(p, ty, Handler::Logs(logs_from_file)),
        ]);
    }
    let db = ServiceType::Database;
    descriptors.extend([
        HandlerDescriptor::new(p, db, Handler::Start(start_postgres)),
        HandlerDescriptor::new(p, db, Handler::Stop(stop_postgres)),
        HandlerDescriptor::new(p, db, Handler::Check(check_postgres)),
        HandlerDescriptor::new(p, db, Handler::Update(update_postgres)),
        HandlerDescriptor::new(p, db, Handler::Provision(provision_postgres)),
        HandlerDescriptor::new(p, db, Handler::Backup(backup_postgres)),
        HandlerDescriptor::new(p, db, Handler::Restore(restore_postgres)),
        HandlerDescriptor::new(p, db, Handler::Logs(logs_from_file)),
    ]);
    let fs = ServiceType::Filesystem;
    descriptors.extend([
        HandlerDescriptor::new(p, fs, Handler::Start(start_filesystem)),
        HandlerDescriptor::new(p, fs, Handler::Stop(stop_filesystem)),
        HandlerDescriptor::new(p, fs, Handler::Check(check_filesystem)),
        HandlerDescriptor::new(p, fs, Handler::Provision(provision_filesystem)),
        HandlerDescriptor::new(p, fs, Handler::Backup(backup_filesystem)),
        HandlerDescriptor::new(p, fs, Handler::Restore(restore_filesystem)),
    ]);
    descriptors
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct ProcessPlatform {
    dispatcher: Dispatcher,
}

impl ProcessPlatform {
    pub fn new(registry: Arc<HandlerRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Platform::Process, registry, runner),
        }
    }

    async fn dispatch<D: HandlerKind>(
        &self,
        service: &ServiceContext,
        args: &OperationArgs,
    ) -> Result<ServiceResult<D>> {
        self.dispatcher
            .dispatch(service, self.determine_service_type(service), args, &NoDiscovery)
            .await
    }
}

#[async_trait]
impl PlatformStrategy for ProcessPlatform {
    fn platform(&self) -> Platform {
        Platform::Process
    }

    fn determine_service_type(&self, service: &ServiceContext) -> ServiceType {
        match service.name {
            ServiceName::Frontend | ServiceName::Backend => ServiceType::Web,
            ServiceName::Database => ServiceType::Database,
            ServiceName::Filesystem => ServiceType::Filesystem,
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
        let mut inv = Invocation::new("sh")
            .args(["-c", command])
            .envs(&service.environment_variables())
            .cwd(service.working_dir());
        if let Some(limit) = options.timeout {
            inv = inv.timeout(limit);
        }
        if service.dry_run() {
            return Ok(ServiceResult::from_output(
                service.name,
                Platform::Process,
                HandlerOutput::dry_run(inv.display()),
            ));
        }
        let started = Instant::now();
        let out = self.dispatcher.runner().run(&inv).await?;
        let details = ExecDetails {
            command: command.to_string(),
            exit_code: Some(out.status),
            duration_ms: started.elapsed().as_millis() as u64,
            stdout: out.stdout.clone(),
            stderr: out.stderr.clone(),
        };
        let output = if out.success() {
            HandlerOutput::ok(details)
        } else {
            HandlerOutput::failed(details, command_error(command, &out))
        };
        Ok(ServiceResult::from_output(service.name, Platform::Process, output))
    }

    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult> {
        let script = match (service.config_str("testCommand"), &options.suite) {
            (Some(cmd), _) => cmd.to_string(),
            (None, Some(suite)) => format!("npm run test:{suite}"),
            (None, None) => "npm test".to_string(),
        };
        let inv = Invocation::new("sh")
            .args(["-c", script.as_str()])
            .envs(&service.environment_variables())
            .env("CI", "true")
            .cwd(service.working_dir());
        if service.dry_run() {
            return Ok(ServiceResult::from_output(
                service.name,
                Platform::Process,
                HandlerOutput::dry_run(inv.display()),
            ));
        }
        let out = self.dispatcher.runner().run(&inv).await?;
        let details = TestDetails {
            suite: options.suite.clone().unwrap_or_else(|| "all".into()),
            passed: u32::from(out.success()),
            failed: u32::from(!out.success()),
            skipped: 0,
            exit_code: Some(out.status),
        };
        let output = if out.success() {
            HandlerOutput::ok(details)
        } else {
            HandlerOutput::failed(details, command_error(&script, &out))
        };
        Ok(ServiceResult::from_output(service.name, Platform::Process, output))
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
            Platform::Process,
            format!(
                "secret {} is not supported on the process platform; use environment variables",
                action.as_str()
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pids listening on `port`, via `lsof`. An empty list means nothing is
/// listening (`lsof` exits 1 in that case).
async fn listener_pids(runner: &dyn CommandRunner, port: u16) -> Result<Vec<u32>> {
    let out = runner
        .run(&Invocation::new("lsof").args(["-ti".to_string(), format!("tcp:{port}"), "-sTCP:LISTEN".to_string()]))
        .await?;
    Ok(out
        .stdout
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect())
}

async fn wait_for_port_release(port: u16, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !tcp_reachable(LOCALHOST, port, Duration::from_millis(500)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

async fn tail_file(path: &Path, tail: usize) -> Result<Vec<LogEntry>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(tail);
    Ok(lines[skip..].iter().map(|l| LogEntry::line(*l)).collect())
}

fn log_path(service: &ServiceContext) -> PathBuf {
    paths::log_file(&service.project_root, &service.environment, service.name.as_str())
}

fn health_url(service: &ServiceContext, port: u16) -> Option<String> {
    let path = service
        .requirements()
        .network
        .health_check
        .as_ref()?
        .path
        .as_deref()?;
    Some(format!("http://localhost:{port}{path}"))
}

// ---------------------------------------------------------------------------
// web / generic
// ---------------------------------------------------------------------------

fn start_app<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(command) = svc.command() else {
            return Ok(HandlerOutput::failure(format!("no command configured for {}", svc.name)));
        };
        let port = svc.port();
        let inv = Invocation::new("sh")
            .args(["-c", command.as_str()])
            .envs(&svc.environment_variables())
            .cwd(svc.working_dir());
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        if let Some(port) = port {
            if tcp_reachable(LOCALHOST, port, PROBE_TIMEOUT).await {
                return Ok(HandlerOutput::failure(format!(
                    "port {port} is already in use; is {} already running?",
                    svc.name
                )));
            }
        }

        let log = log_path(svc);
        let pid = ctx.runner.spawn_detached(&inv, &log).await?;
        tracing::info!(service = %svc.name, pid, "started local process");
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint: port.map(|p| format!("http://localhost:{p}")),
            resources: Some(PlatformResources::Process {
                pid: Some(pid),
                port,
                path: Some(svc.working_dir().display().to_string()),
            }),
        })
        .with_metadata("logFile", log.display().to_string()))
    })
}

fn stop_app<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(port) = svc.port() else {
            return Ok(HandlerOutput::failure(format!(
                "cannot locate {} without a port",
                svc.name
            )));
        };
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("kill $(lsof -ti tcp:{port})")));
        }

        let pids = listener_pids(ctx.runner, port).await?;
        if pids.is_empty() {
            return Ok(HandlerOutput::ok(StopDetails {
                stop_time: Some(Utc::now()),
                graceful: true,
            })
            .with_metadata("wasRunning", false));
        }

        let pid_args: Vec<String> = pids.iter().map(u32::to_string).collect();
        let out = ctx.runner.run(&Invocation::new("kill").args(pid_args.clone())).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("kill", &out)));
        }
        let grace = svc
            .config_u64("stopTimeout")
            .map(Duration::from_secs)
            .unwrap_or(PORT_RELEASE_WAIT);
        let graceful = wait_for_port_release(port, grace).await;
        if !graceful {
            tracing::warn!(service = %svc.name, port, "process ignored SIGTERM; sending SIGKILL");
            let out = ctx
                .runner
                .run(&Invocation::new("kill").arg("-9").args(pid_args))
                .await?;
            if !out.success() {
                return Ok(HandlerOutput::failure(command_error("kill -9", &out))
                    .with_metadata("wasRunning", true)
                    .with_metadata("pids", pids));
            }
        }
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful,
        })
        .with_metadata("wasRunning", true)
        .with_metadata("pids", pids))
    })
}

fn check_app<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(port) = svc.port() else {
            let command = svc.command().unwrap_or_default();
            let out = ctx.runner.run(&Invocation::new("pgrep").args(["-f", command.as_str()])).await?;
            let status = if out.success() && !out.stdout.trim().is_empty() {
                ServiceStatus::Running
            } else {
                ServiceStatus::Stopped
            };
            return Ok(HandlerOutput::ok(CheckDetails {
                status,
                ..Default::default()
            }));
        };

        if !tcp_reachable(LOCALHOST, port, PROBE_TIMEOUT).await {
            return Ok(HandlerOutput::ok(CheckDetails {
                status: ServiceStatus::Stopped,
                health: None,
                resources: Some(PlatformResources::Process {
                    pid: None,
                    port: Some(port),
                    path: None,
                }),
            }));
        }

        let pid = listener_pids(ctx.runner, port).await?.first().copied();
        let health = match (ctx.service_type, health_url(svc, port)) {
            (ServiceType::Web, Some(url)) => Some(http_health(&url, PROBE_TIMEOUT).await),
            _ => None,
        };
        let status = match &health {
            Some(h) if !h.healthy => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Running,
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health,
            resources: Some(PlatformResources::Process {
                pid,
                port: Some(port),
                path: None,
            }),
        }))
    })
}

fn update_app<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<UpdateDetails>>> {
    Box::pin(async move {
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("restart {}", ctx.service.name)));
        }
        let began = Instant::now();
        let stopped = stop_app(ctx).await?;
        if !stopped.success {
            return Ok(HandlerOutput::failure(
                stopped.error.unwrap_or_else(|| "stop failed".into()),
            ));
        }
        let started = start_app(ctx).await?;
        let details = UpdateDetails {
            strategy: UpdateStrategy::Restart,
            downtime_ms: Some(began.elapsed().as_millis() as u64),
            ..Default::default()
        };
        Ok(match started.error {
            None => HandlerOutput::ok(details),
            Some(err) => HandlerOutput::failed(details, err),
        })
    })
}

fn provision_app<'a>(
    ctx: &'a HandlerContext<'a>,
) -> BoxFuture<'a, Result<HandlerOutput<ProvisionDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        if ctx.args.provision.destroy {
            return Ok(HandlerOutput::ok(ProvisionDetails {
                destroyed: true,
                ..Default::default()
            })
            .with_warning("local processes have no infrastructure to destroy"));
        }
        let dir = svc.working_dir();
        let inv = Invocation::new("npm")
            .arg("install")
            .cwd(&dir)
            .timeout(INSTALL_TIMEOUT);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("npm install", &out)));
        }
        Ok(HandlerOutput::ok(ProvisionDetails {
            resources: vec![dir.join("node_modules").display().to_string()],
            dependencies: svc
                .requirements()
                .dependencies
                .services
                .iter()
                .map(ToString::to_string)
                .collect(),
            destroyed: false,
        }))
    })
}

fn publish_app<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<PublishDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let dir = svc.working_dir();
        let inv = Invocation::new("npm")
            .args(["run", "build"])
            .envs(&svc.environment_variables())
            .cwd(&dir)
            .timeout(INSTALL_TIMEOUT);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("npm run build", &out)));
        }
        let mut details = PublishDetails {
            version: Some(ctx.args.publish.tag.clone().unwrap_or_else(|| "local".into())),
            ..Default::default()
        };
        details
            .artifacts
            .insert("build".into(), dir.display().to_string());
        let mut output = HandlerOutput::ok(details);
        if !ctx.args.publish.no_push {
            output = output.with_warning("process platform builds in place; nothing was pushed");
        }
        Ok(output)
    })
}

fn logs_from_file<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<LogsDetails>>> {
    Box::pin(async move {
        let log = log_path(ctx.service);
        let entries = tail_file(&log, ctx.args.logs.tail).await?;
        let mut output = HandlerOutput::ok(LogsDetails { entries })
            .with_metadata("logFile", log.display().to_string());
        if ctx.args.logs.since.is_some() {
            output = output.with_warning("--since is ignored for local log files");
        }
        Ok(output)
    })
}

// ---------------------------------------------------------------------------
// database (PostgreSQL via pg_ctl)
// ---------------------------------------------------------------------------

fn pg_data_dir(svc: &ServiceContext) -> PathBuf {
    match svc.config_str("dataDir") {
        Some(dir) => svc.project_root.join(dir),
        None => paths::data_dir(&svc.project_root, &svc.environment).join("postgres"),
    }
}

fn pg_port(svc: &ServiceContext) -> u16 {
    svc.port().unwrap_or(5432)
}

fn pg_user(svc: &ServiceContext) -> &str {
    svc.config_str("user").unwrap_or("postgres")
}

fn pg_database(svc: &ServiceContext) -> &str {
    svc.config_str("database").unwrap_or("semiont")
}

fn pg_ctl(svc: &ServiceContext, action: &str) -> Invocation {
    let mut inv = Invocation::new("pg_ctl")
        .arg("-D")
        .arg(pg_data_dir(svc).display().to_string())
        .envs(&svc.environment_variables());
    if action != "stop" {
        inv = inv
            .arg("-l")
            .arg(log_path(svc).display().to_string())
            .arg("-o")
            .arg(format!("-p {}", pg_port(svc)));
    }
    inv.args(["-w", action])
}

fn start_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let inv = pg_ctl(svc, "start");
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        if let Some(parent) = log_path(svc).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("pg_ctl start", &out)));
        }
        let port = pg_port(svc);
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint: Some(format!("postgresql://localhost:{port}/{}", pg_database(svc))),
            resources: Some(PlatformResources::Process {
                pid: None,
                port: Some(port),
                path: Some(pg_data_dir(svc).display().to_string()),
            }),
        }))
    })
}

fn stop_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let inv = pg_ctl(svc, "stop").args(["-m", "fast"]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        let stopped = HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        });
        if out.success() {
            return Ok(stopped.with_metadata("wasRunning", true));
        }
        if out.error_text().contains("Is server running?") {
            return Ok(stopped.with_metadata("wasRunning", false));
        }
        Ok(HandlerOutput::failure(command_error("pg_ctl stop", &out)))
    })
}

fn check_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let port = pg_port(svc);
        let out = ctx
            .runner
            .run(&Invocation::new("pg_isready").args(["-h".to_string(), "localhost".to_string(), "-p".to_string(), port.to_string()]))
            .await?;
        // pg_isready: 0 accepting, 1 rejecting, 2 no response, 3 bad params
        let status = match out.status {
            0 => ServiceStatus::Running,
            1 => ServiceStatus::Unhealthy,
            2 => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown,
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: None,
            resources: Some(PlatformResources::Process {
                pid: None,
                port: Some(port),
                path: Some(pg_data_dir(svc).display().to_string()),
            }),
        })
        .with_metadata("pgIsready", out.stdout.trim()))
    })
}

fn update_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<UpdateDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let inv = pg_ctl(svc, "restart");
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let began = Instant::now();
        let out = ctx.runner.run(&inv).await?;
        let details = UpdateDetails {
            strategy: UpdateStrategy::Restart,
            downtime_ms: Some(began.elapsed().as_millis() as u64),
            ..Default::default()
        };
        Ok(if out.success() {
            HandlerOutput::ok(details)
        } else {
            HandlerOutput::failed(details, command_error("pg_ctl restart", &out))
        })
    })
}

fn provision_postgres<'a>(
    ctx: &'a HandlerContext<'a>,
) -> BoxFuture<'a, Result<HandlerOutput<ProvisionDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let dir = pg_data_dir(svc);
        if ctx.args.provision.destroy {
            if svc.dry_run() {
                return Ok(HandlerOutput::dry_run(format!("rm -rf {}", dir.display())));
            }
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            return Ok(HandlerOutput::ok(ProvisionDetails {
                resources: vec![dir.display().to_string()],
                destroyed: true,
                ..Default::default()
            }));
        }
        if dir.join("PG_VERSION").exists() {
            return Ok(HandlerOutput::ok(ProvisionDetails {
                resources: vec![dir.display().to_string()],
                ..Default::default()
            })
            .with_warning("database cluster already initialised"));
        }
        let inv = Invocation::new("initdb")
            .arg("-D")
            .arg(dir.display().to_string())
            .args(["-U", pg_user(svc), "--auth=trust"]);
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("initdb", &out)));
        }
        Ok(HandlerOutput::ok(ProvisionDetails {
            resources: vec![dir.display().to_string()],
            ..Default::default()
        }))
    })
}

fn backup_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let backup_id = new_backup_id(svc);
        let file = paths::backup_file(&svc.project_root, &svc.environment, &backup_id, "sql");
        let inv = Invocation::new("pg_dump")
            .args(["-h".to_string(), "localhost".to_string(), "-p".to_string(), pg_port(svc).to_string()])
            .args(["-U", pg_user(svc), "-d", pg_database(svc)])
            .envs(&svc.environment_variables());
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("{} > {}", inv.display(), file.display())));
        }
        let out = ctx.runner.run(&inv).await?;
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

fn restore_postgres<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<RestoreDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(backup_id) = ctx.args.backup_id.as_deref() else {
            return Ok(HandlerOutput::failure("restore requires a backup id"));
        };
        let file = paths::backup_file(&svc.project_root, &svc.environment, backup_id, "sql");
        if !file.exists() {
            return Ok(HandlerOutput::failure(format!(
                "backup file not found: {}",
                file.display()
            )));
        }
        let mut inv = Invocation::new("psql")
            .args(["-h".to_string(), "localhost".to_string(), "-p".to_string(), pg_port(svc).to_string()])
            .args(["-U", pg_user(svc), "-d", pg_database(svc), "-v", "ON_ERROR_STOP=1"])
            .envs(&svc.environment_variables());
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("{} < {}", inv.display(), file.display())));
        }
        inv = inv.stdin(tokio::fs::read_to_string(&file).await?);
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("psql", &out)));
        }
        Ok(HandlerOutput::ok(RestoreDetails {
            backup_id: Some(backup_id.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(pg_database(svc).to_string()),
        }))
    })
}

// ---------------------------------------------------------------------------
// filesystem (a local data directory)
// ---------------------------------------------------------------------------

fn fs_dir(svc: &ServiceContext) -> PathBuf {
    match svc.config_str("path") {
        Some(p) => svc.project_root.join(p),
        None => paths::data_dir(&svc.project_root, &svc.environment),
    }
}

fn fs_resources(dir: &Path) -> Option<PlatformResources> {
    Some(PlatformResources::Process {
        pid: None,
        port: None,
        path: Some(dir.display().to_string()),
    })
}

fn start_filesystem<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let dir = fs_dir(ctx.service);
        if ctx.service.dry_run() {
            return Ok(HandlerOutput::dry_run(format!("mkdir -p {}", dir.display())));
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint: Some(format!("file://{}", dir.display())),
            resources: fs_resources(&dir),
        }))
    })
}

fn stop_filesystem<'a>(_ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: Some(Utc::now()),
            graceful: true,
        }))
    })
}

fn check_filesystem<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let dir = fs_dir(ctx.service);
        let status = if dir.is_dir() {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        };
        Ok(HandlerOutput::ok(CheckDetails {
            status,
            health: None,
            resources: fs_resources(&dir),
        }))
    })
}

fn provision_filesystem<'a>(
    ctx: &'a HandlerContext<'a>,
) -> BoxFuture<'a, Result<HandlerOutput<ProvisionDetails>>> {
    Box::pin(async move {
        let dir = fs_dir(ctx.service);
        let destroy = ctx.args.provision.destroy;
        if ctx.service.dry_run() {
            let action = if destroy { "rm -rf" } else { "mkdir -p" };
            return Ok(HandlerOutput::dry_run(format!("{action} {}", dir.display())));
        }
        if destroy {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
        } else {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(HandlerOutput::ok(ProvisionDetails {
            resources: vec![dir.display().to_string()],
            dependencies: Vec::new(),
            destroyed: destroy,
        }))
    })
}

fn backup_filesystem<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<BackupDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let dir = fs_dir(svc);
        let backup_id = new_backup_id(svc);
        let file = paths::backup_file(&svc.project_root, &svc.environment, &backup_id, "tar.gz");
        let inv = Invocation::new("tar")
            .arg("-czf")
            .arg(file.display().to_string())
            .arg("-C")
            .arg(dir.display().to_string())
            .arg(".");
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        if !dir.is_dir() {
            return Ok(HandlerOutput::failure(format!(
                "data directory {} does not exist",
                dir.display()
            )));
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("tar", &out)));
        }
        let size_bytes = tokio::fs::metadata(&file).await.ok().map(|m| m.len());
        Ok(HandlerOutput::ok(BackupDetails {
            backup_id: Some(backup_id),
            location: Some(file.display().to_string()),
            size_bytes,
        }))
    })
}

fn restore_filesystem<'a>(
    ctx: &'a HandlerContext<'a>,
) -> BoxFuture<'a, Result<HandlerOutput<RestoreDetails>>> {
    Box::pin(async move {
        let svc = ctx.service;
        let Some(backup_id) = ctx.args.backup_id.as_deref() else {
            return Ok(HandlerOutput::failure("restore requires a backup id"));
        };
        let dir = fs_dir(svc);
        let file = paths::backup_file(&svc.project_root, &svc.environment, backup_id, "tar.gz");
        let inv = Invocation::new("tar")
            .arg("-xzf")
            .arg(file.display().to_string())
            .arg("-C")
            .arg(dir.display().to_string());
        if svc.dry_run() {
            return Ok(HandlerOutput::dry_run(inv.display()));
        }
        if !file.exists() {
            return Ok(HandlerOutput::failure(format!(
                "backup file not found: {}",
                file.display()
            )));
        }
        tokio::fs::create_dir_all(&dir).await?;
        let out = ctx.runner.run(&inv).await?;
        if !out.success() {
            return Ok(HandlerOutput::failure(command_error("tar", &out)));
        }
        Ok(HandlerOutput::ok(RestoreDetails {
            backup_id: Some(backup_id.to_string()),
            restore_time: Some(Utc::now()),
            target: Some(dir.display().to_string()),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::CommandOutput;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn platform(runner: Arc<ScriptedRunner>) -> ProcessPlatform {
        let mut registry = HandlerRegistry::new();
        registry
            .register_handlers(Platform::Process, handlers())
            .unwrap();
        ProcessPlatform::new(Arc::new(registry), runner)
    }

    fn ctx(root: &Path, name: &str, config: Value, dry_run: bool) -> ServiceContext {
        let info = ServicePlatformInfo {
            name: name.into(),
            platform: Platform::Process,
            config,
        };
        let flags = ContextFlags {
            dry_run,
            ..Default::default()
        };
        ServiceContext::new(&info, "local", root, flags).unwrap()
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn type_mapping_covers_every_service() {
        let p = platform(Arc::new(ScriptedRunner::new()));
        let dir = TempDir::new().unwrap();
        let expected = [
            ("frontend", ServiceType::Web),
            ("backend", ServiceType::Web),
            ("database", ServiceType::Database),
            ("filesystem", ServiceType::Filesystem),
            ("agent", ServiceType::Generic),
            ("mcp", ServiceType::Generic),
        ];
        for (name, ty) in expected {
            assert_eq!(p.determine_service_type(&ctx(dir.path(), name, json!({}), false)), ty);
        }
    }

    #[tokio::test]
    async fn start_spawns_the_service_command_detached() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let runner = Arc::new(ScriptedRunner::new());
        let p = platform(runner.clone());

        let result = p
            .start(&ctx(dir.path(), "backend", json!({"port": port}), false))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.details.resources,
            Some(PlatformResources::Process {
                pid: Some(4242),
                port: Some(port),
                path: Some(dir.path().join("apps/backend").display().to_string()),
            })
        );
        let inv = &runner.invocations()[0];
        assert_eq!(inv.display(), "sh -c npm run dev");
        assert_eq!(inv.env["PORT"], port.to_string());
    }

    #[tokio::test]
    async fn start_refuses_a_port_in_use() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = Arc::new(ScriptedRunner::new());
        let p = platform(runner.clone());

        let result = p
            .start(&ctx(dir.path(), "frontend", json!({"port": port}), false))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("already in use"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_without_listener_reports_not_running() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let runner = Arc::new(ScriptedRunner::new().on("lsof", CommandOutput::failed(1, "")));
        let p = platform(runner.clone());

        let result = p
            .stop(&ctx(dir.path(), "backend", json!({"port": port}), false))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["wasRunning"], false);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn stop_kills_listener_pids() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let runner = Arc::new(ScriptedRunner::new().on("lsof", CommandOutput::ok("111\n222\n")));
        let p = platform(runner.clone());

        let result = p
            .stop(&ctx(dir.path(), "backend", json!({"port": port}), false))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.details.graceful);
        assert!(runner.calls().contains(&"kill 111 222".to_string()));
    }

    #[tokio::test]
    async fn stop_fails_when_sigkill_is_refused() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("lsof", CommandOutput::ok("111\n"))
                .on("kill -9", CommandOutput::failed(1, "Operation not permitted")),
        );
        let p = platform(runner.clone());

        let result = p
            .stop(&ctx(dir.path(), "backend", json!({"port": port, "stopTimeout": 1}), false))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("Operation not permitted"));
        assert_eq!(result.metadata["wasRunning"], true);
        assert!(runner.calls().contains(&"kill -9 111".to_string()));
        drop(listener);
    }

    #[tokio::test]
    async fn dry_run_stop_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let p = platform(runner.clone());
        let result = p.stop(&ctx(dir.path(), "backend", json!({}), true)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata["dryRun"], true);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn check_maps_pg_isready_exit_codes() {
        let dir = TempDir::new().unwrap();
        for (code, status) in [
            (0, ServiceStatus::Running),
            (1, ServiceStatus::Unhealthy),
            (2, ServiceStatus::Stopped),
        ] {
            let runner = Arc::new(ScriptedRunner::new().on(
                "pg_isready",
                CommandOutput {
                    status: code,
                    ..Default::default()
                },
            ));
            let result = platform(runner)
                .check(&ctx(dir.path(), "database", json!({}), false))
                .await
                .unwrap();
            assert_eq!(result.details.status, status);
        }
    }

    #[tokio::test]
    async fn check_of_closed_port_is_stopped() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let result = platform(Arc::new(ScriptedRunner::new()))
            .check(&ctx(dir.path(), "frontend", json!({"port": port}), false))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.details.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn database_backup_writes_dump_and_restore_feeds_it_back() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new().on("pg_dump", CommandOutput::ok("CREATE TABLE docs();\n")),
        );
        let p = platform(runner.clone());
        let svc = ctx(dir.path(), "database", json!({}), false);

        let backup = p.backup(&svc).await.unwrap();
        assert!(backup.success, "{:?}", backup.error);
        let id = backup.details.backup_id.unwrap();
        let location = PathBuf::from(backup.details.location.unwrap());
        assert_eq!(std::fs::read_to_string(&location).unwrap(), "CREATE TABLE docs();\n");

        let restored = p.restore(&svc, &id).await.unwrap();
        assert!(restored.success, "{:?}", restored.error);
        let psql = runner
            .invocations()
            .into_iter()
            .find(|i| i.program == "psql")
            .unwrap();
        assert_eq!(psql.stdin.as_deref(), Some("CREATE TABLE docs();\n"));
    }

    #[tokio::test]
    async fn restore_of_unknown_backup_fails_softly() {
        let dir = TempDir::new().unwrap();
        let result = platform(Arc::new(ScriptedRunner::new()))
            .restore(&ctx(dir.path(), "filesystem", json!({}), false), "missing")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("backup file not found"));
    }

    #[tokio::test]
    async fn filesystem_provision_creates_and_destroys_the_data_dir() {
        let dir = TempDir::new().unwrap();
        let p = platform(Arc::new(ScriptedRunner::new()));
        let svc = ctx(dir.path(), "filesystem", json!({"path": "data/uploads"}), false);

        let created = p.provision(&svc, &ProvisionOptions::default()).await.unwrap();
        assert!(created.success);
        assert!(dir.path().join("data/uploads").is_dir());
        assert_eq!(p.check(&svc).await.unwrap().details.status, ServiceStatus::Running);

        let destroyed = p
            .provision(&svc, &ProvisionOptions { destroy: true })
            .await
            .unwrap();
        assert!(destroyed.details.destroyed);
        assert!(!dir.path().join("data/uploads").exists());
    }

    #[tokio::test]
    async fn logs_tail_the_service_log_file() {
        let dir = TempDir::new().unwrap();
        let log = paths::log_file(dir.path(), "local", "backend");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "one\ntwo\nthree\n").unwrap();

        let result = platform(Arc::new(ScriptedRunner::new()))
            .collect_logs(
                &ctx(dir.path(), "backend", json!({}), false),
                &LogOptions { tail: 2, since: None },
            )
            .await
            .unwrap();
        let lines: Vec<_> = result.details.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn filesystem_has_no_logs_handler() {
        let dir = TempDir::new().unwrap();
        let result = platform(Arc::new(ScriptedRunner::new()))
            .collect_logs(&ctx(dir.path(), "filesystem", json!({}), false), &LogOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn exec_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("sh -c false", CommandOutput::failed(1, "nope")));
        let p = platform(runner);
        let svc = ctx(dir.path(), "backend", json!({}), false);

        let ok = p.exec(&svc, "true", &ExecOptions::default()).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.details.exit_code, Some(0));

        let failed = p.exec(&svc, "false", &ExecOptions::default()).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.details.exit_code, Some(1));
    }

    #[tokio::test]
    async fn secrets_are_unsupported() {
        let dir = TempDir::new().unwrap();
        let result = platform(Arc::new(ScriptedRunner::new()))
            .manage_secret(&ctx(dir.path(), "backend", json!({}), false), &SecretAction::List)
            .await
            .unwrap();
        assert!(!result.success);
    }
}

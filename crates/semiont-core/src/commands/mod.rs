//! The command layer: run one operation against every targeted service and
//! fold the per-service results into a [`CommandResults`] envelope.

pub mod ops;
pub mod ordering;

use crate::config::EnvironmentConfig;
use crate::error::Result;
use crate::platforms::Platforms;
use crate::results::{CommandResults, ExecutionContext, ServiceResult, Summary};
use crate::service::{resolve_services, ContextFlags, ServiceContext, ServicePlatformInfo, ServiceSelector};
use crate::strategy::PlatformStrategy;
use crate::types::{Command, Platform};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    ContinueOnError,
    /// Stop after the first service whose operation returned `Err`.
    StopOnFirstError,
}

/// One CLI command as the executor sees it: which strategy method to call
/// and how to react when a service fails.
#[async_trait]
pub trait Operation: Send + Sync {
    type Details: Default + Serialize + Send + Sync + 'static;
    const COMMAND: Command;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::ContinueOnError
    }

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<Self::Details>>;
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// What a reporter learns about one finished service.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub command: Command,
    pub entity: &'a str,
    pub platform: Platform,
    pub success: bool,
    pub error: Option<&'a str>,
    pub warnings: &'a [String],
}

impl<'a> Progress<'a> {
    fn of<D>(command: Command, result: &'a ServiceResult<D>) -> Self {
        Self {
            command,
            entity: &result.entity,
            platform: result.platform,
            success: result.success,
            error: result.error.as_deref(),
            warnings: &result.warnings,
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn service_started(&self, _command: Command, _service: &str, _platform: Platform) {}
    fn service_finished(&self, _progress: Progress<'_>) {}
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {}

// ---------------------------------------------------------------------------
// CommandContext
// ---------------------------------------------------------------------------

pub struct CommandContext<'a> {
    pub project_root: PathBuf,
    pub config: &'a EnvironmentConfig,
    pub selector: ServiceSelector,
    pub flags: ContextFlags,
    pub platforms: &'a Platforms,
    pub reporter: &'a dyn ProgressReporter,
}

impl CommandContext<'_> {
    pub fn environment(&self) -> &str {
        &self.config.name
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Run `op` against every service the selector resolves to, one at a time.
///
/// Never fails: a resolution error becomes an envelope with no results,
/// `summary.failed == 1` and `error` set, and each service's `Err` becomes a
/// failed result for that service.
pub async fn execute<O: Operation>(ctx: &CommandContext<'_>, op: &O) -> CommandResults<O::Details> {
    let command = O::COMMAND;
    let started = Instant::now();
    let timestamp = Utc::now();

    let resolved = match resolve_services(ctx.config, &ctx.selector) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!(%command, error = %e, "service resolution failed");
            return CommandResults {
                command,
                environment: ctx.environment().to_string(),
                timestamp,
                duration: started.elapsed().as_millis() as u64,
                results: Vec::new(),
                summary: Summary {
                    failed: 1,
                    ..Default::default()
                },
                execution_context: ExecutionContext::current(ctx.flags.dry_run),
                error: Some(e.to_string()),
            };
        }
    };

    let targets = ordering::apply(command, resolved);
    let policy = op.failure_policy();
    let mut results = Vec::with_capacity(targets.len());
    for info in &targets {
        ctx.reporter.service_started(command, &info.name, info.platform);
        let (result, raised) = run_one(ctx, op, info).await;
        ctx.reporter.service_finished(Progress::of(command, &result));
        results.push(result);
        if raised && policy == FailurePolicy::StopOnFirstError {
            tracing::warn!(%command, service = %info.name, "stopping after first error");
            break;
        }
    }

    let summary = Summary::from_results(&results);
    tracing::info!(
        %command,
        environment = %ctx.environment(),
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "command finished"
    );
    CommandResults {
        command,
        environment: ctx.environment().to_string(),
        timestamp,
        duration: started.elapsed().as_millis() as u64,
        results,
        summary,
        execution_context: ExecutionContext::current(ctx.flags.dry_run),
        error: None,
    }
}

/// The service's result, and whether it was synthesized from an `Err`.
/// Soft failures (`success: false`, including handler misses) are not
/// errors for the failure policy.
async fn run_one<O: Operation>(
    ctx: &CommandContext<'_>,
    op: &O,
    info: &ServicePlatformInfo,
) -> (ServiceResult<O::Details>, bool) {
    match try_run_one(ctx, op, info).await {
        Ok(result) => (result, false),
        Err(e) => {
            tracing::warn!(service = %info.name, platform = %info.platform, error = %e, "operation failed");
            (
                ServiceResult::failure(info.name.clone(), info.platform, e.to_string()),
                true,
            )
        }
    }
}

async fn try_run_one<O: Operation>(
    ctx: &CommandContext<'_>,
    op: &O,
    info: &ServicePlatformInfo,
) -> Result<ServiceResult<O::Details>> {
    let strategy = ctx.platforms.strategy(info.platform)?;
    let service = ServiceContext::new(info, ctx.environment(), &ctx.project_root, ctx.flags)?;
    op.run(strategy.as_ref(), &service).await
}

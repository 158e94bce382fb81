//! The platform strategy interface and the shared dispatch path that
//! registry-backed strategies use.

use crate::error::Result;
use crate::handler::{DiscoveredResources, HandlerContext, HandlerKind, OperationArgs};
use crate::registry::HandlerRegistry;
use crate::results::{
    BackupResult, CheckResult, ExecResult, LogsResult, ProvisionResult, PublishResult,
    RestoreResult, SecretResult, ServiceResult, StartResult, StopResult, TestResult, UpdateResult,
};
use crate::runner::CommandRunner;
use crate::service::ServiceContext;
use crate::types::{Platform, ServiceType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Operation options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOptions {
    /// Tear the infrastructure down instead of creating it.
    pub destroy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub tag: Option<String>,
    pub no_push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub tail: usize,
    pub since: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: 100,
            since: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub interactive: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    pub suite: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretAction {
    Get { name: String },
    Set { name: String, value: String },
    List,
    Delete { name: String },
}

impl SecretAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretAction::Get { .. } => "get",
            SecretAction::Set { .. } => "set",
            SecretAction::List => "list",
            SecretAction::Delete { .. } => "delete",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SecretAction::Get { name }
            | SecretAction::Set { name, .. }
            | SecretAction::Delete { name } => Some(name),
            SecretAction::List => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformStrategy
// ---------------------------------------------------------------------------

/// One deployment target's ability to run every CLI operation against a
/// service.
///
/// Expected failures (missing cluster, unreachable endpoint, no handler) are
/// reported as results with `success: false`. `Err` means something nobody
/// planned for; the command layer records it as a failure for that service.
#[async_trait]
pub trait PlatformStrategy: Send + Sync {
    fn platform(&self) -> Platform;

    /// Technology discriminator used to pick a handler for this service.
    fn determine_service_type(&self, service: &ServiceContext) -> ServiceType;

    async fn start(&self, service: &ServiceContext) -> Result<StartResult>;
    async fn stop(&self, service: &ServiceContext) -> Result<StopResult>;
    async fn check(&self, service: &ServiceContext) -> Result<CheckResult>;
    async fn update(&self, service: &ServiceContext) -> Result<UpdateResult>;
    async fn provision(
        &self,
        service: &ServiceContext,
        options: &ProvisionOptions,
    ) -> Result<ProvisionResult>;
    async fn publish(&self, service: &ServiceContext, options: &PublishOptions)
        -> Result<PublishResult>;
    async fn backup(&self, service: &ServiceContext) -> Result<BackupResult>;
    async fn restore(&self, service: &ServiceContext, backup_id: &str) -> Result<RestoreResult>;
    async fn exec(
        &self,
        service: &ServiceContext,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult>;
    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult>;
    async fn collect_logs(&self, service: &ServiceContext, options: &LogOptions)
        -> Result<LogsResult>;
    async fn manage_secret(
        &self,
        service: &ServiceContext,
        action: &SecretAction,
    ) -> Result<SecretResult>;
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ResourceDiscovery: Send + Sync {
    async fn discover(&self, service: &ServiceContext) -> Result<DiscoveredResources>;
}

/// Discovery for platforms that have nothing to look up.
pub struct NoDiscovery;

#[async_trait]
impl ResourceDiscovery for NoDiscovery {
    async fn discover(&self, _service: &ServiceContext) -> Result<DiscoveredResources> {
        Ok(DiscoveredResources::new())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Shared registry-backed dispatch: find the handler for
/// `(platform, command, service type)`, run discovery when the descriptor
/// asks for it, invoke the handler, and stamp the result.
#[derive(Clone)]
pub struct Dispatcher {
    platform: Platform,
    registry: Arc<HandlerRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl Dispatcher {
    pub fn new(platform: Platform, registry: Arc<HandlerRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            platform,
            registry,
            runner,
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn dispatch<D: HandlerKind>(
        &self,
        service: &ServiceContext,
        service_type: ServiceType,
        args: &OperationArgs,
        discovery: &dyn ResourceDiscovery,
    ) -> Result<ServiceResult<D>> {
        let command = D::COMMAND;
        let Some(descriptor) = self
            .registry
            .get_handler_for_command(command, self.platform, service_type)
        else {
            tracing::warn!(platform = %self.platform, %command, %service_type, service = %service.name, "no handler registered");
            return Ok(ServiceResult::failure(
                service.name.as_str(),
                self.platform,
                format!(
                    "{command} handler for service type '{service_type}' not found on platform '{}'",
                    self.platform
                ),
            ));
        };
        let Some(handler) = D::select(&descriptor.handler) else {
            return Ok(ServiceResult::failure(
                service.name.as_str(),
                self.platform,
                format!("handler registered for {} does not produce a {command} result", descriptor.key()),
            ));
        };

        let discovered = if descriptor.requires_discovery {
            discovery.discover(service).await?
        } else {
            DiscoveredResources::new()
        };

        let ctx = HandlerContext {
            service,
            platform: self.platform,
            service_type,
            args,
            runner: self.runner.as_ref(),
            discovered: &discovered,
        };
        tracing::debug!(platform = %self.platform, %command, %service_type, service = %service.name, "dispatching");
        let output = handler(&ctx).await?;
        Ok(ServiceResult::from_output(service.name, self.platform, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerDescriptor};
    use crate::results::{CheckDetails, HandlerOutput, ServiceStatus, StartDetails};
    use crate::runner::testing::ScriptedRunner;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use futures::future::BoxFuture;
    use std::path::Path;

    struct FixedDiscovery;

    #[async_trait]
    impl ResourceDiscovery for FixedDiscovery {
        async fn discover(&self, _service: &ServiceContext) -> Result<DiscoveredResources> {
            Ok(DiscoveredResources::new().with("ClusterName", "semiont-cluster"))
        }
    }

    fn check_reports_discovery<'a>(
        ctx: &'a HandlerContext<'a>,
    ) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
        Box::pin(async move {
            let cluster = ctx.discovered.get("ClusterName").unwrap_or("none").to_string();
            Ok(HandlerOutput::ok(CheckDetails {
                status: ServiceStatus::Running,
                ..Default::default()
            })
            .with_metadata("cluster", cluster))
        })
    }

    fn service() -> ServiceContext {
        let info = ServicePlatformInfo {
            name: "backend".into(),
            platform: Platform::Aws,
            config: serde_json::json!({}),
        };
        ServiceContext::new(&info, "staging", Path::new("/p"), ContextFlags::default()).unwrap()
    }

    fn dispatcher(discovery_required: bool) -> Dispatcher {
        let mut registry = HandlerRegistry::new();
        let mut d = HandlerDescriptor::new(
            Platform::Aws,
            ServiceType::EcsFargate,
            Handler::Check(check_reports_discovery),
        );
        if discovery_required {
            d = d.with_discovery();
        }
        registry.register_handler(d).unwrap();
        Dispatcher::new(Platform::Aws, Arc::new(registry), Arc::new(ScriptedRunner::new()))
    }

    #[tokio::test]
    async fn dispatch_runs_discovery_when_required() {
        let result = dispatcher(true)
            .dispatch::<CheckDetails>(&service(), ServiceType::EcsFargate, &OperationArgs::default(), &FixedDiscovery)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.entity, "backend");
        assert_eq!(result.metadata["cluster"], "semiont-cluster");
    }

    #[tokio::test]
    async fn dispatch_skips_discovery_otherwise() {
        let result = dispatcher(false)
            .dispatch::<CheckDetails>(&service(), ServiceType::EcsFargate, &OperationArgs::default(), &FixedDiscovery)
            .await
            .unwrap();
        assert_eq!(result.metadata["cluster"], "none");
    }

    #[tokio::test]
    async fn missing_handler_is_a_failed_result_not_an_error() {
        let result = dispatcher(false)
            .dispatch::<StartDetails>(&service(), ServiceType::EcsFargate, &OperationArgs::default(), &NoDiscovery)
            .await
            .unwrap();
        assert!(!result.success);
        let err = result.error.unwrap();
        assert!(err.contains("start handler"), "{err}");
        assert!(err.contains("not found"), "{err}");
    }
}

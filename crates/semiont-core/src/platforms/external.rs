//! Services that something else runs: a hosted database, a partner API.
//! Semiont only probes them.

use super::probe::{http_health, tcp_reachable, PROBE_TIMEOUT};
use crate::error::Result;
use crate::handler::{Handler, HandlerContext, HandlerDescriptor, HandlerKind, OperationArgs};
use crate::registry::HandlerRegistry;
use crate::results::{
    BackupResult, CheckDetails, CheckResult, ExecResult, HandlerOutput, HealthInfo, LogsResult,
    PlatformResources, ProvisionResult, PublishResult, RestoreResult, SecretResult, ServiceResult,
    ServiceStatus, StartDetails, StartResult, StopDetails, StopResult, TestDetails, TestResult,
    UpdateResult,
};
use crate::runner::CommandRunner;
use crate::service::ServiceContext;
use crate::strategy::{
    Dispatcher, ExecOptions, LogOptions, NoDiscovery, PlatformStrategy, ProvisionOptions,
    PublishOptions, SecretAction, TestOptions,
};
use crate::types::{Platform, ServiceType};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;

const EXTERNALLY_MANAGED: &str = "externally managed";

pub fn handlers() -> Vec<HandlerDescriptor> {
    let p = Platform::External;
    [ServiceType::Generic, ServiceType::Database]
        .into_iter()
        .flat_map(|ty| {
            [
                HandlerDescriptor::new(p, ty, Handler::Start(start_external)),
                HandlerDescriptor::new(p, ty, Handler::Stop(stop_external)),
                HandlerDescriptor::new(p, ty, Handler::Check(check_external)),
            ]
        })
        .collect()
}

pub struct ExternalPlatform {
    dispatcher: Dispatcher,
}

impl ExternalPlatform {
    pub fn new(registry: Arc<HandlerRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Platform::External, registry, runner),
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

    fn unsupported<D: Default>(service: &ServiceContext, what: &str) -> ServiceResult<D> {
        ServiceResult::failure(
            service.name.as_str(),
            Platform::External,
            format!("{what} is not available for {EXTERNALLY_MANAGED} service {}", service.name),
        )
    }
}

#[async_trait]
impl PlatformStrategy for ExternalPlatform {
    fn platform(&self) -> Platform {
        Platform::External
    }

    fn determine_service_type(&self, service: &ServiceContext) -> ServiceType {
        match service.config_str("serviceType") {
            Some("database") => ServiceType::Database,
            _ => ServiceType::Generic,
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

    async fn exec(&self, service: &ServiceContext, _command: &str, _options: &ExecOptions) -> Result<ExecResult> {
        Ok(Self::unsupported(service, "exec"))
    }

    /// Reachability is the only thing we can test from here.
    async fn test(&self, service: &ServiceContext, options: &TestOptions) -> Result<TestResult> {
        let checked = self.check(service).await?;
        let reachable = checked.success && checked.details.status == ServiceStatus::Running;
        let details = TestDetails {
            suite: options.suite.clone().unwrap_or_else(|| "connectivity".into()),
            passed: u32::from(reachable),
            failed: u32::from(!reachable),
            skipped: 0,
            exit_code: None,
        };
        let output = if reachable {
            HandlerOutput::ok(details)
        } else {
            let reason = checked
                .error
                .unwrap_or_else(|| format!("{} is {}", service.name, checked.details.status));
            HandlerOutput::failed(details, reason)
        };
        Ok(ServiceResult::from_output(service.name, Platform::External, output))
    }

    async fn collect_logs(&self, service: &ServiceContext, options: &LogOptions) -> Result<LogsResult> {
        let args = OperationArgs {
            logs: options.clone(),
            ..Default::default()
        };
        self.dispatch(service, &args).await
    }

    async fn manage_secret(&self, service: &ServiceContext, action: &SecretAction) -> Result<SecretResult> {
        Ok(Self::unsupported(service, &format!("secret {}", action.as_str())))
    }
}

// ---------------------------------------------------------------------------
// Probing
// ---------------------------------------------------------------------------

enum Probe {
    Http(String),
    Tcp { host: String, port: u16 },
}

impl Probe {
    /// `healthCheck` (absolute, or a path joined onto `url`), else `url`,
    /// else `host` + port.
    fn for_service(service: &ServiceContext) -> Option<Self> {
        let url = service.config_str("url").map(|u| u.trim_end_matches('/'));
        let http = match (service.config_str("healthCheck"), url) {
            (Some(check), _) if check.starts_with("http://") || check.starts_with("https://") => {
                Some(check.to_string())
            }
            (Some(path), Some(base)) => Some(format!("{base}/{}", path.trim_start_matches('/'))),
            (None, Some(base)) => Some(base.to_string()),
            _ => None,
        };
        if let Some(url) = http {
            return Some(Probe::Http(url));
        }
        let host = service.config_str("host")?;
        Some(Probe::Tcp {
            host: host.to_string(),
            port: service.port()?,
        })
    }

    fn endpoint(&self) -> String {
        match self {
            Probe::Http(url) => url.clone(),
            Probe::Tcp { host, port } => format!("{host}:{port}"),
        }
    }

    async fn run(&self) -> HealthInfo {
        match self {
            Probe::Http(url) => http_health(url, PROBE_TIMEOUT).await,
            Probe::Tcp { host, port } => {
                let started = std::time::Instant::now();
                let healthy = tcp_reachable(host, *port, PROBE_TIMEOUT).await;
                HealthInfo {
                    healthy,
                    endpoint: Some(self.endpoint()),
                    response_time_ms: healthy.then(|| started.elapsed().as_millis() as u64),
                    ..Default::default()
                }
            }
        }
    }
}

fn no_endpoint(service: &ServiceContext) -> String {
    format!(
        "{EXTERNALLY_MANAGED} service {} needs 'url', 'healthCheck' or 'host' and 'port' in its config",
        service.name
    )
}

fn status_of(health: &HealthInfo) -> ServiceStatus {
    if health.healthy {
        ServiceStatus::Running
    } else if health.details.contains_key("statusCode") {
        // answered, but not with success
        ServiceStatus::Unhealthy
    } else {
        ServiceStatus::Stopped
    }
}

fn start_external<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StartDetails>>> {
    Box::pin(async move {
        let Some(probe) = Probe::for_service(ctx.service) else {
            return Ok(HandlerOutput::failure(no_endpoint(ctx.service)));
        };
        let endpoint = probe.endpoint();
        let health = probe.run().await;
        if !health.healthy {
            return Ok(HandlerOutput::failure(format!(
                "{} is not reachable at {endpoint}; it is {EXTERNALLY_MANAGED} and cannot be started here",
                ctx.service.name
            )));
        }
        Ok(HandlerOutput::ok(StartDetails {
            start_time: Some(Utc::now()),
            endpoint: Some(endpoint.clone()),
            resources: Some(PlatformResources::External { endpoint }),
        })
        .with_warning(format!("{} is {EXTERNALLY_MANAGED}; verified reachability only", ctx.service.name)))
    })
}

fn stop_external<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<StopDetails>>> {
    Box::pin(async move {
        Ok(HandlerOutput::ok(StopDetails {
            stop_time: None,
            graceful: true,
        })
        .with_warning(format!("{} is {EXTERNALLY_MANAGED}; nothing was stopped", ctx.service.name)))
    })
}

fn check_external<'a>(ctx: &'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
    Box::pin(async move {
        let Some(probe) = Probe::for_service(ctx.service) else {
            return Ok(HandlerOutput::failure(no_endpoint(ctx.service)));
        };
        let health = probe.run().await;
        tracing::debug!(service = %ctx.service.name, endpoint = %probe.endpoint(), healthy = health.healthy, "external probe");
        Ok(HandlerOutput::ok(CheckDetails {
            status: status_of(&health),
            resources: Some(PlatformResources::External {
                endpoint: probe.endpoint(),
            }),
            health: Some(health),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use serde_json::{json, Value};
    use std::path::Path;

    fn platform() -> ExternalPlatform {
        let mut registry = HandlerRegistry::new();
        registry.register_handlers(Platform::External, handlers()).unwrap();
        ExternalPlatform::new(Arc::new(registry), Arc::new(ScriptedRunner::new()))
    }

    fn ctx(name: &str, config: Value) -> ServiceContext {
        let info = ServicePlatformInfo {
            name: name.into(),
            platform: Platform::External,
            config,
        };
        ServiceContext::new(&info, "staging", Path::new("/p"), ContextFlags::default()).unwrap()
    }

    #[tokio::test]
    async fn check_probes_health_url() {
        let mut server = mockito::Server::new_async().await;
        let health = server.mock("GET", "/api/health").with_status(200).create_async().await;
        let svc = ctx("backend", json!({"url": format!("{}/", server.url()), "healthCheck": "/api/health"}));

        let result = platform().check(&svc).await.unwrap();
        assert!(result.success);
        assert_eq!(result.details.status, ServiceStatus::Running);
        assert_eq!(
            result.details.resources,
            Some(PlatformResources::External {
                endpoint: format!("{}/api/health", server.url())
            })
        );
        health.assert_async().await;
    }

    #[tokio::test]
    async fn relative_health_path_is_joined_with_a_slash() {
        let mut server = mockito::Server::new_async().await;
        let health = server.mock("GET", "/api/health").with_status(200).create_async().await;
        let svc = ctx("backend", json!({"url": server.url(), "healthCheck": "api/health"}));

        let result = platform().check(&svc).await.unwrap();
        assert_eq!(result.details.status, ServiceStatus::Running);
        assert_eq!(
            result.details.resources,
            Some(PlatformResources::External {
                endpoint: format!("{}/api/health", server.url())
            })
        );
        health.assert_async().await;
    }

    #[tokio::test]
    async fn failing_endpoint_is_unhealthy() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/").with_status(500).create_async().await;
        let result = platform()
            .check(&ctx("frontend", json!({"url": server.url()})))
            .await
            .unwrap();
        assert_eq!(result.details.status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn database_type_probes_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let svc = ctx("database", json!({"serviceType": "database", "host": "127.0.0.1", "port": port}));
        let p = platform();
        assert_eq!(p.determine_service_type(&svc), ServiceType::Database);

        let result = p.check(&svc).await.unwrap();
        assert_eq!(result.details.status, ServiceStatus::Running);
        drop(listener);
    }

    #[tokio::test]
    async fn start_verifies_and_warns() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/").with_status(200).create_async().await;
        let result = platform()
            .start(&ctx("backend", json!({"url": server.url()})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains(EXTERNALLY_MANAGED));
    }

    #[tokio::test]
    async fn stop_is_a_warned_no_op() {
        let result = platform().stop(&ctx("backend", json!({}))).await.unwrap();
        assert!(result.success);
        assert!(result.has_warnings());
    }

    #[tokio::test]
    async fn missing_endpoint_fails_softly() {
        let result = platform().check(&ctx("backend", json!({}))).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("'url'"));
    }

    #[tokio::test]
    async fn other_operations_miss_softly() {
        let result = platform().backup(&ctx("database", json!({}))).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }
}

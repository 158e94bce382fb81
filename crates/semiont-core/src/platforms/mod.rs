//! Platform strategies and the table that owns them.
//!
//! Every registry-backed platform exposes `handlers()` (its descriptor set)
//! and a strategy struct that dispatches through the shared
//! [`HandlerRegistry`]. [`Platforms`] registers all of them once and hands
//! strategies out by [`Platform`].

pub mod aws;
pub mod container;
pub mod external;
pub mod mock;
pub mod probe;
pub mod process;

use crate::error::{Result, SemiontError};
use crate::registry::HandlerRegistry;
use crate::runner::{CommandOutput, CommandRunner, SystemRunner};
use crate::service::ServiceContext;
use crate::strategy::PlatformStrategy;
use crate::types::Platform;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

pub use aws::AwsPlatform;
pub use container::ContainerPlatform;
pub use external::ExternalPlatform;
pub use mock::MockPlatform;
pub use process::ProcessPlatform;

/// `"<what> exited with status N: <stderr>"` for handler error messages.
pub(crate) fn command_error(what: &str, output: &CommandOutput) -> String {
    format!(
        "{what} exited with status {}: {}",
        output.status,
        output.error_text()
    )
}

/// `<service>-<env>-<UTC timestamp>`; also a valid RDS snapshot identifier.
pub(crate) fn new_backup_id(service: &ServiceContext) -> String {
    format!(
        "{}-{}-{}",
        service.name,
        service.environment,
        Utc::now().format("%Y%m%d-%H%M%S")
    )
}

pub struct Platforms {
    registry: Arc<HandlerRegistry>,
    strategies: HashMap<Platform, Arc<dyn PlatformStrategy>>,
}

impl Platforms {
    /// Register every built-in handler set and build one strategy per
    /// platform, all sharing `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mut registry = HandlerRegistry::new();
        registry.register_handlers(Platform::Process, process::handlers())?;
        registry.register_handlers(Platform::Container, container::handlers())?;
        registry.register_handlers(Platform::Aws, aws::handlers())?;
        registry.register_handlers(Platform::External, external::handlers())?;
        tracing::debug!(handlers = registry.len(), "handler registry built");
        let registry = Arc::new(registry);

        let built: Vec<Arc<dyn PlatformStrategy>> = vec![
            Arc::new(ProcessPlatform::new(registry.clone(), runner.clone())),
            Arc::new(ContainerPlatform::new(registry.clone(), runner.clone())),
            Arc::new(AwsPlatform::new(registry.clone(), runner.clone())),
            Arc::new(ExternalPlatform::new(registry.clone(), runner)),
            Arc::new(MockPlatform::new()),
        ];
        let strategies = built.into_iter().map(|s| (s.platform(), s)).collect();
        Ok(Self {
            registry,
            strategies,
        })
    }

    /// Strategies backed by real subprocesses.
    pub fn system() -> Result<Self> {
        Self::new(Arc::new(SystemRunner))
    }

    pub fn strategy(&self, platform: Platform) -> Result<Arc<dyn PlatformStrategy>> {
        self.strategies
            .get(&platform)
            .cloned()
            .ok_or_else(|| SemiontError::StrategyUnavailable(platform.to_string()))
    }

    /// Install or replace the strategy for its platform.
    pub fn insert(&mut self, strategy: Arc<dyn PlatformStrategy>) -> Option<Arc<dyn PlatformStrategy>> {
        self.strategies.insert(strategy.platform(), strategy)
    }

    pub fn remove(&mut self, platform: Platform) -> Option<Arc<dyn PlatformStrategy>> {
        self.strategies.remove(&platform)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::service::{ContextFlags, ServicePlatformInfo};
    use crate::types::{Command, ServiceName, ServiceType};
    use std::path::Path;

    fn platforms() -> Platforms {
        Platforms::new(Arc::new(ScriptedRunner::new())).unwrap()
    }

    #[test]
    fn every_platform_has_a_strategy() {
        let p = platforms();
        for platform in Platform::all() {
            assert_eq!(p.strategy(*platform).unwrap().platform(), *platform);
        }
    }

    #[test]
    fn registry_holds_all_registry_backed_platforms() {
        let p = platforms();
        assert_eq!(
            p.registry().platforms(),
            vec![Platform::Process, Platform::Container, Platform::Aws, Platform::External]
        );
        assert!(p
            .registry()
            .get_handler_for_command(Command::Check, Platform::Aws, ServiceType::EcsFargate)
            .is_some());
    }

    #[test]
    fn removed_strategy_is_unavailable() {
        let mut p = platforms();
        p.remove(Platform::Aws);
        let err = p.strategy(Platform::Aws).err().unwrap();
        assert!(matches!(err, SemiontError::StrategyUnavailable(_)));
        assert!(p.insert(Arc::new(MockPlatform::new())).is_some());
    }

    #[test]
    fn backup_ids_name_service_and_environment() {
        let info = ServicePlatformInfo {
            name: "database".into(),
            platform: Platform::Mock,
            config: serde_json::json!({}),
        };
        let ctx = ServiceContext::new(&info, "staging", Path::new("/p"), ContextFlags::default()).unwrap();
        let id = new_backup_id(&ctx);
        assert!(id.starts_with("database-staging-"), "{id}");
        assert_eq!(ctx.name, ServiceName::Database);
    }

    #[test]
    fn command_errors_carry_status_and_stderr() {
        let msg = command_error("pg_dump", &CommandOutput::failed(1, "connection refused\n"));
        assert_eq!(msg, "pg_dump exited with status 1: connection refused");
    }
}

//! The twelve operations, each a thin binding from a command to one
//! [`PlatformStrategy`] method.

use super::{FailurePolicy, Operation};
use crate::error::Result;
use crate::results::{
    BackupDetails, CheckDetails, ExecDetails, LogsDetails, ProvisionDetails, PublishDetails,
    RestoreDetails, SecretDetails, ServiceResult, StartDetails, StopDetails, TestDetails,
    UpdateDetails,
};
use crate::service::ServiceContext;
use crate::strategy::{
    ExecOptions, LogOptions, PlatformStrategy, ProvisionOptions, PublishOptions, SecretAction,
    TestOptions,
};
use crate::types::Command;
use async_trait::async_trait;

macro_rules! plain_operation {
    ($(#[$doc:meta])* $name:ident, $details:ty, $command:ident, $method:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        #[async_trait]
        impl Operation for $name {
            type Details = $details;
            const COMMAND: Command = Command::$command;

            async fn run(
                &self,
                strategy: &dyn PlatformStrategy,
                service: &ServiceContext,
            ) -> Result<ServiceResult<$details>> {
                strategy.$method(service).await
            }
        }
    };
}

plain_operation!(Start, StartDetails, Start, start);
plain_operation!(
    /// Runs in reverse restore order: data services stop last.
    Stop, StopDetails, Stop, stop
);
plain_operation!(Check, CheckDetails, Check, check);
plain_operation!(Update, UpdateDetails, Update, update);
plain_operation!(Backup, BackupDetails, Backup, backup);

#[derive(Debug, Clone, Default)]
pub struct Provision {
    pub options: ProvisionOptions,
}

#[async_trait]
impl Operation for Provision {
    type Details = ProvisionDetails;
    const COMMAND: Command = Command::Provision;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<ProvisionDetails>> {
        strategy.provision(service, &self.options).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Publish {
    pub options: PublishOptions,
}

#[async_trait]
impl Operation for Publish {
    type Details = PublishDetails;
    const COMMAND: Command = Command::Publish;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<PublishDetails>> {
        strategy.publish(service, &self.options).await
    }
}

/// Restores stop at the first service whose restore raises an error unless
/// `force` is set. Soft failures, such as a platform with no restore handler
/// for the service type, do not stop the batch.
#[derive(Debug, Clone)]
pub struct Restore {
    pub backup_id: String,
    pub force: bool,
}

#[async_trait]
impl Operation for Restore {
    type Details = RestoreDetails;
    const COMMAND: Command = Command::Restore;

    fn failure_policy(&self) -> FailurePolicy {
        if self.force {
            FailurePolicy::ContinueOnError
        } else {
            FailurePolicy::StopOnFirstError
        }
    }

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<RestoreDetails>> {
        strategy.restore(service, &self.backup_id).await
    }
}

#[derive(Debug, Clone)]
pub struct Exec {
    pub command: String,
    pub options: ExecOptions,
}

#[async_trait]
impl Operation for Exec {
    type Details = ExecDetails;
    const COMMAND: Command = Command::Exec;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<ExecDetails>> {
        strategy.exec(service, &self.command, &self.options).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Test {
    pub options: TestOptions,
}

#[async_trait]
impl Operation for Test {
    type Details = TestDetails;
    const COMMAND: Command = Command::Test;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<TestDetails>> {
        strategy.test(service, &self.options).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Logs {
    pub options: LogOptions,
}

#[async_trait]
impl Operation for Logs {
    type Details = LogsDetails;
    const COMMAND: Command = Command::Logs;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<LogsDetails>> {
        strategy.collect_logs(service, &self.options).await
    }
}

#[derive(Debug, Clone)]
pub struct Secret {
    pub action: SecretAction,
}

#[async_trait]
impl Operation for Secret {
    type Details = SecretDetails;
    const COMMAND: Command = Command::Secret;

    async fn run(
        &self,
        strategy: &dyn PlatformStrategy,
        service: &ServiceContext,
    ) -> Result<ServiceResult<SecretDetails>> {
        strategy.manage_secret(service, &self.action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_policy_follows_force() {
        let strict = Restore {
            backup_id: "b1".into(),
            force: false,
        };
        assert_eq!(strict.failure_policy(), FailurePolicy::StopOnFirstError);
        let forced = Restore {
            force: true,
            ..strict
        };
        assert_eq!(forced.failure_policy(), FailurePolicy::ContinueOnError);
        assert_eq!(Start.failure_policy(), FailurePolicy::ContinueOnError);
    }

    #[test]
    fn operations_name_their_command() {
        assert_eq!(<Stop as Operation>::COMMAND, Command::Stop);
        assert_eq!(<Logs as Operation>::COMMAND, Command::Logs);
        assert_eq!(<Secret as Operation>::COMMAND, Command::Secret);
    }
}

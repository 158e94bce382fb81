//! Handler descriptors and typed handler signatures.
//!
//! A handler is a plain `fn` that receives a [`HandlerContext`] and returns a
//! boxed future. The [`Handler`] enum wraps one such function per dispatchable
//! command, so the command a descriptor answers to and the result type its
//! handler produces are fixed by the variant rather than by a string key.

use crate::error::Result;
use crate::results::{
    BackupDetails, CheckDetails, HandlerOutput, LogsDetails, ProvisionDetails, PublishDetails,
    RestoreDetails, StartDetails, StopDetails, UpdateDetails,
};
use crate::runner::CommandRunner;
use crate::service::ServiceContext;
use crate::strategy::{LogOptions, ProvisionOptions, PublishOptions};
use crate::types::{Command, Platform, ServiceType};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Operation arguments beyond the service itself.
#[derive(Debug, Clone, Default)]
pub struct OperationArgs {
    pub backup_id: Option<String>,
    pub provision: ProvisionOptions,
    pub publish: PublishOptions,
    pub logs: LogOptions,
}

/// Facts a strategy looked up before dispatch, e.g. CloudFormation stack
/// outputs on AWS or the detected container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredResources(BTreeMap<String, String>);

impl DiscoveredResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for DiscoveredResources {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub struct HandlerContext<'a> {
    pub service: &'a ServiceContext,
    pub platform: Platform,
    pub service_type: ServiceType,
    pub args: &'a OperationArgs,
    pub runner: &'a dyn CommandRunner,
    pub discovered: &'a DiscoveredResources,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub type HandlerFn<D> =
    for<'a> fn(&'a HandlerContext<'a>) -> BoxFuture<'a, Result<HandlerOutput<D>>>;

/// Output types that have a handler variant. Lets generic dispatch code pull
/// the right function pointer out of a [`Handler`].
pub trait HandlerKind: Default + Send + Sized + 'static {
    const COMMAND: Command;
    fn select(handler: &Handler) -> Option<HandlerFn<Self>>;
}

macro_rules! handlers {
    ($($variant:ident => $details:ty),* $(,)?) => {
        #[derive(Clone, Copy)]
        pub enum Handler {
            $($variant(HandlerFn<$details>),)*
        }

        impl Handler {
            pub fn command(&self) -> Command {
                match self {
                    $(Handler::$variant(_) => Command::$variant,)*
                }
            }
        }

        $(
            impl HandlerKind for $details {
                const COMMAND: Command = Command::$variant;

                fn select(handler: &Handler) -> Option<HandlerFn<Self>> {
                    match handler {
                        Handler::$variant(f) => Some(*f),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )*
    };
}

handlers! {
    Start => StartDetails,
    Stop => StopDetails,
    Check => CheckDetails,
    Update => UpdateDetails,
    Provision => ProvisionDetails,
    Publish => PublishDetails,
    Backup => BackupDetails,
    Restore => RestoreDetails,
    Logs => LogsDetails,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.command())
    }
}

// ---------------------------------------------------------------------------
// HandlerKey / HandlerDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub command: Command,
    pub service_type: ServiceType,
}

impl HandlerKey {
    pub fn new(command: Command, service_type: ServiceType) -> Self {
        Self {
            command,
            service_type,
        }
    }

    /// Parse `"command:serviceType"`.
    pub fn parse(operation: &str) -> Option<Self> {
        let (command, service_type) = operation.split_once(':')?;
        Some(Self::new(command.parse().ok()?, service_type.parse().ok()?))
    }

    /// Parse the older `"command-serviceType"` form: the command is the text
    /// before the first dash, the service type is everything after it.
    pub fn parse_legacy(operation: &str) -> Option<Self> {
        let (command, service_type) = operation.split_once('-')?;
        Some(Self::new(command.parse().ok()?, service_type.parse().ok()?))
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.command, self.service_type)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerDescriptor {
    pub platform: Platform,
    pub service_type: ServiceType,
    pub handler: Handler,
    /// The strategy must run resource discovery before invoking the handler.
    pub requires_discovery: bool,
}

impl HandlerDescriptor {
    pub fn new(platform: Platform, service_type: ServiceType, handler: Handler) -> Self {
        Self {
            platform,
            service_type,
            handler,
            requires_discovery: false,
        }
    }

    pub fn with_discovery(mut self) -> Self {
        self.requires_discovery = true;
        self
    }

    pub fn command(&self) -> Command {
        self.handler.command()
    }

    pub fn key(&self) -> HandlerKey {
        HandlerKey::new(self.command(), self.service_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_check<'a>(
        _ctx: &'a HandlerContext<'a>,
    ) -> BoxFuture<'a, Result<HandlerOutput<CheckDetails>>> {
        Box::pin(async { Ok(HandlerOutput::ok(CheckDetails::default())) })
    }

    #[test]
    fn variant_fixes_the_command() {
        let d = HandlerDescriptor::new(Platform::Aws, ServiceType::Rds, Handler::Check(noop_check));
        assert_eq!(d.command(), Command::Check);
        assert_eq!(d.key().to_string(), "check:rds");
        assert!(CheckDetails::select(&d.handler).is_some());
        assert!(StartDetails::select(&d.handler).is_none());
    }

    #[test]
    fn keys_parse_in_both_forms() {
        let expected = HandlerKey::new(Command::Check, ServiceType::EcsFargate);
        assert_eq!(HandlerKey::parse("check:ecs-fargate"), Some(expected));
        assert_eq!(HandlerKey::parse_legacy("check-ecs-fargate"), Some(expected));
        assert_eq!(HandlerKey::parse("check-ecs-fargate"), None);
        assert_eq!(HandlerKey::parse_legacy("check:ecs-fargate"), None);
        assert_eq!(HandlerKey::parse("launch:web"), None);
    }
}

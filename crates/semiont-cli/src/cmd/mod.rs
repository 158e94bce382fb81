pub mod exec;
pub mod handlers;
pub mod secret;

use crate::output::{render, OutputFormat, StderrProgress};
use anyhow::Context;
use semiont_core::commands::{execute, CommandContext, Operation};
use semiont_core::config::{resolve_environment_name, EnvironmentConfig};
use semiont_core::platforms::Platforms;
use semiont_core::service::{ContextFlags, ServiceSelector};
use std::path::Path;

/// The global flags every service command shares.
pub struct Invocation<'a> {
    pub root: &'a Path,
    pub environment: Option<&'a str>,
    pub service: &'a str,
    pub flags: ContextFlags,
    pub output: OutputFormat,
}

impl Invocation<'_> {
    pub fn selector(&self) -> ServiceSelector {
        ServiceSelector::parse(self.service)
    }
}

/// Run one operation across the selected services and print the results.
/// Returns whether every service succeeded.
pub fn run<O: Operation>(inv: &Invocation<'_>, op: O) -> anyhow::Result<bool> {
    let environment = resolve_environment_name(inv.environment, inv.root)?;
    let config = EnvironmentConfig::load(inv.root, &environment)
        .with_context(|| format!("failed to load environment '{environment}'"))?;
    let platforms = Platforms::system().context("failed to build platform strategies")?;
    let reporter = StderrProgress {
        enabled: !inv.flags.quiet && inv.output == OutputFormat::Summary,
    };

    let ctx = CommandContext {
        project_root: inv.root.to_path_buf(),
        config: &config,
        selector: inv.selector(),
        flags: inv.flags,
        platforms: &platforms,
        reporter: &reporter,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(execute(&ctx, &op));
    render(&results, inv.output)?;
    Ok(results.all_succeeded())
}

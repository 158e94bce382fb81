mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{secret::SecretSubcommand, Invocation};
use output::OutputFormat;
use semiont_core::commands::ops;
use semiont_core::service::ContextFlags;
use semiont_core::strategy::{LogOptions, ProvisionOptions, PublishOptions, TestOptions};
use semiont_core::types::Platform;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "semiont",
    about = "Deploy and operate semiont services across local processes, containers, AWS and external hosts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: nearest directory containing semiont.json)
    #[arg(long, global = true, env = "SEMIONT_ROOT")]
    root: Option<PathBuf>,

    /// Environment to act on (reads environments/<ENV>.json)
    #[arg(long, short = 'e', global = true, env = "SEMIONT_ENV")]
    environment: Option<String>,

    /// Service to target, or "all"
    #[arg(long, short = 's', global = true, default_value = "all")]
    service: String,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value_t = OutputFormat::Summary)]
    output: OutputFormat,

    /// Verbose logging
    #[arg(long, short = 'v', global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print results and errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Report what would happen without changing anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services
    Start,

    /// Stop services (data services last)
    Stop,

    /// Report service health
    Check,

    /// Roll services forward to their latest build or image
    Update,

    /// Create (or destroy) the infrastructure services run on
    Provision {
        /// Tear the infrastructure down instead
        #[arg(long)]
        destroy: bool,
    },

    /// Build and publish service artifacts
    Publish {
        /// Image or artifact tag (default: derived from the current time)
        #[arg(long)]
        tag: Option<String>,

        /// Build only; skip pushing to the registry
        #[arg(long)]
        no_push: bool,
    },

    /// Back up stateful services
    Backup,

    /// Restore services from a backup
    Restore {
        /// Backup to restore from
        #[arg(long)]
        backup_id: String,

        /// Keep going after a service fails to restore
        #[arg(long)]
        force: bool,
    },

    /// Run a command inside one service
    Exec {
        /// Attach stdin
        #[arg(long, short = 'i')]
        interactive: bool,

        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run service test suites
    Test {
        /// Suite to run (e.g. unit, integration, smoke)
        #[arg(long)]
        suite: Option<String>,
    },

    /// Fetch recent service logs
    Logs {
        /// Number of lines per service
        #[arg(long, default_value = "100")]
        tail: usize,

        /// Only entries newer than this (RFC 3339, or 30s / 15m / 2h / 1d)
        #[arg(long)]
        since: Option<String>,
    },

    /// Manage service secrets
    Secret {
        #[command(subcommand)]
        subcommand: SecretSubcommand,
    },

    /// List registered platform handlers
    Handlers {
        /// Only this platform
        #[arg(long)]
        platform: Option<Platform>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let inv = Invocation {
        root: &root,
        environment: cli.environment.as_deref(),
        service: &cli.service,
        flags: ContextFlags {
            verbose: cli.verbose,
            quiet: cli.quiet,
            dry_run: cli.dry_run,
        },
        output: cli.output,
    };

    let result = match cli.command {
        Commands::Start => cmd::run(&inv, ops::Start),
        Commands::Stop => cmd::run(&inv, ops::Stop),
        Commands::Check => cmd::run(&inv, ops::Check),
        Commands::Update => cmd::run(&inv, ops::Update),
        Commands::Provision { destroy } => cmd::run(
            &inv,
            ops::Provision {
                options: ProvisionOptions { destroy },
            },
        ),
        Commands::Publish { tag, no_push } => cmd::run(
            &inv,
            ops::Publish {
                options: PublishOptions { tag, no_push },
            },
        ),
        Commands::Backup => cmd::run(&inv, ops::Backup),
        Commands::Restore { backup_id, force } => {
            cmd::run(&inv, ops::Restore { backup_id, force })
        }
        Commands::Exec {
            interactive,
            timeout,
            command,
        } => cmd::exec::run(&inv, &command, interactive, timeout),
        Commands::Test { suite } => cmd::run(
            &inv,
            ops::Test {
                options: TestOptions { suite },
            },
        ),
        Commands::Logs { tail, since } => cmd::run(
            &inv,
            ops::Logs {
                options: LogOptions { tail, since },
            },
        ),
        Commands::Secret { subcommand } => cmd::secret::run(&inv, subcommand),
        Commands::Handlers { platform } => cmd::handlers::run(platform, cli.output),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

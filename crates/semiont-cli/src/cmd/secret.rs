use super::Invocation;
use clap::Subcommand;
use semiont_core::commands::ops::Secret;
use semiont_core::strategy::SecretAction;

#[derive(Subcommand)]
pub enum SecretSubcommand {
    /// Read one secret
    Get { name: String },
    /// Create or overwrite a secret
    Set { name: String, value: String },
    /// List secret names for the service
    List,
    /// Delete a secret
    Delete { name: String },
}

impl From<SecretSubcommand> for SecretAction {
    fn from(sub: SecretSubcommand) -> Self {
        match sub {
            SecretSubcommand::Get { name } => SecretAction::Get { name },
            SecretSubcommand::Set { name, value } => SecretAction::Set { name, value },
            SecretSubcommand::List => SecretAction::List,
            SecretSubcommand::Delete { name } => SecretAction::Delete { name },
        }
    }
}

pub fn run(inv: &Invocation<'_>, subcmd: SecretSubcommand) -> anyhow::Result<bool> {
    super::run(
        inv,
        Secret {
            action: subcmd.into(),
        },
    )
}

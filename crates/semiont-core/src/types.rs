use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Process,
    Container,
    Aws,
    External,
    Mock,
}

impl Platform {
    pub fn all() -> &'static [Platform] {
        &[
            Platform::Process,
            Platform::Container,
            Platform::Aws,
            Platform::External,
            Platform::Mock,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Process => "process",
            Platform::Container => "container",
            Platform::Aws => "aws",
            Platform::External => "external",
            Platform::Mock => "mock",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = crate::error::SemiontError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" | "posix" => Ok(Platform::Process),
            "container" | "docker" | "podman" => Ok(Platform::Container),
            "aws" => Ok(Platform::Aws),
            "external" => Ok(Platform::External),
            "mock" => Ok(Platform::Mock),
            _ => Err(crate::error::SemiontError::UnknownPlatform(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Start,
    Stop,
    Check,
    Update,
    Provision,
    Publish,
    Backup,
    Restore,
    Exec,
    Test,
    Logs,
    Secret,
}

impl Command {
    pub fn all() -> &'static [Command] {
        &[
            Command::Start,
            Command::Stop,
            Command::Check,
            Command::Update,
            Command::Provision,
            Command::Publish,
            Command::Backup,
            Command::Restore,
            Command::Exec,
            Command::Test,
            Command::Logs,
            Command::Secret,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Check => "check",
            Command::Update => "update",
            Command::Provision => "provision",
            Command::Publish => "publish",
            Command::Backup => "backup",
            Command::Restore => "restore",
            Command::Exec => "exec",
            Command::Test => "test",
            Command::Logs => "logs",
            Command::Secret => "secret",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = crate::error::SemiontError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::error::SemiontError::UnknownCommand(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ServiceName
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Frontend,
    Backend,
    Database,
    Filesystem,
    Agent,
    Mcp,
}

impl ServiceName {
    pub fn all() -> &'static [ServiceName] {
        &[
            ServiceName::Frontend,
            ServiceName::Backend,
            ServiceName::Database,
            ServiceName::Filesystem,
            ServiceName::Agent,
            ServiceName::Mcp,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Frontend => "frontend",
            ServiceName::Backend => "backend",
            ServiceName::Database => "database",
            ServiceName::Filesystem => "filesystem",
            ServiceName::Agent => "agent",
            ServiceName::Mcp => "mcp",
        }
    }

    /// Capitalised form used in CloudFormation output keys (`BackendServiceName`).
    pub fn title(self) -> &'static str {
        match self {
            ServiceName::Frontend => "Frontend",
            ServiceName::Backend => "Backend",
            ServiceName::Database => "Database",
            ServiceName::Filesystem => "Filesystem",
            ServiceName::Agent => "Agent",
            ServiceName::Mcp => "Mcp",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceName {
    type Err = crate::error::SemiontError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::all()
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| crate::error::SemiontError::UnknownService(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ServiceType
// ---------------------------------------------------------------------------

/// Platform-specific technology discriminator used to pick among several
/// handlers registered for the same platform and command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Generic,
    Web,
    Database,
    Filesystem,
    EcsFargate,
    Lambda,
    Rds,
    Efs,
    S3Cloudfront,
}

impl ServiceType {
    pub fn all() -> &'static [ServiceType] {
        &[
            ServiceType::Generic,
            ServiceType::Web,
            ServiceType::Database,
            ServiceType::Filesystem,
            ServiceType::EcsFargate,
            ServiceType::Lambda,
            ServiceType::Rds,
            ServiceType::Efs,
            ServiceType::S3Cloudfront,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Generic => "generic",
            ServiceType::Web => "web",
            ServiceType::Database => "database",
            ServiceType::Filesystem => "filesystem",
            ServiceType::EcsFargate => "ecs-fargate",
            ServiceType::Lambda => "lambda",
            ServiceType::Rds => "rds",
            ServiceType::Efs => "efs",
            ServiceType::S3Cloudfront => "s3-cloudfront",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = crate::error::SemiontError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::error::SemiontError::UnknownServiceType(s.to_string()))
    }
}

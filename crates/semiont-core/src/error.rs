use thiserror::Error;

#[derive(Debug, Error)]
pub enum SemiontError {
    #[error("environment '{name}' not found; available environments: {available}")]
    EnvironmentNotFound { name: String, available: String },

    #[error("no environment specified: pass --environment or set SEMIONT_ENV (available: {0})")]
    NoEnvironment(String),

    #[error("service '{name}' is not configured in environment '{environment}'; available: {available}")]
    ServiceNotConfigured {
        name: String,
        environment: String,
        available: String,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("no strategy available for platform '{0}'")]
    StrategyUnavailable(String),

    #[error("handler already registered for {platform} {key}")]
    DuplicateHandler { platform: String, key: String },

    #[error("descriptor for {key} declares platform '{declared}' but was registered under '{expected}'")]
    PlatformMismatch {
        key: String,
        declared: String,
        expected: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("'{program}' timed out after {seconds}s")]
    CommandTimeout { program: String, seconds: u64 },

    #[error("'{program}' exited with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("no container runtime found (tried docker, podman)")]
    NoContainerRuntime,

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SemiontError>;

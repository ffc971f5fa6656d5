/// All errors possible to occur in the manager and the VPN hooks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `redis` crate
    #[error("redis error: {source}")]
    RedisError {
        #[from]
        source: redis::RedisError,
    },

    /// Any error originating from the `bollard` crate
    #[error("docker error: {source}")]
    DockerError {
        #[from]
        source: bollard::errors::Error,
    },

    #[error("i/o error: {source}")]
    IOError {
        #[from]
        source: std::io::Error,
    },

    /// Environment variable error
    #[error("missing environment variable: {source}")]
    EnvError {
        #[from]
        source: std::env::VarError,
    },

    /// Invalid or unparseable configuration value. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A subprocess exited non-zero (or died on a signal). Carries the
    /// captured output for classification with [`ErrorMatch`](crate::cmd::ErrorMatch).
    #[error("command `{command}` failed with exit code {exit_code:?}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// The composition's default network does not exist in the container
    /// runtime, so there is no bridge to attach to.
    #[error("no default network is up for {project}")]
    MissingNetwork { project: String },

    /// An entity (or a required field of it) vanished between the
    /// notification and the handler reading it. Expected during teardown
    /// races; handlers treat this as a clean end of turn.
    #[error("missing entity field: {key}")]
    MissingEntity { key: String },

    /// Could not acquire an advisory lock within its lease duration.
    #[error("timed out acquiring lock {key}")]
    LockTimeout { key: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A notification channel did not parse as the key shape the handler
    /// was registered for.
    #[error("invalid channel key: {0}")]
    InvalidKey(String),

    /// A stored state value does not match any known state.
    #[error("invalid state value for {key}: {value}")]
    InvalidState { key: String, value: String },

    /// A precondition on entity state was not met.
    #[error("{0}")]
    StateError(String),

    /// Every candidate vlan id collided with an allocated one.
    #[error("no free vlan id after {attempts} attempts")]
    VlanExhausted { attempts: u32 },
}

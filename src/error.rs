use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaferayError {
    #[error("Failed to run {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Xray rules not installed. Run 'saferay xray install' first")]
    RulesNotInstalled,

    #[error("saferay not installed. Run 'saferay install' first")]
    NotInstalled,

    #[error("Could not detect active network service")]
    NoNetworkService,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SaferayError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("connection '{0}' has no configuration")]
    UnknownConnection(String),

    #[error("failed to start plugin instance '{instance}': {reason}")]
    PluginStart { instance: String, reason: String },

    #[error("plugin instance '{instance}' is incompatible: {reason}")]
    IncompatiblePlugin { instance: String, reason: String },

    #[error("timed out after {secs}s waiting for plugin instance '{instance}' to start")]
    StartTimeout { instance: String, secs: u64 },

    #[error("gave up starting plugin instance '{instance}' after {attempts} attempts")]
    StartRetriesExhausted { instance: String, attempts: u32 },

    #[error("plugin manager is shutting down")]
    ShuttingDown,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("plugin rpc failed: {0}")]
    Rpc(String),

    #[error("failed to push connection config: {}", .0.join("; "))]
    ConfigPush(Vec<String>),

    #[error("invalid limiter '{name}': {reason}")]
    InvalidLimiter { name: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<rkyv::rancor::Error> for FleetError {
    fn from(e: rkyv::rancor::Error) -> Self {
        FleetError::Rpc(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_push_joins_instance_errors() {
        let err = FleetError::ConfigPush(vec!["aws: refused".into(), "gcp: timeout".into()]);
        assert_eq!(
            err.to_string(),
            "failed to push connection config: aws: refused; gcp: timeout"
        );
    }

    #[test]
    fn start_failure_names_instance() {
        let err = FleetError::PluginStart {
            instance: "aws".into(),
            reason: "exec format error".into(),
        };
        assert!(err.to_string().contains("'aws'"));
    }
}

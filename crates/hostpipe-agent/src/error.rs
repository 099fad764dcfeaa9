use thiserror::Error;

use crate::config::ConfigError;

/// Top-level errors surfaced by the agent orchestrator. Everything below
/// boot (collection ticks, send attempts) is handled in place and reported
/// through logs and counters instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build export transport: {0}")]
    Transport(String),

    #[error("failed to open disk buffer: {0}")]
    Buffer(#[source] std::io::Error),

    #[error("failed to bind health server on port {port}: {source}")]
    HealthBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let err = AgentError::HealthBind {
            port: 13133,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("13133"));

        let err = AgentError::Transport("bad endpoint".into());
        assert_eq!(
            err.to_string(),
            "failed to build export transport: bad endpoint"
        );
    }
}

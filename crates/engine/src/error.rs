//! Error taxonomy for the irrigation engine.

/// Failures surfaced by the weather providers, the action invoker and the
/// engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{what} request failed with status {status}: {body}")]
    Status {
        what: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("action '{action}' failed: {message}")]
    Dispatch { action: String, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("snapshot store failed: {0}")]
    Store(String),
    #[error("station {0} is already sprinkling")]
    StationBusy(usize),
    #[error("weather provider is disabled")]
    WeatherDisabled,
}

impl ControllerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Network, status and decode failures, plus remote dispatch errors.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Status { .. } | Self::Decode { .. } | Self::Dispatch { .. }
        )
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_is_connectivity() {
        let err = ControllerError::Dispatch {
            action: "stop_sprinkle".into(),
            message: "timeout".into(),
        };
        assert!(err.is_connectivity());
        assert_eq!(err.to_string(), "action 'stop_sprinkle' failed: timeout");
    }

    #[test]
    fn config_is_not_connectivity() {
        let err = ControllerError::config("no switch entity configured for station 4");
        assert!(!err.is_connectivity());
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}

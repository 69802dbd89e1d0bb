//! Error taxonomy for the display server.
//!
//! Routing a message to a topic the target plugin never declared is not an
//! error and has no variant here; the router drops such messages.

use std::fmt;

/// Errors surfaced by the display server and its components.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayError {
    /// Malformed setup JSON, missing calibration, or invalid settings.
    Configuration(String),
    /// No discovered plugin carries the requested name.
    PluginNotFound(String),
    /// Introspection asked for a topic the plugin does not declare.
    TopicNotFound { plugin: String, topic: String },
    /// A plugin handler failed while processing a delivered payload.
    MessageHandling {
        plugin: String,
        topic: String,
        reason: String,
    },
    /// Calibration could not be read or parsed.
    GeometryLoad(String),
    /// A requested capture could not be written.
    Capture(String),
    /// A lifecycle operation was called in the wrong state.
    InvalidState(String),
    /// GPU presenter setup or readback failed.
    Gpu(String),
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            DisplayError::PluginNotFound(name) => write!(f, "plugin not found: '{}'", name),
            DisplayError::TopicNotFound { plugin, topic } => {
                write!(f, "plugin '{}' does not declare topic '{}'", plugin, topic)
            }
            DisplayError::MessageHandling {
                plugin,
                topic,
                reason,
            } => write!(
                f,
                "plugin '{}' failed to handle message on '{}': {}",
                plugin, topic, reason
            ),
            DisplayError::GeometryLoad(msg) => write!(f, "calibration load failed: {}", msg),
            DisplayError::Capture(msg) => write!(f, "capture failed: {}", msg),
            DisplayError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            DisplayError::Gpu(msg) => write!(f, "gpu error: {}", msg),
        }
    }
}

impl std::error::Error for DisplayError {}

pub type Result<T> = std::result::Result<T, DisplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = DisplayError::MessageHandling {
            plugin: "A".to_string(),
            topic: "pose".to_string(),
            reason: "bad payload".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("'A'"));
        assert!(text.contains("'pose'"));
        assert!(text.contains("bad payload"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err: anyhow::Error = DisplayError::PluginNotFound("missing".into()).into();
        assert_eq!(err.to_string(), "plugin not found: 'missing'");
    }
}

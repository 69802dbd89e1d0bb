//! Stimulus plugins and their dispatch.
//!
//! A stimulus plugin supplies the 3D world and 2D overlay for the display and
//! reacts to JSON messages on the topics it declares. Plugins are discovered
//! once by the [`StimulusRegistry`] and addressed through the [`TopicRouter`].

pub mod builtin;
pub mod registry;
pub mod router;
pub mod scene;
pub mod script;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

pub use registry::{PluginLoadFailure, StimulusRegistry};
pub use router::{MessageEnvelope, TopicRouter};
pub use scene::{HudElement, HudLayer, WorldPrimitive, WorldScene};

/// A topic a plugin listens on, with the message type clients should send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDeclaration {
    pub topic: String,
    pub message_type: String,
}

impl TopicDeclaration {
    pub fn new(topic: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message_type: message_type.into(),
        }
    }
}

/// Capability interface every stimulus implements.
///
/// Instances are created once at discovery and live as long as the registry,
/// so state set while inactive survives activation switches.
pub trait StimulusPlugin {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Declared topics, in declaration order.
    fn topics(&self) -> &[TopicDeclaration];

    /// Handle a payload on one of the declared topics.
    ///
    /// Payload interpretation is entirely up to the plugin. Errors are
    /// reported back to the dispatcher, which logs them.
    fn receive_json_message(&mut self, topic: &str, json: &str) -> anyhow::Result<()>;

    /// Advance to `time` (seconds) with the current observer pose.
    fn update(&mut self, time: f64, position: Vec3, orientation: Quat);

    fn world(&self) -> &WorldScene;

    fn hud(&self) -> &HudLayer;
}

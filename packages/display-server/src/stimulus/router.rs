//! Topic tables and message routing.
//!
//! The router snapshots every plugin's declared topics when it is built, so
//! topic lists and message types are stable for the life of the process no
//! matter which plugin is active.
//!
//! A message on a topic the target plugin does not declare is dropped without
//! error and without calling the handler. Callers rely on unaddressed topics
//! being harmless.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::registry::StimulusRegistry;
use super::TopicDeclaration;
use crate::error::{DisplayError, Result};

/// One line of a message stream: a payload for a topic, optionally
/// addressed to a named plugin instead of the active one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub plugin: Option<String>,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Frame before which the message is delivered. Absent means frame 0.
    #[serde(default)]
    pub frame: Option<u64>,
}

impl MessageEnvelope {
    pub fn parse_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Per-plugin topic table.
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    tables: HashMap<String, Vec<TopicDeclaration>>,
}

impl TopicRouter {
    pub fn new(registry: &StimulusRegistry) -> Self {
        let tables = registry
            .plugins()
            .map(|p| (p.name().to_string(), p.topics().to_vec()))
            .collect();
        Self { tables }
    }

    pub fn topics_of(&self, plugin: &str) -> Result<Vec<String>> {
        self.table(plugin)
            .map(|topics| topics.iter().map(|t| t.topic.clone()).collect())
    }

    pub fn message_type_of(&self, plugin: &str, topic: &str) -> Result<String> {
        self.table(plugin)?
            .iter()
            .find(|t| t.topic == topic)
            .map(|t| t.message_type.clone())
            .ok_or_else(|| DisplayError::TopicNotFound {
                plugin: plugin.to_string(),
                topic: topic.to_string(),
            })
    }

    pub fn declares(&self, plugin: &str, topic: &str) -> bool {
        self.tables
            .get(plugin)
            .map_or(false, |topics| topics.iter().any(|t| t.topic == topic))
    }

    /// Deliver to the active plugin. Undeclared topics are dropped.
    pub fn route_to_active(
        &self,
        registry: &mut StimulusRegistry,
        topic: &str,
        json: &str,
    ) -> Result<()> {
        let plugin = registry.current_active_name().to_string();
        self.deliver(registry, &plugin, topic, json)
    }

    /// Deliver to `plugin` whether or not it is active. Unknown plugins are
    /// an error; undeclared topics are dropped.
    pub fn route_to_named(
        &self,
        registry: &mut StimulusRegistry,
        plugin: &str,
        topic: &str,
        json: &str,
    ) -> Result<()> {
        self.table(plugin)?;
        self.deliver(registry, plugin, topic, json)
    }

    fn deliver(
        &self,
        registry: &mut StimulusRegistry,
        plugin: &str,
        topic: &str,
        json: &str,
    ) -> Result<()> {
        if !self.declares(plugin, topic) {
            log::debug!("Dropping message for undeclared topic '{}' on '{}'", topic, plugin);
            return Ok(());
        }
        let target = registry
            .get_mut(plugin)
            .ok_or_else(|| DisplayError::PluginNotFound(plugin.to_string()))?;
        target
            .receive_json_message(topic, json)
            .map_err(|e| DisplayError::MessageHandling {
                plugin: plugin.to_string(),
                topic: topic.to_string(),
                reason: format!("{:#}", e),
            })
    }

    fn table(&self, plugin: &str) -> Result<&[TopicDeclaration]> {
        self.tables
            .get(plugin)
            .map(|topics| topics.as_slice())
            .ok_or_else(|| DisplayError::PluginNotFound(plugin.to_string()))
    }
}

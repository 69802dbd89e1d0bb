//! Discovery and activation of stimulus plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::builtin::{PluginConstructor, BUILTIN_PLUGINS};
use super::script::ScriptStimulus;
use super::StimulusPlugin;
use crate::error::{DisplayError, Result};

/// File extension of script plugins on the plugin path.
pub const SCRIPT_EXTENSION: &str = "rhai";

/// A plugin that could not be loaded during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginLoadFailure {
    /// File or built-in the failure came from.
    pub source: PathBuf,
    pub reason: String,
}

/// Every discovered plugin instance, plus which one is active.
///
/// Instances are created once and never dropped while the registry lives.
/// The active plugin is an index into the registry rather than global state.
pub struct StimulusRegistry {
    plugins: Vec<Box<dyn StimulusPlugin>>,
    index: HashMap<String, usize>,
    active: usize,
    load_failures: Vec<PluginLoadFailure>,
}

impl std::fmt::Debug for StimulusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StimulusRegistry")
            .field("plugins", &self.list_plugin_names())
            .field("active", &self.current_active_name())
            .field("load_failures", &self.load_failures)
            .finish()
    }
}

impl StimulusRegistry {
    /// Register the built-in plugins, then every script on `plugin_path`
    /// in file-name order.
    pub fn discover(plugin_path: Option<&Path>) -> Self {
        let mut builder = RegistryBuilder::default();
        builder.add_constructors(BUILTIN_PLUGINS);
        if let Some(dir) = plugin_path {
            builder.scan_scripts(dir);
        }
        builder.finish()
    }

    /// Build a registry from explicit instances, in order. Duplicate names
    /// after the first are recorded as load failures.
    pub fn from_plugins(plugins: Vec<Box<dyn StimulusPlugin>>) -> Self {
        let mut builder = RegistryBuilder::default();
        for plugin in plugins {
            builder.push(plugin, PathBuf::from("<instance>"));
        }
        builder.finish()
    }

    pub fn list_plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Make `name` the active plugin. The previous one stays instantiated.
    /// An unknown name leaves the active plugin unchanged.
    pub fn activate(&mut self, name: &str) -> Result<()> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| DisplayError::PluginNotFound(name.to_string()))?;
        if idx != self.active {
            log::info!(
                "Stimulus '{}' -> '{}'",
                self.plugins[self.active].name(),
                name
            );
            self.active = idx;
        }
        Ok(())
    }

    pub fn current_active_name(&self) -> &str {
        self.plugins[self.active].name()
    }

    pub fn active(&self) -> &dyn StimulusPlugin {
        self.plugins[self.active].as_ref()
    }

    pub fn active_mut(&mut self) -> &mut dyn StimulusPlugin {
        self.plugins[self.active].as_mut()
    }

    pub fn get(&self, name: &str) -> Option<&dyn StimulusPlugin> {
        self.index.get(name).map(|&i| self.plugins[i].as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn StimulusPlugin> {
        match self.index.get(name) {
            Some(&i) => Some(self.plugins[i].as_mut()),
            None => None,
        }
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn StimulusPlugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn load_failures(&self) -> &[PluginLoadFailure] {
        &self.load_failures
    }
}

#[derive(Default)]
struct RegistryBuilder {
    plugins: Vec<Box<dyn StimulusPlugin>>,
    index: HashMap<String, usize>,
    load_failures: Vec<PluginLoadFailure>,
}

impl RegistryBuilder {
    fn add_constructors(&mut self, constructors: &[PluginConstructor]) {
        for ctor in constructors {
            self.push(ctor(), PathBuf::from("<builtin>"));
        }
    }

    fn scan_scripts(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.fail(dir.to_path_buf(), format!("cannot read plugin path: {}", e));
                return;
            }
        };

        let mut scripts: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(SCRIPT_EXTENSION)
            })
            .collect();
        scripts.sort();

        for path in scripts {
            match ScriptStimulus::load(&path) {
                Ok(stimulus) => self.push(Box::new(stimulus), path),
                Err(reason) => self.fail(path, reason),
            }
        }
    }

    fn push(&mut self, plugin: Box<dyn StimulusPlugin>, source: PathBuf) {
        let name = plugin.name().to_string();
        if self.index.contains_key(&name) {
            self.fail(source, format!("duplicate plugin name '{}'", name));
            return;
        }
        log::info!("Discovered stimulus '{}' from {}", name, source.display());
        self.index.insert(name, self.plugins.len());
        self.plugins.push(plugin);
    }

    fn fail(&mut self, source: PathBuf, reason: String) {
        log::warn!("Skipping plugin {}: {}", source.display(), reason);
        self.load_failures.push(PluginLoadFailure { source, reason });
    }

    fn finish(mut self) -> StimulusRegistry {
        if self.plugins.is_empty() {
            // The active index must always point at a live instance.
            self.push(
                Box::new(super::builtin::StandbyStimulus::new()),
                PathBuf::from("<fallback>"),
            );
        }
        StimulusRegistry {
            plugins: self.plugins,
            index: self.index,
            active: 0,
            load_failures: self.load_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::builtin::{CylinderGratingStimulus, DemoStimulus, StandbyStimulus};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ds-registry-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_builtins_come_first_and_first_is_active() {
        let registry = StimulusRegistry::discover(None);
        assert_eq!(
            registry.list_plugin_names(),
            vec![
                StandbyStimulus::NAME,
                CylinderGratingStimulus::NAME,
                DemoStimulus::NAME
            ]
        );
        assert_eq!(registry.current_active_name(), StandbyStimulus::NAME);
        assert!(registry.load_failures().is_empty());
    }

    #[test]
    fn test_activate_unknown_keeps_previous() {
        let mut registry = StimulusRegistry::discover(None);
        registry.activate(DemoStimulus::NAME).unwrap();
        let err = registry.activate("Nope").unwrap_err();
        assert_eq!(err, DisplayError::PluginNotFound("Nope".into()));
        assert_eq!(registry.current_active_name(), DemoStimulus::NAME);
    }

    #[test]
    fn test_scripts_discovered_in_order_and_failures_recorded() {
        let dir = temp_dir("scan");
        std::fs::write(
            dir.join("b_second.rhai"),
            r#"fn describe() { #{ name: "Second", topics: [] } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("a_first.rhai"),
            r#"fn describe() { #{ name: "First", topics: [] } }"#,
        )
        .unwrap();
        std::fs::write(dir.join("broken.rhai"), "fn describe( {").unwrap();
        std::fs::write(
            dir.join("dup.rhai"),
            r#"fn describe() { #{ name: "StimulusStandby" } }"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = StimulusRegistry::discover(Some(&dir));
        let names = registry.list_plugin_names();
        assert_eq!(&names[3..], &["First".to_string(), "Second".to_string()]);

        let failed: Vec<_> = registry
            .load_failures()
            .iter()
            .map(|f| f.source.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(failed, vec!["broken.rhai", "dup.rhai"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_plugin_path_is_not_fatal() {
        let registry = StimulusRegistry::discover(Some(Path::new("/definitely/not/here")));
        assert_eq!(registry.list_plugin_names().len(), BUILTIN_PLUGINS.len());
        assert_eq!(registry.load_failures().len(), 1);
    }
}

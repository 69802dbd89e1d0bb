//! Server and viewer configuration.
//!
//! Both documents are JSON with snake_case keys. Every field has a default so
//! an empty object is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DisplayError, Result};

/// What the viewer shows each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Capture, warp through the calibration, overlay the HUD.
    #[default]
    VrDisplay,
    /// Cross layout of the six captured faces.
    Cubemap,
    /// The warped layer alone, before HUD and colour correction.
    GeometryTexture,
    /// Perspective view of the world from the trackball manipulator.
    VirtualWorld,
}

impl DisplayMode {
    /// Modes that project through the calibration need one loaded at setup.
    pub fn requires_calibration(&self) -> bool {
        matches!(self, DisplayMode::VrDisplay | DisplayMode::GeometryTexture)
    }
}

fn default_observer_radius() -> f32 {
    0.01
}

fn default_cubemap_resolution() -> u32 {
    512
}

/// Process-level configuration, fixed for the lifetime of a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayServerConfig {
    /// Directory scanned for `*.rhai` stimulus plugins.
    #[serde(default)]
    pub plugin_path: Option<PathBuf>,
    #[serde(default)]
    pub mode: DisplayMode,
    /// Radius of the observer marker in the virtual-world view.
    #[serde(default = "default_observer_radius")]
    pub observer_radius: f32,
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
    /// Warp to an offscreen texture, then correct colour after the HUD.
    #[serde(default)]
    pub two_pass: bool,
    /// Render calibration coordinates instead of scene content.
    #[serde(default)]
    pub show_geom_coords: bool,
    /// Keep the capture origin fixed at the world origin.
    #[serde(default)]
    pub tethered_mode: bool,
    /// Edge length in texels of each cubemap face.
    #[serde(default = "default_cubemap_resolution")]
    pub cubemap_resolution: u32,
    /// Plugin to activate after discovery. Defaults to the first discovered.
    #[serde(default)]
    pub initial_stimulus: Option<String>,
}

impl Default for DisplayServerConfig {
    fn default() -> Self {
        Self {
            plugin_path: None,
            mode: DisplayMode::default(),
            observer_radius: default_observer_radius(),
            calibration_file: None,
            two_pass: false,
            show_geom_coords: false,
            tethered_mode: false,
            cubemap_resolution: default_cubemap_resolution(),
            initial_stimulus: None,
        }
    }
}

impl DisplayServerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DisplayError::Configuration(format!("server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. Relative plugin and calibration paths resolve
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DisplayError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json(&text)?;
        if let Some(base) = path.parent() {
            config.plugin_path = config.plugin_path.map(|p| resolve(base, p));
            config.calibration_file = config.calibration_file.map(|p| resolve(base, p));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.observer_radius.is_finite() && self.observer_radius > 0.0) {
            return Err(DisplayError::Configuration(format!(
                "observer_radius must be positive, got {}",
                self.observer_radius
            )));
        }
        if self.cubemap_resolution == 0 || self.cubemap_resolution > 8192 {
            return Err(DisplayError::Configuration(format!(
                "cubemap_resolution must be within 1..=8192, got {}",
                self.cubemap_resolution
            )));
        }
        Ok(())
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StereoMode {
    #[default]
    Mono,
    Stereo,
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_true() -> bool {
    true
}

/// Viewer and window setup, consumed once by `setup_viewer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub fullscreen: bool,
    #[serde(default)]
    pub stereo: StereoMode,
    #[serde(default)]
    pub window_name: Option<String>,
    #[serde(default = "default_true")]
    pub cursor_visible: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fullscreen: false,
            stereo: StereoMode::default(),
            window_name: None,
            cursor_visible: true,
        }
    }
}

impl ViewerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DisplayError::Configuration(format!("viewer config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DisplayError::Configuration(format!(
                "viewer size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

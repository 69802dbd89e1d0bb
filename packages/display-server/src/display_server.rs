//! The display server façade.
//!
//! Owns plugin discovery, topic routing, the observer pose, the calibration
//! slot and the capture/projection/composite passes, and drives them once per
//! `update` + `frame` cycle.
//!
//! Lifecycle: `Uninitialized` until `setup_viewer` succeeds, `Configured`
//! until the first frame, `Running` while frames are produced, and `Done`
//! once the viewer asks to close. Nothing leaves `Done`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use glam::{Quat, Vec3};
use image::{imageops, Rgba, Rgba32FImage};
use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationGeometry, CalibrationSlot, CalibrationSource};
use crate::compositor::{ColorCorrection, DisplayCompositor, PoseRecord, SceneDescriptor};
use crate::config::{DisplayMode, DisplayServerConfig, ViewerConfig};
use crate::cubemap::{Cubemap, CubemapCapturePass};
use crate::display_geometry::DisplaySurfaceModel;
use crate::error::{DisplayError, Result};
use crate::manipulator::{ManipulatorState, TrackballManipulator};
use crate::observer::{ObserverPoseSample, ObserverPosition, ObserverUniform};
use crate::projection::{GeometryProjectionPass, RenderPassMode};
use crate::stimulus::{
    PluginLoadFailure, StimulusRegistry, TopicRouter, WorldPrimitive, WorldScene,
};
use crate::viewer::Viewer;

const DEFAULT_WINDOW_NAME: &str = "display-server";

/// Vertical field of view of the virtual-world preview, in radians.
const PREVIEW_FOV_Y: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Configured,
    Running,
    Done,
}

/// Viewer geometry and camera state saved between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub width: u32,
    pub height: u32,
    pub manipulator: ManipulatorState,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

pub struct DisplayServer {
    config: DisplayServerConfig,
    state: Lifecycle,
    registry: StimulusRegistry,
    router: TopicRouter,
    observer: Arc<ObserverPosition>,
    calibration: Arc<CalibrationSlot>,
    capture_pass: CubemapCapturePass,
    cubemap: Cubemap,
    projection: GeometryProjectionPass,
    compositor: DisplayCompositor,
    manipulator: TrackballManipulator,
    viewer: Option<Box<dyn Viewer>>,
    size: (u32, u32),
    time: f64,
    update_pending: bool,
    frame_count: u64,
    handler_failures: u64,
    last_frame: Option<Rgba32FImage>,
    observer_uniform: ObserverUniform,
}

impl DisplayServer {
    /// Discover plugins and prepare the passes. No viewer yet.
    pub fn new(config: DisplayServerConfig) -> Result<Self> {
        let registry = StimulusRegistry::discover(config.plugin_path.as_deref());
        Self::with_registry(config, registry)
    }

    /// Use an already-built registry instead of discovering one.
    pub fn with_registry(config: DisplayServerConfig, mut registry: StimulusRegistry) -> Result<Self> {
        config.validate()?;
        if let Some(name) = &config.initial_stimulus {
            registry.activate(name).map_err(|_| {
                DisplayError::Configuration(format!("initial stimulus '{}' was not discovered", name))
            })?;
        }
        let router = TopicRouter::new(&registry);
        let viewer_defaults = ViewerConfig::default();

        log::info!(
            "Display server: mode {:?}, {} pass, {} plugins, active '{}'",
            config.mode,
            if config.two_pass { "two" } else { "one" },
            registry.list_plugin_names().len(),
            registry.current_active_name()
        );

        Ok(Self {
            capture_pass: CubemapCapturePass::new(config.cubemap_resolution),
            cubemap: Cubemap::new(config.cubemap_resolution),
            projection: GeometryProjectionPass::new(RenderPassMode::from_two_pass(config.two_pass)),
            compositor: DisplayCompositor::new(DEFAULT_WINDOW_NAME),
            manipulator: TrackballManipulator::new(),
            observer: Arc::new(ObserverPosition::default()),
            calibration: Arc::new(CalibrationSlot::default()),
            viewer: None,
            size: (viewer_defaults.width, viewer_defaults.height),
            state: Lifecycle::Uninitialized,
            time: 0.0,
            update_pending: false,
            frame_count: 0,
            handler_failures: 0,
            last_frame: None,
            observer_uniform: ObserverUniform::zeroed(),
            registry,
            router,
            config,
        })
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn config(&self) -> &DisplayServerConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Configure the viewer and load the calibration. On any failure the
    /// server stays `Uninitialized` with nothing installed.
    pub fn setup_viewer(&mut self, mut viewer: Box<dyn Viewer>, json_config: &str) -> Result<()> {
        if self.state != Lifecycle::Uninitialized {
            return Err(DisplayError::InvalidState(format!(
                "setup_viewer called in state {:?}",
                self.state
            )));
        }
        let viewer_config = ViewerConfig::from_json(json_config)?;
        let size = (viewer_config.width, viewer_config.height);

        let geometry = match &self.config.calibration_file {
            Some(path) => Some(
                CalibrationGeometry::load_file(path, size.0, size.1)
                    .map_err(|e| DisplayError::Configuration(e.to_string()))?
                    .with_debug_requested(self.config.show_geom_coords),
            ),
            None => match self.calibration.snapshot() {
                Some(existing) => Some(
                    existing
                        .resized(size.0, size.1)
                        .map_err(|e| DisplayError::Configuration(e.to_string()))?,
                ),
                None => None,
            },
        };
        if geometry.is_none() && self.config.mode.requires_calibration() {
            return Err(DisplayError::Configuration(format!(
                "mode {:?} needs a calibration_file",
                self.config.mode
            )));
        }

        viewer.configure(&viewer_config)?;
        let window_name = viewer_config
            .window_name
            .clone()
            .unwrap_or_else(|| DEFAULT_WINDOW_NAME.to_string());
        viewer.set_window_name(&window_name);
        viewer.set_cursor_visible(viewer_config.cursor_visible);
        if viewer_config.stereo == crate::config::StereoMode::Stereo {
            log::warn!("Stereo requested; both eyes share the single observer capture");
        }
        if viewer_config.fullscreen {
            log::warn!("Fullscreen requested; the viewer is shown at {}x{}", size.0, size.1);
        }

        // Everything succeeded; commit.
        if let Some(geometry) = geometry {
            self.calibration.replace(geometry);
        }
        self.compositor.set_window_name(window_name);
        self.compositor.set_cursor_visible(viewer_config.cursor_visible);
        self.viewer = Some(viewer);
        self.size = size;
        self.state = Lifecycle::Configured;
        log::info!("Viewer configured at {}x{}", size.0, size.1);
        Ok(())
    }

    /// Store the pose and advance the active plugin. Must precede each frame.
    pub fn update(&mut self, time: f64, position: Vec3, orientation: Quat) -> Result<()> {
        if self.state == Lifecycle::Done {
            return Err(DisplayError::InvalidState("update after done".to_string()));
        }
        self.observer.store(ObserverPoseSample {
            position,
            orientation,
            timestamp: time,
        });
        self.time = time;
        self.registry.active_mut().update(time, position, orientation);
        self.update_pending = true;
        Ok(())
    }

    /// Capture, project, composite and present one frame, then service any
    /// pending capture request.
    pub fn frame(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Uninitialized => {
                return Err(DisplayError::InvalidState("frame before setup_viewer".to_string()))
            }
            Lifecycle::Done => {
                return Err(DisplayError::InvalidState("frame after done".to_string()))
            }
            Lifecycle::Configured | Lifecycle::Running => {}
        }
        if !self.update_pending {
            return Err(DisplayError::InvalidState(
                "update must be called before each frame".to_string(),
            ));
        }
        self.state = Lifecycle::Running;

        // One snapshot of each shared value for the whole frame.
        let (pose, uniform) = self.observer.tick(self.frame_count);
        self.observer_uniform = uniform;
        let geometry = self.current_geometry()?;
        let origin = if self.config.tethered_mode {
            Vec3::ZERO
        } else {
            pose.position
        };

        let image = self.render(origin, pose.position, geometry.as_deref())?;

        let viewer = self
            .viewer
            .as_mut()
            .ok_or_else(|| DisplayError::InvalidState("no viewer installed".to_string()))?;
        viewer.present(&image)?;
        self.compositor.record_present(Instant::now());

        let results = {
            let plugin = self.registry.active();
            let describe = || SceneDescriptor {
                stimulus: plugin.name().to_string(),
                mode: self.config.mode,
                time: self.time,
                frame: self.frame_count,
                observer: PoseRecord {
                    position: pose.position.to_array(),
                    orientation: pose.orientation.to_array(),
                    timestamp: pose.timestamp,
                },
                capture_origin: origin.to_array(),
                world: plugin.world().clone(),
                hud: plugin.hud().clone(),
                calibration_fingerprint: geometry.as_ref().map(|g| g.fingerprint().to_string()),
                captured_at: Utc::now(),
            };
            self.compositor.service_captures(&image, describe)
        };
        for result in results {
            match result {
                Ok(path) => log::info!("Captured {}", path.display()),
                Err(e) => log::error!("{}", e),
            }
        }

        self.last_frame = Some(image);
        self.update_pending = false;
        self.frame_count += 1;
        if self.viewer.as_ref().map_or(false, |v| v.done()) {
            log::info!("Viewer requested shutdown after {} frames", self.frame_count);
            self.state = Lifecycle::Done;
        }
        Ok(())
    }

    /// The active geometry at the viewer size. A reload through the shared
    /// handle may have been built for another size; it is resampled here.
    fn current_geometry(&self) -> Result<Option<Arc<CalibrationGeometry>>> {
        let (width, height) = self.size;
        match self.calibration.snapshot() {
            Some(geometry) if geometry.size() != (width, height) => {
                log::debug!(
                    "Calibration at {:?} resampled to {}x{}",
                    geometry.size(),
                    width,
                    height
                );
                self.calibration.update_with(|g| g.resized(width, height))?;
                Ok(self.calibration.snapshot())
            }
            geometry => Ok(geometry),
        }
    }

    /// Whether the viewer has asked to stop. Latches into `Done`.
    pub fn done(&mut self) -> bool {
        if self.state != Lifecycle::Done && self.viewer.as_ref().map_or(false, |v| v.done()) {
            self.state = Lifecycle::Done;
        }
        self.state == Lifecycle::Done
    }

    fn render(
        &mut self,
        origin: Vec3,
        observer: Vec3,
        geometry: Option<&CalibrationGeometry>,
    ) -> Result<Rgba32FImage> {
        let (width, height) = self.size;
        match self.config.mode {
            DisplayMode::VrDisplay | DisplayMode::GeometryTexture => {
                let geometry = geometry.ok_or_else(|| {
                    DisplayError::InvalidState("no calibration loaded".to_string())
                })?;
                let plugin = self.registry.active();
                self.capture_pass.capture(plugin.world(), origin, &mut self.cubemap);
                if self.config.mode == DisplayMode::GeometryTexture {
                    let mut raw = GeometryProjectionPass::new(RenderPassMode::TwoPass);
                    return Ok(raw
                        .project(&self.cubemap, geometry, ColorCorrection::IDENTITY)
                        .image);
                }
                let layer = self
                    .projection
                    .project(&self.cubemap, geometry, self.compositor.correction());
                Ok(self.compositor.compose(layer, plugin.hud(), Some(geometry)))
            }
            DisplayMode::Cubemap => {
                let plugin = self.registry.active();
                self.capture_pass.capture(plugin.world(), origin, &mut self.cubemap);
                let cross = self.cubemap.to_cross_layout();
                Ok(imageops::resize(&cross, width, height, imageops::FilterType::Triangle))
            }
            DisplayMode::VirtualWorld => Ok(self.render_virtual_world(observer, width, height)),
        }
    }

    /// Perspective view from the trackball camera with the observer drawn as
    /// a small sphere.
    fn render_virtual_world(&self, observer: Vec3, width: u32, height: u32) -> Rgba32FImage {
        let mut scene: WorldScene = self.registry.active().world().clone();
        scene.primitives.push(WorldPrimitive::Sphere {
            center: observer.to_array(),
            radius: self.config.observer_radius,
            color: [1.0, 1.0, 0.0, 1.0],
        });
        let eye = self.manipulator.eye();
        let aspect = width as f32 / height as f32;
        let mut image = Rgba32FImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
            let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
            let dir = self.manipulator.view_ray(ndc_x, ndc_y, PREVIEW_FOV_Y, aspect);
            *pixel = Rgba(scene.shade(eye, dir));
        }
        image
    }

    pub fn frame_rate(&self) -> f64 {
        self.compositor.frame_rate()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The most recently presented frame.
    pub fn last_frame(&self) -> Option<&Rgba32FImage> {
        self.last_frame.as_ref()
    }

    /// Rebuild the resampling map for a new display size.
    pub fn resized(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(DisplayError::Configuration(format!(
                "cannot resize to {}x{}",
                width, height
            )));
        }
        self.calibration.update_with(|g| g.resized(width, height))?;
        self.size = (width, height);
        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Observer pose of the most recent frame, ready for a uniform buffer.
    pub fn observer_uniform(&self) -> ObserverUniform {
        self.observer_uniform
    }

    // ========================================================================
    // Plugins and messages
    // ========================================================================

    pub fn list_plugin_names(&self) -> Vec<String> {
        self.registry.list_plugin_names()
    }

    pub fn current_stimulus_name(&self) -> &str {
        self.registry.current_active_name()
    }

    pub fn set_stimulus_plugin(&mut self, name: &str) -> Result<()> {
        self.registry.activate(name)
    }

    pub fn plugin_load_failures(&self) -> &[PluginLoadFailure] {
        self.registry.load_failures()
    }

    pub fn stimulus_topic_names(&self, plugin: &str) -> Result<Vec<String>> {
        self.router.topics_of(plugin)
    }

    pub fn stimulus_message_type(&self, plugin: &str, topic: &str) -> Result<String> {
        self.router.message_type_of(plugin, topic)
    }

    /// Deliver to the active plugin. Fire and forget: undeclared topics are
    /// dropped and handler failures are logged.
    pub fn topic_receive_json_message(&mut self, topic: &str, json: &str) {
        let result = self.router.route_to_active(&mut self.registry, topic, json);
        self.absorb_handler_failure(result);
    }

    /// Deliver to a named plugin, active or not. Only an unknown plugin is
    /// reported; handler failures are logged.
    pub fn stimulus_receive_json_message(&mut self, plugin: &str, topic: &str, json: &str) -> Result<()> {
        let result = self.router.route_to_named(&mut self.registry, plugin, topic, json);
        match result {
            Err(DisplayError::PluginNotFound(name)) => Err(DisplayError::PluginNotFound(name)),
            other => {
                self.absorb_handler_failure(other);
                Ok(())
            }
        }
    }

    fn absorb_handler_failure(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.handler_failures += 1;
            log::error!("{}", e);
        }
    }

    /// Handler failures caught at the dispatch boundary so far.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures
    }

    // ========================================================================
    // Display controls
    // ========================================================================

    pub fn set_gamma(&mut self, gamma: f32) -> Result<()> {
        self.compositor.set_gamma(gamma)
    }

    pub fn set_red_max(&mut self, enabled: bool) {
        self.compositor.set_red_max(enabled);
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.compositor.set_cursor_visible(visible);
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_cursor_visible(visible);
        }
    }

    pub fn set_window_name(&mut self, name: &str) {
        self.compositor.set_window_name(name);
        if let Some(viewer) = self.viewer.as_mut() {
            viewer.set_window_name(name);
        }
    }

    /// Save the next completed frame to `path`, once.
    pub fn set_capture_image_filename(&self, path: impl Into<PathBuf>) {
        self.compositor.captures().request_image(path.into());
    }

    /// Save the next frame's scene description to `path`, once.
    pub fn set_capture_scene_filename(&self, path: impl Into<PathBuf>) {
        self.compositor.captures().request_scene(path.into());
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Replace the active calibration. The previous one stays if this fails.
    pub fn load_display_calibration_file(&mut self, path: &Path, show_geom_coords: bool) -> Result<()> {
        let (width, height) = self.size;
        self.calibration.reload(
            &CalibrationSource::File(path.to_path_buf()),
            width,
            height,
            show_geom_coords,
        )
    }

    /// Replace the active calibration with one derived from an analytic
    /// surface description.
    pub fn load_display_geom_json(&mut self, json: &str) -> Result<()> {
        let model: DisplaySurfaceModel = serde_json::from_str(json)
            .map_err(|e| DisplayError::GeometryLoad(format!("display geometry: {}", e)))?;
        let (width, height) = self.size;
        let geometry = CalibrationGeometry::from_surface_model(&model, width, height)?
            .with_debug_requested(self.config.show_geom_coords);
        self.calibration.replace(geometry);
        Ok(())
    }

    pub fn calibration(&self) -> Option<Arc<CalibrationGeometry>> {
        self.calibration.snapshot()
    }

    /// Shared slot, for reloading from another thread.
    pub fn calibration_handle(&self) -> Arc<CalibrationSlot> {
        Arc::clone(&self.calibration)
    }

    // ========================================================================
    // Observer, camera and session
    // ========================================================================

    /// Shared pose holder, for a pose-producer thread.
    pub fn observer_handle(&self) -> Arc<ObserverPosition> {
        Arc::clone(&self.observer)
    }

    pub fn trackball_manipulator_state(&self) -> ManipulatorState {
        self.manipulator.export_state()
    }

    pub fn set_trackball_manipulator_state(&mut self, state: &ManipulatorState) -> Result<()> {
        self.manipulator.import_state(state)
    }

    pub fn manipulator_mut(&mut self) -> &mut TrackballManipulator {
        &mut self.manipulator
    }

    pub fn export_session(&self) -> SessionState {
        SessionState {
            width: self.size.0,
            height: self.size.1,
            manipulator: self.manipulator.export_state(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Restore camera state and, if it differs, the display size.
    pub fn import_session(&mut self, session: &SessionState) -> Result<()> {
        self.manipulator.import_state(&session.manipulator)?;
        if (session.width, session.height) != self.size {
            self.resized(session.width, session.height)?;
        }
        Ok(())
    }

    pub fn save_session(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.export_session())
            .map_err(|e| DisplayError::Configuration(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| {
            DisplayError::Configuration(format!("cannot write {}: {}", path.display(), e))
        })
    }

    pub fn load_session(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DisplayError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let session: SessionState = serde_json::from_str(&text)
            .map_err(|e| DisplayError::Configuration(format!("session: {}", e)))?;
        self.import_session(&session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::OffscreenViewer;

    fn server(mode: DisplayMode) -> DisplayServer {
        DisplayServer::new(DisplayServerConfig {
            mode,
            cubemap_resolution: 8,
            ..DisplayServerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_setup_requires_calibration_in_vr_mode() {
        let mut server = server(DisplayMode::VrDisplay);
        let err = server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 8, "height": 4}"#)
            .unwrap_err();
        assert!(matches!(err, DisplayError::Configuration(_)));
        assert_eq!(server.state(), Lifecycle::Uninitialized);
    }

    #[test]
    fn test_malformed_viewer_json_leaves_nothing_installed() {
        let mut server = server(DisplayMode::Cubemap);
        assert!(server
            .setup_viewer(Box::new(OffscreenViewer::new()), "{ width: ")
            .is_err());
        assert_eq!(server.state(), Lifecycle::Uninitialized);
        server.update(0.0, Vec3::ZERO, Quat::IDENTITY).unwrap();
        assert!(matches!(server.frame(), Err(DisplayError::InvalidState(_))));
    }

    #[test]
    fn test_frame_requires_update_each_cycle() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 16, "height": 12}"#)
            .unwrap();
        assert_eq!(server.state(), Lifecycle::Configured);
        assert!(server.frame().is_err());

        server.update(0.0, Vec3::ZERO, Quat::IDENTITY).unwrap();
        server.frame().unwrap();
        assert_eq!(server.state(), Lifecycle::Running);
        assert_eq!(server.last_frame().unwrap().dimensions(), (16, 12));
        assert!(matches!(server.frame(), Err(DisplayError::InvalidState(_))));
    }

    #[test]
    fn test_done_is_terminal() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(
                Box::new(OffscreenViewer::new().with_frame_limit(1)),
                r#"{"width": 8, "height": 6}"#,
            )
            .unwrap();
        assert!(!server.done());
        server.update(0.0, Vec3::ZERO, Quat::IDENTITY).unwrap();
        server.frame().unwrap();
        assert!(server.done());
        assert_eq!(server.state(), Lifecycle::Done);
        assert!(server.update(0.1, Vec3::ZERO, Quat::IDENTITY).is_err());
        assert!(server.frame().is_err());
    }

    #[test]
    fn test_geometry_from_surface_model_and_resize() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 12, "height": 6}"#)
            .unwrap();
        assert!(server.calibration().is_none());
        server
            .load_display_geom_json(r#"{"model": "cylinder", "radius": 1.0, "samples": [9, 3]}"#)
            .unwrap();
        assert_eq!(server.calibration().unwrap().size(), (12, 6));
        assert!(server.load_display_geom_json(r#"{"model": "torus"}"#).is_err());
        assert_eq!(server.calibration().unwrap().size(), (12, 6));

        server.resized(6, 3).unwrap();
        assert_eq!(server.calibration().unwrap().size(), (6, 3));
        server.update(0.0, Vec3::ZERO, Quat::IDENTITY).unwrap();
        server.frame().unwrap();
        assert_eq!(server.last_frame().unwrap().dimensions(), (6, 3));
    }

    #[test]
    fn test_oversized_surface_model_is_a_geometry_error() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 8, "height": 4}"#)
            .unwrap();
        server
            .load_display_geom_json(r#"{"model": "cylinder", "radius": 1.0, "samples": [9, 3]}"#)
            .unwrap();
        let before = server.calibration().unwrap();

        let err = server
            .load_display_geom_json(
                r#"{"model": "planar", "center": [2, 0, 0], "u_axis": [0, -1, 0],
                    "v_axis": [0, 0, -1], "samples": [70000, 70000]}"#,
            )
            .unwrap_err();
        assert!(matches!(err, DisplayError::GeometryLoad(_)));
        assert!(Arc::ptr_eq(&before, &server.calibration().unwrap()));
    }

    #[test]
    fn test_calibration_document_can_enable_debug() {
        let dir = std::env::temp_dir().join(format!("ds-debug-doc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("calibration.json");
        std::fs::write(
            &path,
            r#"{"debug": true, "correspondences": [
                {"direction": [1, 0, 0], "uv": [0.25, 0.5]},
                {"direction": [0, 0, 1], "uv": [0.75, 0.5]}
            ]}"#,
        )
        .unwrap();

        let mut server = DisplayServer::new(DisplayServerConfig {
            mode: DisplayMode::VrDisplay,
            cubemap_resolution: 4,
            calibration_file: Some(path.clone()),
            show_geom_coords: false,
            ..DisplayServerConfig::default()
        })
        .unwrap();
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 8, "height": 4}"#)
            .unwrap();
        assert!(server.calibration().unwrap().is_debug());

        server
            .load_display_geom_json(r#"{"model": "cylinder", "radius": 1.0, "samples": [9, 3]}"#)
            .unwrap();
        assert!(!server.calibration().unwrap().is_debug());
        server.load_display_calibration_file(&path, false).unwrap();
        assert!(server.calibration().unwrap().is_debug());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_fullscreen_request_still_configures() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(
                Box::new(OffscreenViewer::new()),
                r#"{"width": 8, "height": 6, "fullscreen": true}"#,
            )
            .unwrap();
        assert_eq!(server.state(), Lifecycle::Configured);
        assert_eq!(server.size(), (8, 6));
    }

    #[test]
    fn test_frame_publishes_observer_uniform() {
        let mut server = server(DisplayMode::Cubemap);
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 4, "height": 3}"#)
            .unwrap();
        assert_eq!(server.observer_uniform(), ObserverUniform::zeroed());

        for frame in 0..2 {
            let position = Vec3::new(1.0 + frame as f32, 0.0, -2.0);
            server.update(0.5 * frame as f64, position, Quat::IDENTITY).unwrap();
            server.frame().unwrap();
            let uniform = server.observer_uniform();
            assert_eq!(uniform.position, [1.0 + frame as f32, 0.0, -2.0, 1.0]);
            assert_eq!(uniform.time, [0.5 * frame as f32, frame as f32, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_tethered_mode_captures_from_origin() {
        let dir = std::env::temp_dir().join(format!("ds-tether-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let capture_origin = |tethered: bool| {
            let mut server = DisplayServer::new(DisplayServerConfig {
                mode: DisplayMode::Cubemap,
                tethered_mode: tethered,
                cubemap_resolution: 4,
                ..DisplayServerConfig::default()
            })
            .unwrap();
            server
                .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 4, "height": 3}"#)
                .unwrap();
            let path = dir.join(format!("scene-{}.json", tethered));
            server.set_capture_scene_filename(&path);
            server.update(0.0, Vec3::new(4.0, 0.0, 0.0), Quat::IDENTITY).unwrap();
            server.frame().unwrap();
            let text = std::fs::read_to_string(&path).unwrap();
            let descriptor: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(descriptor["observer"]["position"], serde_json::json!([4.0, 0.0, 0.0]));
            descriptor["capture_origin"].clone()
        };

        assert_eq!(capture_origin(false), serde_json::json!([4.0, 0.0, 0.0]));
        assert_eq!(capture_origin(true), serde_json::json!([0.0, 0.0, 0.0]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_session_round_trip() {
        let mut server = server(DisplayMode::VirtualWorld);
        server.manipulator_mut().orbit(0.4, 0.1);
        let session = server.export_session();

        let mut restored = self::server(DisplayMode::VirtualWorld);
        restored.import_session(&session).unwrap();
        assert_eq!(restored.trackball_manipulator_state(), session.manipulator);

        let json = serde_json::to_string(&session).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_virtual_world_shows_observer_marker() {
        let mut server = DisplayServer::new(DisplayServerConfig {
            mode: DisplayMode::VirtualWorld,
            observer_radius: 0.5,
            cubemap_resolution: 4,
            ..DisplayServerConfig::default()
        })
        .unwrap();
        server
            .setup_viewer(Box::new(OffscreenViewer::new()), r#"{"width": 9, "height": 9}"#)
            .unwrap();
        // Manipulator looks at the origin, where the observer stands.
        server.update(0.0, Vec3::ZERO, Quat::IDENTITY).unwrap();
        server.frame().unwrap();
        assert_eq!(server.last_frame().unwrap().get_pixel(4, 4).0, [1.0, 1.0, 0.0, 1.0]);
    }
}

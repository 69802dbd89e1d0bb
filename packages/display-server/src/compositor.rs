//! Final frame composition and capture.
//!
//! The warped world layer goes underneath the HUD. Colour correction is a
//! per-pixel power curve plus an optional forced red channel. Captures are
//! one-shot requests picked up by the next completed frame.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::{DynamicImage, Rgba32FImage};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationGeometry;
use crate::config::DisplayMode;
use crate::error::{DisplayError, Result};
use crate::projection::ProjectedLayer;
use crate::stimulus::scene::{HudElement, HudLayer, Rgba, WorldScene};

/// Presented frames kept for the frame-rate estimate.
const FRAME_RATE_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorCorrection {
    pub gamma: f32,
    /// Force the red channel to full intensity.
    pub red_max: bool,
}

impl ColorCorrection {
    pub const IDENTITY: ColorCorrection = ColorCorrection {
        gamma: 1.0,
        red_max: false,
    };

    pub fn is_identity(&self) -> bool {
        self.gamma == 1.0 && !self.red_max
    }

    /// Correct RGB, leaving alpha alone.
    pub fn apply(&self, color: Rgba) -> Rgba {
        let mut out = color;
        if self.gamma != 1.0 {
            let exponent = 1.0 / self.gamma;
            for c in out.iter_mut().take(3) {
                *c = c.max(0.0).powf(exponent);
            }
        }
        if self.red_max {
            out[0] = 1.0;
        }
        out
    }
}

impl Default for ColorCorrection {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Observer pose as written into a scene descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub position: [f32; 3],
    /// Quaternion `[x, y, z, w]`.
    pub orientation: [f32; 4],
    pub timestamp: f64,
}

/// Everything needed to reproduce what a frame showed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub stimulus: String,
    pub mode: DisplayMode,
    pub time: f64,
    pub frame: u64,
    pub observer: PoseRecord,
    pub capture_origin: [f32; 3],
    pub world: WorldScene,
    pub hud: HudLayer,
    pub calibration_fingerprint: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Pending one-shot capture paths. Requests may arrive from any thread.
#[derive(Debug, Default)]
pub struct CaptureRequests {
    image: Mutex<Option<PathBuf>>,
    scene: Mutex<Option<PathBuf>>,
}

impl CaptureRequests {
    pub fn request_image(&self, path: PathBuf) {
        *self.image.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    pub fn request_scene(&self, path: PathBuf) {
        *self.scene.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    pub fn take_image(&self) -> Option<PathBuf> {
        self.image.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn take_scene(&self) -> Option<PathBuf> {
        self.scene.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_pending(&self) -> bool {
        self.image.lock().unwrap_or_else(PoisonError::into_inner).is_some()
            || self.scene.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

pub struct DisplayCompositor {
    correction: ColorCorrection,
    cursor_visible: bool,
    window_name: String,
    captures: CaptureRequests,
    present_times: VecDeque<Instant>,
}

impl DisplayCompositor {
    pub fn new(window_name: impl Into<String>) -> Self {
        Self {
            correction: ColorCorrection::IDENTITY,
            cursor_visible: true,
            window_name: window_name.into(),
            captures: CaptureRequests::default(),
            present_times: VecDeque::with_capacity(FRAME_RATE_WINDOW),
        }
    }

    pub fn correction(&self) -> ColorCorrection {
        self.correction
    }

    /// Output becomes `c^(1/gamma)`. Non-positive values are rejected.
    pub fn set_gamma(&mut self, gamma: f32) -> Result<()> {
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(DisplayError::Configuration(format!(
                "gamma must be positive, got {}",
                gamma
            )));
        }
        self.correction.gamma = gamma;
        Ok(())
    }

    pub fn set_red_max(&mut self, enabled: bool) {
        self.correction.red_max = enabled;
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor_visible = visible;
    }

    pub fn window_name(&self) -> &str {
        &self.window_name
    }

    pub fn set_window_name(&mut self, name: impl Into<String>) {
        self.window_name = name.into();
    }

    pub fn captures(&self) -> &CaptureRequests {
        &self.captures
    }

    /// Put the HUD over the warped layer, then correct colour unless the
    /// projection pass already did.
    pub fn compose(
        &self,
        layer: ProjectedLayer,
        hud: &HudLayer,
        calibration: Option<&CalibrationGeometry>,
    ) -> Rgba32FImage {
        let ProjectedLayer { mut image, corrected } = layer;
        draw_hud(&mut image, hud, calibration);
        if !corrected && !self.correction.is_identity() {
            for pixel in image.pixels_mut() {
                pixel.0 = self.correction.apply(pixel.0);
            }
        }
        image
    }

    pub fn record_present(&mut self, at: Instant) {
        if self.present_times.len() == FRAME_RATE_WINDOW {
            self.present_times.pop_front();
        }
        self.present_times.push_back(at);
    }

    /// Frames per second over the recent window, or 0 before two frames.
    pub fn frame_rate(&self) -> f64 {
        match (self.present_times.front(), self.present_times.back()) {
            (Some(first), Some(last)) if self.present_times.len() > 1 => {
                let span = last.duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (self.present_times.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Write whichever captures are pending for the frame just presented.
    /// Each request is consumed whether or not writing succeeds.
    pub fn service_captures(
        &self,
        frame: &Rgba32FImage,
        describe: impl FnOnce() -> SceneDescriptor,
    ) -> Vec<Result<PathBuf>> {
        let mut results = Vec::new();
        if let Some(path) = self.captures.take_image() {
            results.push(write_image(&path, frame).map(|_| path));
        }
        if let Some(path) = self.captures.take_scene() {
            results.push(write_descriptor(&path, &describe()).map(|_| path));
        }
        results
    }
}

pub fn write_image(path: &Path, frame: &Rgba32FImage) -> Result<()> {
    let rgba8 = DynamicImage::ImageRgba32F(frame.clone()).to_rgba8();
    rgba8
        .save(path)
        .map_err(|e| DisplayError::Capture(format!("{}: {}", path.display(), e)))
}

fn write_descriptor(path: &Path, descriptor: &SceneDescriptor) -> Result<()> {
    let json = serde_json::to_string_pretty(descriptor)
        .map_err(|e| DisplayError::Capture(e.to_string()))?;
    std::fs::write(path, json)
        .map_err(|e| DisplayError::Capture(format!("{}: {}", path.display(), e)))
}

// ============================================================================
// HUD rasterisation
// ============================================================================

fn draw_hud(image: &mut Rgba32FImage, hud: &HudLayer, calibration: Option<&CalibrationGeometry>) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    for element in &hud.elements {
        match element {
            HudElement::Rect { min, max, color } => {
                fill(image, min[0] * w, min[1] * h, max[0] * w, max[1] * h, *color);
            }
            HudElement::Crosshair {
                center,
                size,
                thickness,
                color,
            } => {
                let (cx, cy) = (center[0] * w, center[1] * h);
                let (half_w, half_h) = (size * w * 0.5, size * h * 0.5);
                let t = (thickness * h.min(w) * 0.5).max(0.5);
                fill(image, cx - half_w, cy - t, cx + half_w, cy + t, *color);
                fill(image, cx - t, cy - half_h, cx + t, cy - t, *color);
                fill(image, cx - t, cy + t, cx + t, cy + half_h, *color);
            }
            HudElement::WorldMarker {
                direction,
                size,
                color,
            } => {
                // Needs a calibration to know where the direction lands.
                if let Some(geometry) = calibration {
                    let uv = geometry.display_uv_for(glam::Vec3::from(*direction));
                    let half = (size * w.min(h) * 0.5).max(0.5);
                    let (cx, cy) = (uv[0] * w, uv[1] * h);
                    fill(image, cx - half, cy - half, cx + half, cy + half, *color);
                }
            }
        }
    }
}

/// Alpha-blend `color` over pixels whose centres fall in `[x0, x1) x [y0, y1)`.
fn fill(image: &mut Rgba32FImage, x0: f32, y0: f32, x1: f32, y1: f32, color: Rgba) {
    let (w, h) = image.dimensions();
    let first = |v: f32, limit: u32| (v - 0.5).ceil().clamp(0.0, limit as f32) as u32;
    let (xa, xb) = (first(x0, w), first(x1, w));
    let (ya, yb) = (first(y0, h), first(y1, h));
    let alpha = color[3].clamp(0.0, 1.0);
    for y in ya..yb {
        for x in xa..xb {
            let dst = &mut image.get_pixel_mut(x, y).0;
            for c in 0..3 {
                dst[c] = color[c] * alpha + dst[c] * (1.0 - alpha);
            }
            dst[3] = alpha + dst[3] * (1.0 - alpha);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba as Px;
    use std::time::Duration;

    fn gray_layer(corrected: bool) -> ProjectedLayer {
        ProjectedLayer {
            image: Rgba32FImage::from_pixel(10, 10, Px([0.25, 0.25, 0.25, 1.0])),
            corrected,
        }
    }

    fn rect_hud() -> HudLayer {
        HudLayer {
            elements: vec![HudElement::Rect {
                min: [0.0, 0.0],
                max: [0.5, 0.5],
                color: [0.25, 0.25, 0.25, 1.0],
            }],
        }
    }

    #[test]
    fn test_gamma_and_red_max() {
        let c = ColorCorrection {
            gamma: 2.0,
            red_max: true,
        };
        let out = c.apply([0.25, 0.04, 0.0, 0.5]);
        assert_eq!(out[0], 1.0);
        assert!((out[1] - 0.2).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.5);

        let mut compositor = DisplayCompositor::new("test");
        assert!(compositor.set_gamma(0.0).is_err());
        assert!(compositor.set_gamma(f32::NAN).is_err());
        assert_eq!(compositor.correction().gamma, 1.0);
        compositor.set_gamma(2.2).unwrap();
        assert_eq!(compositor.correction().gamma, 2.2);
    }

    #[test]
    fn test_hud_is_corrected_only_when_layer_is_not() {
        let mut compositor = DisplayCompositor::new("test");
        compositor.set_gamma(2.0).unwrap();

        // Already corrected layer: HUD pixels keep their raw value.
        let frame = compositor.compose(gray_layer(true), &rect_hud(), None);
        assert_eq!(frame.get_pixel(1, 1).0, [0.25, 0.25, 0.25, 1.0]);

        // Uncorrected layer: everything is corrected after the HUD.
        let frame = compositor.compose(gray_layer(false), &rect_hud(), None);
        assert!((frame.get_pixel(1, 1).0[0] - 0.5).abs() < 1e-6);
        assert!((frame.get_pixel(8, 8).0[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rect_covers_expected_pixels_and_blends() {
        let compositor = DisplayCompositor::new("test");
        let hud = HudLayer {
            elements: vec![HudElement::Rect {
                min: [0.0, 0.0],
                max: [0.5, 0.5],
                color: [1.0, 1.0, 1.0, 0.5],
            }],
        };
        let frame = compositor.compose(gray_layer(true), &hud, None);
        assert!((frame.get_pixel(4, 4).0[0] - 0.625).abs() < 1e-6);
        assert_eq!(frame.get_pixel(5, 5).0[0], 0.25);
    }

    #[test]
    fn test_frame_rate_over_window() {
        let mut compositor = DisplayCompositor::new("test");
        assert_eq!(compositor.frame_rate(), 0.0);
        let start = Instant::now();
        for i in 0..=FRAME_RATE_WINDOW as u64 + 10 {
            compositor.record_present(start + Duration::from_millis(10 * i));
        }
        assert!((compositor.frame_rate() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_capture_request_is_one_shot() {
        let dir = std::env::temp_dir().join(format!("ds-compositor-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame.png");

        let compositor = DisplayCompositor::new("test");
        let frame = Rgba32FImage::from_pixel(4, 4, Px([1.0, 0.0, 0.0, 1.0]));
        let describe = || -> SceneDescriptor { unreachable!("no scene capture requested") };

        compositor.captures().request_image(path.clone());
        let results = compositor.service_captures(&frame, describe);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &path);
        assert!(!compositor.captures().is_pending());

        let saved = image::open(&path).unwrap().to_rgba8();
        assert_eq!(saved.get_pixel(0, 0).0, [255, 0, 0, 255]);

        assert!(compositor.service_captures(&frame, describe).is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}

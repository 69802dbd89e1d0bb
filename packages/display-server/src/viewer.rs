//! Presentation targets.
//!
//! Platform windowing is outside this crate; a [`Viewer`] is whatever the
//! composed frame is handed to. [`OffscreenViewer`] keeps frames in memory
//! and can write them to disk, which is what tests and batch renders use.

use std::path::PathBuf;

use image::Rgba32FImage;

use crate::compositor::write_image;
use crate::config::ViewerConfig;
use crate::error::{DisplayError, Result};

pub trait Viewer {
    /// Apply the viewer configuration. Called once, before any frame.
    fn configure(&mut self, config: &ViewerConfig) -> Result<()>;

    /// Show a completed frame.
    fn present(&mut self, frame: &Rgba32FImage) -> Result<()>;

    /// Whether the viewer has asked to shut down.
    fn done(&self) -> bool;

    fn set_cursor_visible(&mut self, visible: bool);

    fn set_window_name(&mut self, name: &str);
}

/// In-memory viewer.
#[derive(Debug, Default)]
pub struct OffscreenViewer {
    config: Option<ViewerConfig>,
    frame_limit: Option<u64>,
    output_dir: Option<PathBuf>,
    frames_presented: u64,
    last_frame: Option<Rgba32FImage>,
    cursor_visible: bool,
    window_name: String,
    close_requested: bool,
}

impl OffscreenViewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `done` after this many frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Write every presented frame as `frame_NNNNN.png` into `dir`.
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    /// Simulate the user closing the window.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn config(&self) -> Option<&ViewerConfig> {
        self.config.as_ref()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn last_frame(&self) -> Option<&Rgba32FImage> {
        self.last_frame.as_ref()
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn window_name(&self) -> &str {
        &self.window_name
    }
}

impl Viewer for OffscreenViewer {
    fn configure(&mut self, config: &ViewerConfig) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                DisplayError::Configuration(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn present(&mut self, frame: &Rgba32FImage) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            write_image(&dir.join(format!("frame_{:05}.png", self.frames_presented)), frame)?;
        }
        self.frames_presented += 1;
        self.last_frame = Some(frame.clone());
        Ok(())
    }

    fn done(&self) -> bool {
        self.close_requested
            || self
                .frame_limit
                .map_or(false, |limit| self.frames_presented >= limit)
    }

    fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor_visible = visible;
    }

    fn set_window_name(&mut self, name: &str) {
        self.window_name = name.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_frame_limit_and_close() {
        let mut viewer = OffscreenViewer::new().with_frame_limit(2);
        viewer.configure(&ViewerConfig::default()).unwrap();
        let frame = Rgba32FImage::from_pixel(2, 2, Rgba([0.0, 0.0, 0.0, 1.0]));

        viewer.present(&frame).unwrap();
        assert!(!viewer.done());
        viewer.present(&frame).unwrap();
        assert!(viewer.done());
        assert_eq!(viewer.frames_presented(), 2);

        let mut open_ended = OffscreenViewer::new();
        assert!(!open_ended.done());
        open_ended.request_close();
        assert!(open_ended.done());
    }

    #[test]
    fn test_writes_numbered_frames() {
        let dir = std::env::temp_dir().join(format!("ds-viewer-{}", std::process::id()));
        let mut viewer = OffscreenViewer::new().with_output_dir(dir.clone());
        viewer.configure(&ViewerConfig::default()).unwrap();
        let frame = Rgba32FImage::from_pixel(2, 2, Rgba([0.0, 1.0, 0.0, 1.0]));
        viewer.present(&frame).unwrap();
        viewer.present(&frame).unwrap();
        assert!(dir.join("frame_00000.png").exists());
        assert!(dir.join("frame_00001.png").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}

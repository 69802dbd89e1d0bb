pub mod calibration;
pub mod compositor;
pub mod config;
pub mod cubemap;
pub mod display_geometry;
pub mod display_server;
pub mod error;
pub mod gpu;
pub mod manipulator;
pub mod observer;
pub mod projection;
pub mod stimulus;
pub mod viewer;

pub mod cli;

pub use calibration::{CalibrationGeometry, CalibrationSlot, CalibrationSource};
pub use compositor::{ColorCorrection, DisplayCompositor, SceneDescriptor};
pub use config::{DisplayMode, DisplayServerConfig, ViewerConfig};
pub use display_server::{DisplayServer, Lifecycle, SessionState};
pub use error::{DisplayError, Result};
pub use observer::{ObserverPoseSample, ObserverPosition, ObserverUniform};
pub use stimulus::{StimulusPlugin, StimulusRegistry, TopicDeclaration, TopicRouter};
pub use viewer::{OffscreenViewer, Viewer};

//! Stimulus plugins compiled into the binary.
//!
//! [`BUILTIN_PLUGINS`] is the constructor table the registry walks before it
//! scans the plugin path, so built-ins always come first in discovery order.

use anyhow::Context;
use glam::{Quat, Vec3};
use serde::Deserialize;

use super::scene::{HudElement, HudLayer, Rgba, WorldPrimitive, WorldScene, BLACK, WHITE};
use super::{StimulusPlugin, TopicDeclaration};

pub type PluginConstructor = fn() -> Box<dyn StimulusPlugin>;

pub const BUILTIN_PLUGINS: &[PluginConstructor] = &[standby, cylinder_grating, demo];

fn standby() -> Box<dyn StimulusPlugin> {
    Box::new(StandbyStimulus::new())
}

fn cylinder_grating() -> Box<dyn StimulusPlugin> {
    Box::new(CylinderGratingStimulus::new())
}

fn demo() -> Box<dyn StimulusPlugin> {
    Box::new(DemoStimulus::new())
}

/// `std_msgs/ColorRGBA`
#[derive(Debug, Deserialize)]
struct ColorMessage {
    r: f32,
    g: f32,
    b: f32,
    #[serde(default = "opaque")]
    a: f32,
}

fn opaque() -> f32 {
    1.0
}

impl ColorMessage {
    fn rgba(&self) -> Rgba {
        [self.r, self.g, self.b, self.a]
    }
}

fn parse<T: for<'de> Deserialize<'de>>(topic: &str, json: &str) -> anyhow::Result<T> {
    serde_json::from_str(json).with_context(|| format!("invalid payload on '{}'", topic))
}

// ============================================================================
// Standby
// ============================================================================

/// Uniform background, shown while no experiment stimulus is selected.
pub struct StandbyStimulus {
    topics: Vec<TopicDeclaration>,
    world: WorldScene,
    hud: HudLayer,
}

impl StandbyStimulus {
    pub const NAME: &'static str = "StimulusStandby";

    pub fn new() -> Self {
        Self {
            topics: vec![TopicDeclaration::new("background_color", "std_msgs/ColorRGBA")],
            world: WorldScene::solid([0.5, 0.5, 0.5, 1.0]),
            hud: HudLayer::default(),
        }
    }
}

impl Default for StandbyStimulus {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusPlugin for StandbyStimulus {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn topics(&self) -> &[TopicDeclaration] {
        &self.topics
    }

    fn receive_json_message(&mut self, topic: &str, json: &str) -> anyhow::Result<()> {
        match topic {
            "background_color" => {
                let color: ColorMessage = parse(topic, json)?;
                self.world.background = color.rgba();
                Ok(())
            }
            _ => anyhow::bail!("unhandled topic '{}'", topic),
        }
    }

    fn update(&mut self, _time: f64, _position: Vec3, _orientation: Quat) {}

    fn world(&self) -> &WorldScene {
        &self.world
    }

    fn hud(&self) -> &HudLayer {
        &self.hud
    }
}

// ============================================================================
// Cylinder grating
// ============================================================================

/// `flyvr/CylinderGratingInfo`; absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
struct GratingInfo {
    radius: Option<f32>,
    cycles: Option<f32>,
    phase_position: Option<f32>,
    phase_velocity: Option<f32>,
    color_a: Option<Rgba>,
    color_b: Option<Rgba>,
}

/// Rotating striped cylinder centred on the world origin.
pub struct CylinderGratingStimulus {
    topics: Vec<TopicDeclaration>,
    radius: f32,
    cycles: f32,
    phase: f32,
    /// Radians per second.
    phase_velocity: f32,
    color_a: Rgba,
    color_b: Rgba,
    last_time: Option<f64>,
    world: WorldScene,
    hud: HudLayer,
}

impl CylinderGratingStimulus {
    pub const NAME: &'static str = "StimulusCylinderGrating";

    pub fn new() -> Self {
        let mut stimulus = Self {
            topics: vec![TopicDeclaration::new(
                "grating_info",
                "flyvr/CylinderGratingInfo",
            )],
            radius: 1.0,
            cycles: 20.0,
            phase: 0.0,
            phase_velocity: 0.0,
            color_a: WHITE,
            color_b: BLACK,
            last_time: None,
            world: WorldScene::default(),
            hud: HudLayer::default(),
        };
        stimulus.rebuild();
        stimulus
    }

    pub fn phase(&self) -> f32 {
        self.phase
    }

    fn rebuild(&mut self) {
        self.world = WorldScene {
            background: BLACK,
            primitives: vec![WorldPrimitive::Grating {
                radius: self.radius,
                cycles: self.cycles,
                phase: self.phase,
                half_height: 1.0e6,
                color_a: self.color_a,
                color_b: self.color_b,
            }],
        };
    }
}

impl Default for CylinderGratingStimulus {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusPlugin for CylinderGratingStimulus {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn topics(&self) -> &[TopicDeclaration] {
        &self.topics
    }

    fn receive_json_message(&mut self, topic: &str, json: &str) -> anyhow::Result<()> {
        if topic != "grating_info" {
            anyhow::bail!("unhandled topic '{}'", topic);
        }
        let info: GratingInfo = parse(topic, json)?;
        if let Some(radius) = info.radius {
            anyhow::ensure!(radius > 0.0, "radius must be positive, got {}", radius);
            self.radius = radius;
        }
        if let Some(cycles) = info.cycles {
            self.cycles = cycles;
        }
        if let Some(phase) = info.phase_position {
            self.phase = phase;
        }
        if let Some(velocity) = info.phase_velocity {
            self.phase_velocity = velocity;
        }
        if let Some(color) = info.color_a {
            self.color_a = color;
        }
        if let Some(color) = info.color_b {
            self.color_b = color;
        }
        self.rebuild();
        Ok(())
    }

    fn update(&mut self, time: f64, _position: Vec3, _orientation: Quat) {
        if let Some(last) = self.last_time {
            let dt = (time - last).max(0.0) as f32;
            self.phase = (self.phase + self.phase_velocity * dt).rem_euclid(std::f32::consts::TAU);
        }
        self.last_time = Some(time);
        self.rebuild();
    }

    fn world(&self) -> &WorldScene {
        &self.world
    }

    fn hud(&self) -> &HudLayer {
        &self.hud
    }
}

// ============================================================================
// 3D demo
// ============================================================================

/// `geometry_msgs/Point`
#[derive(Debug, Deserialize)]
struct PointMessage {
    x: f32,
    y: f32,
    z: f32,
}

/// `std_msgs/Bool`
#[derive(Debug, Deserialize)]
struct BoolMessage {
    data: bool,
}

/// Checkered floor with a movable sphere and an optional fixation cross.
///
/// A HUD marker tracks the sphere's direction from the observer so the
/// overlay and the warped world can be checked against each other.
pub struct DemoStimulus {
    topics: Vec<TopicDeclaration>,
    sphere_position: Vec3,
    show_fixation: bool,
    observer: Vec3,
    world: WorldScene,
    hud: HudLayer,
}

impl DemoStimulus {
    pub const NAME: &'static str = "Stimulus3DDemo";

    pub fn new() -> Self {
        let mut stimulus = Self {
            topics: vec![
                TopicDeclaration::new("sphere_position", "geometry_msgs/Point"),
                TopicDeclaration::new("show_fixation", "std_msgs/Bool"),
            ],
            sphere_position: Vec3::new(2.0, 0.0, 0.0),
            show_fixation: false,
            observer: Vec3::ZERO,
            world: WorldScene::default(),
            hud: HudLayer::default(),
        };
        stimulus.rebuild();
        stimulus
    }

    fn rebuild(&mut self) {
        self.world = WorldScene {
            background: [0.1, 0.1, 0.3, 1.0],
            primitives: vec![
                WorldPrimitive::Floor {
                    height: -1.0,
                    tile_size: 0.5,
                    color_a: [0.8, 0.8, 0.8, 1.0],
                    color_b: [0.2, 0.2, 0.2, 1.0],
                },
                WorldPrimitive::Sphere {
                    center: self.sphere_position.to_array(),
                    radius: 0.25,
                    color: [0.9, 0.2, 0.1, 1.0],
                },
            ],
        };

        let mut elements = Vec::new();
        let to_sphere = self.sphere_position - self.observer;
        if to_sphere.length_squared() > f32::EPSILON {
            elements.push(HudElement::WorldMarker {
                direction: to_sphere.normalize().to_array(),
                size: 0.02,
                color: [0.0, 1.0, 0.0, 0.8],
            });
        }
        if self.show_fixation {
            elements.push(HudElement::Crosshair {
                center: [0.5, 0.5],
                size: 0.05,
                thickness: 0.005,
                color: WHITE,
            });
        }
        self.hud = HudLayer { elements };
    }
}

impl Default for DemoStimulus {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusPlugin for DemoStimulus {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn topics(&self) -> &[TopicDeclaration] {
        &self.topics
    }

    fn receive_json_message(&mut self, topic: &str, json: &str) -> anyhow::Result<()> {
        match topic {
            "sphere_position" => {
                let p: PointMessage = parse(topic, json)?;
                self.sphere_position = Vec3::new(p.x, p.y, p.z);
            }
            "show_fixation" => {
                let b: BoolMessage = parse(topic, json)?;
                self.show_fixation = b.data;
            }
            _ => anyhow::bail!("unhandled topic '{}'", topic),
        }
        self.rebuild();
        Ok(())
    }

    fn update(&mut self, _time: f64, position: Vec3, _orientation: Quat) {
        self.observer = position;
        self.rebuild();
    }

    fn world(&self) -> &WorldScene {
        &self.world
    }

    fn hud(&self) -> &HudLayer {
        &self.hud
    }
}

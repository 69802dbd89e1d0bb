//! Scene content supplied by stimulus plugins.
//!
//! A [`WorldScene`] is a small set of analytic primitives that the cubemap
//! capture pass ray-casts from the observer position. The world is Z-up.
//! A [`HudLayer`] is drawn over the warped image in display coordinates.

use std::f32::consts::TAU;

use glam::Vec3;
use serde::{Deserialize, Serialize};

pub type Rgba = [f32; 4];

pub const BLACK: Rgba = [0.0, 0.0, 0.0, 1.0];
pub const WHITE: Rgba = [1.0, 1.0, 1.0, 1.0];

fn default_half_height() -> f32 {
    1.0e6
}

fn default_tile_size() -> f32 {
    1.0
}

/// A ray-castable world element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorldPrimitive {
    Sphere {
        center: [f32; 3],
        radius: f32,
        color: Rgba,
    },
    /// Vertical cylinder around the world Z axis with alternating stripes.
    Grating {
        radius: f32,
        /// Number of full light/dark cycles around the circumference.
        cycles: f32,
        /// Phase offset in radians.
        #[serde(default)]
        phase: f32,
        #[serde(default = "default_half_height")]
        half_height: f32,
        color_a: Rgba,
        color_b: Rgba,
    },
    /// Checkerboard plane at `z = height`.
    Floor {
        height: f32,
        #[serde(default = "default_tile_size")]
        tile_size: f32,
        color_a: Rgba,
        color_b: Rgba,
    },
}

impl WorldPrimitive {
    /// Distance along `dir` (unit length) to the nearest hit, with its colour.
    pub fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<(f32, Rgba)> {
        match self {
            WorldPrimitive::Sphere {
                center,
                radius,
                color,
            } => {
                let oc = origin - Vec3::from(*center);
                let b = oc.dot(dir);
                let c = oc.length_squared() - radius * radius;
                let disc = b * b - c;
                if disc < 0.0 {
                    return None;
                }
                let sq = disc.sqrt();
                let t = if -b - sq > 0.0 { -b - sq } else { -b + sq };
                (t > 0.0).then_some((t, *color))
            }
            WorldPrimitive::Grating {
                radius,
                cycles,
                phase,
                half_height,
                color_a,
                color_b,
            } => {
                let a = dir.x * dir.x + dir.y * dir.y;
                if a <= f32::EPSILON {
                    return None;
                }
                let b = origin.x * dir.x + origin.y * dir.y;
                let c = origin.x * origin.x + origin.y * origin.y - radius * radius;
                let disc = b * b - a * c;
                if disc < 0.0 {
                    return None;
                }
                let t = (-b + disc.sqrt()) / a;
                if t <= 0.0 {
                    return None;
                }
                let hit = origin + dir * t;
                if hit.z.abs() > *half_height {
                    return None;
                }
                let angle = hit.y.atan2(hit.x) + phase;
                let cycle = (angle / TAU * cycles).rem_euclid(1.0);
                Some((t, if cycle < 0.5 { *color_a } else { *color_b }))
            }
            WorldPrimitive::Floor {
                height,
                tile_size,
                color_a,
                color_b,
            } => {
                if dir.z.abs() <= f32::EPSILON {
                    return None;
                }
                let t = (height - origin.z) / dir.z;
                if t <= 0.0 {
                    return None;
                }
                let hit = origin + dir * t;
                let size = tile_size.max(f32::EPSILON);
                let parity = ((hit.x / size).floor() as i64 + (hit.y / size).floor() as i64)
                    .rem_euclid(2);
                Some((t, if parity == 0 { *color_a } else { *color_b }))
            }
        }
    }
}

/// 3D content of a stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldScene {
    #[serde(default = "default_background")]
    pub background: Rgba,
    #[serde(default)]
    pub primitives: Vec<WorldPrimitive>,
}

fn default_background() -> Rgba {
    BLACK
}

impl Default for WorldScene {
    fn default() -> Self {
        Self {
            background: default_background(),
            primitives: Vec::new(),
        }
    }
}

impl WorldScene {
    pub fn solid(color: Rgba) -> Self {
        Self {
            background: color,
            primitives: Vec::new(),
        }
    }

    /// Colour seen from `origin` looking along `dir`.
    pub fn shade(&self, origin: Vec3, dir: Vec3) -> Rgba {
        let mut nearest: Option<(f32, Rgba)> = None;
        for primitive in &self.primitives {
            if let Some((t, color)) = primitive.intersect(origin, dir) {
                if nearest.map_or(true, |(best, _)| t < best) {
                    nearest = Some((t, color));
                }
            }
        }
        nearest.map_or(self.background, |(_, color)| color)
    }
}

/// A 2D overlay element in normalised display coordinates (0..1, y down).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HudElement {
    Rect {
        min: [f32; 2],
        max: [f32; 2],
        color: Rgba,
    },
    Crosshair {
        center: [f32; 2],
        size: f32,
        #[serde(default = "default_thickness")]
        thickness: f32,
        color: Rgba,
    },
    /// Square drawn where a world direction lands on the display.
    WorldMarker {
        direction: [f32; 3],
        size: f32,
        color: Rgba,
    },
}

fn default_thickness() -> f32 {
    0.005
}

/// 2D content drawn over the warped world layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HudLayer {
    #[serde(default)]
    pub elements: Vec<HudElement>,
}

impl HudLayer {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_hit_from_outside_and_inside() {
        let sphere = WorldPrimitive::Sphere {
            center: [5.0, 0.0, 0.0],
            radius: 1.0,
            color: WHITE,
        };
        let (t, _) = sphere.intersect(Vec3::ZERO, Vec3::X).unwrap();
        assert!((t - 4.0).abs() < 1e-5);
        assert!(sphere.intersect(Vec3::ZERO, -Vec3::X).is_none());

        let (t, _) = sphere.intersect(Vec3::new(5.0, 0.0, 0.0), Vec3::Y).unwrap();
        assert!((t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_grating_alternates_with_angle() {
        let grating = WorldPrimitive::Grating {
            radius: 1.0,
            cycles: 2.0,
            phase: 0.0,
            half_height: 10.0,
            color_a: WHITE,
            color_b: BLACK,
        };
        // Quarter turns step through half cycles.
        let dirs = [
            Vec3::new(1.0, 0.1, 0.0).normalize(),
            Vec3::new(-0.1, 1.0, 0.0).normalize(),
            Vec3::new(-1.0, -0.1, 0.0).normalize(),
        ];
        let colors: Vec<Rgba> = dirs
            .iter()
            .map(|d| grating.intersect(Vec3::ZERO, *d).unwrap().1)
            .collect();
        assert_eq!(colors, vec![WHITE, BLACK, WHITE]);
        assert!(grating.intersect(Vec3::ZERO, Vec3::Z).is_none());
    }

    #[test]
    fn test_floor_checker_and_nearest_hit() {
        let scene = WorldScene {
            background: [0.2, 0.2, 0.2, 1.0],
            primitives: vec![
                WorldPrimitive::Floor {
                    height: -1.0,
                    tile_size: 1.0,
                    color_a: WHITE,
                    color_b: BLACK,
                },
                WorldPrimitive::Sphere {
                    center: [0.0, 0.0, -0.5],
                    radius: 0.1,
                    color: [1.0, 0.0, 0.0, 1.0],
                },
            ],
        };
        assert_eq!(scene.shade(Vec3::ZERO, -Vec3::Z), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(scene.shade(Vec3::ZERO, Vec3::Z), [0.2, 0.2, 0.2, 1.0]);
        let toward_floor = Vec3::new(0.5, 0.5, -1.0).normalize();
        assert_eq!(scene.shade(Vec3::ZERO, toward_floor), WHITE);
    }

    #[test]
    fn test_scene_json_shape() {
        let json = r#"{
            "background": [0, 0, 0, 1],
            "primitives": [{"kind": "sphere", "center": [1, 0, 0], "radius": 0.5, "color": [1, 1, 1, 1]}]
        }"#;
        let scene: WorldScene = serde_json::from_str(json).unwrap();
        assert_eq!(scene.primitives.len(), 1);
        let hud: HudLayer =
            serde_json::from_str(r#"{"elements": [{"kind": "crosshair", "center": [0.5, 0.5], "size": 0.1, "color": [1,1,1,1]}]}"#)
                .unwrap();
        assert!(!hud.is_empty());
    }
}

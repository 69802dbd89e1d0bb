//! Omnidirectional capture into six cube faces.
//!
//! Face orientation follows the OpenGL cube-map conventions, so a direction
//! selects a face by its major axis and the remaining two components give
//! the texel within it.

use glam::Vec3;
use image::{Rgba, Rgba32FImage};

use crate::stimulus::scene::{Rgba as Color, WorldScene};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Face hit by `dir`, with face coordinates `(s, t)` in `[0, 1]`.
    pub fn project(dir: Vec3) -> (CubeFace, f32, f32) {
        let a = dir.abs();
        let (face, ma, sc, tc) = if a.x >= a.y && a.x >= a.z {
            if dir.x >= 0.0 {
                (CubeFace::PositiveX, a.x, -dir.z, -dir.y)
            } else {
                (CubeFace::NegativeX, a.x, dir.z, -dir.y)
            }
        } else if a.y >= a.z {
            if dir.y >= 0.0 {
                (CubeFace::PositiveY, a.y, dir.x, dir.z)
            } else {
                (CubeFace::NegativeY, a.y, dir.x, -dir.z)
            }
        } else if dir.z >= 0.0 {
            (CubeFace::PositiveZ, a.z, dir.x, -dir.y)
        } else {
            (CubeFace::NegativeZ, a.z, -dir.x, -dir.y)
        };
        let ma = ma.max(f32::MIN_POSITIVE);
        (face, (sc / ma + 1.0) * 0.5, (tc / ma + 1.0) * 0.5)
    }

    /// Unnormalised direction through face coordinates `(s, t)`.
    pub fn direction(self, s: f32, t: f32) -> Vec3 {
        let sc = 2.0 * s - 1.0;
        let tc = 2.0 * t - 1.0;
        match self {
            CubeFace::PositiveX => Vec3::new(1.0, -tc, -sc),
            CubeFace::NegativeX => Vec3::new(-1.0, -tc, sc),
            CubeFace::PositiveY => Vec3::new(sc, 1.0, tc),
            CubeFace::NegativeY => Vec3::new(sc, -1.0, -tc),
            CubeFace::PositiveZ => Vec3::new(sc, -tc, 1.0),
            CubeFace::NegativeZ => Vec3::new(-sc, -tc, -1.0),
        }
    }
}

/// Six square RGBA float faces.
#[derive(Debug, Clone)]
pub struct Cubemap {
    resolution: u32,
    faces: [Rgba32FImage; 6],
}

impl Cubemap {
    pub fn new(resolution: u32) -> Self {
        Self::filled(resolution, [0.0, 0.0, 0.0, 1.0])
    }

    pub fn filled(resolution: u32, color: Color) -> Self {
        let resolution = resolution.max(1);
        Self {
            resolution,
            faces: std::array::from_fn(|_| Rgba32FImage::from_pixel(resolution, resolution, Rgba(color))),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn face(&self, face: CubeFace) -> &Rgba32FImage {
        &self.faces[face.index()]
    }

    pub fn face_mut(&mut self, face: CubeFace) -> &mut Rgba32FImage {
        &mut self.faces[face.index()]
    }

    /// Bilinear lookup along `dir`. Coordinates past a face's outermost
    /// texel centres clamp to that edge.
    pub fn sample(&self, dir: Vec3) -> Color {
        let (face, s, t) = CubeFace::project(dir);
        let image = self.face(face);
        let n = self.resolution as f32;
        let max = (self.resolution - 1) as f32;
        let fx = (s * n - 0.5).clamp(0.0, max);
        let fy = (t * n - 0.5).clamp(0.0, max);

        let x0 = fx.floor() as u32;
        let y0 = fy.floor() as u32;
        let x1 = (x0 + 1).min(self.resolution - 1);
        let y1 = (y0 + 1).min(self.resolution - 1);
        let wx = fx - x0 as f32;
        let wy = fy - y0 as f32;

        let p00 = image.get_pixel(x0, y0).0;
        let p10 = image.get_pixel(x1, y0).0;
        let p01 = image.get_pixel(x0, y1).0;
        let p11 = image.get_pixel(x1, y1).0;

        let mut out = [0.0; 4];
        for c in 0..4 {
            let top = p00[c] + (p10[c] - p00[c]) * wx;
            let bottom = p01[c] + (p11[c] - p01[c]) * wx;
            out[c] = top + (bottom - top) * wy;
        }
        out
    }

    /// Horizontal cross: `-X +Z +X -Z` across the middle row, `+Y` above and
    /// `-Y` below the second column.
    pub fn to_cross_layout(&self) -> Rgba32FImage {
        let n = self.resolution;
        let mut out = Rgba32FImage::from_pixel(4 * n, 3 * n, Rgba([0.0, 0.0, 0.0, 1.0]));
        let placements = [
            (CubeFace::PositiveY, 1, 0),
            (CubeFace::NegativeX, 0, 1),
            (CubeFace::PositiveZ, 1, 1),
            (CubeFace::PositiveX, 2, 1),
            (CubeFace::NegativeZ, 3, 1),
            (CubeFace::NegativeY, 1, 2),
        ];
        for (face, col, row) in placements {
            image::imageops::replace(&mut out, self.face(face), (col * n) as i64, (row * n) as i64);
        }
        out
    }
}

/// Ray-casts the active stimulus's world into a [`Cubemap`].
///
/// Per-texel directions are computed once for the configured resolution.
pub struct CubemapCapturePass {
    resolution: u32,
    rays: Vec<Vec3>,
}

impl CubemapCapturePass {
    pub fn new(resolution: u32) -> Self {
        let resolution = resolution.max(1);
        let n = resolution as f32;
        let mut rays = Vec::with_capacity(6 * (resolution * resolution) as usize);
        for face in CubeFace::ALL {
            for y in 0..resolution {
                for x in 0..resolution {
                    let s = (x as f32 + 0.5) / n;
                    let t = (y as f32 + 0.5) / n;
                    rays.push(face.direction(s, t).normalize());
                }
            }
        }
        Self { resolution, rays }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Render `scene` as seen from `origin` into all six faces of `target`.
    pub fn capture(&self, scene: &WorldScene, origin: Vec3, target: &mut Cubemap) {
        if target.resolution() != self.resolution {
            *target = Cubemap::new(self.resolution);
        }
        let per_face = (self.resolution * self.resolution) as usize;
        for face in CubeFace::ALL {
            let rays = &self.rays[face.index() * per_face..(face.index() + 1) * per_face];
            for (pixel, dir) in target.face_mut(face).pixels_mut().zip(rays) {
                *pixel = Rgba(scene.shade(origin, *dir));
            }
        }
    }
}

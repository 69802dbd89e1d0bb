//! Warp the captured cubemap onto the display through the calibration.
//!
//! Every display texel looks up the capture direction the calibration
//! assigns to it and samples the cubemap along it. In one-pass mode colour
//! correction is applied in the same loop; in two-pass mode the warp lands
//! in a retained offscreen image and correction is left to the compositor.

use glam::Vec3;
use image::{Rgba, Rgba32FImage};

use crate::calibration::CalibrationGeometry;
use crate::compositor::ColorCorrection;
use crate::cubemap::Cubemap;

/// How the warped image reaches the display. Fixed when the pass is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPassMode {
    /// Warp and correct directly into the display layer.
    #[default]
    OnePass,
    /// Warp into an offscreen texture; correct after compositing.
    TwoPass,
}

impl RenderPassMode {
    pub fn from_two_pass(two_pass: bool) -> Self {
        if two_pass {
            RenderPassMode::TwoPass
        } else {
            RenderPassMode::OnePass
        }
    }
}

/// Output of the projection pass.
#[derive(Debug, Clone)]
pub struct ProjectedLayer {
    pub image: Rgba32FImage,
    /// Whether colour correction has already been applied.
    pub corrected: bool,
}

pub struct GeometryProjectionPass {
    mode: RenderPassMode,
    offscreen: Option<Rgba32FImage>,
}

impl GeometryProjectionPass {
    pub fn new(mode: RenderPassMode) -> Self {
        Self {
            mode,
            offscreen: None,
        }
    }

    pub fn mode(&self) -> RenderPassMode {
        self.mode
    }

    /// The last warped image in two-pass mode.
    pub fn offscreen(&self) -> Option<&Rgba32FImage> {
        self.offscreen.as_ref()
    }

    pub fn project(
        &mut self,
        cubemap: &Cubemap,
        geometry: &CalibrationGeometry,
        correction: ColorCorrection,
    ) -> ProjectedLayer {
        match self.mode {
            RenderPassMode::OnePass => ProjectedLayer {
                image: warp(cubemap, geometry, Some(correction)),
                corrected: true,
            },
            RenderPassMode::TwoPass => {
                let (width, height) = geometry.size();
                let reuse = self
                    .offscreen
                    .take()
                    .filter(|img| img.dimensions() == (width, height));
                let image = match reuse {
                    Some(mut target) => {
                        warp_into(&mut target, cubemap, geometry, None);
                        target
                    }
                    None => warp(cubemap, geometry, None),
                };
                self.offscreen = Some(image.clone());
                ProjectedLayer {
                    image,
                    corrected: false,
                }
            }
        }
    }
}

fn warp(
    cubemap: &Cubemap,
    geometry: &CalibrationGeometry,
    correction: Option<ColorCorrection>,
) -> Rgba32FImage {
    let (width, height) = geometry.size();
    let mut image = Rgba32FImage::new(width, height);
    warp_into(&mut image, cubemap, geometry, correction);
    image
}

fn warp_into(
    target: &mut Rgba32FImage,
    cubemap: &Cubemap,
    geometry: &CalibrationGeometry,
    correction: Option<ColorCorrection>,
) {
    if geometry.is_debug() {
        draw_geometry_coordinates(target, geometry);
        if let Some(correction) = correction {
            for pixel in target.pixels_mut() {
                pixel.0 = correction.apply(pixel.0);
            }
        }
        return;
    }
    for (x, y, pixel) in target.enumerate_pixels_mut() {
        let color = cubemap.sample(geometry.direction_at(x, y));
        pixel.0 = match correction {
            Some(correction) => correction.apply(color),
            None => color,
        };
    }
}

/// Colour each texel by its capture direction and mark every measured
/// correspondence, for checking alignment on the physical screen.
fn draw_geometry_coordinates(target: &mut Rgba32FImage, geometry: &CalibrationGeometry) {
    for (x, y, pixel) in target.enumerate_pixels_mut() {
        let d = geometry.direction_at(x, y) * 0.5 + Vec3::splat(0.5);
        *pixel = Rgba([d.x, d.y, d.z, 1.0]);
    }
    let (width, height) = target.dimensions();
    for c in geometry.correspondences() {
        let cx = (c.uv[0] * width as f32) as i64;
        let cy = (c.uv[1] * height as f32) as i64;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (x, y) = (cx + dx, cy + dy);
                if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
                    target.put_pixel(x as u32, y as u32, Rgba([1.0, 1.0, 1.0, 1.0]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationSource, Correspondence};
    use crate::cubemap::CubeFace;

    fn split_geometry() -> CalibrationGeometry {
        let points = vec![
            Correspondence { direction: Vec3::X, uv: [0.0, 0.0] },
            Correspondence { direction: Vec3::X, uv: [0.0, 1.0] },
            Correspondence { direction: -Vec3::X, uv: [1.0, 0.0] },
            Correspondence { direction: -Vec3::X, uv: [1.0, 1.0] },
        ];
        CalibrationGeometry::from_correspondences(points, 4, 2).unwrap()
    }

    fn two_tone_cubemap() -> Cubemap {
        let mut cubemap = Cubemap::filled(4, [0.25, 0.25, 0.25, 1.0]);
        for pixel in cubemap.face_mut(CubeFace::PositiveX).pixels_mut() {
            *pixel = Rgba([1.0, 0.0, 0.0, 1.0]);
        }
        cubemap
    }

    #[test]
    fn test_warp_follows_calibration() {
        let mut pass = GeometryProjectionPass::new(RenderPassMode::OnePass);
        let layer = pass.project(&two_tone_cubemap(), &split_geometry(), ColorCorrection::IDENTITY);
        assert!(layer.corrected);
        assert_eq!(layer.image.get_pixel(0, 0).0, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(layer.image.get_pixel(3, 1).0, [0.25, 0.25, 0.25, 1.0]);
        assert!(pass.offscreen().is_none());
    }

    #[test]
    fn test_two_pass_retains_uncorrected_offscreen() {
        let correction = ColorCorrection {
            gamma: 2.0,
            red_max: false,
        };
        let mut pass = GeometryProjectionPass::new(RenderPassMode::TwoPass);
        let layer = pass.project(&two_tone_cubemap(), &split_geometry(), correction);
        assert!(!layer.corrected);
        assert_eq!(layer.image.get_pixel(3, 1).0, [0.25, 0.25, 0.25, 1.0]);
        assert_eq!(pass.offscreen().unwrap(), &layer.image);

        let mut one = GeometryProjectionPass::new(RenderPassMode::OnePass);
        let layer = one.project(&two_tone_cubemap(), &split_geometry(), correction);
        assert!((layer.image.get_pixel(3, 1).0[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_debug_draws_directions() {
        let geometry = CalibrationGeometry::load(
            &CalibrationSource::Json(
                r#"{"debug": true, "correspondences": [{"direction": [0, 0, 1], "uv": [0.5, 0.5]}]}"#
                    .to_string(),
            ),
            8,
            8,
        )
        .unwrap();
        let mut pass = GeometryProjectionPass::new(RenderPassMode::OnePass);
        let layer = pass.project(&two_tone_cubemap(), &geometry, ColorCorrection::IDENTITY);
        assert_eq!(layer.image.get_pixel(0, 0).0, [0.5, 0.5, 1.0, 1.0]);
        assert_eq!(layer.image.get_pixel(4, 4).0, [1.0, 1.0, 1.0, 1.0]);
    }
}

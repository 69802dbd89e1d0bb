//! Display calibration: which capture direction each display texel shows.
//!
//! A calibration is a set of measured correspondences between unit
//! directions seen from the observer and normalised display coordinates.
//! From those a dense resampling map is built once per display size. The
//! built geometry is immutable; reloads and resizes produce a new value that
//! is swapped into the [`CalibrationSlot`] in one step.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::Vec3;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::display_geometry::DisplaySurfaceModel;
use crate::error::{DisplayError, Result};

/// Correspondences blended per display texel.
const NEIGHBOURS: usize = 4;

/// Texels farther than this multiple of the sample spacing from any
/// correspondence are outside the measured region.
const REACH_FACTOR: f32 = 1.5;

/// Where calibration data comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationSource {
    File(PathBuf),
    Json(String),
}

/// One measured direction/display-UV pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Unit direction from the observer.
    pub direction: Vec3,
    /// Display coordinates in `[0, 1]`, origin at the top-left.
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrespondenceRecord {
    direction: [f32; 3],
    uv: [f32; 2],
}

#[derive(Debug, Deserialize)]
struct CalibrationDocument {
    correspondences: Vec<CorrespondenceRecord>,
    #[serde(default)]
    debug: bool,
}

/// Loaded calibration plus its resampling map for one display size.
#[derive(Debug, Clone)]
pub struct CalibrationGeometry {
    correspondences: Vec<Correspondence>,
    debug: bool,
    fingerprint: String,
    width: u32,
    height: u32,
    /// Capture direction per display texel, row-major.
    map: Vec<Vec3>,
}

impl CalibrationGeometry {
    /// Parse `source` and build the resampling map for a `width` x `height`
    /// display.
    pub fn load(source: &CalibrationSource, width: u32, height: u32) -> Result<Self> {
        let text = match source {
            CalibrationSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                DisplayError::GeometryLoad(format!("cannot read {}: {}", path.display(), e))
            })?,
            CalibrationSource::Json(json) => json.clone(),
        };
        let (correspondences, debug) = parse_document(&text)?;
        let mut geometry = Self::from_correspondences(correspondences, width, height)?;
        geometry.debug = debug;
        geometry.fingerprint = fingerprint(text.as_bytes());
        Ok(geometry)
    }

    pub fn load_file(path: &Path, width: u32, height: u32) -> Result<Self> {
        Self::load(&CalibrationSource::File(path.to_path_buf()), width, height)
    }

    /// Build from an analytic surface description.
    pub fn from_surface_model(model: &DisplaySurfaceModel, width: u32, height: u32) -> Result<Self> {
        model.validate().map_err(DisplayError::GeometryLoad)?;
        let mut geometry = Self::from_correspondences(model.correspondences(), width, height)?;
        let canonical = serde_json::to_string(model)
            .map_err(|e| DisplayError::GeometryLoad(e.to_string()))?;
        geometry.fingerprint = fingerprint(canonical.as_bytes());
        Ok(geometry)
    }

    pub fn from_correspondences(
        correspondences: Vec<Correspondence>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if correspondences.is_empty() {
            return Err(DisplayError::GeometryLoad(
                "calibration has no correspondences".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(DisplayError::GeometryLoad(format!(
                "display size must be non-zero, got {}x{}",
                width, height
            )));
        }
        let map = build_resampling_map(&correspondences, width, height);
        Ok(Self {
            correspondences,
            debug: false,
            fingerprint: String::new(),
            width,
            height,
            map,
        })
    }

    /// Same correspondences, with geometry visualisation switched on or off.
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Switch visualisation on when requested. A document that asked for it
    /// keeps it either way.
    pub fn with_debug_requested(mut self, requested: bool) -> Self {
        self.debug |= requested;
        self
    }

    /// Same correspondences, resampled for a new display size.
    pub fn resized(&self, width: u32, height: u32) -> Result<Self> {
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let mut geometry = Self::from_correspondences(self.correspondences.clone(), width, height)?;
        geometry.debug = self.debug;
        geometry.fingerprint = self.fingerprint.clone();
        Ok(geometry)
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// SHA-256 of the source document, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    /// Capture direction shown at display texel `(x, y)`.
    pub fn direction_at(&self, x: u32, y: u32) -> Vec3 {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        self.map[(y * self.width + x) as usize]
    }

    /// Display coordinates where `direction` appears. Directions outside the
    /// calibrated field clamp to the angularly nearest correspondence.
    pub fn display_uv_for(&self, direction: Vec3) -> [f32; 2] {
        let dir = direction.normalize_or_zero();
        let mut best = &self.correspondences[0];
        let mut best_dot = f32::NEG_INFINITY;
        for c in &self.correspondences {
            let d = c.direction.dot(dir);
            if d > best_dot {
                best_dot = d;
                best = c;
            }
        }
        best.uv
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn parse_document(text: &str) -> Result<(Vec<Correspondence>, bool)> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| DisplayError::GeometryLoad(format!("malformed calibration JSON: {}", e)))?;

    if value.get("model").is_some() {
        let model: DisplaySurfaceModel = serde_json::from_value(value)
            .map_err(|e| DisplayError::GeometryLoad(format!("surface model: {}", e)))?;
        model.validate().map_err(DisplayError::GeometryLoad)?;
        return Ok((model.correspondences(), false));
    }

    let (records, debug) = if value.is_array() {
        let records: Vec<CorrespondenceRecord> = serde_json::from_value(value)
            .map_err(|e| DisplayError::GeometryLoad(format!("correspondences: {}", e)))?;
        (records, false)
    } else {
        let doc: CalibrationDocument = serde_json::from_value(value)
            .map_err(|e| DisplayError::GeometryLoad(format!("calibration: {}", e)))?;
        (doc.correspondences, doc.debug)
    };

    let correspondences = records
        .into_iter()
        .enumerate()
        .map(|(i, record)| validate_record(i, record))
        .collect::<Result<Vec<_>>>()?;
    Ok((correspondences, debug))
}

fn validate_record(index: usize, record: CorrespondenceRecord) -> Result<Correspondence> {
    let direction = Vec3::from(record.direction);
    if !direction.is_finite() || direction.length_squared() <= f32::EPSILON {
        return Err(DisplayError::GeometryLoad(format!(
            "record {}: direction {:?} is not a usable vector",
            index, record.direction
        )));
    }
    if !record.uv.iter().all(|c| c.is_finite() && (0.0..=1.0).contains(c)) {
        return Err(DisplayError::GeometryLoad(format!(
            "record {}: uv {:?} outside [0, 1]",
            index, record.uv
        )));
    }
    Ok(Correspondence {
        direction: direction.normalize(),
        uv: record.uv,
    })
}

// ============================================================================
// Resampling map
// ============================================================================

/// Uniform bucket grid over UV space for nearest-neighbour queries.
struct UvGrid<'a> {
    points: &'a [Correspondence],
    cells: Vec<Vec<usize>>,
    size: usize,
}

impl<'a> UvGrid<'a> {
    fn new(points: &'a [Correspondence]) -> Self {
        let size = ((points.len() as f32 / 2.0).sqrt().ceil() as usize).clamp(1, 256);
        let mut cells = vec![Vec::new(); size * size];
        for (i, p) in points.iter().enumerate() {
            let (cx, cy) = Self::cell_of(p.uv, size);
            cells[cy * size + cx].push(i);
        }
        Self {
            points,
            cells,
            size,
        }
    }

    fn cell_of(uv: [f32; 2], size: usize) -> (usize, usize) {
        let f = |c: f32| ((c.clamp(0.0, 1.0) * size as f32) as usize).min(size - 1);
        (f(uv[0]), f(uv[1]))
    }

    /// Up to `k` nearest points to `uv`, closest first, as (distance, index).
    fn nearest(&self, uv: [f32; 2], k: usize) -> Vec<(f32, usize)> {
        let (cx, cy) = Self::cell_of(uv, self.size);
        let cell_width = 1.0 / self.size as f32;
        let mut best: Vec<(f32, usize)> = Vec::with_capacity(k + 1);

        for ring in 0..self.size {
            let r = ring as isize;
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs() != r && dy.abs() != r {
                        continue;
                    }
                    let (x, y) = (cx as isize + dx, cy as isize + dy);
                    if x < 0 || y < 0 || x >= self.size as isize || y >= self.size as isize {
                        continue;
                    }
                    for &i in &self.cells[y as usize * self.size + x as usize] {
                        let p = self.points[i].uv;
                        let d = ((p[0] - uv[0]).powi(2) + (p[1] - uv[1]).powi(2)).sqrt();
                        let pos = best.partition_point(|&(bd, _)| bd <= d);
                        if pos < k {
                            best.insert(pos, (d, i));
                            best.truncate(k);
                        }
                    }
                }
            }
            // Anything in the next ring is at least `ring` cells away.
            if best.len() == k && best[k - 1].0 <= ring as f32 * cell_width {
                break;
            }
        }
        best
    }
}

fn build_resampling_map(points: &[Correspondence], width: u32, height: u32) -> Vec<Vec3> {
    let grid = UvGrid::new(points);

    // Sample spacing: the largest nearest-neighbour distance.
    let reach = if points.len() < 2 {
        f32::INFINITY
    } else {
        let spacing = points
            .iter()
            .filter_map(|p| grid.nearest(p.uv, 2).get(1).map(|&(d, _)| d))
            .fold(0.0f32, f32::max);
        (spacing * REACH_FACTOR).max(f32::EPSILON)
    };

    let mut map = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let uv = [
                (x as f32 + 0.5) / width as f32,
                (y as f32 + 0.5) / height as f32,
            ];
            let neighbours = grid.nearest(uv, NEIGHBOURS);
            map.push(blend(points, &neighbours, reach));
        }
    }
    map
}

/// Inverse-distance blend of neighbour directions. Outside the measured
/// region, or where the blend cancels out, the nearest direction is used.
fn blend(points: &[Correspondence], neighbours: &[(f32, usize)], reach: f32) -> Vec3 {
    let (nearest_dist, nearest) = neighbours[0];
    let nearest_dir = points[nearest].direction;
    if neighbours.len() == 1 || nearest_dist <= 1e-6 || nearest_dist > reach {
        return nearest_dir;
    }
    let mut sum = Vec3::ZERO;
    for &(d, i) in neighbours {
        sum += points[i].direction / d;
    }
    if sum.length_squared() <= 1e-12 {
        nearest_dir
    } else {
        sum.normalize()
    }
}

// ============================================================================
// Slot
// ============================================================================

/// The active calibration, shared between the render loop and reloaders.
///
/// Frames take one [`snapshot`](Self::snapshot) at their start and use it
/// throughout; a concurrent [`replace`](Self::replace) only affects later
/// frames.
#[derive(Debug, Default)]
pub struct CalibrationSlot {
    active: Mutex<Option<Arc<CalibrationGeometry>>>,
}

impl CalibrationSlot {
    pub fn new(geometry: Option<CalibrationGeometry>) -> Self {
        Self {
            active: Mutex::new(geometry.map(Arc::new)),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<CalibrationGeometry>> {
        self.lock().clone()
    }

    /// Swap in a new geometry, returning the previous one.
    pub fn replace(&self, geometry: CalibrationGeometry) -> Option<Arc<CalibrationGeometry>> {
        let geometry = Arc::new(geometry);
        std::mem::replace(&mut *self.lock(), Some(geometry))
    }

    pub fn clear(&self) -> Option<Arc<CalibrationGeometry>> {
        self.lock().take()
    }

    /// Parse and build outside the lock, then swap. On failure the current
    /// geometry stays active.
    pub fn reload(&self, source: &CalibrationSource, width: u32, height: u32, debug: bool) -> Result<()> {
        let geometry = CalibrationGeometry::load(source, width, height)?.with_debug_requested(debug);
        log::info!(
            "Calibration loaded: {} correspondences, fingerprint {}",
            geometry.correspondences().len(),
            &geometry.fingerprint()[..geometry.fingerprint().len().min(12)]
        );
        self.replace(geometry);
        Ok(())
    }

    /// Derive a new geometry from the active one and swap it in, unless a
    /// reload replaced the active geometry meanwhile, in which case `derive`
    /// runs again against the newer one. The build happens outside the lock.
    ///
    /// Returns `false` when the slot is empty.
    pub fn update_with<F>(&self, derive: F) -> Result<bool>
    where
        F: Fn(&CalibrationGeometry) -> Result<CalibrationGeometry>,
    {
        loop {
            let Some(current) = self.snapshot() else {
                return Ok(false);
            };
            let next = derive(&current)?;
            let mut active = self.lock();
            match active.as_ref() {
                Some(latest) if Arc::ptr_eq(latest, &current) => {
                    *active = Some(Arc::new(next));
                    return Ok(true);
                }
                Some(_) => continue,
                None => return Ok(false),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<CalibrationGeometry>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

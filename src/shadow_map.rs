use crate::backend::{self, ShadowBackend};
use crate::geo_projection::{project, unproject};
use crate::shadow_engine::Scene;
use crate::types::*;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub const SUNLIT: u8 = 0;
pub const SHADED: u8 = 1;

/// Upper bound on `columns * rows`, so a typo in the cell size fails instead of
/// allocating gigabytes.
pub const MAX_GRID_CELLS: usize = 64_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterMeta {
    pub center: GeoPoint,
    pub radius_meters: f64,
    pub cell_meters: f64,
    pub instant: DateTime<Utc>,
}

/// Shaded/sunlit samples on a square grid around a disk.
///
/// Row 0 is the southern edge and column 0 the western edge; `origin` is the
/// grid's south-west corner. Cells whose centre lies outside the disk are
/// always sunlit. Rasters are never edited after they are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RasterRecord", try_from = "RasterRecord")]
pub struct ShadowRaster {
    meta: RasterMeta,
    origin: GeoPoint,
    grid: Array2<u8>,
}

/// Wire shape of a raster: `grid` is row-major `rows × columns` of 0/1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterRecord {
    pub meta: RasterMeta,
    pub origin: GeoPoint,
    pub columns: usize,
    pub rows: usize,
    pub grid: Vec<Vec<u8>>,
}

impl From<ShadowRaster> for RasterRecord {
    fn from(raster: ShadowRaster) -> Self {
        let (rows, columns) = raster.grid.dim();
        RasterRecord {
            meta: raster.meta,
            origin: raster.origin,
            columns,
            rows,
            grid: raster.grid.outer_iter().map(|row| row.to_vec()).collect(),
        }
    }
}

impl TryFrom<RasterRecord> for ShadowRaster {
    type Error = ShadowError;

    fn try_from(record: RasterRecord) -> Result<Self> {
        let malformed = |msg: String| ShadowError::Config(format!("malformed raster: {}", msg));

        ensure_positive("radiusMeters", record.meta.radius_meters)?;
        ensure_positive("cellMeters", record.meta.cell_meters)?;
        let expected = grid_size(2.0 * record.meta.radius_meters, record.meta.cell_meters)?;
        if record.columns != expected || record.rows != expected {
            return Err(malformed(format!(
                "expected {0}x{0} cells, header says {1}x{2}",
                expected, record.columns, record.rows
            )));
        }
        if record.grid.len() != record.rows {
            return Err(malformed(format!(
                "{} rows declared, {} present",
                record.rows,
                record.grid.len()
            )));
        }

        let mut data = Vec::with_capacity(record.rows * record.columns);
        for (r, row) in record.grid.iter().enumerate() {
            if row.len() != record.columns {
                return Err(malformed(format!(
                    "row {} has {} cells, expected {}",
                    r,
                    row.len(),
                    record.columns
                )));
            }
            if let Some(v) = row.iter().find(|&&v| v != SUNLIT && v != SHADED) {
                return Err(malformed(format!("row {} holds value {}", r, v)));
            }
            data.extend_from_slice(row);
        }

        let grid = Array2::from_shape_vec((record.rows, record.columns), data)
            .map_err(|e| malformed(e.to_string()))?;

        Ok(ShadowRaster {
            meta: record.meta,
            origin: record.origin,
            grid,
        })
    }
}

impl ShadowRaster {
    pub fn meta(&self) -> &RasterMeta {
        &self.meta
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    pub fn columns(&self) -> usize {
        self.grid.ncols()
    }

    pub fn rows(&self) -> usize {
        self.grid.nrows()
    }

    pub fn grid(&self) -> &Array2<u8> {
        &self.grid
    }

    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        self.grid.get([row, col]).copied()
    }

    fn half_extent(&self) -> f64 {
        self.columns() as f64 * self.meta.cell_meters / 2.0
    }

    /// Offset in metres of a cell centre from the raster centre.
    pub fn cell_offset(&self, row: usize, col: usize) -> LocalPoint {
        cell_offset(row, col, self.meta.cell_meters, self.half_extent())
    }

    pub fn cell_center(&self, row: usize, col: usize) -> GeoPoint {
        unproject(self.meta.center, self.cell_offset(row, col))
    }

    pub fn is_inside_disk(&self, row: usize, col: usize) -> bool {
        self.cell_offset(row, col).length() <= self.meta.radius_meters
    }

    /// Cell holding `point`, or `None` outside the grid.
    pub fn cell_at(&self, point: GeoPoint) -> Option<(usize, usize)> {
        let local = project(self.meta.center, point);
        let half = self.half_extent();
        let col = ((local.x + half) / self.meta.cell_meters).floor();
        let row = ((local.y + half) / self.meta.cell_meters).floor();
        if !(col >= 0.0 && row >= 0.0) {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row < self.rows() && col < self.columns() {
            Some((row, col))
        } else {
            None
        }
    }

    /// `true` when `point` is sunlit. Points off the grid count as sunlit.
    pub fn is_sunny(&self, point: GeoPoint) -> bool {
        match self.cell_at(point) {
            Some((row, col)) => self.grid[[row, col]] == SUNLIT,
            None => true,
        }
    }

    pub fn shaded_cells(&self) -> usize {
        self.grid.iter().filter(|&&v| v == SHADED).count()
    }
}

pub fn query_raster(raster: &ShadowRaster, point: GeoPoint) -> bool {
    raster.is_sunny(point)
}

fn grid_size(diameter_meters: f64, cell_meters: f64) -> Result<usize> {
    let n = (diameter_meters / cell_meters).ceil();
    if !n.is_finite() || n < 1.0 || n * n > MAX_GRID_CELLS as f64 {
        return Err(ShadowError::DegenerateInput(format!(
            "a {} m disk at {} m cells needs {}x{} cells (limit {})",
            diameter_meters, cell_meters, n, n, MAX_GRID_CELLS
        )));
    }
    Ok(n as usize)
}

fn cell_offset(row: usize, col: usize, cell_meters: f64, half_extent: f64) -> LocalPoint {
    LocalPoint::new(
        -half_extent + (col as f64 + 0.5) * cell_meters,
        -half_extent + (row as f64 + 0.5) * cell_meters,
    )
}

/// Builds shadow rasters for one building set.
pub struct ShadowMapBuilder {
    scene: Scene,
    config: Config,
    backend: Box<dyn ShadowBackend>,
}

impl ShadowMapBuilder {
    pub fn new(buildings: &[BuildingFootprint], config: Config) -> Result<Self> {
        config.validate()?;
        let backend = backend::from_config(&config)?;
        Ok(Self {
            scene: Scene::new(buildings, config.occluder_policy),
            config,
            backend,
        })
    }

    pub fn with_backend(mut self, backend: Box<dyn ShadowBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn build(
        &self,
        center: GeoPoint,
        diameter_meters: f64,
        instant: &DateTime<Utc>,
    ) -> Result<ShadowRaster> {
        if !center.is_finite() {
            return Err(ShadowError::DegenerateInput(format!(
                "raster centre has non-finite coordinates: {:?}",
                center
            )));
        }
        ensure_positive("diameterMeters", diameter_meters)?;
        let cell_meters = self.config.cell_meters;
        ensure_positive("cellMeters", cell_meters)?;
        let max_ray = self.config.batch_ray_for(diameter_meters);
        ensure_positive("batchRayMeters", max_ray)?;

        let n = grid_size(diameter_meters, cell_meters)?;
        let radius = diameter_meters / 2.0;
        let half = n as f64 * cell_meters / 2.0;
        let origin = unproject(center, LocalPoint::new(-half, -half));

        let (cells, points): (Vec<(usize, usize)>, Vec<GeoPoint>) = (0..n)
            .flat_map(|row| (0..n).map(move |col| (row, col)))
            .filter_map(|(row, col)| {
                let offset = cell_offset(row, col, cell_meters, half);
                (offset.length() <= radius).then(|| ((row, col), unproject(center, offset)))
            })
            .unzip();

        debug!(
            "Raster {}x{} at {} m: {} of {} cells inside the disk, ray {} m, backend {}",
            n,
            n,
            cell_meters,
            cells.len(),
            n * n,
            max_ray,
            self.backend.name()
        );

        let pb = self.progress_bar(points.len() as u64);
        let results = self
            .backend
            .classify(&self.scene, &points, instant, max_ray, pb.as_ref())?;
        if let Some(pb) = pb {
            pb.finish_with_message("Shadow raster complete");
        }

        let mut grid = Array2::<u8>::zeros((n, n));
        for (&(row, col), result) in cells.iter().zip(results.iter()) {
            if result.shaded {
                grid[[row, col]] = SHADED;
            }
        }

        let raster = ShadowRaster {
            meta: RasterMeta {
                center,
                radius_meters: radius,
                cell_meters,
                instant: *instant,
            },
            origin,
            grid,
        };
        info!(
            "Built {}x{} shadow raster: {} of {} disk cells shaded",
            n,
            n,
            raster.shaded_cells(),
            cells.len()
        );
        Ok(raster)
    }

    fn progress_bar(&self, len: u64) -> Option<ProgressBar> {
        if !self.config.show_progress {
            return None;
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style);
        }
        Some(pb)
    }
}

/// One-shot raster build with the default configuration and `cell_meters` cells.
pub fn build_shadow_raster(
    center: GeoPoint,
    diameter_meters: f64,
    instant: &DateTime<Utc>,
    cell_meters: f64,
    buildings: &[BuildingFootprint],
) -> Result<ShadowRaster> {
    ensure_positive("cellMeters", cell_meters)?;
    ensure_positive("diameterMeters", diameter_meters)?;
    let config = Config {
        cell_meters,
        ..Config::default()
    };
    ShadowMapBuilder::new(buildings, config)?.build(center, diameter_meters, instant)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTER: GeoPoint = GeoPoint::new(-122.4194, 37.7749);

    fn noon() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-21T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn midnight() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-21T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_dimensions() {
        let raster = build_shadow_raster(CENTER, 100.0, &noon(), 30.0, &[]).unwrap();
        assert_eq!(raster.columns(), 4);
        assert_eq!(raster.rows(), 4);
        assert_eq!(raster.meta().radius_meters, 50.0);

        let origin = project(CENTER, raster.origin());
        assert!((origin.x + 60.0).abs() < 1e-6);
        assert!((origin.y + 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_night_shades_disk_only() {
        let raster = build_shadow_raster(CENTER, 100.0, &midnight(), 10.0, &[]).unwrap();
        for row in 0..raster.rows() {
            for col in 0..raster.columns() {
                let expected = if raster.is_inside_disk(row, col) { SHADED } else { SUNLIT };
                assert_eq!(raster.get(row, col), Some(expected), "cell ({}, {})", row, col);
            }
        }
        // Corner cells lie outside the disk.
        assert_eq!(raster.get(0, 0), Some(SUNLIT));
        assert!(raster.shaded_cells() > 0);
    }

    #[test]
    fn test_query_outside_grid_is_sunny() {
        let raster = build_shadow_raster(CENTER, 100.0, &midnight(), 10.0, &[]).unwrap();
        assert!(!raster.is_sunny(CENTER));
        let far = unproject(CENTER, LocalPoint::new(500.0, 0.0));
        assert!(query_raster(&raster, far));
        let south_west = unproject(CENTER, LocalPoint::new(-51.0, -51.0));
        assert!(query_raster(&raster, south_west));
        assert!(query_raster(&raster, GeoPoint::new(f64::NAN, 0.0)));
    }

    #[test]
    fn test_cell_centres_map_to_own_cell() {
        let raster = build_shadow_raster(CENTER, 90.0, &noon(), 7.0, &[]).unwrap();
        for row in 0..raster.rows() {
            for col in 0..raster.columns() {
                assert_eq!(raster.cell_at(raster.cell_center(row, col)), Some((row, col)));
            }
        }
    }

    #[test]
    fn test_degenerate_parameters() {
        for (diameter, cell) in [(0.0, 10.0), (100.0, 0.0), (-5.0, 1.0), (100.0, f64::NAN)] {
            assert!(matches!(
                build_shadow_raster(CENTER, diameter, &noon(), cell, &[]),
                Err(ShadowError::DegenerateInput(_))
            ));
        }
        assert!(build_shadow_raster(CENTER, 1.0e7, &noon(), 0.01, &[]).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let raster = build_shadow_raster(CENTER, 60.0, &midnight(), 10.0, &[]).unwrap();
        let json = serde_json::to_string(&raster).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["columns"], 6);
        assert_eq!(value["rows"], 6);
        assert_eq!(value["meta"]["radiusMeters"], 30.0);
        assert_eq!(value["grid"].as_array().unwrap().len(), 6);

        let back: ShadowRaster = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raster);
    }

    #[test]
    fn test_malformed_record_rejected() {
        let raster = build_shadow_raster(CENTER, 20.0, &midnight(), 10.0, &[]).unwrap();
        let mut value = serde_json::to_value(&raster).unwrap();
        value["grid"][0][0] = serde_json::json!(7);
        assert!(serde_json::from_value::<ShadowRaster>(value).is_err());

        let mut value = serde_json::to_value(&raster).unwrap();
        value["columns"] = serde_json::json!(3);
        assert!(serde_json::from_value::<ShadowRaster>(value).is_err());
    }
}

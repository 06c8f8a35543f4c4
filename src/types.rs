use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

pub type Result<T> = std::result::Result<T, ShadowError>;

/// Geographic position in degrees. Serialized as `{ "lng": .., "lat": .. }`;
/// GeoJSON-style `[lng, lat]` pairs are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "GeoPointRecord")]
pub struct GeoPoint {
    #[serde(rename = "lng")]
    pub longitude: f64,
    #[serde(rename = "lat")]
    pub latitude: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeoPointRecord {
    Pair([f64; 2]),
    Named {
        #[serde(alias = "longitude")]
        lng: f64,
        #[serde(alias = "latitude")]
        lat: f64,
    },
}

impl From<GeoPointRecord> for GeoPoint {
    fn from(record: GeoPointRecord) -> Self {
        match record {
            GeoPointRecord::Pair([lng, lat]) => GeoPoint::new(lng, lat),
            GeoPointRecord::Named { lng, lat } => GeoPoint::new(lng, lat),
        }
    }
}

impl GeoPoint {
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.longitude.is_finite() && self.latitude.is_finite()
    }
}

impl From<GeoPoint> for geo_types::Coord<f64> {
    fn from(p: GeoPoint) -> Self {
        geo_types::coord! { x: p.longitude, y: p.latitude }
    }
}

impl From<geo_types::Coord<f64>> for GeoPoint {
    fn from(c: geo_types::Coord<f64>) -> Self {
        GeoPoint::new(c.x, c.y)
    }
}

/// Metres east (`x`) and north (`y`) of the anchor it was projected against.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalPoint {
    pub x: f64,
    pub y: f64,
}

impl LocalPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl From<LocalPoint> for geo_types::Coord<f64> {
    fn from(p: LocalPoint) -> Self {
        geo_types::coord! { x: p.x, y: p.y }
    }
}

impl From<geo_types::Coord<f64>> for LocalPoint {
    fn from(c: geo_types::Coord<f64>) -> Self {
        LocalPoint::new(c.x, c.y)
    }
}

/// Building identifier as handed out by the data provider (OSM ids are numeric,
/// other sources use strings).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildingId {
    Number(i64),
    Text(String),
}

impl fmt::Display for BuildingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildingId::Number(n) => write!(f, "{}", n),
            BuildingId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for BuildingId {
    fn from(n: i64) -> Self {
        BuildingId::Number(n)
    }
}

impl From<&str> for BuildingId {
    fn from(s: &str) -> Self {
        BuildingId::Text(s.to_string())
    }
}

/// Flat-roofed extrusion of a closed ground footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingFootprint {
    pub id: BuildingId,
    #[serde(rename = "outer")]
    pub outer_ring: Vec<GeoPoint>,
    #[serde(rename = "height")]
    pub height_meters: f64,
}

impl BuildingFootprint {
    pub fn new(id: impl Into<BuildingId>, outer_ring: Vec<GeoPoint>, height_meters: f64) -> Self {
        Self {
            id: id.into(),
            outer_ring,
            height_meters,
        }
    }

    /// Checks the ring is closed, has at least three distinct vertices and that
    /// every number involved is finite. Height must be positive.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ShadowError::InvalidGeometry {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };

        if !(self.height_meters.is_finite() && self.height_meters > 0.0) {
            return Err(invalid("height must be a positive finite number"));
        }
        if self.outer_ring.len() < 4 {
            return Err(invalid("ring needs at least 4 points"));
        }
        if self.outer_ring.iter().any(|p| !p.is_finite()) {
            return Err(invalid("ring contains non-finite coordinates"));
        }
        let first = self.outer_ring[0];
        let last = self.outer_ring[self.outer_ring.len() - 1];
        if first != last {
            return Err(invalid("ring is not closed"));
        }

        let distinct: HashSet<(u64, u64)> = self
            .outer_ring
            .iter()
            .map(|p| (p.longitude.to_bits(), p.latitude.to_bits()))
            .collect();
        if distinct.len() < 3 {
            return Err(invalid("ring has fewer than 3 distinct vertices"));
        }

        Ok(())
    }
}

/// Sun position at one instant and place.
///
/// `azimuth` keeps the ephemeris convention (radians, 0 = south, positive toward
/// west); the two bearings are compass degrees clockwise from true north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarPosition {
    pub altitude: f64,
    pub azimuth: f64,
    pub bearing_from_north: f64,
    pub shadow_bearing: f64,
}

impl SolarPosition {
    pub fn from_altitude_azimuth(altitude: f64, azimuth: f64) -> Self {
        let bearing_from_north = (azimuth.to_degrees() + 180.0).rem_euclid(360.0);
        let shadow_bearing = (bearing_from_north + 180.0).rem_euclid(360.0);
        Self {
            altitude,
            azimuth,
            bearing_from_north,
            shadow_bearing,
        }
    }

    /// Builds a position from altitude (radians) and compass bearing (degrees).
    pub fn from_bearing(altitude: f64, bearing_from_north: f64) -> Self {
        let azimuth = (bearing_from_north - 180.0).to_radians();
        Self::from_altitude_azimuth(altitude, azimuth)
    }

    pub fn is_above_horizon(&self) -> bool {
        self.altitude > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadeResult {
    pub shaded: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cast_by: Option<BuildingId>,
}

impl ShadeResult {
    pub fn sunlit() -> Self {
        Self {
            shaded: false,
            cast_by: None,
        }
    }

    /// Sun at or below the horizon.
    pub fn night() -> Self {
        Self {
            shaded: true,
            cast_by: None,
        }
    }

    pub fn cast_by(id: BuildingId) -> Self {
        Self {
            shaded: true,
            cast_by: Some(id),
        }
    }
}

/// Which occluding building the shadow test reports when several qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OccluderPolicy {
    /// Every building is evaluated and the closest qualifying hit wins.
    #[default]
    Nearest,
    /// Stop at the first building, in input order, tall enough to reach the
    /// closest ray hit found on any building so far.
    FirstMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    #[default]
    Parallel,
    Serial,
}

pub const DEFAULT_MAX_RAY_METERS: f64 = 500.0;
pub const DEFAULT_CELL_METERS: f64 = 20.0;
pub const MIN_BATCH_RAY_METERS: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub max_ray_meters: f64,
    pub batch_ray_meters: Option<f64>,
    pub cell_meters: f64,
    pub occluder_policy: OccluderPolicy,
    pub backend: BackendKind,
    pub cpu_cores: Option<usize>,
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_ray_meters: DEFAULT_MAX_RAY_METERS,
            batch_ray_meters: None,
            cell_meters: DEFAULT_CELL_METERS,
            occluder_policy: OccluderPolicy::default(),
            backend: BackendKind::default(),
            cpu_cores: None,
            show_progress: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_positive("maxRayMeters", self.max_ray_meters)?;
        ensure_positive("cellMeters", self.cell_meters)?;
        if let Some(ray) = self.batch_ray_meters {
            ensure_positive("batchRayMeters", ray)?;
        }
        if self.cpu_cores == Some(0) {
            return Err(ShadowError::Config("cpuCores must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn get_cpu_cores(&self) -> usize {
        self.cpu_cores.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Ray length used for raster builds: long enough to cross the whole disk.
    pub fn batch_ray_for(&self, diameter_meters: f64) -> f64 {
        self.batch_ray_meters
            .unwrap_or_else(|| diameter_meters.max(MIN_BATCH_RAY_METERS))
    }
}

pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ShadowError::DegenerateInput(format!(
            "{} must be a positive finite number, got {}",
            name, value
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid geometry for building {id}: {reason}")]
    InvalidGeometry { id: String, reason: String },
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Building provider error: {0}")]
    Provider(String),
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

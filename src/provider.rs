//! Building data sources and request throttling.
//!
//! The shadow code only consumes `BuildingFootprint`s. This module turns an
//! Overpass API `out geom` response into footprints, estimates missing heights,
//! and spaces out requests to an external service.

use crate::geo_projection::project_ring;
use crate::types::*;
use geo::EuclideanDistance;
use geo_types::{LineString, Point, Polygon};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Height used when a building carries no usable tags.
pub const FALLBACK_HEIGHT_METERS: f64 = 10.0;
pub const METERS_PER_LEVEL: f64 = 3.0;

pub trait BuildingProvider {
    /// Buildings with at least one vertex within `radius_meters` of `center`.
    fn fetch_buildings(&self, center: GeoPoint, radius_meters: f64) -> Result<Vec<BuildingFootprint>>;
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    id: i64,
    #[serde(default)]
    geometry: Option<Vec<OverpassNode>>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OverpassNode {
    lat: f64,
    lon: f64,
}

/// Parses an Overpass JSON response. Elements that do not describe a way with
/// at least three nodes are skipped; open rings are closed.
pub fn parse_overpass(json: &str) -> Result<Vec<BuildingFootprint>> {
    let response: OverpassResponse = serde_json::from_str(json)?;
    let mut buildings = Vec::with_capacity(response.elements.len());

    for value in response.elements {
        let element: OverpassElement = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping malformed Overpass element: {}", e);
                continue;
            }
        };
        let Some(nodes) = element.geometry else {
            continue;
        };
        if nodes.len() < 3 {
            debug!("Skipping way {} with {} nodes", element.id, nodes.len());
            continue;
        }

        let mut ring: Vec<GeoPoint> = nodes
            .iter()
            .map(|n| GeoPoint::new(n.lon, n.lat))
            .collect();
        if ring.first() != ring.last() {
            ring.push(ring[0]);
        }

        let height = estimate_height(&element.tags);
        buildings.push(BuildingFootprint::new(element.id, ring, height));
    }

    Ok(buildings)
}

/// Height from OSM tags: `height` / `building:height` (metres, unit optional),
/// else `building:levels` × 3 m, else 10 m. Zero or unreadable values fall
/// through to the next rule.
pub fn estimate_height(tags: &HashMap<String, String>) -> f64 {
    let explicit = tags
        .get("height")
        .or_else(|| tags.get("building:height"))
        .and_then(|raw| leading_number(raw));
    if let Some(h) = explicit.filter(|h| *h > 0.0) {
        return h;
    }

    let levels = tags
        .get("building:levels")
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|l| l.is_finite() && *l > 0.0);
    if let Some(levels) = levels {
        return levels * METERS_PER_LEVEL;
    }

    FALLBACK_HEIGHT_METERS
}

/// First `digits[.digits]` run in `raw`, e.g. `"12.5 m"` -> 12.5.
fn leading_number(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let rest = &raw[start..];
    let mut end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if rest[end..].starts_with('.') {
        let fraction = &rest[end + 1..];
        end += 1 + fraction
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(fraction.len());
    }
    rest[..end].trim_end_matches('.').parse().ok()
}

/// Any part of the footprint (outline or interior) within `radius_meters`.
fn within_radius(building: &BuildingFootprint, center: GeoPoint, radius_meters: f64) -> bool {
    let exterior: LineString<f64> = project_ring(center, &building.outer_ring)
        .into_iter()
        .map(geo_types::Coord::from)
        .collect();
    let footprint = Polygon::new(exterior, vec![]);
    Point::new(0.0, 0.0).euclidean_distance(&footprint) <= radius_meters
}

/// Buildings from a saved Overpass response.
#[derive(Debug, Clone)]
pub struct OverpassFileProvider {
    path: PathBuf,
}

impl OverpassFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BuildingProvider for OverpassFileProvider {
    fn fetch_buildings(&self, center: GeoPoint, radius_meters: f64) -> Result<Vec<BuildingFootprint>> {
        ensure_positive("radiusMeters", radius_meters)?;
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            ShadowError::Provider(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let all = parse_overpass(&text)?;
        let total = all.len();
        let nearby: Vec<BuildingFootprint> = all
            .into_iter()
            .filter(|b| within_radius(b, center, radius_meters))
            .collect();
        debug!(
            "{}: {} of {} buildings within {} m",
            self.path.display(),
            nearby.len(),
            total,
            radius_meters
        );
        Ok(nearby)
    }
}

/// Buildings already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    buildings: Vec<BuildingFootprint>,
}

impl InMemoryProvider {
    pub fn new(buildings: Vec<BuildingFootprint>) -> Self {
        Self { buildings }
    }
}

impl BuildingProvider for InMemoryProvider {
    fn fetch_buildings(&self, center: GeoPoint, radius_meters: f64) -> Result<Vec<BuildingFootprint>> {
        ensure_positive("radiusMeters", radius_meters)?;
        Ok(self
            .buildings
            .iter()
            .filter(|b| within_radius(b, center, radius_meters))
            .cloned()
            .collect())
    }
}

/// Monotonic time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Allows at most one request per `interval`.
#[derive(Debug)]
pub struct RateLimiter<C: Clock = SystemClock> {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    clock: C,
}

impl RateLimiter<SystemClock> {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(interval: Duration, clock: C) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            clock,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Claims the slot if the interval has passed, otherwise returns how long
    /// the caller still has to wait.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let now = self.clock.now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }

    /// Blocks until a slot is free.
    pub fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            self.clock.sleep(wait);
        }
    }
}

/// Wraps a provider so consecutive fetches are spaced by the limiter.
pub struct ThrottledProvider<P, C: Clock = SystemClock> {
    inner: P,
    limiter: RateLimiter<C>,
}

impl<P: BuildingProvider> ThrottledProvider<P, SystemClock> {
    pub fn new(inner: P, interval: Duration) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(interval),
        }
    }
}

impl<P: BuildingProvider, C: Clock> ThrottledProvider<P, C> {
    pub fn with_limiter(inner: P, limiter: RateLimiter<C>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &RateLimiter<C> {
        &self.limiter
    }
}

impl<P: BuildingProvider, C: Clock> BuildingProvider for ThrottledProvider<P, C> {
    fn fetch_buildings(&self, center: GeoPoint, radius_meters: f64) -> Result<Vec<BuildingFootprint>> {
        self.limiter.acquire();
        self.inner.fetch_buildings(center, radius_meters)
    }
}

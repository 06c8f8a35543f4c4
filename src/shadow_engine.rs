use crate::geo_projection::project;
use crate::sun_position::compute_sun;
use crate::types::*;
use chrono::{DateTime, Utc};
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::Contains;
use geo_types::{coord, Line, LineString, Point, Polygon};
use log::{debug, warn};

/// A footprint that passed validation, kept with its geographic polygon so the
/// inside test does not rebuild it for every query.
#[derive(Debug, Clone)]
pub struct PreparedBuilding {
    id: BuildingId,
    height: f64,
    ring: Vec<GeoPoint>,
    polygon: Polygon<f64>,
}

impl PreparedBuilding {
    pub fn new(building: &BuildingFootprint) -> Result<Self> {
        building.validate()?;
        let exterior: LineString<f64> = building
            .outer_ring
            .iter()
            .map(|&p| geo_types::Coord::from(p))
            .collect();
        Ok(Self {
            id: building.id.clone(),
            height: building.height_meters,
            ring: building.outer_ring.clone(),
            polygon: Polygon::new(exterior, vec![]),
        })
    }

    pub fn id(&self) -> &BuildingId {
        &self.id
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    /// Strictly inside the footprint; points on the outline are outside.
    pub fn contains(&self, point: GeoPoint) -> bool {
        self.polygon
            .contains(&Point::new(point.longitude, point.latitude))
    }

    /// Distance in metres from `origin` to the closest place where `ray`
    /// (expressed in the local frame anchored at `origin`) crosses the outline.
    fn nearest_hit(&self, origin: GeoPoint, ray: Line<f64>) -> Option<f64> {
        let mut nearest: Option<f64> = None;
        for pair in self.ring.windows(2) {
            let a = project(origin, pair[0]);
            let b = project(origin, pair[1]);
            let edge = Line::new(a, b);

            // Collinear overlaps are treated as grazing; the neighbouring edges
            // still report the corner hits.
            let hit = match line_intersection(edge, ray) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => intersection,
                _ => continue,
            };
            let d = hit.x.hypot(hit.y);
            if !d.is_finite() {
                continue;
            }
            if nearest.map_or(true, |n| d < n) {
                nearest = Some(d);
            }
        }
        nearest
    }
}

/// Validated buildings plus the tie-break policy for reporting an occluder.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    buildings: Vec<PreparedBuilding>,
    policy: OccluderPolicy,
    skipped: usize,
}

impl Scene {
    /// Invalid footprints are dropped with a warning rather than failing the scene.
    pub fn new(buildings: &[BuildingFootprint], policy: OccluderPolicy) -> Self {
        let mut prepared = Vec::with_capacity(buildings.len());
        let mut skipped = 0;
        for building in buildings {
            match PreparedBuilding::new(building) {
                Ok(b) => prepared.push(b),
                Err(e) => {
                    warn!("Skipping building: {}", e);
                    skipped += 1;
                }
            }
        }
        debug!(
            "Prepared scene with {} buildings ({} skipped, policy {:?})",
            prepared.len(),
            skipped,
            policy
        );
        Self {
            buildings: prepared,
            policy,
            skipped,
        }
    }

    pub fn buildings(&self) -> &[PreparedBuilding] {
        &self.buildings
    }

    pub fn len(&self) -> usize {
        self.buildings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty()
    }

    /// Number of input footprints rejected as invalid geometry.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn policy(&self) -> OccluderPolicy {
        self.policy
    }

    pub fn shade_at(
        &self,
        point: GeoPoint,
        instant: &DateTime<Utc>,
        max_ray_meters: f64,
    ) -> Result<ShadeResult> {
        ensure_point(point)?;
        ensure_positive("maxRayMeters", max_ray_meters)?;
        Ok(self.classify(point, instant, max_ray_meters))
    }

    /// Shade test against an explicit sun position instead of one computed
    /// from an instant.
    pub fn shade_with_sun(
        &self,
        point: GeoPoint,
        sun: &SolarPosition,
        max_ray_meters: f64,
    ) -> Result<ShadeResult> {
        ensure_point(point)?;
        ensure_positive("maxRayMeters", max_ray_meters)?;
        Ok(self.classify_with_sun(point, sun, max_ray_meters))
    }

    /// Unchecked variant for callers that validated their parameters up front.
    pub(crate) fn classify(
        &self,
        point: GeoPoint,
        instant: &DateTime<Utc>,
        max_ray_meters: f64,
    ) -> ShadeResult {
        let sun = compute_sun(instant, point.latitude, point.longitude);
        self.classify_with_sun(point, &sun, max_ray_meters)
    }

    pub(crate) fn classify_with_sun(
        &self,
        point: GeoPoint,
        sun: &SolarPosition,
        max_ray_meters: f64,
    ) -> ShadeResult {
        if !sun.is_above_horizon() {
            return ShadeResult::night();
        }

        let tan_altitude = sun.altitude.tan();
        if !tan_altitude.is_finite() || tan_altitude < 0.0 {
            // Sun at the zenith: nothing casts a shadow.
            return ShadeResult::sunlit();
        }

        let bearing = sun.bearing_from_north.to_radians();
        let ray = Line::new(
            coord! { x: 0.0, y: 0.0 },
            coord! { x: max_ray_meters * bearing.sin(), y: max_ray_meters * bearing.cos() },
        );

        // FirstMatch compares every building against the closest hit seen so
        // far on any building, not against its own hit.
        let mut running_hit = f64::INFINITY;
        let mut nearest: Option<(f64, &PreparedBuilding)> = None;
        for building in &self.buildings {
            if building.contains(point) {
                continue;
            }
            let Some(distance) = building.nearest_hit(point, ray) else {
                continue;
            };

            match self.policy {
                OccluderPolicy::FirstMatch => {
                    running_hit = running_hit.min(distance);
                    if building.height >= running_hit * tan_altitude {
                        return ShadeResult::cast_by(building.id.clone());
                    }
                }
                OccluderPolicy::Nearest => {
                    if building.height < distance * tan_altitude {
                        continue;
                    }
                    if nearest.map_or(true, |(d, _)| distance < d) {
                        nearest = Some((distance, building));
                    }
                }
            }
        }

        match nearest {
            Some((_, building)) => ShadeResult::cast_by(building.id.clone()),
            None => ShadeResult::sunlit(),
        }
    }
}

/// Shade test for one point with the nearest-occluder policy.
pub fn is_shaded(
    point: GeoPoint,
    buildings: &[BuildingFootprint],
    instant: &DateTime<Utc>,
    max_ray_meters: f64,
) -> Result<ShadeResult> {
    is_shaded_with_policy(point, buildings, instant, max_ray_meters, OccluderPolicy::Nearest)
}

pub fn is_shaded_with_policy(
    point: GeoPoint,
    buildings: &[BuildingFootprint],
    instant: &DateTime<Utc>,
    max_ray_meters: f64,
    policy: OccluderPolicy,
) -> Result<ShadeResult> {
    ensure_positive("maxRayMeters", max_ray_meters)?;
    Scene::new(buildings, policy).shade_at(point, instant, max_ray_meters)
}

fn ensure_point(point: GeoPoint) -> Result<()> {
    if point.is_finite() {
        Ok(())
    } else {
        Err(ShadowError::DegenerateInput(format!(
            "query point has non-finite coordinates: {:?}",
            point
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_projection::unproject;

    const ORIGIN: GeoPoint = GeoPoint::new(13.4050, 52.5200);

    /// Axis-aligned square centred `(cx, cy)` metres from `ORIGIN`.
    fn square(id: i64, cx: f64, cy: f64, half: f64, height: f64) -> BuildingFootprint {
        let corners = [
            (cx - half, cy - half),
            (cx + half, cy - half),
            (cx + half, cy + half),
            (cx - half, cy + half),
            (cx - half, cy - half),
        ];
        let ring = corners
            .iter()
            .map(|&(x, y)| unproject(ORIGIN, crate::types::LocalPoint::new(x, y)))
            .collect();
        BuildingFootprint::new(id, ring, height)
    }

    fn at_meters(x: f64, y: f64) -> GeoPoint {
        unproject(ORIGIN, crate::types::LocalPoint::new(x, y))
    }

    #[test]
    fn test_night_is_always_shaded() {
        let scene = Scene::new(&[], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(-0.1, 200.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 100.0).unwrap();
        assert!(result.shaded);
        assert!(result.cast_by.is_none());

        let horizon = SolarPosition::from_bearing(0.0, 90.0);
        assert!(scene.shade_with_sun(ORIGIN, &horizon, 100.0).unwrap().shaded);
    }

    #[test]
    fn test_empty_scene_is_sunlit_by_day() {
        let scene = Scene::new(&[], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(0.6, 180.0);
        assert_eq!(
            scene.shade_with_sun(ORIGIN, &sun, 100.0).unwrap(),
            ShadeResult::sunlit()
        );
    }

    #[test]
    fn test_building_toward_sun_casts_shade() {
        let scene = Scene::new(&[square(1, 0.0, 20.0, 3.0, 15.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap();
        assert_eq!(result, ShadeResult::cast_by(BuildingId::Number(1)));
    }

    #[test]
    fn test_short_building_does_not_reach() {
        // Face at 17 m needs 17 * tan(30°) ≈ 9.8 m.
        let scene = Scene::new(&[square(1, 0.0, 20.0, 3.0, 9.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        assert!(!scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().shaded);
    }

    #[test]
    fn test_building_behind_observer_is_ignored() {
        let scene = Scene::new(&[square(1, 0.0, -20.0, 3.0, 80.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        assert!(!scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().shaded);
    }

    #[test]
    fn test_ray_length_limits_reach() {
        let scene = Scene::new(&[square(1, 0.0, 40.0, 3.0, 80.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        assert!(!scene.shade_with_sun(ORIGIN, &sun, 30.0).unwrap().shaded);
        assert!(scene.shade_with_sun(ORIGIN, &sun, 50.0).unwrap().shaded);
    }

    #[test]
    fn test_point_inside_building_not_shaded_by_itself() {
        let scene = Scene::new(&[square(9, 0.0, 0.0, 10.0, 100.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(10f64.to_radians(), 135.0);
        let result = scene.shade_with_sun(at_meters(1.0, 1.0), &sun, 200.0).unwrap();
        assert!(!result.shaded);
    }

    #[test]
    fn test_point_inside_one_building_shaded_by_another() {
        let scene = Scene::new(
            &[square(1, 0.0, 0.0, 5.0, 100.0), square(2, 0.0, 20.0, 3.0, 100.0)],
            OccluderPolicy::Nearest,
        );
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap();
        assert_eq!(result.cast_by, Some(BuildingId::Number(2)));
    }

    #[test]
    fn test_near_horizon_long_shadow() {
        // Required height is 5 * tan(0.001) ≈ 0.005 m.
        let scene = Scene::new(&[square(1, 0.0, 8.0, 3.0, 10.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(0.001, 0.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 1000.0).unwrap();
        assert!(result.shaded);
    }

    #[test]
    fn test_policies_disagree_on_input_order() {
        // Both occlude; the far one comes first in input order.
        let buildings = [square(1, 0.0, 60.0, 3.0, 200.0), square(2, 0.0, 15.0, 3.0, 200.0)];
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);

        let first = Scene::new(&buildings, OccluderPolicy::FirstMatch);
        assert_eq!(
            first.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().cast_by,
            Some(BuildingId::Number(1))
        );

        let nearest = Scene::new(&buildings, OccluderPolicy::Nearest);
        assert_eq!(
            nearest.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().cast_by,
            Some(BuildingId::Number(2))
        );
    }

    #[test]
    fn test_first_match_uses_closest_hit_so_far() {
        // A: face 7 m away, 1 m tall. B: face 97 m away, 20 m tall.
        // 20 >= 7 * tan(30°) ≈ 4.04, so B is reported under FirstMatch.
        let buildings = [square(1, 0.0, 10.0, 3.0, 1.0), square(2, 0.0, 100.0, 3.0, 20.0)];
        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);

        let first = Scene::new(&buildings, OccluderPolicy::FirstMatch);
        assert_eq!(
            first.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().cast_by,
            Some(BuildingId::Number(2))
        );

        // B on its own needs 97 * tan(30°) ≈ 56 m.
        let nearest = Scene::new(&buildings, OccluderPolicy::Nearest);
        assert!(!nearest.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().shaded);

        // Order matters: B first has only its own hit to go by.
        let reversed = [buildings[1].clone(), buildings[0].clone()];
        let first = Scene::new(&reversed, OccluderPolicy::FirstMatch);
        assert!(!first.shade_with_sun(ORIGIN, &sun, 200.0).unwrap().shaded);
    }

    #[test]
    fn test_invalid_buildings_are_skipped() {
        let mut broken = square(5, 0.0, 20.0, 3.0, 100.0);
        broken.outer_ring.truncate(3);
        let scene = Scene::new(&[broken, square(6, 0.0, 40.0, 3.0, 100.0)], OccluderPolicy::Nearest);
        assert_eq!(scene.len(), 1);
        assert_eq!(scene.skipped(), 1);

        let sun = SolarPosition::from_bearing(30f64.to_radians(), 0.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap();
        assert_eq!(result.cast_by, Some(BuildingId::Number(6)));
    }

    #[test]
    fn test_degenerate_ray_rejected() {
        let scene = Scene::new(&[], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(0.5, 0.0);
        assert!(matches!(
            scene.shade_with_sun(ORIGIN, &sun, 0.0),
            Err(ShadowError::DegenerateInput(_))
        ));
        assert!(scene
            .shade_with_sun(GeoPoint::new(f64::NAN, 0.0), &sun, 10.0)
            .is_err());
    }

    #[test]
    fn test_ray_along_wall_does_not_produce_nan() {
        // Ray runs exactly along the western wall's line.
        let scene = Scene::new(&[square(1, 3.0, 20.0, 3.0, 50.0)], OccluderPolicy::Nearest);
        let sun = SolarPosition::from_bearing(45f64.to_radians(), 0.0);
        let result = scene.shade_with_sun(ORIGIN, &sun, 200.0).unwrap();
        assert!(result.shaded);
    }
}

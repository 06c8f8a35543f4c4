//! Execution backends for classifying many points against one scene.
//!
//! Every backend must produce exactly the classification the serial path
//! does; only the scheduling differs.

use crate::shadow_engine::Scene;
use crate::types::*;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rayon::prelude::*;

pub trait ShadowBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classifies `points` in order. Parameters are validated by the caller.
    fn classify(
        &self,
        scene: &Scene,
        points: &[GeoPoint],
        instant: &DateTime<Utc>,
        max_ray_meters: f64,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<ShadeResult>>;
}

/// Reference implementation: one point after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl ShadowBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn classify(
        &self,
        scene: &Scene,
        points: &[GeoPoint],
        instant: &DateTime<Utc>,
        max_ray_meters: f64,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<ShadeResult>> {
        Ok(points
            .iter()
            .map(|&p| {
                let result = scene.classify(p, instant, max_ray_meters);
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                result
            })
            .collect())
    }
}

/// Splits points across a dedicated rayon pool, built once per backend.
#[derive(Debug)]
pub struct ParallelBackend {
    pool: rayon::ThreadPool,
}

impl ParallelBackend {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| ShadowError::ThreadPool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl ShadowBackend for ParallelBackend {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn classify(
        &self,
        scene: &Scene,
        points: &[GeoPoint],
        instant: &DateTime<Utc>,
        max_ray_meters: f64,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<ShadeResult>> {
        // Indexed collect keeps input order regardless of scheduling.
        Ok(self.pool.install(|| {
            points
                .par_iter()
                .map(|&p| {
                    let result = scene.classify(p, instant, max_ray_meters);
                    if let Some(pb) = progress {
                        pb.inc(1);
                    }
                    result
                })
                .collect()
        }))
    }
}

/// Backend selected by `config.backend`.
pub fn from_config(config: &Config) -> Result<Box<dyn ShadowBackend>> {
    let backend: Box<dyn ShadowBackend> = match config.backend {
        BackendKind::Serial => Box::new(SerialBackend),
        BackendKind::Parallel => Box::new(ParallelBackend::new(config.get_cpu_cores())?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_projection::unproject;

    fn sample_scene(anchor: GeoPoint) -> Scene {
        let ring = [(-4.0, 10.0), (4.0, 10.0), (4.0, 18.0), (-4.0, 18.0), (-4.0, 10.0)]
            .iter()
            .map(|&(x, y)| unproject(anchor, LocalPoint::new(x, y)))
            .collect();
        Scene::new(
            &[BuildingFootprint::new(1, ring, 40.0)],
            OccluderPolicy::Nearest,
        )
    }

    #[test]
    fn test_backends_agree() {
        let anchor = GeoPoint::new(-0.1276, 51.5072);
        let scene = sample_scene(anchor);
        let instant = DateTime::parse_from_rfc3339("2024-06-21T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let points: Vec<GeoPoint> = (0..200)
            .map(|i| {
                let x = (i % 20) as f64 * 3.0 - 30.0;
                let y = (i / 20) as f64 * 6.0 - 30.0;
                unproject(anchor, LocalPoint::new(x, y))
            })
            .collect();

        let serial = SerialBackend
            .classify(&scene, &points, &instant, 300.0, None)
            .unwrap();
        for threads in [1, 3, 8] {
            let parallel = ParallelBackend::new(threads)
                .unwrap()
                .classify(&scene, &points, &instant, 300.0, None)
                .unwrap();
            assert_eq!(serial, parallel);
        }
    }

    #[test]
    fn test_from_config() {
        let serial = Config {
            backend: BackendKind::Serial,
            ..Config::default()
        };
        assert_eq!(from_config(&serial).unwrap().name(), "serial");
        assert_eq!(from_config(&Config::default()).unwrap().name(), "parallel");
    }

    #[test]
    fn test_pool_built_once_and_reused() {
        assert_eq!(ParallelBackend::new(0).unwrap().threads(), 1);

        let backend = ParallelBackend::new(3).unwrap();
        assert_eq!(backend.threads(), 3);
        let anchor = GeoPoint::new(-0.1276, 51.5072);
        let scene = sample_scene(anchor);
        let instant = DateTime::parse_from_rfc3339("2024-06-21T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let points = vec![anchor; 16];
        let first = backend.classify(&scene, &points, &instant, 300.0, None).unwrap();
        let second = backend.classify(&scene, &points, &instant, 300.0, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.threads(), 3);
    }
}

//! Building shadows from footprints and the sun.
//!
//! Point queries ([`shadow_engine::is_shaded`]) cast a ray from the point
//! toward the sun and check whether any building along it is tall enough to
//! block the sun. Batch queries ([`shadow_map::ShadowMapBuilder`]) sample that
//! test over a grid covering a disk and store the answers as a raster that can
//! be looked up in constant time. [`footprint`] produces drawable shadow
//! outlines.

pub mod backend;
pub mod footprint;
pub mod geo_projection;
pub mod provider;
pub mod raster_io;
pub mod shadow_engine;
pub mod shadow_map;
pub mod sun_position;
pub mod types;

pub use footprint::{project_shadow, project_shadows, ShadowPolygon};
pub use shadow_engine::{is_shaded, Scene};
pub use shadow_map::{build_shadow_raster, query_raster, ShadowMapBuilder, ShadowRaster};
pub use sun_position::{compute_sun, SunCalculator};
pub use types::*;

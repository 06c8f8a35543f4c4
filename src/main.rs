use anyhow::{anyhow, bail, Context, Result};
use building_shadows::footprint::project_shadows;
use building_shadows::provider::{BuildingProvider, InMemoryProvider, OverpassFileProvider};
use building_shadows::raster_io::RasterIO;
use building_shadows::shadow_map::{query_raster, ShadowMapBuilder};
use building_shadows::sun_position::SunCalculator;
use building_shadows::{BackendKind, BuildingFootprint, Config, GeoPoint, OccluderPolicy, Scene};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

/// Building shadow maps and point shade queries
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Location {
    /// Latitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    /// Longitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lng: f64,
}

impl Location {
    fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lng, self.lat)
    }
}

#[derive(Args, Debug)]
struct When {
    /// Instant as RFC 3339, or a local "YYYY-MM-DDTHH:MM[:SS]" together with --tz
    #[arg(long)]
    at: String,

    /// IANA time zone for a local --at value (UTC when omitted)
    #[arg(long)]
    tz: Option<String>,
}

impl When {
    fn instant(&self) -> Result<DateTime<Utc>> {
        parse_instant(&self.at, self.tz.as_deref())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sun position and sun times
    Sun {
        #[command(flatten)]
        location: Location,
        #[command(flatten)]
        when: When,
    },
    /// Whether a single point is in the shade
    Shade {
        #[command(flatten)]
        location: Location,
        #[command(flatten)]
        when: When,
        /// Buildings: Overpass JSON or a JSON array of footprints
        #[arg(short, long)]
        buildings: PathBuf,
        /// Ray length in metres
        #[arg(long)]
        max_ray: Option<f64>,
    },
    /// Shadow outlines of every building around a point
    Footprints {
        #[command(flatten)]
        location: Location,
        #[command(flatten)]
        when: When,
        #[arg(short, long)]
        buildings: PathBuf,
        /// Search radius in metres
        #[arg(long, default_value_t = 300.0)]
        radius: f64,
        /// Write outlines here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build a shadow raster over a disk
    Build {
        #[command(flatten)]
        location: Location,
        #[command(flatten)]
        when: When,
        #[arg(short, long)]
        buildings: PathBuf,
        /// Disk diameter in metres
        #[arg(long)]
        diameter: f64,
        /// Cell size in metres
        #[arg(long)]
        cell: Option<f64>,
        /// Use the single-threaded backend
        #[arg(long)]
        serial: bool,
        /// Worker threads for the parallel backend
        #[arg(long)]
        threads: Option<usize>,
        /// Report the first qualifying building in input order
        #[arg(long)]
        first_match: bool,
        /// Show a progress bar
        #[arg(long)]
        progress: bool,
        /// Raster JSON path (defaults to the export directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write one CSV line per cell
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Look up a point in a saved raster
    Query {
        #[command(flatten)]
        location: Location,
        /// Raster JSON written by `build`
        #[arg(short, long)]
        raster: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Sun { location, when } => run_sun(&location, &when),
        Command::Shade {
            location,
            when,
            buildings,
            max_ray,
        } => {
            let max_ray = max_ray.unwrap_or(config.max_ray_meters);
            let footprints = load_buildings(&buildings, location.point(), max_ray)?;
            let scene = Scene::new(&footprints, config.occluder_policy);
            let result = scene
                .shade_at(location.point(), &when.instant()?, max_ray)
                .context("Shade test failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Footprints {
            location,
            when,
            buildings,
            radius,
            output,
        } => {
            let footprints = load_buildings(&buildings, location.point(), radius)?;
            let shadows = project_shadows(&footprints, &when.instant()?);
            let json = serde_json::to_string_pretty(&shadows)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote {} shadow outlines to {}", shadows.len(), path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Command::Build {
            location,
            when,
            buildings,
            diameter,
            cell,
            serial,
            threads,
            first_match,
            progress,
            output,
            csv,
        } => {
            let mut config = config;
            if let Some(cell) = cell {
                config.cell_meters = cell;
            }
            if serial {
                config.backend = BackendKind::Serial;
            }
            if threads.is_some() {
                config.cpu_cores = threads;
            }
            if first_match {
                config.occluder_policy = OccluderPolicy::FirstMatch;
            }
            config.show_progress |= progress;
            run_build(&config, &location, &when, &buildings, diameter, output, csv)
        }
        Command::Query { location, raster } => {
            let raster = RasterIO::read_raster(&raster)
                .with_context(|| format!("Failed to load raster {}", raster.display()))?;
            let sunny = query_raster(&raster, location.point());
            println!("{}", if sunny { "sunny" } else { "shaded" });
            Ok(())
        }
    }
}

fn run_sun(location: &Location, when: &When) -> Result<()> {
    let instant = when.instant()?;
    let calc = SunCalculator::new(location.lat, location.lng);
    let position = calc.get_position(&instant);

    println!("Instant:            {}", instant.to_rfc3339());
    println!("Altitude:           {:.3}°", position.altitude.to_degrees());
    println!("Bearing from north: {:.3}°", position.bearing_from_north);
    println!("Shadow bearing:     {:.3}°", position.shadow_bearing);

    if let Some(times) = calc.sun_times(&instant) {
        println!("Solar noon:         {}", times.solar_noon.to_rfc3339());
        match (times.sunrise, times.sunset) {
            (Some(rise), Some(set)) => {
                println!("Sunrise:            {}", rise.to_rfc3339());
                println!("Sunset:             {}", set.to_rfc3339());
                if let Some(hours) = times.daylight_hours() {
                    println!("Daylight:           {:.2} h", hours);
                }
            }
            _ => println!("Sun does not rise or set on this day"),
        }
    }
    Ok(())
}

fn run_build(
    config: &Config,
    location: &Location,
    when: &When,
    buildings: &Path,
    diameter: f64,
    output: Option<PathBuf>,
    csv: Option<PathBuf>,
) -> Result<()> {
    let instant = when.instant()?;
    let center = location.point();
    if !(diameter.is_finite() && diameter > 0.0) {
        bail!("--diameter must be a positive number of metres");
    }

    // Buildings just outside the disk still cast shadows into it.
    let footprints = load_buildings(buildings, center, diameter / 2.0 + 50.0)?;
    info!(
        "Building {} m shadow raster at {} m cells from {} buildings",
        diameter,
        config.cell_meters,
        footprints.len()
    );

    let builder = ShadowMapBuilder::new(&footprints, config.clone())
        .context("Invalid configuration")?;
    let raster = builder
        .build(center, diameter, &instant)
        .context("Shadow raster build failed")?;

    let path = match output {
        Some(path) => path,
        None => RasterIO::default_output_dir().join(RasterIO::raster_file_name(&raster)),
    };
    RasterIO::write_raster(&path, &raster)
        .with_context(|| format!("Failed to write raster {}", path.display()))?;
    println!("Raster written to: {}", path.display());

    if let Some(csv) = csv {
        RasterIO::write_csv(&csv, &raster)
            .with_context(|| format!("Failed to write CSV {}", csv.display()))?;
        println!("CSV written to: {}", csv.display());
    }
    Ok(())
}

/// Reads buildings near `center` from either a footprint array or an Overpass response.
fn load_buildings(path: &Path, center: GeoPoint, radius: f64) -> Result<Vec<BuildingFootprint>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read buildings {}", path.display()))?;

    let buildings = match serde_json::from_str::<Vec<BuildingFootprint>>(&text) {
        Ok(list) => InMemoryProvider::new(list).fetch_buildings(center, radius)?,
        Err(_) => OverpassFileProvider::new(path)
            .fetch_buildings(center, radius)
            .with_context(|| format!("{} is neither a footprint list nor Overpass JSON", path.display()))?,
    };
    info!("Loaded {} buildings within {} m", buildings.len(), radius);
    Ok(buildings)
}

fn parse_instant(raw: &str, tz: Option<&str>) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| anyhow!("Cannot parse time '{}'", raw))?;

    match tz {
        Some(name) => {
            let zone: Tz = name
                .parse()
                .map_err(|e| anyhow!("Unknown time zone '{}': {}", name, e))?;
            zone.from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| anyhow!("{} does not exist in {}", raw, name))
        }
        None => Ok(Utc.from_utc_datetime(&naive)),
    }
}

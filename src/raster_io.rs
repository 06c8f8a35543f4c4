use crate::shadow_map::ShadowRaster;
use crate::types::*;
use chrono::{Datelike, Timelike};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct RasterIO;

impl RasterIO {
    pub fn read_raster(path: &Path) -> Result<ShadowRaster> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_raster(path: &Path, raster: &ShadowRaster) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, raster)?;
        writer.flush()?;
        Ok(())
    }

    /// `shadow_<lat>_<lng>_<MM>-<DD>_<HH>-<mm>.json`, coordinates to 5 decimals.
    pub fn raster_file_name(raster: &ShadowRaster) -> String {
        let meta = raster.meta();
        format!(
            "shadow_{:.5}_{:.5}_{:02}-{:02}_{:02}-{:02}.json",
            meta.center.latitude,
            meta.center.longitude,
            meta.instant.month(),
            meta.instant.day(),
            meta.instant.hour(),
            meta.instant.minute()
        )
    }

    /// Export directory under the user's documents folder, or `./exports`.
    pub fn default_output_dir() -> PathBuf {
        match dirs::document_dir() {
            Some(dir) => dir.join("BuildingShadows"),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("exports"),
        }
    }

    /// One line per cell: `cell_id,row,col,lat,lng,shaded`.
    pub fn write_csv(path: &Path, raster: &ShadowRaster) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut file = BufWriter::new(file);

        writeln!(file, "cell_id,row,col,lat,lng,shaded")?;

        let mut cell_id = 0;
        for ((row, col), &value) in raster.grid().indexed_iter() {
            let center = raster.cell_center(row, col);
            writeln!(
                file,
                "{},{},{},{:.7},{:.7},{}",
                cell_id, row, col, center.latitude, center.longitude, value
            )?;
            cell_id += 1;
        }

        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_map::build_shadow_raster;
    use chrono::{DateTime, Utc};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "building-shadows-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn raster() -> ShadowRaster {
        let instant = DateTime::parse_from_rfc3339("2024-03-05T07:09:00Z")
            .unwrap()
            .with_timezone(&Utc);
        build_shadow_raster(GeoPoint::new(-122.4194, 37.7749), 40.0, &instant, 10.0, &[]).unwrap()
    }

    #[test]
    fn test_file_round_trip() {
        let dir = scratch_dir("roundtrip");
        let raster = raster();
        let path = dir.join(RasterIO::raster_file_name(&raster));
        RasterIO::write_raster(&path, &raster).unwrap();
        let back = RasterIO::read_raster(&path).unwrap();
        assert_eq!(back, raster);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_name() {
        assert_eq!(
            RasterIO::raster_file_name(&raster()),
            "shadow_37.77490_-122.41940_03-05_07-09.json"
        );
    }

    #[test]
    fn test_csv_has_every_cell() {
        let dir = scratch_dir("csv");
        let raster = raster();
        let path = dir.join("cells.csv");
        RasterIO::write_csv(&path, &raster).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "cell_id,row,col,lat,lng,shaded");
        assert_eq!(lines.len(), 1 + raster.rows() * raster.columns());
        assert!(lines[1].starts_with("0,0,0,"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RasterIO::read_raster(Path::new("/nonexistent/shadow.json")).unwrap_err();
        assert!(matches!(err, ShadowError::Io(_)));
    }
}

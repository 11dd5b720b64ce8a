use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::mbtiles::{Mbtiles, TileCoord, make_progress_bar};
use crate::pyramid::RasterFormat;
use crate::vector_tile;

/// What every tile of a container is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileKind {
    Vector,
    Raster(RasterFormat),
}

impl TileKind {
    /// `pbf` or a missing `format` means vector tiles.
    pub fn from_format(format: Option<&str>) -> Result<Self> {
        match format.map(str::trim) {
            None | Some("pbf") | Some("mvt") => Ok(TileKind::Vector),
            Some(value) => RasterFormat::from_metadata(value)
                .map(TileKind::Raster)
                .ok_or_else(|| anyhow::anyhow!("unsupported tile format `{value}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadTile {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub kind: TileKind,
    pub total: u64,
    pub valid: u64,
    pub bad_tiles: Vec<BadTile>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.bad_tiles.is_empty()
    }
}

pub fn check_tile(kind: TileKind, data: &[u8]) -> Result<(), String> {
    match kind {
        TileKind::Vector => vector_tile::decode(data)
            .map(|_| ())
            .map_err(|err| err.to_string()),
        TileKind::Raster(format) => {
            let found = image::guess_format(data).map_err(|err| err.to_string())?;
            if found != format.image_format() {
                return Err(format!("expected {format:?}, found {found:?}"));
            }
            image::load_from_memory_with_format(data, found)
                .map(|_| ())
                .map_err(|err| err.to_string())
        }
    }
}

/// Decodes every tile of the container according to its `format` metadata.
pub fn verify_container(path: &Path, verbose: bool, no_progress: bool) -> Result<VerifyReport> {
    let container = Mbtiles::open_readonly(path)?;
    let kind = TileKind::from_format(container.get_metadata("format")?.as_deref())?;
    let total = container.tile_count()?;
    let progress = make_progress_bar(total, no_progress);
    progress.set_message("verifying");

    let mut report = VerifyReport {
        kind,
        total: 0,
        valid: 0,
        bad_tiles: Vec::new(),
    };
    container.for_each_tile(|record| {
        report.total += 1;
        progress.inc(1);
        let TileCoord { zoom, x, y } = record.coord;
        match check_tile(kind, &record.data) {
            Ok(()) => {
                report.valid += 1;
                if verbose {
                    info!(tile = %record.coord, bytes = record.data.len(), "ok");
                }
            }
            Err(error) => {
                warn!(tile = %record.coord, error = %error, "bad tile");
                report.bad_tiles.push(BadTile { zoom, x, y, error });
            }
        }
        Ok(())
    })?;
    progress.finish_and_clear();
    container.close()?;
    info!(
        total = report.total,
        valid = report.valid,
        bad = report.bad_tiles.len(),
        "verification finished"
    );
    Ok(report)
}

//! Coarser raster zoom levels built from the finest one.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageFormat, RgbImage};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::mbtiles::{
    Mbtiles, PyramidLevelStats, PyramidStats, TileCoord, TileRecord, build_thread_pool,
    make_progress_bar,
};

const JPEG_QUALITY: u8 = 85;
const PARENTS_PER_BATCH: usize = 256;

/// Image codec named by the container's `format` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    Png,
    Jpeg,
    Webp,
}

impl RasterFormat {
    pub fn from_metadata(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Some(RasterFormat::Png),
            "jpg" | "jpeg" => Some(RasterFormat::Jpeg),
            "webp" => Some(RasterFormat::Webp),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Webp => ImageFormat::WebP,
        }
    }

    /// Encodes a composited tile. JPEG uses quality 85. WebP output is
    /// lossless because the encoder has no lossy mode, so WebP parents are
    /// typically several times larger than lossy quality-85 tiles would be.
    pub fn encode(self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        match self {
            RasterFormat::Png => {
                image
                    .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
                    .context("encode png tile")?;
            }
            RasterFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
                    .encode(
                        image.as_raw(),
                        image.width(),
                        image.height(),
                        ExtendedColorType::Rgb8,
                    )
                    .context("encode jpeg tile")?;
            }
            RasterFormat::Webp => {
                WebPEncoder::new_lossless(&mut buffer)
                    .encode(
                        image.as_raw(),
                        image.width(),
                        image.height(),
                        ExtendedColorType::Rgb8,
                    )
                    .context("encode webp tile")?;
            }
        }
        Ok(buffer)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyramidOptions {
    /// Finest zoom to read from; `maxzoom` metadata when unset.
    pub start_zoom: Option<u8>,
    pub target_zoom: u8,
    pub tile_size: u32,
    pub threads: usize,
    pub no_progress: bool,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            start_zoom: None,
            target_zoom: 7,
            tile_size: 256,
            threads: 0,
            no_progress: true,
        }
    }
}

/// Child tiles of a parent in container (TMS) numbering, in compositing
/// order: (2x,2y), (2x+1,2y), (2x,2y+1), (2x+1,2y+1).
pub fn child_coords(parent: TileCoord) -> [TileCoord; 4] {
    let zoom = parent.zoom + 1;
    let (x, y) = (parent.x * 2, parent.y * 2);
    [
        TileCoord::new(zoom, x, y),
        TileCoord::new(zoom, x + 1, y),
        TileCoord::new(zoom, x, y + 1),
        TileCoord::new(zoom, x + 1, y + 1),
    ]
}

/// Composites up to four child images into one image twice the child size.
///
/// Child 0 lands bottom-left, 1 bottom-right, 2 top-left and 3 top-right,
/// since container rows grow northwards while pixel rows grow downwards.
/// Children of another size are resampled first. A child that fails to
/// decode is logged and its quadrant left black. Returns `None` when no
/// child could be decoded.
pub fn build_parent_tile(
    children: [Option<&[u8]>; 4],
    child_size: u32,
    format: RasterFormat,
) -> Result<Option<Vec<u8>>> {
    if children
        .iter()
        .all(|child| child.is_none_or(|blob| blob.is_empty()))
    {
        return Ok(None);
    }
    let positions = [
        (0, child_size),
        (child_size, child_size),
        (0, 0),
        (child_size, 0),
    ];
    let mut canvas = RgbImage::new(child_size * 2, child_size * 2);
    let mut placed = 0;
    for (index, child) in children.iter().enumerate() {
        let Some(blob) = child.filter(|blob| !blob.is_empty()) else {
            continue;
        };
        let decoded = match image::load_from_memory(blob) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(err) => {
                warn!(child = index, error = %err, "skipping undecodable child tile");
                continue;
            }
        };
        let decoded = if decoded.dimensions() == (child_size, child_size) {
            decoded
        } else {
            imageops::resize(&decoded, child_size, child_size, FilterType::Lanczos3)
        };
        let (x, y) = positions[index];
        imageops::replace(&mut canvas, &decoded, x.into(), y.into());
        placed += 1;
    }
    if placed == 0 {
        return Ok(None);
    }
    format.encode(&canvas).map(Some)
}

/// Builds every zoom level from `start_zoom - 1` down to `target_zoom` and
/// lowers `minzoom` after each level.
pub fn generate_pyramid(path: &Path, options: &PyramidOptions) -> Result<PyramidStats> {
    let mut container = Mbtiles::open(path)?;
    let format_name = container
        .get_metadata("format")?
        .context("container has no `format` metadata")?;
    let format = RasterFormat::from_metadata(&format_name)
        .with_context(|| format!("unsupported raster format `{format_name}`"))?;
    let start_zoom = match options.start_zoom {
        Some(zoom) => zoom,
        None => match container.metadata_zoom("maxzoom")? {
            Some(zoom) => zoom,
            None => container
                .zoom_range()?
                .map(|(_, max)| max)
                .context("container has no tiles")?,
        },
    };

    let mut stats = PyramidStats::default();
    if start_zoom <= options.target_zoom {
        info!(
            start_zoom,
            target_zoom = options.target_zoom,
            "start zoom is already at or below target, nothing to do"
        );
        return Ok(stats);
    }

    let pool = build_thread_pool(options.threads)?;
    for zoom in (options.target_zoom..start_zoom).rev() {
        let Some(extent) = container.tile_extent(zoom + 1)? else {
            warn!(zoom = zoom + 1, "no tiles to downsample");
            break;
        };
        let columns = extent.min_x / 2..=extent.max_x / 2;
        let rows = extent.min_y / 2..=extent.max_y / 2;
        let total = (u64::from(columns.end() - columns.start()) + 1)
            * (u64::from(rows.end() - rows.start()) + 1);
        let mut parents = columns
            .flat_map(|x| rows.clone().map(move |y| TileCoord::new(zoom, x, y)));
        info!(zoom, parents = total, "building zoom level");
        let progress = make_progress_bar(total, options.no_progress);
        progress.set_message(format!("z{zoom}"));

        let mut level = PyramidLevelStats {
            zoom,
            parents_considered: total,
            tiles_written: 0,
            bytes_written: 0,
        };
        loop {
            let chunk: Vec<TileCoord> = parents.by_ref().take(PARENTS_PER_BATCH).collect();
            if chunk.is_empty() {
                break;
            }
            let mut inputs = Vec::with_capacity(chunk.len());
            for parent in &chunk {
                let mut blobs: [Option<Vec<u8>>; 4] = Default::default();
                for (slot, child) in blobs.iter_mut().zip(child_coords(*parent)) {
                    *slot = container.get_tile(child)?;
                }
                inputs.push((*parent, blobs));
            }

            let built: Vec<(TileCoord, Result<Option<Vec<u8>>>)> = pool.install(|| {
                inputs
                    .par_iter()
                    .map(|(parent, blobs)| {
                        let children = [
                            blobs[0].as_deref(),
                            blobs[1].as_deref(),
                            blobs[2].as_deref(),
                            blobs[3].as_deref(),
                        ];
                        (*parent, build_parent_tile(children, options.tile_size, format))
                    })
                    .collect()
            });

            let mut writes = Vec::new();
            for (coord, result) in built {
                match result {
                    Ok(Some(data)) => {
                        level.tiles_written += 1;
                        level.bytes_written += data.len() as u64;
                        writes.push(TileRecord { coord, data });
                    }
                    Ok(None) => {}
                    Err(err) => return Err(err.context(format!("failed to build tile {coord}"))),
                }
            }
            container.put_tiles(&writes)?;
            progress.inc(chunk.len() as u64);
        }
        progress.finish_and_clear();

        container.set_metadata("minzoom", &zoom.to_string())?;
        stats.minzoom = Some(zoom);
        info!(zoom, tiles = level.tiles_written, "zoom level done");
        stats.levels.push(level);
    }
    container.close()?;
    Ok(stats)
}

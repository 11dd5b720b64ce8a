//! Removes tiles that lie outside a buffered country boundary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use geo::{BooleanOps, Buffer, Coord, Intersects, MapCoords, MultiPolygon, Polygon, Rect};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::coord::{Bounds, MAX_LATITUDE, tile_bounds};
use crate::error::ContainerError;
use crate::mbtiles::{Mbtiles, PruneStats, TileCoord, copy_container};

const LONLAT: &str = "+proj=longlat +a=6378137 +b=6378137 +no_defs";
const WEB_MERCATOR: &str =
    "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs";

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub boundary: PathBuf,
    pub country: String,
    pub country_property: String,
    /// Working area; the container's `bounds` metadata when unset.
    pub bbox: Option<Bounds>,
    pub buffer_meters: f64,
    /// Write the pruned result here instead of modifying the input.
    pub output: Option<PathBuf>,
}

impl PruneOptions {
    pub fn new(boundary: PathBuf, country: impl Into<String>) -> Self {
        Self {
            boundary,
            country: country.into(),
            country_property: "SOVEREIGNT".to_string(),
            bbox: None,
            buffer_meters: 20_000.0,
            output: None,
        }
    }
}

/// Reads the (multi)polygons of every feature whose `property` equals
/// `country` from a GeoJSON FeatureCollection and merges them.
pub fn read_boundary_geojson(path: &Path, property: &str, country: &str) -> Result<MultiPolygon<f64>> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read boundary file: {}", path.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse boundary file: {}", path.display()))?;
    let features = value["features"]
        .as_array()
        .with_context(|| format!("boundary file is not a FeatureCollection: {}", path.display()))?;

    let mut merged: Option<MultiPolygon<f64>> = None;
    for feature in features {
        if feature["properties"][property].as_str() != Some(country) {
            continue;
        }
        let shape = parse_geometry(&feature["geometry"])
            .with_context(|| format!("invalid geometry for {property} = {country:?}"))?;
        merged = Some(match merged {
            Some(current) => current.union(&shape),
            None => shape,
        });
    }
    match merged {
        Some(shape) if !shape.0.is_empty() => Ok(shape),
        _ => Err(ContainerError::EmptyBoundary {
            property: property.to_string(),
            country: country.to_string(),
        }
        .into()),
    }
}

fn parse_geometry(geometry: &Value) -> Result<MultiPolygon<f64>> {
    let coords = geometry["coordinates"]
        .as_array()
        .context("geometry has no coordinates")?;
    match geometry["type"].as_str() {
        Some("Polygon") => Ok(MultiPolygon::new(vec![parse_polygon(coords)?])),
        Some("MultiPolygon") => coords
            .iter()
            .map(|polygon| {
                polygon
                    .as_array()
                    .context("polygon is not an array")
                    .and_then(|rings| parse_polygon(rings))
            })
            .collect::<Result<Vec<_>>>()
            .map(MultiPolygon::new),
        other => Err(anyhow!("unsupported boundary geometry type: {other:?}")),
    }
}

fn parse_polygon(rings: &[Value]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|ring| {
        ring.as_array()
            .context("ring is not an array")?
            .iter()
            .map(|position| match position.as_array().map(Vec::as_slice) {
                Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => Ok(Coord { x, y }),
                    _ => Err(anyhow!("position is not numeric")),
                },
                _ => Err(anyhow!("position needs two coordinates")),
            })
            .collect::<Result<Vec<_>>>()
    });
    let exterior = rings.next().context("polygon has no exterior ring")??;
    let interiors = rings
        .map(|ring| ring.map(Into::into))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior.into(), interiors))
}

/// Clips `country` to `bbox` and grows it by `buffer_meters`, measured in
/// Web Mercator metres.
pub fn buffered_boundary(
    country: &MultiPolygon<f64>,
    bbox: Rect<f64>,
    buffer_meters: f64,
) -> Result<MultiPolygon<f64>> {
    let clipped = country.intersection(&bbox.to_polygon());
    if clipped.0.is_empty() {
        anyhow::bail!("boundary does not overlap the working area");
    }
    let lonlat = Proj::from_proj_string(LONLAT)
        .map_err(|err| anyhow!("failed to build projection `{LONLAT}`: {err}"))?;
    let mercator = Proj::from_proj_string(WEB_MERCATOR)
        .map_err(|err| anyhow!("failed to build projection `{WEB_MERCATOR}`: {err}"))?;

    let projected = clipped.try_map_coords(|coord: Coord<f64>| {
        let lat = coord.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let mut point = (coord.x.to_radians(), lat.to_radians(), 0.0);
        transform(&lonlat, &mercator, &mut point)
            .map_err(|err| anyhow!("project to mercator: {err}"))?;
        Ok::<_, anyhow::Error>(Coord {
            x: point.0,
            y: point.1,
        })
    })?;
    let buffered = projected.buffer(buffer_meters);
    buffered.try_map_coords(|coord: Coord<f64>| {
        let mut point = (coord.x, coord.y, 0.0);
        transform(&mercator, &lonlat, &mut point)
            .map_err(|err| anyhow!("project to lon/lat: {err}"))?;
        Ok::<_, anyhow::Error>(Coord {
            x: point.0.to_degrees(),
            y: point.1.to_degrees(),
        })
    })
}

/// Returns the tiles (XYZ numbering) whose rectangle does not touch
/// `boundary`. Tiles that touch or overlap it are never returned.
pub fn compute_foreign_tiles(coords: &[TileCoord], boundary: &MultiPolygon<f64>) -> Vec<TileCoord> {
    coords
        .par_iter()
        .filter(|coord| !boundary.intersects(&tile_bounds(**coord)))
        .copied()
        .collect()
}

/// Deletes every tile outside `boundary` and compacts once.
pub fn prune_container(container: &mut Mbtiles, boundary: &MultiPolygon<f64>) -> Result<PruneStats> {
    let mut tiles_skipped = 0u64;
    let coords: Vec<TileCoord> = container
        .tile_coords()?
        .into_iter()
        .filter_map(|coord| {
            let flipped = coord.flipped();
            if flipped.is_none() {
                warn!(tile = %coord, "tile outside the grid of its zoom level, skipping");
                tiles_skipped += 1;
            }
            flipped
        })
        .collect();
    let foreign: Vec<TileCoord> = compute_foreign_tiles(&coords, boundary)
        .into_iter()
        .filter_map(TileCoord::flipped)
        .collect();

    let mut stats = PruneStats {
        tiles_checked: coords.len() as u64,
        tiles_skipped,
        ..PruneStats::default()
    };
    for coord in &foreign {
        *stats.deleted_by_zoom.entry(coord.zoom).or_insert(0) += 1;
    }
    stats.tiles_deleted = container.delete_tiles(&foreign)?;
    info!(
        checked = stats.tiles_checked,
        deleted = stats.tiles_deleted,
        skipped = stats.tiles_skipped,
        "deleted foreign tiles"
    );
    if stats.tiles_deleted > 0 {
        container.compact()?;
    }
    Ok(stats)
}

/// Builds the buffered boundary for `options.country` and prunes the
/// container (or a copy of it) to it.
pub fn prune_to_country(path: &Path, options: &PruneOptions) -> Result<PruneStats> {
    let country = read_boundary_geojson(
        &options.boundary,
        &options.country_property,
        &options.country,
    )?;
    let mut container = match &options.output {
        Some(output) => copy_container(path, output)?,
        None => Mbtiles::open(path)?,
    };
    let bbox = match options.bbox {
        Some(bbox) => bbox,
        None => match container.get_metadata("bounds")? {
            Some(value) => value.parse::<Bounds>()?,
            None => Bounds {
                west: -180.0,
                south: -MAX_LATITUDE,
                east: 180.0,
                north: MAX_LATITUDE,
            },
        },
    };
    debug!(%bbox, country = %options.country, "building boundary");
    let boundary = buffered_boundary(&country, bbox.to_rect(), options.buffer_meters)?;
    let stats = prune_container(&mut container, &boundary)?;
    container.close()?;
    Ok(stats)
}

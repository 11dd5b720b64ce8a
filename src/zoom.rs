use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::mbtiles::{Mbtiles, ShrinkStats};

/// Drops every zoom level above `max_zoom` and brings the zoom metadata in
/// line, including the `vector_layers` entries of the `json` metadata.
pub fn truncate_zoom_levels(container: &Mbtiles, max_zoom: u8) -> Result<ShrinkStats> {
    let from_tiles = container.zoom_range()?.map(|(_, max)| max);
    let from_metadata = container.metadata_zoom("maxzoom")?;
    let previous = from_tiles.max(from_metadata);
    let mut stats = ShrinkStats {
        previous_maxzoom: previous,
        maxzoom: max_zoom,
        tiles_deleted: 0,
    };
    if previous.is_none_or(|zoom| zoom <= max_zoom) {
        info!(max_zoom, "container already ends at or below the requested zoom");
        return Ok(stats);
    }

    stats.tiles_deleted = container.delete_zoom_levels_above(max_zoom)?;
    info!(
        path = %container.path().display(),
        max_zoom,
        deleted = stats.tiles_deleted,
        "deleted zoom levels"
    );

    container.set_metadata("maxzoom", &max_zoom.to_string())?;
    if container
        .metadata_zoom("minzoom")?
        .is_some_and(|zoom| zoom > max_zoom)
    {
        container.set_metadata("minzoom", &max_zoom.to_string())?;
    }
    if let Some(raw) = container.get_metadata("json")? {
        let mut json: Value =
            serde_json::from_str(&raw).context("failed to parse `json` metadata")?;
        if clamp_vector_layers(&mut json, max_zoom) {
            container.set_metadata("json", &serde_json::to_string(&json)?)?;
        }
    }

    container.compact()?;
    Ok(stats)
}

fn clamp_vector_layers(json: &mut Value, max_zoom: u8) -> bool {
    let Some(layers) = json
        .get_mut("vector_layers")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let mut changed = false;
    for layer in layers.iter_mut() {
        let too_deep = layer
            .get("maxzoom")
            .and_then(Value::as_f64)
            .is_some_and(|zoom| zoom > max_zoom as f64);
        if too_deep {
            layer["maxzoom"] = Value::from(max_zoom);
            changed = true;
        }
    }
    changed
}

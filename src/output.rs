use crate::mbtiles::{OptimizeStats, PruneStats, PyramidStats, ShrinkStats};
use crate::verify::VerifyReport;

pub fn optimize_text_lines(stats: &OptimizeStats) -> Vec<String> {
    let mut lines = vec![
        format!(
            "tiles: processed={} rewritten={} deleted={}",
            stats.tiles_processed, stats.tiles_rewritten, stats.tiles_deleted
        ),
        format!(
            "bytes: before={} after={}",
            stats.bytes_before, stats.bytes_after
        ),
        format!("corrupt_tiles: {}", stats.corrupt_tiles),
        format!("unknown_layer_tiles: {}", stats.unknown_layer_tiles),
    ];
    for (layer, count) in stats.unknown_layers.iter() {
        lines.push(format!("unknown_layer: {layer} tiles={count}"));
    }
    for (layer, zooms) in stats.removed_layers_by_zoom.iter() {
        let zooms = zooms
            .iter()
            .map(|zoom| zoom.to_string())
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("removed_layer: {layer} zooms={zooms}"));
    }
    for (zoom, count) in stats.removed_features_by_zoom.iter() {
        lines.push(format!("removed_features: z={zoom} count={count}"));
    }
    lines
}

pub fn pyramid_text_lines(stats: &PyramidStats) -> Vec<String> {
    let mut lines: Vec<String> = stats
        .levels
        .iter()
        .map(|level| {
            format!(
                "z={}: parents={} written={} bytes={}",
                level.zoom, level.parents_considered, level.tiles_written, level.bytes_written
            )
        })
        .collect();
    match stats.minzoom {
        Some(zoom) => lines.push(format!("minzoom: {zoom}")),
        None => lines.push("no zoom levels built".to_string()),
    }
    lines
}

pub fn prune_text_lines(stats: &PruneStats) -> Vec<String> {
    let mut lines = vec![format!(
        "tiles: checked={} deleted={}",
        stats.tiles_checked, stats.tiles_deleted
    )];
    if stats.tiles_skipped > 0 {
        lines.push(format!("skipped_tiles: {}", stats.tiles_skipped));
    }
    for (zoom, count) in stats.deleted_by_zoom.iter() {
        lines.push(format!("deleted: z={zoom} count={count}"));
    }
    lines
}

pub fn shrink_text_lines(stats: &ShrinkStats) -> Vec<String> {
    let previous = stats
        .previous_maxzoom
        .map(|zoom| zoom.to_string())
        .unwrap_or_else(|| "-".to_string());
    vec![format!(
        "maxzoom: {} -> {} deleted={}",
        previous, stats.maxzoom, stats.tiles_deleted
    )]
}

pub fn verify_text_lines(report: &VerifyReport) -> Vec<String> {
    let rate = if report.total == 0 {
        100.0
    } else {
        report.valid as f64 / report.total as f64 * 100.0
    };
    let mut lines = vec![
        format!("total: {}", report.total),
        format!("valid: {}", report.valid),
        format!("bad: {}", report.bad_tiles.len()),
        format!("success_rate: {rate:.2}%"),
    ];
    for tile in report.bad_tiles.iter() {
        lines.push(format!("{}/{}/{}: {}", tile.zoom, tile.x, tile.y, tile.error));
    }
    lines
}

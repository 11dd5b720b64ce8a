use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::error::TileError;
use crate::mbtiles::container::{Mbtiles, TileSchema};
use crate::mbtiles::stats::OptimizeStats;
use crate::mbtiles::types::{ImageId, OptimizeOptions, TileCoord, TileRecord};
use crate::policy::{LayerPolicy, PolicyOutcome, apply_policy};
use crate::vector_tile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileAction {
    Replace(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedTile {
    pub action: TileAction,
    pub outcome: PolicyOutcome,
}

pub fn make_progress_bar(total: u64, no_progress: bool) -> ProgressBar {
    if no_progress {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr_with_hz(10));
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

pub fn build_thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("failed to build worker pool")
}

/// Decodes one tile, applies the policy and encodes it again with the same
/// compression. Errors carry a [`TileError`] when the tile itself is at fault.
pub fn optimize_tile(data: &[u8], policy: &LayerPolicy, drop_empty: bool) -> Result<OptimizedTile> {
    let mut decoded = vector_tile::decode(data)?;
    let outcome = apply_policy(&mut decoded.tile, policy)?;
    let action = if drop_empty && decoded.is_empty() {
        TileAction::Delete
    } else {
        TileAction::Replace(vector_tile::encode(&decoded)?)
    };
    Ok(OptimizedTile { action, outcome })
}

/// Runs the layer policy over every tile of the container in place.
///
/// Tiles are read in batches, transformed on the worker pool and written
/// back from this thread, one transaction per batch. On a deduplicated
/// container every distinct blob is transformed once and updated in place,
/// so coordinates sharing it keep sharing it. Corrupt tiles are skipped and
/// counted; tiles with a layer the policy does not know are left untouched
/// and counted per layer. With `fail_fast` the first bad tile ends the run.
pub fn optimize_container(
    path: &Path,
    policy: &LayerPolicy,
    options: &OptimizeOptions,
) -> Result<OptimizeStats> {
    let mut container = Mbtiles::open(path)?;
    let total = container.image_count()?;
    let pool = build_thread_pool(options.threads)?;
    let progress = make_progress_bar(total, options.no_progress);
    progress.set_message("optimizing");
    info!(path = %path.display(), schema = ?container.schema(), blobs = total, "optimizing container");

    let limit = options.io_batch.max(1);
    let mut stats = OptimizeStats::default();
    match container.schema() {
        TileSchema::Flat => {
            let mut after: Option<TileCoord> = None;
            loop {
                let batch = container.read_batch(after, limit)?;
                let Some(last) = batch.last() else {
                    break;
                };
                after = Some(last.coord);
                let jobs: Vec<Job<TileCoord>> = batch
                    .into_iter()
                    .map(|record| Job {
                        key: record.coord,
                        zooms: BTreeMap::from([(record.coord.zoom, 1)]),
                        references: 1,
                        data: record.data,
                    })
                    .collect();

                let done = run_batch(&pool, &jobs, policy, options, &mut stats)?;
                let writes: Vec<TileRecord> = done
                    .writes
                    .into_iter()
                    .map(|(coord, data)| TileRecord { coord, data })
                    .collect();
                container.put_tiles(&writes)?;
                if !done.deletes.is_empty() {
                    container.delete_tiles(&done.deletes)?;
                }
                progress.inc(jobs.len() as u64);
            }
        }
        TileSchema::Deduplicated => {
            let mut after: Option<ImageId> = None;
            loop {
                let batch = container.read_image_batch(after.as_ref(), limit)?;
                let Some(last) = batch.last() else {
                    break;
                };
                after = Some(last.tile_id.clone());
                let jobs: Vec<Job<ImageId>> = batch
                    .into_iter()
                    .map(|image| Job {
                        references: image.references(),
                        key: image.tile_id,
                        zooms: image.zooms,
                        data: image.data,
                    })
                    .collect();

                let done = run_batch(&pool, &jobs, policy, options, &mut stats)?;
                container.put_images(&done.writes)?;
                if !done.deletes.is_empty() {
                    container.delete_images(&done.deletes)?;
                }
                progress.inc(jobs.len() as u64);
            }
        }
    }
    progress.finish_and_clear();

    if stats.tiles_rewritten > 0 || stats.tiles_deleted > 0 {
        container.compact()?;
    }
    container.close()?;
    info!(
        processed = stats.tiles_processed,
        rewritten = stats.tiles_rewritten,
        corrupt = stats.corrupt_tiles,
        unknown_layer_tiles = stats.unknown_layer_tiles,
        "optimize finished"
    );
    Ok(stats)
}

/// A blob to optimize and the tiles it stands for.
struct Job<K> {
    key: K,
    /// Tiles per zoom level sharing `data`.
    zooms: BTreeMap<u8, u64>,
    references: u64,
    data: Vec<u8>,
}

struct BatchOutput<K> {
    writes: Vec<(K, Vec<u8>)>,
    deletes: Vec<K>,
}

/// Optimizes one batch on the pool and folds the results into `stats`.
/// Counts are per tile, so a blob shared by several coordinates counts once
/// for each of them.
fn run_batch<K>(
    pool: &rayon::ThreadPool,
    jobs: &[Job<K>],
    policy: &LayerPolicy,
    options: &OptimizeOptions,
    stats: &mut OptimizeStats,
) -> Result<BatchOutput<K>>
where
    K: Clone + Display + Sync,
{
    let results: Vec<Result<OptimizedTile>> = pool.install(|| {
        jobs.par_iter()
            .map(|job| optimize_tile(&job.data, policy, options.drop_empty_tiles))
            .collect()
    });

    let mut output = BatchOutput {
        writes: Vec::new(),
        deletes: Vec::new(),
    };
    for (job, result) in jobs.iter().zip(results) {
        stats.tiles_processed += job.references;
        let tile = match result {
            Ok(tile) => tile,
            Err(err) => {
                match err.downcast_ref::<TileError>() {
                    Some(TileError::UnknownLayer { layer }) => {
                        error!(tile = %job.key, layer = %layer, "unknown layer, tile left untouched");
                        stats.record_unknown_layer(layer, job.references);
                    }
                    Some(TileError::Corrupt { reason }) => {
                        warn!(tile = %job.key, reason = %reason, "skipping corrupt tile");
                        stats.corrupt_tiles += job.references;
                    }
                    None => {
                        return Err(err.context(format!("failed to optimize tile {}", job.key)));
                    }
                }
                if options.fail_fast {
                    return Err(err.context(format!("aborting at tile {}", job.key)));
                }
                continue;
            }
        };
        for (zoom, tiles) in job.zooms.iter() {
            stats.record_outcome(*zoom, *tiles, &tile.outcome);
        }
        stats.bytes_before += job.data.len() as u64;
        match tile.action {
            TileAction::Replace(data) => {
                stats.tiles_rewritten += job.references;
                stats.bytes_after += data.len() as u64;
                output.writes.push((job.key.clone(), data));
            }
            TileAction::Delete => {
                stats.tiles_deleted += job.references;
                output.deletes.push(job.key.clone());
            }
        }
    }
    debug!(
        batch = jobs.len(),
        written = output.writes.len(),
        deleted = output.deletes.len(),
        "batch done"
    );
    Ok(output)
}

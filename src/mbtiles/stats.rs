use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::policy::PolicyOutcome;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct OptimizeStats {
    pub tiles_processed: u64,
    pub tiles_rewritten: u64,
    pub tiles_deleted: u64,
    pub corrupt_tiles: u64,
    pub unknown_layer_tiles: u64,
    pub unknown_layers: BTreeMap<String, u64>,
    pub removed_layers_by_zoom: BTreeMap<String, BTreeSet<u8>>,
    pub removed_features_by_zoom: BTreeMap<u8, u64>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl OptimizeStats {
    /// Records the outcome of `tiles` tiles at `zoom` that shared one blob.
    pub fn record_outcome(&mut self, zoom: u8, tiles: u64, outcome: &PolicyOutcome) {
        for layer in outcome.removed_layers.iter() {
            self.removed_layers_by_zoom
                .entry(layer.clone())
                .or_default()
                .insert(zoom);
        }
        if outcome.removed_features > 0 {
            *self.removed_features_by_zoom.entry(zoom).or_insert(0) += outcome.removed_features * tiles;
        }
    }

    pub fn record_unknown_layer(&mut self, layer: &str, tiles: u64) {
        self.unknown_layer_tiles += tiles;
        *self.unknown_layers.entry(layer.to_string()).or_insert(0) += tiles;
    }

    /// Whether the run must end with a failure status.
    pub fn has_fatal_errors(&self) -> bool {
        self.unknown_layer_tiles > 0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidStats {
    pub levels: Vec<PyramidLevelStats>,
    pub minzoom: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidLevelStats {
    pub zoom: u8,
    pub parents_considered: u64,
    pub tiles_written: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub tiles_checked: u64,
    pub tiles_deleted: u64,
    /// Rows whose coordinates lie outside the grid of their zoom level.
    pub tiles_skipped: u64,
    pub deleted_by_zoom: BTreeMap<u8, u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ShrinkStats {
    pub previous_maxzoom: Option<u8>,
    pub maxzoom: u8,
    pub tiles_deleted: u64,
}

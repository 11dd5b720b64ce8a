use std::collections::{BTreeMap, BTreeSet};

use flightmap_tiles::mbtiles::{OptimizeStats, PruneStats, PyramidLevelStats, PyramidStats};
use flightmap_tiles::output::{optimize_text_lines, prune_text_lines, pyramid_text_lines};

#[test]
fn optimize_lines_list_counts_and_removals() {
    let stats = OptimizeStats {
        tiles_processed: 12,
        tiles_rewritten: 9,
        tiles_deleted: 1,
        corrupt_tiles: 1,
        unknown_layer_tiles: 1,
        unknown_layers: BTreeMap::from([("poi".to_string(), 1)]),
        removed_layers_by_zoom: BTreeMap::from([(
            "park".to_string(),
            BTreeSet::from([5u8, 6]),
        )]),
        removed_features_by_zoom: BTreeMap::from([(6u8, 42)]),
        bytes_before: 2048,
        bytes_after: 1024,
    };
    assert_eq!(
        optimize_text_lines(&stats),
        vec![
            "tiles: processed=12 rewritten=9 deleted=1",
            "bytes: before=2048 after=1024",
            "corrupt_tiles: 1",
            "unknown_layer_tiles: 1",
            "unknown_layer: poi tiles=1",
            "removed_layer: park zooms=5,6",
            "removed_features: z=6 count=42",
        ]
    );
}

#[test]
fn pyramid_lines_end_with_minzoom() {
    let stats = PyramidStats {
        levels: vec![PyramidLevelStats {
            zoom: 6,
            parents_considered: 4,
            tiles_written: 3,
            bytes_written: 900,
        }],
        minzoom: Some(6),
    };
    assert_eq!(
        pyramid_text_lines(&stats),
        vec!["z=6: parents=4 written=3 bytes=900", "minzoom: 6"]
    );
    assert_eq!(
        pyramid_text_lines(&PyramidStats::default()),
        vec!["no zoom levels built"]
    );
}

#[test]
fn prune_lines_group_by_zoom() {
    let stats = PruneStats {
        tiles_checked: 20,
        tiles_deleted: 3,
        tiles_skipped: 1,
        deleted_by_zoom: BTreeMap::from([(5u8, 1), (6, 2)]),
    };
    assert_eq!(
        prune_text_lines(&stats),
        vec![
            "tiles: checked=20 deleted=3",
            "skipped_tiles: 1",
            "deleted: z=5 count=1",
            "deleted: z=6 count=2",
        ]
    );
}

#[test]
fn optimize_stats_serialize_as_json() {
    let stats = OptimizeStats {
        tiles_processed: 2,
        ..OptimizeStats::default()
    };
    let json = serde_json::to_value(&stats).expect("json");
    assert_eq!(json["tiles_processed"], 2);
    assert!(json["unknown_layers"].as_object().expect("object").is_empty());
}

use std::collections::HashSet;

use flightmap_tiles::error::TileError;
use flightmap_tiles::filter::{
    AllowList, compact_keys_and_values, remove_layers, restrict_features_by_attribute,
    restrict_tags, select_top_n,
};
use flightmap_tiles::policy::{LayerPolicy, PolicyFile, apply_policy};
use flightmap_tiles::vector_tile::tile::{Feature, Layer, Value};
use flightmap_tiles::vector_tile::{AttributeValue, Tile, resolve_attributes};

fn string(value: &str) -> Value {
    Value {
        string_value: Some(value.to_string()),
        ..Default::default()
    }
}

fn double(value: f64) -> Value {
    Value {
        double_value: Some(value),
        ..Default::default()
    }
}

fn feature(tags: &[u32]) -> Feature {
    Feature {
        id: None,
        tags: tags.to_vec(),
        r#type: Some(1),
        geometry: vec![9, 50, 34],
    }
}

fn layer(name: &str, keys: &[&str], values: Vec<Value>, features: Vec<Feature>) -> Layer {
    Layer {
        version: 2,
        name: name.to_string(),
        features,
        keys: keys.iter().map(|key| key.to_string()).collect(),
        values,
        extent: Some(4096),
    }
}

/// keys: class, name, rank, ele
/// values: "city", "A", "forest", "B", 3.0, "2"
fn place_layer() -> Layer {
    layer(
        "place",
        &["class", "name", "rank", "ele"],
        vec![
            string("city"),
            string("A"),
            string("forest"),
            string("B"),
            double(3.0),
            string("2"),
        ],
        vec![
            feature(&[0, 0, 1, 1, 2, 4]),
            feature(&[0, 2, 1, 3, 3, 5]),
        ],
    )
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn strings(items: &[&str]) -> AllowList {
    AllowList::new(
        items
            .iter()
            .map(|item| AttributeValue::String(item.to_string())),
    )
}

#[test]
fn remove_layers_keeps_order_of_the_rest() {
    let mut tile = Tile {
        layers: vec![
            layer("water", &[], vec![], vec![feature(&[])]),
            layer("park", &[], vec![], vec![feature(&[])]),
            layer("place", &[], vec![], vec![feature(&[])]),
        ],
    };
    let dropped = remove_layers(&mut tile, &set(&["park", "unused"]));
    assert_eq!(dropped.len(), 1);
    let names: Vec<&str> = tile.layers.iter().map(|layer| layer.name.as_str()).collect();
    assert_eq!(names, vec!["water", "place"]);
}

#[test]
fn feature_filter_drops_features_without_allowed_value() {
    let mut layer = place_layer();
    layer.features.push(feature(&[1, 1]));
    let removed = restrict_features_by_attribute(&mut layer, "class", &strings(&["city"]));
    assert_eq!(removed, 2);
    assert_eq!(layer.features.len(), 1);
    assert_eq!(layer.features[0].tags[..2], [0, 0]);
}

#[test]
fn feature_filter_compares_by_declared_type() {
    let mut by_number = place_layer();
    let numbers = AllowList::new([AttributeValue::Float(3.0)]);
    restrict_features_by_attribute(&mut by_number, "rank", &numbers);
    assert_eq!(by_number.features.len(), 1);

    // `ele` is the string "2" on the second feature; the number 2 must not match it.
    let mut by_string = place_layer();
    let numbers = AllowList::new([AttributeValue::Float(2.0)]);
    restrict_features_by_attribute(&mut by_string, "ele", &numbers);
    assert!(by_string.features.is_empty());

    let mut by_string = place_layer();
    restrict_features_by_attribute(&mut by_string, "ele", &strings(&["2"]));
    assert_eq!(by_string.features.len(), 1);

    let mut rank_as_text = place_layer();
    restrict_features_by_attribute(&mut rank_as_text, "rank", &strings(&["3"]));
    assert!(rank_as_text.features.is_empty());
}

#[test]
fn restrict_tags_is_idempotent() {
    let allowed = set(&["class", "name"]);
    let mut once = place_layer();
    restrict_tags(&mut once, &allowed);
    let mut twice = once.clone();
    restrict_tags(&mut twice, &allowed);
    assert_eq!(once, twice);
    assert_eq!(once.features[0].tags, vec![0, 0, 1, 1]);
    assert_eq!(once.features[1].tags, vec![0, 2, 1, 3]);
}

#[test]
fn compaction_preserves_attributes_and_drops_orphans() {
    let mut layer = place_layer();
    layer.features.remove(1);
    restrict_tags(&mut layer, &set(&["class", "rank"]));
    let before: Vec<_> = layer
        .features
        .iter()
        .map(|feature| resolve_attributes(feature, &layer))
        .collect();

    compact_keys_and_values(&mut layer);
    let after: Vec<_> = layer
        .features
        .iter()
        .map(|feature| resolve_attributes(feature, &layer))
        .collect();
    assert_eq!(before, after);
    assert_eq!(layer.keys, vec!["class".to_string(), "rank".to_string()]);
    assert_eq!(layer.values, vec![string("city"), double(3.0)]);
    assert_eq!(layer.features[0].tags, vec![0, 0, 1, 1]);
}

#[test]
fn compaction_merges_duplicate_entries() {
    let mut layer = layer(
        "water",
        &["class", "class"],
        vec![string("lake"), string("lake")],
        vec![feature(&[0, 0]), feature(&[1, 1])],
    );
    compact_keys_and_values(&mut layer);
    assert_eq!(layer.keys, vec!["class".to_string()]);
    assert_eq!(layer.values, vec![string("lake")]);
    assert_eq!(layer.features[1].tags, vec![0, 0]);
}

#[test]
fn top_n_keeps_highest_in_original_order() {
    let mut layer = layer(
        "mountain_peak",
        &["ele", "name"],
        vec![
            double(1200.0),
            double(3000.0),
            double(800.0),
            string("Peak"),
            double(3000.0),
        ],
        vec![
            feature(&[0, 0]),
            feature(&[1, 3]),
            feature(&[0, 1]),
            feature(&[0, 2]),
            feature(&[0, 4]),
        ],
    );
    let removed = select_top_n(&mut layer, "ele", 3);
    assert_eq!(removed, 2);
    let kept: Vec<Vec<u32>> = layer.features.iter().map(|f| f.tags.clone()).collect();
    assert_eq!(kept, vec![vec![0, 0], vec![0, 1], vec![0, 4]]);
}

#[test]
fn top_n_breaks_ties_by_position() {
    let mut layer = layer(
        "mountain_peak",
        &["ele"],
        vec![double(100.0)],
        vec![feature(&[0, 0]), feature(&[0, 0]), feature(&[0, 0])],
    );
    layer.features[2].id = Some(3);
    select_top_n(&mut layer, "ele", 2);
    assert_eq!(layer.features.len(), 2);
    assert!(layer.features.iter().all(|feature| feature.id.is_none()));
}

#[test]
fn default_policy_filters_places() {
    let mut tile = Tile {
        layers: vec![place_layer()],
    };
    let outcome = apply_policy(&mut tile, &LayerPolicy::default()).expect("policy");
    assert_eq!(outcome.removed_features, 1);
    assert!(outcome.removed_layers.is_empty());
    let layer = &tile.layers[0];
    assert_eq!(layer.keys, vec!["class".to_string(), "name".to_string()]);
    assert_eq!(layer.values, vec![string("city"), string("A")]);
}

#[test]
fn default_policy_drops_layers_and_emptied_layers() {
    let mut tile = Tile {
        layers: vec![
            layer("park", &[], vec![], vec![feature(&[]), feature(&[])]),
            layer(
                "water",
                &["class"],
                vec![string("swimming_pool")],
                vec![feature(&[0, 0])],
            ),
        ],
    };
    let outcome = apply_policy(&mut tile, &LayerPolicy::default()).expect("policy");
    assert!(tile.layers.is_empty());
    assert_eq!(outcome.removed_features, 3);
    assert_eq!(
        outcome.removed_layers,
        vec!["park".to_string(), "water".to_string()]
    );
}

#[test]
fn unknown_layer_leaves_tile_untouched() {
    let mut tile = Tile {
        layers: vec![
            place_layer(),
            layer("poi", &[], vec![], vec![feature(&[])]),
        ],
    };
    let original = tile.clone();
    let err = apply_policy(&mut tile, &LayerPolicy::default()).expect_err("unknown layer");
    assert_eq!(
        err,
        TileError::UnknownLayer {
            layer: "poi".to_string()
        }
    );
    assert_eq!(tile, original);
}

#[test]
fn policy_file_supports_mixed_allow_lists() {
    let file: PolicyFile = serde_json::from_str(
        r#"{
            "layers": {
                "place": {
                    "action": "keep",
                    "filter": { "key": "rank", "values": ["3", 3, true] },
                    "tags": ["rank"]
                },
                "poi": { "action": "drop" }
            }
        }"#,
    )
    .expect("policy json");
    let policy = LayerPolicy::from_file(file);

    let mut tile = Tile {
        layers: vec![
            place_layer(),
            layer("poi", &[], vec![], vec![feature(&[])]),
        ],
    };
    let outcome = apply_policy(&mut tile, &policy).expect("policy");
    assert_eq!(outcome.removed_layers, vec!["poi".to_string()]);
    assert_eq!(tile.layers.len(), 1);
    assert_eq!(tile.layers[0].features.len(), 1);
    assert_eq!(tile.layers[0].keys, vec!["rank".to_string()]);
    assert_eq!(tile.layers[0].values, vec![double(3.0)]);
}

#[test]
fn policy_file_rejects_unknown_action() {
    let result: Result<PolicyFile, _> =
        serde_json::from_str(r#"{"layers": {"place": {"action": "rename"}}}"#);
    assert!(result.is_err());
}

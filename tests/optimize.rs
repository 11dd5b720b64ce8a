use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use mvt::{GeomEncoder, GeomType, Tile};
use mvt_reader::Reader;

use flightmap_tiles::mbtiles::{
    Mbtiles, OptimizeOptions, TileAction, TileCoord, optimize_container, optimize_tile,
};
use flightmap_tiles::policy::{LayerPolicy, read_policy};
use flightmap_tiles::vector_tile::decode;

fn point() -> mvt::GeomData {
    GeomEncoder::new(GeomType::Point)
        .point(1.0, 2.0)
        .expect("point")
        .encode()
        .expect("encode")
}

fn create_place_tile() -> Vec<u8> {
    let mut tile = Tile::new(4096);
    let layer = tile.create_layer("place");
    let mut feature = layer.into_feature(point());
    feature.add_tag_string("class", "city");
    feature.add_tag_string("name", "A");
    feature.add_tag_uint("rank", 4);
    let layer = feature.into_layer();
    let mut feature = layer.into_feature(point());
    feature.add_tag_string("class", "forest");
    feature.add_tag_string("name", "B");
    feature.add_tag_string("subclass", "wood");
    let layer = feature.into_layer();
    tile.add_layer(layer).expect("add place");
    tile.to_bytes().expect("tile bytes")
}

fn create_unknown_layer_tile() -> Vec<u8> {
    let mut tile = Tile::new(4096);
    let layer = tile.create_layer("poi");
    let mut feature = layer.into_feature(point());
    feature.add_tag_string("class", "shop");
    let layer = feature.into_layer();
    tile.add_layer(layer).expect("add poi");
    tile.to_bytes().expect("tile bytes")
}

fn create_park_tile() -> Vec<u8> {
    let mut tile = Tile::new(4096);
    let layer = tile.create_layer("park");
    let mut feature = layer.into_feature(point());
    feature.add_tag_string("class", "national_park");
    let layer = feature.into_layer();
    tile.add_layer(layer).expect("add park");
    tile.to_bytes().expect("tile bytes")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .expect("gunzip");
    decoded
}

fn create_mbtiles(path: &Path, tiles: &[(u8, u32, u32, Vec<u8>)]) {
    let conn = rusqlite::Connection::open(path).expect("open");
    conn.execute_batch(
        "
        CREATE TABLE metadata (name TEXT, value TEXT);
        CREATE TABLE tiles (
            zoom_level INTEGER,
            tile_column INTEGER,
            tile_row INTEGER,
            tile_data BLOB
        );
        INSERT INTO metadata (name, value) VALUES ('format', 'pbf');
        ",
    )
    .expect("schema");
    for (z, x, y, data) in tiles {
        conn.execute(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
            (z, x, y, data),
        )
        .expect("tile insert");
    }
}

fn read_tile(path: &Path, z: u8, x: u32, y: u32) -> Option<Vec<u8>> {
    let container = Mbtiles::open_readonly(path).expect("open");
    container.get_tile(TileCoord::new(z, x, y)).expect("get")
}

fn options() -> OptimizeOptions {
    OptimizeOptions {
        threads: 2,
        io_batch: 2,
        ..OptimizeOptions::default()
    }
}

#[test]
fn place_tile_keeps_only_city_with_class_and_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("base.mbtiles");
    create_mbtiles(&path, &[(10, 512, 300, gzip(&create_place_tile()))]);

    let stats = optimize_container(&path, &LayerPolicy::default(), &options()).expect("optimize");
    assert_eq!(stats.tiles_processed, 1);
    assert_eq!(stats.tiles_rewritten, 1);
    assert_eq!(stats.removed_features_by_zoom.get(&10), Some(&1));
    assert!(!stats.has_fatal_errors());

    let data = read_tile(&path, 10, 512, 300).expect("tile");
    assert_eq!(&data[..2], &[0x1f, 0x8b]);

    let decoded = decode(&data).expect("decode");
    let layer = decoded.layer("place").expect("place layer");
    assert_eq!(layer.features.len(), 1);
    assert_eq!(layer.keys, vec!["class".to_string(), "name".to_string()]);
    let values: Vec<Option<&str>> = layer
        .values
        .iter()
        .map(|value| value.string_value.as_deref())
        .collect();
    assert_eq!(values, vec![Some("city"), Some("A")]);

    let reader = Reader::new(gunzip(&data)).expect("reader");
    let features = reader.get_features(0).expect("features");
    assert_eq!(features.len(), 1);
    let properties = features[0].properties.as_ref().expect("properties");
    assert_eq!(properties.len(), 2);
    assert!(matches!(
        properties.get("class"),
        Some(mvt_reader::feature::Value::String(text)) if text == "city"
    ));
    assert!(matches!(
        properties.get("name"),
        Some(mvt_reader::feature::Value::String(text)) if text == "A"
    ));
}

#[test]
fn unknown_layer_tiles_are_counted_and_left_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("base.mbtiles");
    let unknown = create_unknown_layer_tile();
    create_mbtiles(
        &path,
        &[
            (5, 1, 1, unknown.clone()),
            (5, 1, 2, unknown.clone()),
            (5, 2, 2, create_place_tile()),
        ],
    );

    let stats = optimize_container(&path, &LayerPolicy::default(), &options()).expect("optimize");
    assert_eq!(stats.tiles_processed, 3);
    assert_eq!(stats.tiles_rewritten, 1);
    assert_eq!(stats.unknown_layer_tiles, 2);
    assert_eq!(stats.unknown_layers.get("poi"), Some(&2));
    assert!(stats.has_fatal_errors());
    assert_eq!(read_tile(&path, 5, 1, 1), Some(unknown));
}

#[test]
fn corrupt_tiles_are_skipped_unless_fail_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("base.mbtiles");
    let garbage = vec![0xff, 0xff, 0xff, 0x01];
    create_mbtiles(
        &path,
        &[
            (3, 0, 0, garbage.clone()),
            (3, 0, 1, create_place_tile()),
        ],
    );

    let stats = optimize_container(&path, &LayerPolicy::default(), &options()).expect("optimize");
    assert_eq!(stats.corrupt_tiles, 1);
    assert_eq!(stats.tiles_rewritten, 1);
    assert!(!stats.has_fatal_errors());
    assert_eq!(read_tile(&path, 3, 0, 0), Some(garbage));

    let fail_fast = OptimizeOptions {
        fail_fast: true,
        ..options()
    };
    assert!(optimize_container(&path, &LayerPolicy::default(), &fail_fast).is_err());
}

#[test]
fn empty_tiles_are_kept_unless_requested() {
    let park = create_park_tile();
    let policy = LayerPolicy::default();

    let kept = optimize_tile(&park, &policy, false).expect("optimize");
    assert_eq!(kept.outcome.removed_layers, vec!["park".to_string()]);
    match kept.action {
        TileAction::Replace(data) => assert!(decode(&data).expect("decode").is_empty()),
        TileAction::Delete => panic!("tile should be kept"),
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("base.mbtiles");
    create_mbtiles(&path, &[(4, 1, 1, park), (4, 1, 2, create_place_tile())]);
    let options = OptimizeOptions {
        drop_empty_tiles: true,
        ..options()
    };
    let stats = optimize_container(&path, &policy, &options).expect("optimize");
    assert_eq!(stats.tiles_deleted, 1);
    assert_eq!(
        stats.removed_layers_by_zoom.get("park").map(|zooms| zooms.len()),
        Some(1)
    );
    assert_eq!(read_tile(&path, 4, 1, 1), None);
    assert!(read_tile(&path, 4, 1, 2).is_some());
}

#[test]
fn policy_file_overrides_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy_path = dir.path().join("policy.json");
    fs::write(
        &policy_path,
        r#"{"layers": {"poi": {"action": "keep", "tags": []}, "place": {"action": "drop"}}}"#,
    )
    .expect("write policy");
    let policy = read_policy(&policy_path).expect("policy");

    let path = dir.path().join("base.mbtiles");
    create_mbtiles(
        &path,
        &[
            (2, 0, 0, create_unknown_layer_tile()),
            (2, 0, 1, create_place_tile()),
        ],
    );
    let stats = optimize_container(&path, &policy, &options()).expect("optimize");
    assert_eq!(stats.unknown_layer_tiles, 0);
    assert_eq!(stats.tiles_rewritten, 2);

    let poi = decode(&read_tile(&path, 2, 0, 0).expect("tile")).expect("decode");
    let layer = poi.layer("poi").expect("poi");
    assert_eq!(layer.features.len(), 1);
    assert!(layer.keys.is_empty());
    assert!(layer.values.is_empty());
    let place = decode(&read_tile(&path, 2, 0, 1).expect("tile")).expect("decode");
    assert!(place.is_empty());
}

fn create_dedup_mbtiles(path: &Path, coords: &[(u8, u32, u32)], data: &[u8]) {
    let conn = rusqlite::Connection::open(path).expect("open");
    conn.execute_batch(
        "
        CREATE TABLE metadata (name TEXT, value TEXT);
        CREATE TABLE map (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_id TEXT);
        CREATE TABLE images (tile_id TEXT, tile_data BLOB);
        CREATE VIEW tiles AS
            SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column,
                   map.tile_row AS tile_row, images.tile_data AS tile_data
            FROM map JOIN images ON images.tile_id = map.tile_id;
        INSERT INTO metadata (name, value) VALUES ('format', 'pbf');
        ",
    )
    .expect("schema");
    conn.execute(
        "INSERT INTO images (tile_id, tile_data) VALUES ('shared', ?1)",
        [data],
    )
    .expect("image insert");
    for (z, x, y) in coords {
        conn.execute(
            "INSERT INTO map (zoom_level, tile_column, tile_row, tile_id) VALUES (?1, ?2, ?3, 'shared')",
            (z, x, y),
        )
        .expect("map insert");
    }
}

fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).expect("open");
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count")
}

#[test]
fn shared_blob_is_rewritten_once_and_stays_shared() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dedup.mbtiles");
    let mut coords: Vec<(u8, u32, u32)> = Vec::new();
    for x in 0..10 {
        for y in 0..4 {
            coords.push((6, x, y));
        }
    }
    for x in 0..10 {
        coords.push((7, x, 0));
    }
    create_dedup_mbtiles(&path, &coords, &gzip(&create_place_tile()));
    assert_eq!(count_rows(&path, "images"), 1);

    let stats = optimize_container(&path, &LayerPolicy::default(), &options()).expect("optimize");
    assert_eq!(stats.tiles_processed, 50);
    assert_eq!(stats.tiles_rewritten, 50);
    assert_eq!(stats.removed_features_by_zoom.get(&6), Some(&40));
    assert_eq!(stats.removed_features_by_zoom.get(&7), Some(&10));

    assert_eq!(count_rows(&path, "images"), 1);
    assert_eq!(count_rows(&path, "map"), 50);
    let first = read_tile(&path, 6, 0, 0).expect("tile");
    assert_eq!(read_tile(&path, 7, 9, 0), Some(first.clone()));
    let layer_len = decode(&first)
        .expect("decode")
        .layer("place")
        .expect("place layer")
        .features
        .len();
    assert_eq!(layer_len, 1);
}

#[test]
fn shared_blob_delete_removes_every_coordinate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dedup.mbtiles");
    create_dedup_mbtiles(&path, &[(4, 0, 0), (4, 0, 1), (5, 3, 3)], &create_park_tile());

    let options = OptimizeOptions {
        drop_empty_tiles: true,
        ..options()
    };
    let stats = optimize_container(&path, &LayerPolicy::default(), &options).expect("optimize");
    assert_eq!(stats.tiles_deleted, 3);
    assert_eq!(count_rows(&path, "map"), 0);
    assert_eq!(count_rows(&path, "images"), 0);
}

fn feature_with(layer: mvt::Layer, tags: &[(&str, TagValue)]) -> mvt::Layer {
    let mut feature = layer.into_feature(point());
    for (key, value) in tags {
        match value {
            TagValue::Text(text) => feature.add_tag_string(key, text),
            TagValue::Uint(number) => feature.add_tag_uint(key, *number),
        }
    }
    feature.into_layer()
}

enum TagValue {
    Text(&'static str),
    Uint(u64),
}

fn optimized_layers(data: Vec<u8>) -> flightmap_tiles::vector_tile::DecodedTile {
    match optimize_tile(&data, &LayerPolicy::default(), false)
        .expect("optimize")
        .action
    {
        TileAction::Replace(data) => decode(&data).expect("decode"),
        TileAction::Delete => panic!("tile should be kept"),
    }
}

#[test]
fn built_in_policy_keeps_country_borders_only() {
    let mut tile = Tile::new(4096);
    let mut layer = tile.create_layer("boundary");
    layer = feature_with(
        layer,
        &[("admin_level", TagValue::Uint(2)), ("disputed", TagValue::Uint(0))],
    );
    layer = feature_with(layer, &[("admin_level", TagValue::Uint(4))]);
    layer = feature_with(layer, &[("admin_level", TagValue::Text("2"))]);
    tile.add_layer(layer).expect("add boundary");

    let decoded = optimized_layers(tile.to_bytes().expect("tile bytes"));
    let layer = decoded.layer("boundary").expect("boundary layer");
    assert_eq!(layer.features.len(), 1);
    assert_eq!(layer.keys, vec!["admin_level".to_string()]);
    assert_eq!(layer.values.len(), 1);
    assert_eq!(layer.values[0].uint_value, Some(2));
}

#[test]
fn built_in_policy_caps_mountain_peaks_by_elevation() {
    let elevations = [1200, 4478, 900, 3100, 2500, 4000, 1800];
    let mut tile = Tile::new(4096);
    let mut layer = tile.create_layer("mountain_peak");
    for ele in elevations {
        layer = feature_with(
            layer,
            &[
                ("name", TagValue::Text("peak")),
                ("ele", TagValue::Uint(ele)),
                ("rank", TagValue::Uint(1)),
            ],
        );
    }
    tile.add_layer(layer).expect("add peaks");
    let data = tile.to_bytes().expect("tile bytes");

    let outcome = optimize_tile(&data, &LayerPolicy::default(), false).expect("optimize");
    assert_eq!(outcome.outcome.removed_features, 2);
    let TileAction::Replace(optimized) = outcome.action else {
        panic!("tile should be kept");
    };

    let reader = Reader::new(optimized).expect("reader");
    let features = reader.get_features(0).expect("features");
    let kept: Vec<u64> = features
        .iter()
        .map(|feature| {
            let properties = feature.properties.as_ref().expect("properties");
            assert!(properties.get("rank").is_none());
            match properties.get("ele") {
                Some(mvt_reader::feature::Value::UInt(ele)) => *ele,
                other => panic!("unexpected ele {other:?}"),
            }
        })
        .collect();
    assert_eq!(kept, vec![4478, 3100, 2500, 4000, 1800]);
}

#[test]
fn built_in_policy_filters_lines_and_keeps_class_on_areas() {
    let mut tile = Tile::new(4096);
    let mut layer = tile.create_layer("transportation");
    for class in ["motorway", "service", "rail", "path"] {
        layer = feature_with(
            layer,
            &[("class", TagValue::Text(class)), ("oneway", TagValue::Uint(1))],
        );
    }
    tile.add_layer(layer).expect("add transportation");
    let mut layer = tile.create_layer("waterway");
    for class in ["river", "ditch", "stream"] {
        layer = feature_with(layer, &[("class", TagValue::Text(class))]);
    }
    tile.add_layer(layer).expect("add waterway");
    for name in ["landuse", "landcover"] {
        let mut layer = tile.create_layer(name);
        for class in ["residential", "farmland", "wood"] {
            layer = feature_with(
                layer,
                &[("class", TagValue::Text(class)), ("subclass", TagValue::Text("x"))],
            );
        }
        tile.add_layer(layer).expect("add area layer");
    }

    let decoded = optimized_layers(tile.to_bytes().expect("tile bytes"));
    let classes = |name: &str| -> Vec<String> {
        let layer = decoded.layer(name).expect("layer");
        layer
            .features
            .iter()
            .map(|feature| {
                let index = feature.tags[1] as usize;
                layer.values[index].string_value.clone().expect("class value")
            })
            .collect()
    };
    assert_eq!(classes("transportation"), vec!["motorway", "rail"]);
    assert_eq!(classes("waterway"), vec!["river", "stream"]);
    for name in ["landuse", "landcover"] {
        assert_eq!(classes(name), vec!["residential", "farmland", "wood"]);
        assert_eq!(
            decoded.layer(name).expect("layer").keys,
            vec!["class".to_string()]
        );
    }
}

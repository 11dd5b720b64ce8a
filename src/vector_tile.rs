//! Mapbox Vector Tile codec.
//!
//! Tiles are decoded into the protobuf messages themselves so that geometry,
//! ids and untouched values survive a decode/encode cycle byte for byte.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::TileError;

pub mod tile {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum GeomType {
        Unknown = 0,
        Point = 1,
        Linestring = 2,
        Polygon = 3,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Value {
        #[prost(string, optional, tag = "1")]
        pub string_value: Option<String>,
        #[prost(float, optional, tag = "2")]
        pub float_value: Option<f32>,
        #[prost(double, optional, tag = "3")]
        pub double_value: Option<f64>,
        #[prost(int64, optional, tag = "4")]
        pub int_value: Option<i64>,
        #[prost(uint64, optional, tag = "5")]
        pub uint_value: Option<u64>,
        #[prost(sint64, optional, tag = "6")]
        pub sint_value: Option<i64>,
        #[prost(bool, optional, tag = "7")]
        pub bool_value: Option<bool>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Feature {
        #[prost(uint64, optional, tag = "1")]
        pub id: Option<u64>,
        #[prost(uint32, repeated, packed = "true", tag = "2")]
        pub tags: Vec<u32>,
        #[prost(enumeration = "GeomType", optional, tag = "3")]
        pub r#type: Option<i32>,
        #[prost(uint32, repeated, packed = "true", tag = "4")]
        pub geometry: Vec<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Layer {
        #[prost(uint32, required, tag = "15", default = "1")]
        pub version: u32,
        #[prost(string, required, tag = "1")]
        pub name: String,
        #[prost(message, repeated, tag = "2")]
        pub features: Vec<Feature>,
        #[prost(string, repeated, tag = "3")]
        pub keys: Vec<String>,
        #[prost(message, repeated, tag = "4")]
        pub values: Vec<Value>,
        #[prost(uint32, optional, tag = "5", default = "4096")]
        pub extent: Option<u32>,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Tile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<tile::Layer>,
}

/// Compression wrapped around the protobuf bytes in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTile {
    pub tile: Tile,
    pub compression: Compression,
}

impl DecodedTile {
    pub fn layer(&self, name: &str) -> Option<&tile::Layer> {
        self.tile.layers.iter().find(|layer| layer.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tile.layers.is_empty()
    }
}

/// Attribute value as used for comparisons. Every numeric protobuf variant
/// widens to `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Float(f64),
    Bool(bool),
}

impl AttributeValue {
    /// `None` for a value message with no field set.
    pub fn from_value(value: &tile::Value) -> Option<Self> {
        if let Some(text) = &value.string_value {
            return Some(AttributeValue::String(text.clone()));
        }
        if let Some(number) = value.float_value {
            return Some(AttributeValue::Float(number as f64));
        }
        if let Some(number) = value.double_value {
            return Some(AttributeValue::Float(number));
        }
        if let Some(number) = value.int_value.or(value.sint_value) {
            return Some(AttributeValue::Float(number as f64));
        }
        if let Some(number) = value.uint_value {
            return Some(AttributeValue::Float(number as f64));
        }
        value.bool_value.map(AttributeValue::Bool)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(number) => Some(*number),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::String(text) => write!(f, "{text}"),
            AttributeValue::Float(number) => write!(f, "{number}"),
            AttributeValue::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

pub fn decode(blob: &[u8]) -> Result<DecodedTile> {
    let (payload, compression) = if blob.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(blob);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|err| TileError::corrupt(format!("gzip: {err}")))?;
        (decoded, Compression::Gzip)
    } else {
        (blob.to_vec(), Compression::None)
    };
    let tile = Tile::decode(payload.as_slice())
        .map_err(|err| TileError::corrupt(format!("protobuf: {err}")))?;
    validate_tags(&tile)?;
    Ok(DecodedTile { tile, compression })
}

/// Serializes the tile in the order given and applies the original
/// compression. Identical input always yields identical bytes.
pub fn encode(decoded: &DecodedTile) -> Result<Vec<u8>> {
    let payload = decoded.tile.encode_to_vec();
    match decoded.compression {
        Compression::None => Ok(payload),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&payload)
                .context("encode gzip tile data")?;
            encoder.finish().context("finish gzip tile data")
        }
    }
}

fn validate_tags(tile: &Tile) -> Result<(), TileError> {
    for layer in &tile.layers {
        for feature in &layer.features {
            if feature.tags.len() % 2 != 0 {
                return Err(TileError::corrupt(format!(
                    "layer `{}`: odd number of tag indices",
                    layer.name
                )));
            }
            for pair in feature.tags.chunks_exact(2) {
                if pair[0] as usize >= layer.keys.len() || pair[1] as usize >= layer.values.len() {
                    return Err(TileError::corrupt(format!(
                        "layer `{}`: tag index out of range",
                        layer.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Materializes a feature's attributes. A repeated key keeps its last value.
pub fn resolve_attributes(
    feature: &tile::Feature,
    layer: &tile::Layer,
) -> BTreeMap<String, AttributeValue> {
    let mut attributes = BTreeMap::new();
    for pair in feature.tags.chunks_exact(2) {
        let (Some(key), Some(value)) = (
            layer.keys.get(pair[0] as usize),
            layer.values.get(pair[1] as usize),
        ) else {
            continue;
        };
        match AttributeValue::from_value(value) {
            Some(value) => {
                attributes.insert(key.clone(), value);
            }
            None => {
                attributes.remove(key);
            }
        }
    }
    attributes
}

/// Looks up a single attribute without building the whole map.
pub fn feature_attribute(
    feature: &tile::Feature,
    keys: &[String],
    values: &[tile::Value],
    name: &str,
) -> Option<AttributeValue> {
    feature
        .tags
        .chunks_exact(2)
        .filter(|pair| keys.get(pair[0] as usize).is_some_and(|key| key == name))
        .last()
        .and_then(|pair| values.get(pair[1] as usize))
        .and_then(AttributeValue::from_value)
}

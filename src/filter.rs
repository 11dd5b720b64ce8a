use std::collections::{HashMap, HashSet};

use prost::Message;

use crate::vector_tile::tile::{Layer, Value};
use crate::vector_tile::{AttributeValue, Tile, feature_attribute};

/// Set of accepted attribute values. Members only match values of the same
/// declared type: the number `2` never matches the string `"2"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowList {
    strings: HashSet<String>,
    numbers: Vec<f64>,
    bools: HashSet<bool>,
}

impl AllowList {
    pub fn new<I>(values: I) -> Self
    where
        I: IntoIterator<Item = AttributeValue>,
    {
        let mut list = AllowList::default();
        for value in values {
            match value {
                AttributeValue::String(text) => {
                    list.strings.insert(text);
                }
                AttributeValue::Float(number) => list.numbers.push(number),
                AttributeValue::Bool(flag) => {
                    list.bools.insert(flag);
                }
            }
        }
        list
    }

    pub fn contains(&self, value: &AttributeValue) -> bool {
        match value {
            AttributeValue::String(text) => self.strings.contains(text),
            AttributeValue::Float(number) => self.numbers.iter().any(|member| member == number),
            AttributeValue::Bool(flag) => self.bools.contains(flag),
        }
    }
}

/// Drops every layer named in `names`. Returns the dropped layers so callers
/// can account for them.
pub fn remove_layers(tile: &mut Tile, names: &HashSet<String>) -> Vec<Layer> {
    let (dropped, kept): (Vec<Layer>, Vec<Layer>) = std::mem::take(&mut tile.layers)
        .into_iter()
        .partition(|layer| names.contains(&layer.name));
    tile.layers = kept;
    dropped
}

/// Keeps the features whose `key` attribute is in `allowed`; a feature without
/// the attribute is dropped. Returns the number of features removed.
pub fn restrict_features_by_attribute(layer: &mut Layer, key: &str, allowed: &AllowList) -> usize {
    let before = layer.features.len();
    let features = std::mem::take(&mut layer.features);
    layer.features = features
        .into_iter()
        .filter(|feature| {
            feature_attribute(feature, &layer.keys, &layer.values, key)
                .is_some_and(|value| allowed.contains(&value))
        })
        .collect();
    before - layer.features.len()
}

/// Drops tag pairs whose key is not in `allowed`. Keys and values stay in
/// place until [`compact_keys_and_values`] runs.
pub fn restrict_tags(layer: &mut Layer, allowed: &HashSet<String>) {
    for feature in layer.features.iter_mut() {
        let tags = feature
            .tags
            .chunks_exact(2)
            .filter(|pair| {
                layer
                    .keys
                    .get(pair[0] as usize)
                    .is_some_and(|key| allowed.contains(key))
            })
            .flatten()
            .copied()
            .collect();
        feature.tags = tags;
    }
}

/// Rebuilds `keys` and `values` from the entries still referenced by some
/// feature, in first-seen order, and rewrites tag indices to match. Equal
/// keys and equal values share one slot.
pub fn compact_keys_and_values(layer: &mut Layer) {
    let mut keys: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut key_slots: HashMap<&str, u32> = HashMap::new();
    let mut value_slots: HashMap<Vec<u8>, u32> = HashMap::new();
    let mut rewritten: Vec<Vec<u32>> = Vec::with_capacity(layer.features.len());

    for feature in &layer.features {
        let mut tags = Vec::with_capacity(feature.tags.len());
        for pair in feature.tags.chunks_exact(2) {
            let (Some(key), Some(value)) = (
                layer.keys.get(pair[0] as usize),
                layer.values.get(pair[1] as usize),
            ) else {
                continue;
            };
            let key_index = *key_slots.entry(key.as_str()).or_insert_with(|| {
                keys.push(key.clone());
                (keys.len() - 1) as u32
            });
            let value_index = *value_slots.entry(value.encode_to_vec()).or_insert_with(|| {
                values.push(value.clone());
                (values.len() - 1) as u32
            });
            tags.push(key_index);
            tags.push(value_index);
        }
        rewritten.push(tags);
    }

    for (feature, tags) in layer.features.iter_mut().zip(rewritten) {
        feature.tags = tags;
    }
    layer.keys = keys;
    layer.values = values;
}

/// Keeps the `count` features with the largest numeric `attribute`, in their
/// original order. Missing or non-numeric values rank lowest; ties go to the
/// earlier feature. Returns the number of features removed.
pub fn select_top_n(layer: &mut Layer, attribute: &str, count: usize) -> usize {
    let before = layer.features.len();
    if before <= count {
        return 0;
    }
    let mut ranked: Vec<(usize, f64)> = layer
        .features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            let rank = feature_attribute(feature, &layer.keys, &layer.values, attribute)
                .and_then(|value| value.as_f64())
                .filter(|number| !number.is_nan())
                .unwrap_or(f64::NEG_INFINITY);
            (index, rank)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let keep: HashSet<usize> = ranked.into_iter().take(count).map(|(index, _)| index).collect();

    let features = std::mem::take(&mut layer.features);
    layer.features = features
        .into_iter()
        .enumerate()
        .filter(|(index, _)| keep.contains(index))
        .map(|(_, feature)| feature)
        .collect();
    before - layer.features.len()
}

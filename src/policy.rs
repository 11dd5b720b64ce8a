//! Per-layer rules applied by the optimize pass.
//!
//! The policy file is JSON:
//!
//! ```json
//! {
//!   "layers": {
//!     "park": { "action": "drop" },
//!     "place": {
//!       "action": "keep",
//!       "filter": { "key": "class", "values": ["city", "town"] },
//!       "tags": ["class", "name"]
//!     },
//!     "mountain_peak": { "action": "keep", "top_n": { "attribute": "ele", "count": 5 } }
//!   }
//! }
//! ```
//!
//! A kept layer without `tags` keeps every tag. Every layer found in a tile
//! must be listed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TileError;
use crate::filter::{
    AllowList, compact_keys_and_values, remove_layers, restrict_features_by_attribute,
    restrict_tags, select_top_n,
};
use crate::vector_tile::{AttributeValue, Tile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyFile {
    pub layers: BTreeMap<String, LayerRuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LayerRuleConfig {
    Drop,
    Keep(KeepRuleConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepRuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FeatureFilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<TopNConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFilterConfig {
    pub key: String,
    pub values: Vec<AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNConfig {
    pub attribute: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub enum LayerRule {
    Drop,
    Keep {
        filter: Option<(String, AllowList)>,
        tags: Option<HashSet<String>>,
        top_n: Option<(String, usize)>,
    },
}

#[derive(Debug, Clone)]
pub struct LayerPolicy {
    rules: HashMap<String, LayerRule>,
    dropped: HashSet<String>,
}

/// What applying a policy removed from one tile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub removed_layers: Vec<String>,
    pub removed_features: u64,
}

impl LayerPolicy {
    pub fn from_file(file: PolicyFile) -> Self {
        let mut rules = HashMap::new();
        let mut dropped = HashSet::new();
        for (name, rule) in file.layers {
            let rule = match rule {
                LayerRuleConfig::Drop => {
                    dropped.insert(name.clone());
                    LayerRule::Drop
                }
                LayerRuleConfig::Keep(keep) => LayerRule::Keep {
                    filter: keep
                        .filter
                        .map(|filter| (filter.key, AllowList::new(filter.values))),
                    tags: keep.tags.map(|tags| tags.into_iter().collect()),
                    top_n: keep.top_n.map(|top| (top.attribute, top.count)),
                },
            };
            rules.insert(name, rule);
        }
        Self { rules, dropped }
    }

    pub fn rule(&self, layer: &str) -> Option<&LayerRule> {
        self.rules.get(layer)
    }
}

impl Default for LayerPolicy {
    fn default() -> Self {
        LayerPolicy::from_file(default_policy_file())
    }
}

pub fn read_policy(path: &Path) -> Result<LayerPolicy> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    let file: PolicyFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))?;
    Ok(LayerPolicy::from_file(file))
}

/// Built-in rules for the base map's OpenMapTiles-style layers.
pub fn default_policy_file() -> PolicyFile {
    fn keep(
        filter: Option<(&str, Vec<AttributeValue>)>,
        tags: &[&str],
        top_n: Option<(&str, usize)>,
    ) -> LayerRuleConfig {
        LayerRuleConfig::Keep(KeepRuleConfig {
            filter: filter.map(|(key, values)| FeatureFilterConfig {
                key: key.to_string(),
                values,
            }),
            tags: Some(tags.iter().map(|tag| tag.to_string()).collect()),
            top_n: top_n.map(|(attribute, count)| TopNConfig {
                attribute: attribute.to_string(),
                count,
            }),
        })
    }
    fn classes(values: &[&str]) -> Option<(&'static str, Vec<AttributeValue>)> {
        Some((
            "class",
            values
                .iter()
                .map(|value| AttributeValue::String(value.to_string()))
                .collect(),
        ))
    }

    let layers = BTreeMap::from([
        ("aeroway".to_string(), keep(None, &["class", "ref"], None)),
        (
            "boundary".to_string(),
            keep(
                Some(("admin_level", vec![AttributeValue::Float(2.0)])),
                &["admin_level"],
                None,
            ),
        ),
        ("landcover".to_string(), keep(None, &["class"], None)),
        ("landuse".to_string(), keep(None, &["class"], None)),
        (
            "mountain_peak".to_string(),
            keep(None, &["name", "ele"], Some(("ele", 5))),
        ),
        ("park".to_string(), LayerRuleConfig::Drop),
        (
            "place".to_string(),
            keep(
                classes(&["city", "town", "village"]),
                &["class", "name", "name_en"],
                None,
            ),
        ),
        (
            "transportation".to_string(),
            keep(
                classes(&[
                    "motorway",
                    "trunk",
                    "primary",
                    "secondary",
                    "rail",
                    "aerialway",
                ]),
                &["class"],
                None,
            ),
        ),
        ("transportation_name".to_string(), LayerRuleConfig::Drop),
        (
            "water".to_string(),
            keep(classes(&["river", "lake", "ocean"]), &["class"], None),
        ),
        ("water_name".to_string(), LayerRuleConfig::Drop),
        (
            "waterway".to_string(),
            keep(classes(&["stream", "river", "canal"]), &["class"], None),
        ),
    ]);
    PolicyFile { layers }
}

/// Applies `policy` to every layer of `tile`. A layer the policy does not
/// know aborts the tile before anything is changed. Kept layers that end up
/// without features are removed.
pub fn apply_policy(tile: &mut Tile, policy: &LayerPolicy) -> Result<PolicyOutcome, TileError> {
    if let Some(layer) = tile
        .layers
        .iter()
        .find(|layer| policy.rule(&layer.name).is_none())
    {
        return Err(TileError::UnknownLayer {
            layer: layer.name.clone(),
        });
    }

    let mut outcome = PolicyOutcome::default();
    for layer in remove_layers(tile, &policy.dropped) {
        outcome.removed_features += layer.features.len() as u64;
        outcome.removed_layers.push(layer.name);
    }

    for layer in tile.layers.iter_mut() {
        let Some(LayerRule::Keep {
            filter,
            tags,
            top_n,
        }) = policy.rule(&layer.name)
        else {
            continue;
        };
        if let Some((key, allowed)) = filter {
            outcome.removed_features += restrict_features_by_attribute(layer, key, allowed) as u64;
        }
        if let Some((attribute, count)) = top_n {
            outcome.removed_features += select_top_n(layer, attribute, *count) as u64;
        }
        if let Some(allowed) = tags {
            restrict_tags(layer, allowed);
        }
        compact_keys_and_values(layer);
    }

    let emptied: HashSet<String> = tile
        .layers
        .iter()
        .filter(|layer| layer.features.is_empty())
        .map(|layer| layer.name.clone())
        .collect();
    for layer in remove_layers(tile, &emptied) {
        outcome.removed_layers.push(layer.name);
    }
    Ok(outcome)
}

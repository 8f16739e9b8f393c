//! Resolved timeline input.
//!
//! The resolver that turns timeline objects into a flat per-instant state
//! lives outside this crate. What arrives here is one `Snapshot` per instant
//! plus the layer-to-device `Mappings` that were active for it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Time;

/// Flat, resolved state of the timeline at one instant.
///
/// Layers are kept in a `BTreeMap` so iteration is in lexical layer order,
/// which adapters rely on for their last-write-wins tie-break.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub time: Time,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerObject>,
}

impl Snapshot {
    pub fn new(time: Time) -> Self {
        Self {
            time,
            layers: BTreeMap::new(),
        }
    }

    /// Builder-style layer insertion.
    pub fn with_layer(mut self, layer: impl Into<String>, object: LayerObject) -> Self {
        self.layers.insert(layer.into(), object);
        self
    }
}

/// The timeline object occupying a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerObject {
    pub object_id: String,
    /// Device-specific content, decoded by the adapter the layer maps to.
    pub content: serde_json::Value,
    /// Object was inserted ahead of time so the device can pre-load it.
    #[serde(default)]
    pub is_lookahead: bool,
    /// For lookahead objects: the layer they pre-load for.
    #[serde(default)]
    pub lookahead_for_layer: Option<String>,
}

impl LayerObject {
    pub fn new(object_id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            object_id: object_id.into(),
            content,
            is_lookahead: false,
            lookahead_for_layer: None,
        }
    }

    pub fn lookahead_for(mut self, layer: impl Into<String>) -> Self {
        self.is_lookahead = true;
        self.lookahead_for_layer = Some(layer.into());
        self
    }
}

/// Binding of a layer to a device and its device-specific addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub device_id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl Mapping {
    pub fn new(device_id: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            device_id: device_id.into(),
            options,
        }
    }
}

/// Layer id -> mapping.
pub type Mappings = BTreeMap<String, Mapping>;

/// Iterate the layers of `snapshot` that map to `device_id`, in lexical layer
/// order, yielding `(layer, object, mapping)`.
///
/// Lookahead objects on layers without their own mapping resolve through the
/// mapping of the layer they look ahead for.
pub fn layers_for_device<'a>(
    device_id: &'a str,
    snapshot: &'a Snapshot,
    mappings: &'a Mappings,
) -> impl Iterator<Item = (&'a str, &'a LayerObject, &'a Mapping)> + 'a {
    snapshot.layers.iter().filter_map(move |(layer, object)| {
        let mapping = mappings.get(layer).or_else(|| {
            object
                .lookahead_for_layer
                .as_ref()
                .filter(|_| object.is_lookahead)
                .and_then(|target| mappings.get(target))
        })?;
        (mapping.device_id == device_id).then_some((layer.as_str(), object, mapping))
    })
}

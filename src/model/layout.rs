use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use super::{ConfigError, LayerConfig, Translation, from_json, is_valid_id};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutConfigJson {
    id: String,
    title: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    #[serde(default)]
    layers: Vec<Value>,
    #[serde(default)]
    start_zoom: f64,
    #[serde(default)]
    start_lat: f64,
    #[serde(default)]
    start_lon: f64,
    #[serde(default)]
    social_image: Option<String>,
    #[serde(default)]
    hide_from_overview: bool,
    #[serde(default)]
    enable_node_database: bool,
}

/// A theme: ordered layers plus metadata. Earlier layers claim features first.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConfig {
    pub id: String,
    pub title: Translation,
    pub description: Option<Translation>,
    pub layers: Vec<LayerConfig>,
    pub start_zoom: f64,
    pub start_lat: f64,
    pub start_lon: f64,
    pub social_image: Option<String>,
    pub hide_from_overview: bool,
    pub enable_node_database: bool,
}

impl LayoutConfig {
    pub fn from_json(value: &Value, context: &str) -> Result<Self, ConfigError> {
        let raw: LayoutConfigJson = from_json(value, context)?;
        let context = format!("{context}:{}", raw.id);
        if !is_valid_id(&raw.id) {
            return Err(ConfigError::invalid(&context, format!("invalid theme id '{}'", raw.id)));
        }
        let title = match &raw.title {
            Some(title) => Translation::from_json(title, &format!("{context}.title"))?,
            None => return Err(ConfigError::invalid(&context, "the theme has no title")),
        };
        if raw.layers.is_empty() {
            return Err(ConfigError::invalid(&context, "the theme has no layers"));
        }

        let mut layers = Vec::with_capacity(raw.layers.len());
        let mut ids = HashSet::new();
        for (i, layer) in raw.layers.iter().enumerate() {
            let layer_context = format!("{context}.layers[{i}]");
            if !layer.is_object() {
                return Err(ConfigError::invalid(
                    &layer_context,
                    format!("layer {layer} has not been substituted"),
                ));
            }
            let layer = LayerConfig::from_json(layer, &layer_context)?;
            if !ids.insert(layer.id.clone()) {
                return Err(ConfigError::invalid(
                    &layer_context,
                    format!("duplicate layer id '{}'", layer.id),
                ));
            }
            layers.push(layer);
        }

        Ok(LayoutConfig {
            description: raw
                .description
                .as_ref()
                .map(|d| Translation::from_json(d, &format!("{context}.description")))
                .transpose()?,
            id: raw.id,
            title,
            layers,
            start_zoom: raw.start_zoom,
            start_lat: raw.start_lat,
            start_lon: raw.start_lon,
            social_image: raw.social_image,
            hide_from_overview: raw.hide_from_overview,
            enable_node_database: raw.enable_node_database,
        })
    }

    pub fn layer(&self, id: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|l| l.id == id)
    }
}

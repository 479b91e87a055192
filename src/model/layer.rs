use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use super::{ConfigError, TagRenderingConfig, Translation, from_json, is_valid_id, parse_filter};
use crate::tags::{Optimized, TagsFilter, parse_tag_string};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerConfigJson {
    id: String,
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
    source: Option<SourceJson>,
    #[serde(default)]
    minzoom: Option<f64>,
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    tag_renderings: Vec<Value>,
    #[serde(default)]
    presets: Vec<PresetJson>,
    #[serde(default)]
    filter: Vec<Value>,
    #[serde(default)]
    calculated_tags: Vec<String>,
    #[serde(default)]
    force_load: bool,
    #[serde(default)]
    pass_all_features: bool,
    #[serde(default)]
    map_rendering: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceJson {
    /// `"special"`, `"special:library"`: features are supplied by the runtime.
    Special(String),
    Tags {
        #[serde(rename = "osmTags")]
        osm_tags: Value,
        #[serde(default, rename = "geoJson")]
        geojson: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresetJson {
    title: Value,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    precise_input: Option<PreciseInputJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreciseInputJson {
    #[serde(default)]
    snap_to_layer: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FilterJson {
    id: String,
    #[serde(default)]
    options: Vec<FilterOptionJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterOptionJson {
    question: Value,
    #[serde(default)]
    osm_tags: Option<Value>,
}

/// Where the features of a layer come from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub osm_tags: TagsFilter,
    pub geojson: Option<String>,
}

impl SourceConfig {
    /// Rejects filters that would load (almost) everything or nothing.
    pub fn new(osm_tags: TagsFilter, geojson: Option<String>, context: &str) -> Result<Self, ConfigError> {
        match osm_tags.optimize() {
            Optimized::True => {
                return Err(ConfigError::invalid(
                    context,
                    format!("the source filter '{osm_tags}' matches every feature"),
                ));
            }
            Optimized::False => {
                return Err(ConfigError::invalid(
                    context,
                    format!("the source filter '{osm_tags}' can never match"),
                ));
            }
            Optimized::Filter(_) => {}
        }
        if osm_tags.is_negative() {
            return Err(ConfigError::invalid(
                context,
                format!(
                    "the source filter '{osm_tags}' is negative: it matches features without any tags and would load nearly everything"
                ),
            ));
        }
        Ok(SourceConfig { osm_tags, geojson })
    }

    pub fn is_osm(&self) -> bool {
        self.geojson.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresetConfig {
    pub title: Translation,
    pub tags: Vec<TagsFilter>,
    pub snap_to_layers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOption {
    pub question: Translation,
    pub osm_tags: Option<TagsFilter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub id: String,
    pub options: Vec<FilterOption>,
}

/// One fully expanded map layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub id: String,
    pub name: Option<Translation>,
    pub description: Option<Translation>,
    /// `None` for layers fed by the runtime itself (`"source": "special"`).
    pub source: Option<SourceConfig>,
    pub min_zoom: f64,
    pub title: Option<TagRenderingConfig>,
    pub tag_renderings: Vec<TagRenderingConfig>,
    pub presets: Vec<PresetConfig>,
    pub filters: Vec<FilterConfig>,
    /// `(key, expression)` pairs from `calculatedTags`.
    pub calculated_tags: Vec<(String, String)>,
    pub force_load: bool,
    pub pass_all_features: bool,
    pub map_rendering: Vec<Value>,
}

/// `"a"`, `"a;b"` or `["a", "b"]` as a list of layer ids.
pub(crate) fn layer_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split([';', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items.iter().flat_map(layer_list).collect(),
        _ => Vec::new(),
    }
}

impl LayerConfig {
    pub fn from_json(value: &Value, context: &str) -> Result<Self, ConfigError> {
        let raw: LayerConfigJson = from_json(value, context)?;
        let context = format!("{context}.{}", raw.id);
        if !is_valid_id(&raw.id) {
            return Err(ConfigError::invalid(
                &context,
                format!("invalid layer id '{}': only lowercase letters, digits, '_' and '-' are allowed", raw.id),
            ));
        }

        let source = match raw.source {
            None => {
                return Err(ConfigError::invalid(&context, "the layer has no source"));
            }
            Some(SourceJson::Special(kind)) if kind == "special" || kind.starts_with("special:") => None,
            Some(SourceJson::Special(other)) => {
                return Err(ConfigError::invalid(
                    &format!("{context}.source"),
                    format!("unknown source '{other}'; use an object with 'osmTags'"),
                ));
            }
            Some(SourceJson::Tags { osm_tags, geojson }) => {
                let source_context = format!("{context}.source.osmTags");
                let filter = parse_filter(&osm_tags, &source_context)?;
                Some(SourceConfig::new(filter, geojson, &source_context)?)
            }
        };

        let translation = |field: &Option<Value>, name: &str| {
            field
                .as_ref()
                .map(|v| Translation::from_json(v, &format!("{context}.{name}")))
                .transpose()
        };

        let title = raw
            .title
            .as_ref()
            .map(|t| match t {
                Value::Object(_) => TagRenderingConfig::from_json(t, &format!("{context}.title")),
                other => TagRenderingConfig::from_json(
                    &serde_json::json!({ "render": other }),
                    &format!("{context}.title"),
                ),
            })
            .transpose()?;

        let tag_renderings = raw
            .tag_renderings
            .iter()
            .enumerate()
            .map(|(i, tr)| TagRenderingConfig::from_json(tr, &format!("{context}.tagRenderings[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;
        let mut seen = HashSet::new();
        for (i, tr) in tag_renderings.iter().enumerate() {
            if !tr.id.is_empty() && !seen.insert(tr.id.as_str()) {
                return Err(ConfigError::invalid(
                    &format!("{context}.tagRenderings[{i}]"),
                    format!("duplicate tag rendering id '{}'", tr.id),
                ));
            }
        }

        let presets = raw
            .presets
            .iter()
            .enumerate()
            .map(|(i, preset)| -> Result<PresetConfig, ConfigError> {
                let preset_context = format!("{context}.presets[{i}]");
                let tags = preset
                    .tags
                    .iter()
                    .map(|t| {
                        parse_tag_string(t).map_err(|source| ConfigError::Tag {
                            context: format!("{preset_context}.tags"),
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PresetConfig {
                    title: Translation::from_json(&preset.title, &format!("{preset_context}.title"))?,
                    tags,
                    snap_to_layers: preset
                        .precise_input
                        .as_ref()
                        .and_then(|p| p.snap_to_layer.as_ref())
                        .map(layer_list)
                        .unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut filters = Vec::with_capacity(raw.filter.len());
        let mut filter_ids = HashSet::new();
        for (i, filter) in raw.filter.iter().enumerate() {
            let filter_context = format!("{context}.filter[{i}]");
            if !filter.is_object() {
                return Err(ConfigError::invalid(
                    &filter_context,
                    format!("filter {filter} has not been expanded into an object"),
                ));
            }
            let filter: FilterJson = from_json(filter, &filter_context)?;
            if !filter_ids.insert(filter.id.clone()) {
                return Err(ConfigError::invalid(
                    &filter_context,
                    format!("duplicate filter id '{}'", filter.id),
                ));
            }
            let options = filter
                .options
                .iter()
                .enumerate()
                .map(|(j, option)| -> Result<FilterOption, ConfigError> {
                    let option_context = format!("{filter_context}.options[{j}]");
                    Ok(FilterOption {
                        question: Translation::from_json(&option.question, &format!("{option_context}.question"))?,
                        osm_tags: option
                            .osm_tags
                            .as_ref()
                            .map(|t| parse_filter(t, &format!("{option_context}.osmTags")))
                            .transpose()?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            filters.push(FilterConfig {
                id: filter.id,
                options,
            });
        }

        let calculated_tags = raw
            .calculated_tags
            .iter()
            .enumerate()
            .map(|(i, line)| match line.split_once('=') {
                Some((key, expression)) => Ok((key.trim().to_string(), expression.trim().to_string())),
                None => Err(ConfigError::invalid(
                    &format!("{context}.calculatedTags[{i}]"),
                    format!("'{line}' is not of the form key=expression"),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let map_rendering = match raw.map_rendering {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ConfigError::invalid(
                    &format!("{context}.mapRendering"),
                    "mapRendering must be a list",
                ));
            }
        };

        Ok(LayerConfig {
            name: translation(&raw.name, "name")?,
            description: translation(&raw.description, "description")?,
            id: raw.id,
            source,
            min_zoom: raw.minzoom.unwrap_or(0.0),
            title,
            tag_renderings,
            presets,
            filters,
            calculated_tags,
            force_load: raw.force_load,
            pass_all_features: raw.pass_all_features,
            map_rendering,
        })
    }

    pub fn is_osm_layer(&self) -> bool {
        self.source.as_ref().is_some_and(SourceConfig::is_osm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn benches() -> Value {
        json!({
            "id": "benches",
            "name": {"en": "Benches"},
            "source": {"osmTags": "amenity=bench"},
            "minzoom": 17,
            "title": {"render": "Bench"},
            "tagRenderings": [
                {"id": "backrest", "question": "Backrest?", "mappings": [{"if": "backrest=yes", "then": "yes"}]}
            ],
            "presets": [{
                "title": "a bench",
                "tags": ["amenity=bench"],
                "preciseInput": {"snapToLayer": ["walls", "street"]}
            }],
            "filter": [{"id": "backrest", "options": [{"question": "With backrest", "osmTags": "backrest=yes"}]}],
            "calculatedTags": ["_closest=feat.closest('toilets')"]
        })
    }

    #[test]
    fn test_builds_full_layer() {
        let layer = LayerConfig::from_json(&benches(), "layers").unwrap();
        assert_eq!(layer.id, "benches");
        assert_eq!(layer.min_zoom, 17.0);
        assert!(layer.is_osm_layer());
        assert_eq!(layer.presets[0].snap_to_layers, vec!["walls", "street"]);
        assert_eq!(
            layer.calculated_tags,
            vec![("_closest".to_string(), "feat.closest('toilets')".to_string())]
        );
        assert_eq!(layer.filters[0].id, "backrest");
    }

    #[test]
    fn test_rejects_bad_ids_and_duplicates() {
        let mut layer = benches();
        layer["id"] = json!("Benches");
        assert!(LayerConfig::from_json(&layer, "layers").is_err());

        let mut layer = benches();
        layer["filter"] = json!([{"id": "a", "options": []}, {"id": "a", "options": []}]);
        let err = LayerConfig::from_json(&layer, "layers").unwrap_err();
        assert!(err.to_string().contains("duplicate filter id 'a'"));
    }

    #[test]
    fn test_rejects_negative_and_universal_sources() {
        let negative = TagsFilter::tag("amenity", "");
        assert!(SourceConfig::new(negative, None, "src").is_err());
        let universal = TagsFilter::And(vec![]);
        assert!(SourceConfig::new(universal, None, "src").is_err());
        let plain = parse_tag_string("a=b").unwrap();
        let contradiction = TagsFilter::And(vec![plain.clone(), parse_tag_string("a!=b").unwrap()]);
        assert!(SourceConfig::new(contradiction, None, "src").is_err());
        assert!(SourceConfig::new(plain, None, "src").is_ok());
    }

    #[test]
    fn test_special_source_has_no_filter() {
        let layer = LayerConfig::from_json(&json!({"id": "gps_location", "source": "special"}), "layers").unwrap();
        assert!(layer.source.is_none());
        assert!(!layer.is_osm_layer());
    }

    #[test]
    fn test_layer_list_splits() {
        assert_eq!(layer_list(&json!("a;b, c")), vec!["a", "b", "c"]);
        assert_eq!(layer_list(&json!(["a", "b"])), vec!["a", "b"]);
    }
}

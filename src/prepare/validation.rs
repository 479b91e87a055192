use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use super::{DesugaringContext, layer_id};
use crate::convert::{Conversion, Converted, Diagnostics};
use crate::model::{LayerConfig, LayoutConfig, TagRenderingConfig, is_valid_id};
use crate::special::{calls_in_texts, find_special, special_names};
use crate::tags::Properties;
use crate::utils::{closest_matches, suggestion_text};

/// Checks a fully expanded layer: it must build as a [`LayerConfig`] and its
/// renderings, presets and specials must make sense together.
pub struct ValidateLayer;

fn check_rendering(rendering: &TagRenderingConfig, context: &str, diagnostics: &mut Diagnostics) {
    for (i, mapping) in rendering.mappings.iter().enumerate() {
        let mapping_context = format!("{context}.mappings[{i}]");
        if rendering.is_question() && !mapping.is_hidden() && !mapping.if_tags.is_usable_as_answer() {
            diagnostics.error(
                &mapping_context,
                format!(
                    "'{}' is offered as an answer but can not be written to a feature; use plain key=value tags or set hideInAnswer",
                    mapping.if_tags
                ),
            );
        }
        if !rendering.multi_answer {
            let shadowing = rendering.mappings[..i]
                .iter()
                .position(|earlier| mapping.if_tags.shadows(&earlier.if_tags));
            if let Some(earlier) = shadowing {
                diagnostics.warn(
                    &mapping_context,
                    format!(
                        "this mapping is never shown: mapping {earlier} ('{}') matches whenever '{}' does",
                        rendering.mappings[earlier].if_tags, mapping.if_tags
                    ),
                );
            }
        }
        if let Some(freeform) = &rendering.freeform {
            let erases = mapping
                .if_tags
                .as_change(&Properties::new())
                .is_ok_and(|changes| changes.iter().any(|(k, v)| *k == freeform.key && v.is_empty()));
            if erases && !mapping.is_hidden() {
                diagnostics.warn(
                    &mapping_context,
                    format!("choosing this mapping erases the value of the freeform key '{}'", freeform.key),
                );
            }
        }
    }
}

fn check_specials<'a>(
    texts: impl IntoIterator<Item = &'a str>,
    context: &str,
    diagnostics: &mut Diagnostics,
) {
    for call in calls_in_texts(texts) {
        if find_special(&call.name).is_none() {
            let suggestions = closest_matches(&call.name, &special_names(), 3);
            diagnostics.error(
                context,
                format!("unknown special visualisation '{}'.{}", call.name, suggestion_text(&suggestions)),
            );
        }
    }
}

fn check_presets(layer: &LayerConfig, context: &str, diagnostics: &mut Diagnostics) {
    let Some(source) = layer.source.as_ref().filter(|s| s.is_osm()) else {
        return;
    };
    for (i, preset) in layer.presets.iter().enumerate() {
        let mut properties = Properties::new();
        for tag in &preset.tags {
            if let Ok(changes) = tag.as_change(&properties) {
                properties.extend(changes);
            }
        }
        if !source.osm_tags.matches_properties(&properties) {
            diagnostics.warn(
                &format!("{context}.presets[{i}]"),
                format!(
                    "a feature created by preset '{}' does not match the source filter '{}'; it would vanish after creation",
                    preset.title.text().unwrap_or(""),
                    source.osm_tags
                ),
            );
        }
    }
}

impl Conversion<Value> for ValidateLayer {
    fn name(&self) -> &str {
        "ValidateLayer"
    }

    fn doc(&self) -> &str {
        "Checks that a layer is complete and consistent"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let mut diagnostics = Diagnostics::default();
        let layer = match LayerConfig::from_json(input, context) {
            Ok(layer) => layer,
            Err(e) => {
                diagnostics.errors.push(e.to_string());
                return Converted::from_parts(None, diagnostics);
            }
        };

        if let Some(title) = &layer.title {
            check_specials(title.shown_texts(), &format!("{context}.title"), &mut diagnostics);
        }
        for (i, rendering) in layer.tag_renderings.iter().enumerate() {
            let rendering_context = format!("{context}.tagRenderings[{i}]");
            check_rendering(rendering, &rendering_context, &mut diagnostics);
            check_specials(rendering.shown_texts(), &rendering_context, &mut diagnostics);
        }
        check_presets(&layer, context, &mut diagnostics);
        diagnostics.finish(input.clone())
    }
}

/// Checks a fully expanded theme. Layers identical to their builtin version
/// were validated when the builtin was compiled and are skipped.
pub struct ValidateTheme {
    ctx: Arc<DesugaringContext>,
}

impl ValidateTheme {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        ValidateTheme { ctx }
    }
}

impl Conversion<Value> for ValidateTheme {
    fn name(&self) -> &str {
        "ValidateTheme"
    }

    fn doc(&self) -> &str {
        "Checks that a theme is complete and consistent"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let mut diagnostics = Diagnostics::default();
        match input.get("id").and_then(Value::as_str) {
            Some(id) if is_valid_id(id) => {}
            Some(id) => diagnostics.error(
                context,
                format!("invalid theme id '{id}': only lowercase letters, digits, '_' and '-' are allowed"),
            ),
            None => diagnostics.error(context, "the theme has no id"),
        }
        if input.get("title").is_none() {
            diagnostics.error(context, "the theme has no title");
        }
        let layers = match input.get("layers") {
            Some(Value::Array(layers)) if !layers.is_empty() => layers.as_slice(),
            _ => {
                diagnostics.error(context, "the theme has no layers");
                return Converted::from_parts(None, diagnostics);
            }
        };

        let mut seen = HashSet::new();
        for (i, layer) in layers.iter().enumerate() {
            let layer_context = format!("{context}.layers[{i}]");
            let Some(id) = layer_id(layer) else {
                diagnostics.error(&layer_context, format!("layer {layer} has not been substituted"));
                continue;
            };
            if !seen.insert(id) {
                diagnostics.error(&layer_context, format!("duplicate layer id '{id}'"));
                continue;
            }
            if self.ctx.shared_layers.get(id) == Some(layer) {
                continue;
            }
            diagnostics.absorb(ValidateLayer.convert(layer, &layer_context));
        }

        if !diagnostics.has_errors() {
            if let Err(e) = LayoutConfig::from_json(input, "themes") {
                diagnostics.errors.push(e.to_string());
            }
        }
        diagnostics.finish(input.clone())
    }
}

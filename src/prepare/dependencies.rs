use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{DesugaringContext, layer_id};
use crate::convert::{Conversion, Converted, Diagnostics};
use crate::model::{LayerConfig, layer_list};
use crate::special::{calls_in_texts, find_special};

/// `needed_by` cannot work without `needed_layer` being loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDependency {
    pub needed_layer: String,
    pub needed_by: String,
    pub reason: String,
    pub context: String,
}

static LAYER_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.(overlapWith|closestn|closest|intersectionsWith)\(\s*["']([a-zA-Z0-9_-]+)["']"#)
        .expect("layer function pattern is valid")
});

/// Every layer referenced by `layer` through presets, special visualisations
/// or calculated tags. References to the layer itself are skipped.
pub fn layer_dependencies(layer: &LayerConfig) -> Vec<LayerDependency> {
    let mut found: Vec<LayerDependency> = Vec::new();
    let mut add = |needed: &str, reason: String, context: String| {
        if needed == layer.id {
            return;
        }
        let dependency = LayerDependency {
            needed_layer: needed.to_string(),
            needed_by: layer.id.clone(),
            reason,
            context,
        };
        if !found.contains(&dependency) {
            found.push(dependency);
        }
    };

    for (i, preset) in layer.presets.iter().enumerate() {
        for target in &preset.snap_to_layers {
            add(
                target,
                "a preset snaps to this layer".to_string(),
                format!("{}.presets[{i}].preciseInput.snapToLayer", layer.id),
            );
        }
    }

    let renderings = layer
        .title
        .iter()
        .map(|t| ("title".to_string(), t))
        .chain(
            layer
                .tag_renderings
                .iter()
                .enumerate()
                .map(|(i, t)| (format!("tagRenderings[{i}]"), t)),
        );
    for (path, rendering) in renderings {
        for call in calls_in_texts(rendering.shown_texts()) {
            let Some(special) = find_special(&call.name) else {
                continue;
            };
            for (arg, value) in special.args.iter().zip(special.resolve_args(&call.args)) {
                let (name, Some(value)) = value else {
                    continue;
                };
                if !arg.is_layer {
                    continue;
                }
                for target in layer_list(&Value::String(value)) {
                    add(
                        &target,
                        format!("{} uses this layer as '{name}'", call.name),
                        format!("{}.{path}", layer.id),
                    );
                }
            }
        }
    }

    for (i, (key, expression)) in layer.calculated_tags.iter().enumerate() {
        for caps in LAYER_FUNCTION.captures_iter(expression) {
            add(
                &caps[2],
                format!("the calculated tag '{key}' calls {} on this layer", &caps[1]),
                format!("{}.calculatedTags[{i}]", layer.id),
            );
        }
    }

    found
}

/// Injects the layers other layers depend on. Every injected layer is a
/// copy of the builtin, marked `forceLoad` and `passAllFeatures`, placed before
/// the layers already in the theme. Repeats until nothing is missing.
pub struct AddDependencyLayersToTheme {
    ctx: Arc<DesugaringContext>,
}

impl AddDependencyLayersToTheme {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        AddDependencyLayersToTheme { ctx }
    }

    fn missing_dependencies(
        &self,
        layers: &[Value],
        context: &str,
        diagnostics: &mut Diagnostics,
    ) -> Vec<LayerDependency> {
        let present: HashSet<&str> = layers.iter().filter_map(layer_id).collect();
        let mut missing: Vec<LayerDependency> = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            let config = match LayerConfig::from_json(layer, &format!("{context}.layers[{i}]")) {
                Ok(config) => config,
                Err(e) => {
                    diagnostics.error(context, format!("cannot compute dependencies: {e}"));
                    continue;
                }
            };
            for dependency in layer_dependencies(&config) {
                let already_listed = missing.iter().any(|m| m.needed_layer == dependency.needed_layer);
                if !present.contains(dependency.needed_layer.as_str()) && !already_listed {
                    missing.push(dependency);
                }
            }
        }
        missing
    }
}

impl Conversion<Value> for AddDependencyLayersToTheme {
    fn name(&self) -> &str {
        "AddDependencyLayersToTheme"
    }

    fn doc(&self) -> &str {
        "Adds the layers which other layers need, e.g. to snap onto"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["layers".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(Value::Array(layers)) = input.get("layers") else {
            return Converted::failure(context, "the theme has no list of layers");
        };
        let theme_id = input.get("id").and_then(Value::as_str).unwrap_or("<unnamed>");
        let mut diagnostics = Diagnostics::default();
        let mut layers = layers.clone();

        // Every round adds at least one builtin layer that was not there yet
        for _ in 0..=self.ctx.shared_layers.len() {
            let missing = self.missing_dependencies(&layers, context, &mut diagnostics);
            if diagnostics.has_errors() || missing.is_empty() {
                break;
            }
            let mut added = Vec::with_capacity(missing.len());
            for dependency in missing {
                let Some(builtin) = self.ctx.shared_layers.get(&dependency.needed_layer) else {
                    diagnostics.error(
                        &dependency.context,
                        format!(
                            "layer '{}' is needed by '{}' ({}), but it was not found, neither as layer of {theme_id} nor as builtin layer",
                            dependency.needed_layer, dependency.needed_by, dependency.reason
                        ),
                    );
                    continue;
                };
                let mut layer = builtin.clone();
                if let Some(object) = layer.as_object_mut() {
                    object.insert("forceLoad".to_string(), json!(true));
                    object.insert("passAllFeatures".to_string(), json!(true));
                    object.insert("description".to_string(), json!(dependency.reason));
                }
                debug!(
                    theme = theme_id,
                    layer = %dependency.needed_layer,
                    needed_by = %dependency.needed_by,
                    "adding dependency layer"
                );
                diagnostics.info(
                    context,
                    format!(
                        "added '{}' as dependency of '{}': {}",
                        dependency.needed_layer, dependency.needed_by, dependency.reason
                    ),
                );
                added.push(layer);
            }
            if diagnostics.has_errors() {
                break;
            }
            added.extend(layers);
            layers = added;
        }

        let mut output = input.clone();
        if let Some(object) = output.as_object_mut() {
            object.insert("layers".to_string(), Value::Array(layers));
        }
        diagnostics.finish(output)
    }
}

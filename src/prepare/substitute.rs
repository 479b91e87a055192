use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{DesugaringContext, merge};
use crate::convert::{Conversion, Converted, Diagnostics};
use crate::utils::{closest_matches, suggestion_text};

/// Replaces a layer reference in a theme by the layer itself:
/// - `"id"`: the builtin layer,
/// - `{builtin: id | [ids], override, hideTagRenderingsWithLabels}`: copies of
///   the builtin layers with the override merged on top and the labelled
///   renderings removed,
/// - any other object is an inline layer and stays as it is.
pub struct SubstituteLayer {
    ctx: Arc<DesugaringContext>,
}

impl SubstituteLayer {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        SubstituteLayer { ctx }
    }

    fn builtin(&self, name: &str, context: &str, diagnostics: &mut Diagnostics) -> Option<Value> {
        if let Some(layer) = self.ctx.shared_layers.get(name) {
            return Some(layer.clone());
        }
        let suggestions = closest_matches(name, self.ctx.layer_ids(), 3);
        diagnostics.error(
            context,
            format!("layer '{name}' not found as a builtin layer.{}", suggestion_text(&suggestions)),
        );
        None
    }
}

/// Whether a tag rendering carries `label` as a label, its id or its group.
fn rendering_has_label(rendering: &Value, label: &str) -> bool {
    match rendering {
        Value::String(id) => id == label,
        Value::Object(map) => {
            map.get("id").and_then(Value::as_str) == Some(label)
                || map.get("group").and_then(Value::as_str) == Some(label)
                || map
                    .get("labels")
                    .and_then(Value::as_array)
                    .is_some_and(|labels| labels.iter().any(|l| l.as_str() == Some(label)))
        }
        _ => false,
    }
}

/// Drop every rendering matching one of `labels`; returns the labels that
/// matched something.
fn hide_renderings(layer: &mut Value, labels: &[String]) -> BTreeSet<String> {
    let mut used = BTreeSet::new();
    if let Some(Value::Array(renderings)) = layer.get_mut("tagRenderings") {
        renderings.retain(|rendering| {
            let matching: Vec<&String> = labels
                .iter()
                .filter(|label| rendering_has_label(rendering, label))
                .collect();
            used.extend(matching.iter().map(|l| l.to_string()));
            matching.is_empty()
        });
    }
    used
}

fn names_of(builtin: &Value) -> Option<Vec<String>> {
    match builtin {
        Value::String(name) => Some(vec![name.clone()]),
        Value::Array(items) => items.iter().map(|i| i.as_str().map(str::to_string)).collect(),
        _ => None,
    }
}

impl Conversion<Value, Vec<Value>> for SubstituteLayer {
    fn name(&self) -> &str {
        "SubstituteLayer"
    }

    fn doc(&self) -> &str {
        "Replaces references to builtin layers by their definition, applying overrides"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Vec<Value>> {
        let mut diagnostics = Diagnostics::default();
        match input {
            Value::String(name) => {
                let layers = self.builtin(name, context, &mut diagnostics).into_iter().collect();
                diagnostics.finish(layers)
            }
            Value::Object(entry) if entry.contains_key("builtin") => {
                let Some(names) = names_of(&entry["builtin"]) else {
                    return Converted::failure(context, "'builtin' must be a layer id or a list of layer ids");
                };
                let override_ = entry.get("override");
                if let Some(Value::Object(override_)) = override_ {
                    if override_.contains_key("tagRenderings") {
                        diagnostics.error(
                            context,
                            "the override of a builtin layer must not contain 'tagRenderings': it would replace every builtin rendering. Use '+tagRenderings' to prepend or 'tagRenderings+' to append renderings instead",
                        );
                        return Converted::from_parts(None, diagnostics);
                    }
                } else if override_.is_some() {
                    return Converted::failure(context, "'override' must be an object");
                }
                let hidden: Vec<String> = match entry.get("hideTagRenderingsWithLabels") {
                    None => Vec::new(),
                    Some(labels) => match names_of(labels) {
                        Some(labels) => labels,
                        None => {
                            return Converted::failure(
                                context,
                                "'hideTagRenderingsWithLabels' must be a list of labels",
                            );
                        }
                    },
                };

                let mut layers = Vec::with_capacity(names.len());
                for name in &names {
                    let Some(builtin) = self.builtin(name, context, &mut diagnostics) else {
                        continue;
                    };
                    let mut layer = match override_ {
                        Some(override_) => match merge(override_, &builtin) {
                            Ok(merged) => merged,
                            Err(message) => {
                                diagnostics.error(context, format!("cannot apply the override: {message}"));
                                continue;
                            }
                        },
                        None => builtin,
                    };
                    if !hidden.is_empty() {
                        let before = layer.get("tagRenderings").and_then(Value::as_array).map_or(0, Vec::len);
                        let used = hide_renderings(&mut layer, &hidden);
                        let after = layer.get("tagRenderings").and_then(Value::as_array).map_or(0, Vec::len);
                        diagnostics.info(
                            context,
                            format!("hid {} tag renderings of layer '{name}'", before - after),
                        );
                        for label in hidden.iter().filter(|l| !used.contains(*l)) {
                            diagnostics.error(
                                context,
                                format!(
                                    "hideTagRenderingsWithLabels: the label '{label}' did not remove any tag rendering from layer '{name}'"
                                ),
                            );
                        }
                    }
                    layers.push(layer);
                }
                diagnostics.finish(layers)
            }
            Value::Object(_) => Converted::success(vec![input.clone()]),
            other => Converted::failure(context, format!("invalid layer entry {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::fixtures;
    use serde_json::json;

    #[test]
    fn test_substitutes_builtin_unchanged() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step.convert(&json!("benches"), "themes:t.layers[0]");
        assert!(out.errors.is_empty());
        assert_eq!(out.result, Some(vec![fixtures::benches()]));
    }

    #[test]
    fn test_typo_suggests_closest_layer() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step.convert(&json!("bnches"), "themes:t.layers[0]");
        assert!(out.result.is_none());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("not found as a builtin layer"));
        assert!(out.errors[0].contains("benches"));
    }

    #[test]
    fn test_override_replacing_tag_renderings_is_rejected() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step.convert(
            &json!({"builtin": "benches", "override": {"tagRenderings": ["images"]}}),
            "themes:t.layers[0]",
        );
        assert!(out.result.is_none());
        assert!(out.errors[0].contains("+tagRenderings"));
    }

    #[test]
    fn test_override_merges_and_keeps_renderings() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step
            .convert(&json!({"builtin": "benches", "override": {"minzoom": 10}}), "c")
            .result
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["minzoom"], json!(10));
        assert_eq!(out[0]["tagRenderings"], fixtures::benches()["tagRenderings"]);
    }

    #[test]
    fn test_several_builtins_and_additive_override() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step
            .convert(
                &json!({"builtin": ["benches", "defibrillator"], "override": {"tagRenderings+": ["images"]}}),
                "c",
            )
            .result
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["tagRenderings"].as_array().unwrap().len(), 3);
        assert_eq!(out[1]["tagRenderings"], json!(["images"]));
    }

    #[test]
    fn test_hides_by_label_id_and_group() {
        let step = SubstituteLayer::new(fixtures::context());
        let by_label = step
            .convert(&json!({"builtin": "benches", "hideTagRenderingsWithLabels": ["comfort"]}), "c")
            .result
            .unwrap();
        assert_eq!(by_label[0]["tagRenderings"].as_array().unwrap().len(), 1);
        assert_eq!(by_label[0]["tagRenderings"][0]["id"], json!("bench-material"));

        let by_group = step
            .convert(&json!({"builtin": "benches", "hideTagRenderingsWithLabels": ["details"]}), "c")
            .result
            .unwrap();
        assert_eq!(by_group[0]["tagRenderings"][0]["id"], json!("bench-backrest"));

        let by_id = step
            .convert(
                &json!({"builtin": "benches", "hideTagRenderingsWithLabels": ["bench-backrest", "bench-material"]}),
                "c",
            )
            .result
            .unwrap();
        assert_eq!(by_id[0]["tagRenderings"], json!([]));
    }

    #[test]
    fn test_dangling_hide_label_is_fatal() {
        let step = SubstituteLayer::new(fixtures::context());
        let out = step.convert(
            &json!({"builtin": "benches", "hideTagRenderingsWithLabels": ["comfort", "no-such-label"]}),
            "c",
        );
        assert!(out.result.is_none());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("'no-such-label' did not remove any tag rendering"));
    }

    #[test]
    fn test_inline_layer_passes() {
        let step = SubstituteLayer::new(fixtures::context());
        let inline = json!({"id": "mine", "source": {"osmTags": "a=b"}});
        assert_eq!(step.convert(&inline, "c").result, Some(vec![inline]));
    }
}

use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;

use super::{DesugaringContext, layer_id, merge};
use crate::convert::{Concat, Conversion, Converted, Diagnostics, Each, Fuse, On, SetDefault};
use crate::special::{calls_in_rendering, find_special, parse_template, render_call, special_names};
use crate::utils::{closest_matches, suggestion_text};

/// Nesting limit when a referenced rendering refers to further renderings.
const MAX_REFERENCE_DEPTH: usize = 8;

/// Renderings the compiler adds itself; `layer.*` leaves them out so they are
/// not duplicated.
const GENERATED_RENDERINGS: &[&str] = &["leftover-questions", "minimap"];

/// The per-layer expansion pipeline.
pub fn prepare_layer(ctx: Arc<DesugaringContext>) -> Fuse {
    Fuse::new(
        "PrepareLayer",
        "Expands shared tag renderings, rewrites legacy and shorthand syntax and adds generated renderings",
        vec![
            Box::new(On::new("tagRenderings", Box::new(Concat::new(Box::new(ExpandRewrite))))),
            Box::new(On::new(
                "tagRenderings",
                Box::new(Concat::new(Box::new(ExpandTagRendering::new(ctx.clone())))),
            )),
            Box::new(On::new("tagRenderings", Box::new(UniqueInlineIds))),
            Box::new(On::new("tagRenderings", Box::new(Each::new(Box::new(RewriteSpecial))))),
            Box::new(RewriteLegacyMapRendering),
            Box::new(SetDefault::new("titleIcons", json!(["defaults"]), true)),
            Box::new(On::new(
                "titleIcons",
                Box::new(Concat::new(Box::new(ExpandTitleIcon::new(ctx.clone())))),
            )),
            Box::new(AddMiniMap::new(ctx.clone())),
            Box::new(AddQuestionBox::new(ctx.clone())),
            Box::new(On::new("filter", Box::new(Concat::new(Box::new(ExpandFilter::new(ctx)))))),
        ],
    )
}

fn tag_renderings(layer: &Value) -> &[Value] {
    layer
        .get("tagRenderings")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn uses_special(layer: &Value, name: &str) -> bool {
    tag_renderings(layer)
        .iter()
        .any(|tr| calls_in_rendering(tr).iter().any(|call| call.name == name))
}

/// Turns `{rewrite: {sourceString, into}, renderings}` into one copy of the
/// renderings per row of `into`.
pub struct ExpandRewrite;

fn replace_in(value: &Value, source: &str, replacement: &Value) -> Value {
    match value {
        Value::String(s) if s == source => replacement.clone(),
        Value::String(s) => match replacement.as_str() {
            Some(r) => Value::String(s.replace(source, r)),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|i| replace_in(i, source, replacement)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, child)| {
                    let key = match replacement.as_str() {
                        Some(r) => key.replace(source, r),
                        None => key.clone(),
                    };
                    (key, replace_in(child, source, replacement))
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items.iter().map(|i| i.as_str().map(str::to_string)).collect(),
        _ => None,
    }
}

impl Conversion<Value, Vec<Value>> for ExpandRewrite {
    fn name(&self) -> &str {
        "ExpandRewrite"
    }

    fn doc(&self) -> &str {
        "Expands a rewrite block into one set of renderings per replacement row"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Vec<Value>> {
        let Some(rewrite) = input.get("rewrite") else {
            return Converted::success(vec![input.clone()]);
        };
        let Some(sources) = rewrite.get("sourceString").and_then(string_list) else {
            return Converted::failure(context, "rewrite.sourceString must be a string or a list of strings");
        };
        if let Some(empty) = sources.iter().position(String::is_empty) {
            return Converted::failure(context, format!("rewrite.sourceString[{empty}] is empty"));
        }
        for (i, a) in sources.iter().enumerate() {
            for (j, b) in sources.iter().enumerate() {
                if i != j && b.contains(a.as_str()) {
                    return Converted::failure(
                        context,
                        format!("rewrite.sourceString '{b}' contains '{a}'; the replacement would be ambiguous"),
                    );
                }
            }
        }
        let Some(rows) = rewrite.get("into").and_then(Value::as_array) else {
            return Converted::failure(context, "rewrite.into must be a list");
        };
        let Some(renderings) = input.get("renderings").and_then(Value::as_array) else {
            return Converted::failure(context, "a rewrite block needs a list of 'renderings'");
        };

        let mut diagnostics = Diagnostics::default();
        let mut output = Vec::with_capacity(rows.len() * renderings.len());
        for (r, row) in rows.iter().enumerate() {
            let row: Vec<Value> = match row {
                Value::Array(values) => values.clone(),
                single if sources.len() == 1 => vec![single.clone()],
                _ => {
                    diagnostics.error(&format!("{context}.rewrite.into[{r}]"), "expected a list of replacements");
                    continue;
                }
            };
            if row.len() != sources.len() {
                diagnostics.error(
                    &format!("{context}.rewrite.into[{r}]"),
                    format!("{} replacements given for {} source strings", row.len(), sources.len()),
                );
                continue;
            }
            for rendering in renderings {
                let rewritten = sources
                    .iter()
                    .zip(&row)
                    .fold(rendering.clone(), |acc, (source, replacement)| {
                        replace_in(&acc, source, replacement)
                    });
                output.push(rewritten);
            }
        }
        diagnostics.finish(output)
    }
}

/// Resolves tag rendering references:
/// - `"id"`: a shared tag rendering,
/// - `"layer.id"` / `"layer.*"`: renderings of a builtin layer,
/// - `{builtin, override}`: any of the above with an override merged on top,
/// - a render text with a special visualisation, e.g. `"{wikipedia()}"`.
pub struct ExpandTagRendering {
    ctx: Arc<DesugaringContext>,
}

impl ExpandTagRendering {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        ExpandTagRendering { ctx }
    }

    fn lookup(&self, name: &str, context: &str, diagnostics: &mut Diagnostics, depth: usize) -> Vec<Value> {
        if depth > MAX_REFERENCE_DEPTH {
            diagnostics.error(
                context,
                format!("tag rendering '{name}' is nested too deeply; is there a reference cycle?"),
            );
            return Vec::new();
        }
        if let Some(rendering) = self.ctx.tag_renderings.get(name) {
            return vec![rendering.clone()];
        }
        if !parse_template(name).is_empty() {
            return vec![json!({ "id": inline_id(name), "render": name })];
        }
        if let Some((layer, rendering_id)) = name.split_once('.') {
            return self.lookup_in_layer(layer, rendering_id, context, diagnostics, depth);
        }
        let suggestions = closest_matches(name, self.ctx.tag_renderings.keys(), 3);
        diagnostics.error(
            context,
            format!("tag rendering '{name}' not found.{}", suggestion_text(&suggestions)),
        );
        Vec::new()
    }

    fn lookup_in_layer(
        &self,
        layer: &str,
        rendering_id: &str,
        context: &str,
        diagnostics: &mut Diagnostics,
        depth: usize,
    ) -> Vec<Value> {
        let Some(layer_json) = self.ctx.shared_layers.get(layer) else {
            let suggestions = closest_matches(layer, self.ctx.layer_ids(), 3);
            diagnostics.error(
                context,
                format!(
                    "layer '{layer}' not found while resolving tag rendering '{layer}.{rendering_id}'.{}",
                    suggestion_text(&suggestions)
                ),
            );
            return Vec::new();
        };
        let wanted = |id: &str| {
            if rendering_id == "*" {
                !GENERATED_RENDERINGS.contains(&id)
            } else {
                id == rendering_id
            }
        };
        let renderings = tag_renderings(layer_json);
        let mut found = Vec::new();
        for rendering in renderings {
            match rendering {
                Value::String(reference) if rendering_id == "*" || reference == rendering_id => {
                    found.extend(self.expand(rendering, context, diagnostics, depth + 1));
                }
                Value::Object(map) if map.contains_key("builtin") || map.contains_key("rewrite") => {
                    // The ids are only known once the block is expanded
                    let expanded = self.expand(rendering, context, diagnostics, depth + 1);
                    found.extend(
                        expanded
                            .into_iter()
                            .filter(|r| wanted(r.get("id").and_then(Value::as_str).unwrap_or(""))),
                    );
                }
                Value::Object(_) if wanted(rendering.get("id").and_then(Value::as_str).unwrap_or("")) => {
                    found.push(rendering.clone());
                }
                _ => {}
            }
        }
        if found.is_empty() && rendering_id != "*" {
            let ids: Vec<String> = renderings
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_str).or_else(|| r.as_str()))
                .map(str::to_string)
                .collect();
            let suggestions = closest_matches(rendering_id, &ids, 3);
            diagnostics.error(
                context,
                format!(
                    "tag rendering '{rendering_id}' not found in layer '{layer}'.{}",
                    suggestion_text(&suggestions)
                ),
            );
        }
        found
    }

    /// One entry of a `tagRenderings` list, fully resolved.
    fn expand(&self, input: &Value, context: &str, diagnostics: &mut Diagnostics, depth: usize) -> Vec<Value> {
        match input {
            Value::String(name) => self.lookup(name, context, diagnostics, depth),
            Value::Object(map) if map.contains_key("rewrite") => {
                let Some(rewritten) = diagnostics.absorb(ExpandRewrite.convert(input, context)) else {
                    return Vec::new();
                };
                rewritten
                    .iter()
                    .flat_map(|r| self.expand(r, context, diagnostics, depth + 1))
                    .collect()
            }
            Value::Object(map) if map.contains_key("builtin") => {
                let Some(names) = string_list(&map["builtin"]) else {
                    diagnostics.error(context, "'builtin' must be a tag rendering id or a list of ids");
                    return Vec::new();
                };
                let override_ = map.get("override").cloned().unwrap_or_else(|| json!({}));
                let mut output = Vec::new();
                for name in names {
                    for rendering in self.lookup(&name, context, diagnostics, depth) {
                        match merge(&override_, &rendering) {
                            Ok(merged) => output.push(merged),
                            Err(message) => diagnostics.error(context, message),
                        }
                    }
                }
                output
            }
            Value::Object(_) => vec![input.clone()],
            other => {
                diagnostics.error(context, format!("invalid tag rendering {other}"));
                Vec::new()
            }
        }
    }
}

impl Conversion<Value, Vec<Value>> for ExpandTagRendering {
    fn name(&self) -> &str {
        "ExpandTagRendering"
    }

    fn doc(&self) -> &str {
        "Replaces references to shared tag renderings by their definition"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Vec<Value>> {
        let mut diagnostics = Diagnostics::default();
        let output = self.expand(input, context, &mut diagnostics, 0);
        diagnostics.finish(output)
    }
}

/// The id given to a rendering written as a bare special, e.g. `"{wikipedia()}"`.
fn inline_id(template: &str) -> String {
    template.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect()
}

/// Renderings written as the same bare special get the same generated id;
/// every repeat gets a numeric suffix. Ids written by the author are kept.
pub struct UniqueInlineIds;

fn is_generated_inline(rendering: &Value) -> bool {
    let Some(map) = rendering.as_object() else {
        return false;
    };
    match (map.get("id").and_then(Value::as_str), map.get("render").and_then(Value::as_str)) {
        (Some(id), Some(render)) => map.len() == 2 && id == inline_id(render),
        _ => false,
    }
}

impl Conversion<Value> for UniqueInlineIds {
    fn name(&self) -> &str {
        "UniqueInlineIds"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Value::Array(renderings) = input else {
            return Converted::failure(context, "expected a list");
        };
        let mut used: HashSet<String> = renderings
            .iter()
            .filter(|r| !is_generated_inline(r))
            .filter_map(|r| r.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let mut output = Vec::with_capacity(renderings.len());
        for rendering in renderings {
            if !is_generated_inline(rendering) {
                output.push(rendering.clone());
                continue;
            }
            let base = rendering.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let mut id = base.clone();
            let mut n = 1;
            while used.contains(&id) {
                id = format!("{base}_{n}");
                n += 1;
            }
            used.insert(id.clone());
            let mut renamed = rendering.clone();
            renamed["id"] = Value::String(id);
            output.push(renamed);
        }
        Converted::success(Value::Array(output))
    }
}

/// Converts structured `{special: {type, args..., before, after}}` blocks into
/// render texts.
pub struct RewriteSpecial;

fn pick_text<'a>(value: Option<&'a Value>, language: &str) -> &'a str {
    match value {
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => map
            .get(language)
            .or_else(|| map.get("*"))
            .or_else(|| map.get("en"))
            .and_then(Value::as_str)
            .unwrap_or(""),
        _ => "",
    }
}

fn rewrite_special_block(block: &Map<String, Value>) -> Result<Value, String> {
    if let Some(extra) = block.keys().find(|k| *k != "special" && !k.starts_with('_')) {
        return Err(format!("a special block may only contain 'special', found '{extra}'"));
    }
    let Some(Value::Object(special)) = block.get("special") else {
        return Err("'special' must be an object".to_string());
    };
    let Some(kind) = special.get("type").and_then(Value::as_str) else {
        return Err("the special block has no 'type'".to_string());
    };
    let Some(visualisation) = find_special(kind) else {
        let suggestions = closest_matches(kind, &special_names(), 3);
        return Err(format!("unknown special visualisation '{kind}'.{}", suggestion_text(&suggestions)));
    };
    let known = visualisation.arg_names();
    for key in special.keys() {
        if matches!(key.as_str(), "type" | "before" | "after") || key.starts_with('_') {
            continue;
        }
        if !known.contains(key) {
            let suggestions = closest_matches(key, &known, 3);
            return Err(format!(
                "special visualisation '{kind}' has no argument '{key}'.{}",
                suggestion_text(&suggestions)
            ));
        }
    }

    let mut languages: Vec<String> = special
        .values()
        .filter_map(Value::as_object)
        .flat_map(|translation| translation.keys())
        .filter(|language| !language.starts_with('_'))
        .cloned()
        .collect();
    languages.sort();
    languages.dedup();
    if languages.is_empty() {
        languages.push("*".to_string());
    }

    let mut output = Map::new();
    for language in languages {
        let mut args: Vec<String> = visualisation
            .args
            .iter()
            .map(|arg| pick_text(special.get(arg.name), &language).to_string())
            .collect();
        while args.last().is_some_and(String::is_empty) {
            args.pop();
        }
        let text = format!(
            "{}{}{}",
            pick_text(special.get("before"), &language),
            render_call(kind, &args),
            pick_text(special.get("after"), &language)
        );
        output.insert(language, Value::String(text));
    }
    Ok(Value::Object(output))
}

fn rewrite_specials(value: &Value, context: &str, diagnostics: &mut Diagnostics) -> Value {
    match value {
        Value::Object(map) if map.contains_key("special") => match rewrite_special_block(map) {
            Ok(rewritten) => rewritten,
            Err(message) => {
                diagnostics.error(context, message);
                value.clone()
            }
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, child)| {
                    (key.clone(), rewrite_specials(child, &format!("{context}.{key}"), diagnostics))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| rewrite_specials(item, &format!("{context}[{i}]"), diagnostics))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Conversion<Value> for RewriteSpecial {
    fn name(&self) -> &str {
        "RewriteSpecial"
    }

    fn doc(&self) -> &str {
        "Converts structured special visualisation blocks into render texts"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let mut diagnostics = Diagnostics::default();
        let output = rewrite_specials(input, context, &mut diagnostics);
        diagnostics.finish(output)
    }
}

/// Moves the legacy top-level styling fields into a `mapRendering` list.
pub struct RewriteLegacyMapRendering;

const LEGACY_POINT_FIELDS: &[&str] = &["icon", "iconSize", "label", "rotation"];
const LEGACY_LINE_FIELDS: &[&str] = &["color", "width", "dashArray"];

impl Conversion<Value> for RewriteLegacyMapRendering {
    fn name(&self) -> &str {
        "RewriteLegacyMapRendering"
    }

    fn modified_attributes(&self) -> Vec<String> {
        let mut attributes: Vec<String> = LEGACY_POINT_FIELDS
            .iter()
            .chain(LEGACY_LINE_FIELDS)
            .map(|s| s.to_string())
            .collect();
        attributes.push("mapRendering".to_string());
        attributes.push("wayHandling".to_string());
        attributes
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(layer) = input.as_object() else {
            return Converted::failure(context, "expected a layer object");
        };
        let has_legacy = LEGACY_POINT_FIELDS
            .iter()
            .chain(LEGACY_LINE_FIELDS)
            .any(|field| layer.contains_key(*field));
        if !has_legacy {
            return Converted::success(input.clone());
        }
        let mut diagnostics = Diagnostics::default();
        if layer.contains_key("mapRendering") {
            diagnostics.warn(
                context,
                "the layer has a mapRendering; the legacy icon/color/width fields are ignored and removed",
            );
        }

        let mut output = layer.clone();
        let mut point = Map::new();
        let mut line = Map::new();
        for field in LEGACY_POINT_FIELDS {
            if let Some(value) = output.remove(*field) {
                point.insert(field.to_string(), value);
            }
        }
        for field in LEGACY_LINE_FIELDS {
            if let Some(value) = output.remove(*field) {
                line.insert(field.to_string(), value);
            }
        }
        let way_handling = output.remove("wayHandling").and_then(|w| w.as_u64()).unwrap_or(0);

        if !output.contains_key("mapRendering") {
            let mut renderings = Vec::new();
            if !point.is_empty() {
                let location = if way_handling == 0 { json!(["point"]) } else { json!(["point", "centroid"]) };
                point.insert("location".to_string(), location);
                renderings.push(Value::Object(point));
            }
            if !line.is_empty() && way_handling != 1 {
                renderings.push(Value::Object(line));
            }
            output.insert("mapRendering".to_string(), Value::Array(renderings));
        }
        diagnostics.finish(Value::Object(output))
    }
}

/// Resolves `titleIcons` entries; `"defaults"` stands for every shared
/// rendering labelled `defaults`.
pub struct ExpandTitleIcon {
    ctx: Arc<DesugaringContext>,
}

impl ExpandTitleIcon {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        ExpandTitleIcon { ctx }
    }
}

impl Conversion<Value, Vec<Value>> for ExpandTitleIcon {
    fn name(&self) -> &str {
        "ExpandTitleIcon"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Vec<Value>> {
        match input {
            Value::String(name) if name == "defaults" => Converted::success(
                self.ctx
                    .tag_renderings
                    .values()
                    .filter(|tr| {
                        tr.get("labels")
                            .and_then(Value::as_array)
                            .is_some_and(|labels| labels.iter().any(|l| l == "defaults"))
                    })
                    .cloned()
                    .collect(),
            ),
            Value::String(name) => match self.ctx.tag_renderings.get(name) {
                Some(rendering) => Converted::success(vec![rendering.clone()]),
                None => {
                    let suggestions = closest_matches(name, self.ctx.tag_renderings.keys(), 3);
                    Converted::failure(
                        context,
                        format!("title icon '{name}' not found.{}", suggestion_text(&suggestions)),
                    )
                }
            },
            other => Converted::success(vec![other.clone()]),
        }
    }
}

/// Appends the shared `minimap` rendering to layers that do not show one.
pub struct AddMiniMap {
    ctx: Arc<DesugaringContext>,
}

impl AddMiniMap {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        AddMiniMap { ctx }
    }
}

impl Conversion<Value> for AddMiniMap {
    fn name(&self) -> &str {
        "AddMiniMap"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["tagRenderings".to_string()]
    }

    fn convert(&self, input: &Value, _context: &str) -> Converted<Value> {
        let Some(minimap) = self.ctx.tag_renderings.get("minimap") else {
            return Converted::success(input.clone());
        };
        let privileged = layer_id(input).is_some_and(|id| self.ctx.settings.is_privileged(id));
        let renderings = tag_renderings(input);
        let has_minimap = renderings
            .iter()
            .any(|tr| tr.get("id").and_then(Value::as_str) == Some("minimap"))
            || uses_special(input, "minimap");
        if privileged || renderings.is_empty() || has_minimap {
            return Converted::success(input.clone());
        }
        let mut output = input.clone();
        if let Some(Value::Array(renderings)) = output.get_mut("tagRenderings") {
            renderings.push(minimap.clone());
        }
        Converted::success(output)
    }
}

/// Appends a `leftover-questions` rendering showing every open question,
/// unless the layer already shows its questions somewhere.
pub struct AddQuestionBox {
    ctx: Arc<DesugaringContext>,
}

impl AddQuestionBox {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        AddQuestionBox { ctx }
    }
}

impl Conversion<Value> for AddQuestionBox {
    fn name(&self) -> &str {
        "AddQuestionBox"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["tagRenderings".to_string()]
    }

    fn convert(&self, input: &Value, _context: &str) -> Converted<Value> {
        let privileged = layer_id(input).is_some_and(|id| self.ctx.settings.is_privileged(id));
        let has_question = tag_renderings(input).iter().any(|tr| tr.get("question").is_some());
        if !self.ctx.settings.add_question_box
            || privileged
            || !has_question
            || uses_special(input, "questions")
        {
            return Converted::success(input.clone());
        }
        let mut output = input.clone();
        if let Some(Value::Array(renderings)) = output.get_mut("tagRenderings") {
            renderings.push(json!({
                "id": "leftover-questions",
                "render": {"*": "{questions()}"}
            }));
        }
        Converted::success(output)
    }
}

/// Resolves string entries of `filter` against the builtin `filters` layer.
pub struct ExpandFilter {
    ctx: Arc<DesugaringContext>,
}

impl ExpandFilter {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        ExpandFilter { ctx }
    }
}

impl Conversion<Value, Vec<Value>> for ExpandFilter {
    fn name(&self) -> &str {
        "ExpandFilter"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Vec<Value>> {
        let Value::String(name) = input else {
            return Converted::success(vec![input.clone()]);
        };
        let shared: &[Value] = self
            .ctx
            .shared_layers
            .get("filters")
            .and_then(|layer| layer.get("filter"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if let Some(filter) = shared.iter().find(|f| f.get("id").and_then(Value::as_str) == Some(name)) {
            return Converted::success(vec![filter.clone()]);
        }
        let ids: Vec<String> = shared
            .iter()
            .filter_map(|f| f.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let suggestions = closest_matches(name, &ids, 3);
        Converted::failure(
            context,
            format!("filter '{name}' not found in the builtin filters.{}", suggestion_text(&suggestions)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::{ValidateLayer, fixtures};

    #[test]
    fn test_expands_shared_and_layer_renderings() {
        let step = ExpandTagRendering::new(fixtures::context());
        assert_eq!(
            step.convert(&json!("images"), "c").result,
            Some(vec![json!({"id": "images", "render": "{image_carousel()}"})])
        );
        let all = step.convert(&json!("benches.*"), "c").result.unwrap();
        assert_eq!(all.len(), 2);
        let one = step.convert(&json!("benches.bench-material"), "c").result.unwrap();
        assert_eq!(one[0]["id"], json!("bench-material"));
    }

    #[test]
    fn test_builtin_rendering_with_override() {
        let step = ExpandTagRendering::new(fixtures::context());
        let out = step
            .convert(&json!({"builtin": "images", "override": {"condition": "a=b"}}), "c")
            .result
            .unwrap();
        assert_eq!(out, vec![json!({"id": "images", "render": "{image_carousel()}", "condition": "a=b"})]);
    }

    #[test]
    fn test_inline_special_becomes_rendering() {
        let step = ExpandTagRendering::new(fixtures::context());
        let out = step.convert(&json!("{open_in_josm()}"), "c").result.unwrap();
        assert_eq!(out, vec![json!({"id": "open_in_josm", "render": "{open_in_josm()}"})]);
    }

    #[test]
    fn test_unknown_rendering_suggests() {
        let step = ExpandTagRendering::new(fixtures::context());
        let out = step.convert(&json!("imags"), "layers:x.tagRenderings[0]");
        assert!(out.result.is_none());
        assert!(out.errors[0].contains("'imags' not found"));
        assert!(out.errors[0].contains("images"));

        let out = step.convert(&json!("benches.nope"), "c");
        assert!(out.errors[0].contains("not found in layer 'benches'"));
    }

    #[test]
    fn test_rewrite_expands_rows() {
        let block = json!({
            "rewrite": {"sourceString": ["_KEY_", "_NAME_"], "into": [["phone", "Phone"], ["email", "Email"]]},
            "renderings": [{"id": "_KEY_", "render": "_NAME_: {_KEY_}", "freeform": {"key": "_KEY_"}}]
        });
        let out = ExpandRewrite.convert(&block, "c").result.unwrap();
        assert_eq!(
            out,
            vec![
                json!({"id": "phone", "render": "Phone: {phone}", "freeform": {"key": "phone"}}),
                json!({"id": "email", "render": "Email: {email}", "freeform": {"key": "email"}}),
            ]
        );
    }

    #[test]
    fn test_rewrite_rejects_overlapping_sources() {
        let block = json!({
            "rewrite": {"sourceString": ["_K_", "_K_X"], "into": [["a", "b"]]},
            "renderings": []
        });
        assert!(ExpandRewrite.convert(&block, "c").result.is_none());
    }

    #[test]
    fn test_special_block_becomes_template() {
        let rendering = json!({
            "id": "import",
            "render": {"special": {
                "type": "import_button",
                "targetLayer": "shops",
                "tags": "shop=bakery",
                "before": {"en": "Import: ", "nl": "Importeer: "}
            }}
        });
        let out = RewriteSpecial.convert(&rendering, "c").result.unwrap();
        assert_eq!(
            out["render"],
            json!({"en": "Import: {import_button(shops,shop=bakery)}", "nl": "Importeer: {import_button(shops,shop=bakery)}"})
        );
    }

    #[test]
    fn test_special_block_errors() {
        let unknown = json!({"render": {"special": {"type": "import_buton"}}});
        let out = RewriteSpecial.convert(&unknown, "c");
        assert!(out.errors[0].contains("import_button"));

        let bad_arg = json!({"render": {"special": {"type": "minimap", "zoom": "17"}}});
        let out = RewriteSpecial.convert(&bad_arg, "c");
        assert!(out.errors[0].contains("has no argument 'zoom'"));
    }

    #[test]
    fn test_legacy_rendering_is_rewritten() {
        let layer = json!({"id": "x", "icon": "pin.svg", "iconSize": "40,40", "color": "#f00", "width": 3});
        let out = RewriteLegacyMapRendering.convert(&layer, "c").result.unwrap();
        assert_eq!(
            out,
            json!({
                "id": "x",
                "mapRendering": [
                    {"icon": "pin.svg", "iconSize": "40,40", "location": ["point"]},
                    {"color": "#f00", "width": 3}
                ]
            })
        );
    }

    #[test]
    fn test_question_box_and_minimap() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.add_question_box = true;
        ctx.tag_renderings
            .insert("minimap".to_string(), json!({"id": "minimap", "render": "{minimap()}"}));
        let ctx = Arc::new(ctx);

        let out = prepare_layer(ctx.clone()).convert(&fixtures::benches(), "layers:benches");
        let layer = out.result.unwrap();
        let ids: Vec<&str> = tag_renderings(&layer).iter().filter_map(|t| t["id"].as_str()).collect();
        assert_eq!(ids, vec!["bench-backrest", "bench-material", "minimap", "leftover-questions"]);

        // A second pass adds nothing
        let again = prepare_layer(ctx).convert(&layer, "layers:benches").result.unwrap();
        assert_eq!(again, layer);
    }

    #[test]
    fn test_privileged_layers_get_nothing_generated() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.add_question_box = true;
        let ctx = Arc::new(ctx);
        let gps = json!({"id": "gps_location", "source": "special",
            "tagRenderings": [{"id": "q", "question": "?", "mappings": [{"if": "a=b", "then": "b"}]}]});
        let out = AddQuestionBox::new(ctx).convert(&gps, "c").result.unwrap();
        assert_eq!(out, gps);
    }

    #[test]
    fn test_filters_resolve_from_builtin_layer() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.shared_layers.insert(
            "filters".to_string(),
            json!({"id": "filters", "source": "special", "filter": [{"id": "open_now", "options": []}]}),
        );
        let step = ExpandFilter::new(Arc::new(ctx));
        assert_eq!(step.convert(&json!("open_now"), "c").result.unwrap()[0]["id"], json!("open_now"));
        assert!(step.convert(&json!("open_later"), "c").errors[0].contains("open_now"));
    }

    fn context_with_base(base_renderings: Value) -> Arc<DesugaringContext> {
        let mut ctx = (*fixtures::context()).clone();
        ctx.shared_layers.insert(
            "base".to_string(),
            json!({"id": "base", "source": {"osmTags": "amenity=bench"}, "tagRenderings": base_renderings}),
        );
        Arc::new(ctx)
    }

    #[test]
    fn test_layer_reference_expands_builtin_blocks() {
        let ctx = context_with_base(json!([
            "wikipedia",
            {"builtin": "images", "override": {"condition": "a=b"}},
            {"id": "own", "render": "Own"}
        ]));
        let step = ExpandTagRendering::new(ctx);
        let out = step.convert(&json!("base.*"), "c");
        assert!(out.is_ok(), "{:?}", out.errors);
        assert_eq!(
            out.result.unwrap(),
            vec![
                json!({"id": "wikipedia", "render": "{wikipedia()}"}),
                json!({"id": "images", "render": "{image_carousel()}", "condition": "a=b"}),
                json!({"id": "own", "render": "Own"}),
            ]
        );

        let one = step.convert(&json!("base.images"), "c").result.unwrap();
        assert_eq!(one, vec![json!({"id": "images", "render": "{image_carousel()}", "condition": "a=b"})]);
    }

    #[test]
    fn test_layer_reference_expands_rewrite_blocks() {
        let ctx = context_with_base(json!([{
            "rewrite": {"sourceString": ["_KEY_"], "into": [["phone"], ["email"]]},
            "renderings": [{"id": "_KEY_", "render": "{_KEY_}"}, "images"]
        }]));
        let step = ExpandTagRendering::new(ctx);
        let all = step.convert(&json!("base.*"), "c");
        assert!(all.is_ok(), "{:?}", all.errors);
        let ids: Vec<Value> = all.result.unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("phone"), json!("images"), json!("email"), json!("images")]);

        let email = step.convert(&json!("base.email"), "c").result.unwrap();
        assert_eq!(email, vec![json!({"id": "email", "render": "{email}"})]);
    }

    #[test]
    fn test_layer_reference_through_prepare_layer() {
        let ctx = context_with_base(json!([
            {"builtin": ["images", "wikipedia"]},
            {"rewrite": {"sourceString": ["_KEY_"], "into": [["phone"]]},
             "renderings": [{"id": "_KEY_", "render": "{_KEY_}"}]}
        ]));
        let mut layer = fixtures::benches();
        layer["tagRenderings"] = json!(["base.*"]);
        let out = prepare_layer(ctx).convert(&layer, "layers:benches");
        assert!(out.is_ok(), "{:?}", out.errors);
        let layer = out.result.unwrap();
        let ids: Vec<&str> = tag_renderings(&layer).iter().filter_map(|t| t["id"].as_str()).collect();
        assert_eq!(ids, vec!["images", "wikipedia", "phone"]);
        assert!(ValidateLayer.convert(&layer, "layers:benches").is_ok());
    }

    #[test]
    fn test_self_reference_is_reported() {
        let ctx = context_with_base(json!(["base.*"]));
        let out = ExpandTagRendering::new(ctx).convert(&json!("base.*"), "c");
        assert!(out.result.is_none());
        assert!(out.errors[0].contains("reference cycle"));
    }

    #[test]
    fn test_repeated_inline_specials_get_distinct_ids() {
        let mut layer = fixtures::benches();
        layer["tagRenderings"] = json!(["{wikipedia()}", {"id": "wikipedia_1", "render": "Own"}, "{wikipedia()}"]);
        let out = prepare_layer(fixtures::context()).convert(&layer, "layers:benches");
        assert!(out.is_ok(), "{:?}", out.errors);
        let layer = out.result.unwrap();
        let ids: Vec<&str> = tag_renderings(&layer).iter().filter_map(|t| t["id"].as_str()).collect();
        assert_eq!(ids, vec!["wikipedia", "wikipedia_1", "wikipedia_2"]);
        assert!(ValidateLayer.convert(&layer, "layers:benches").is_ok());

        let again = prepare_layer(fixtures::context()).convert(&layer, "layers:benches").result.unwrap();
        assert_eq!(again, layer);
    }
}

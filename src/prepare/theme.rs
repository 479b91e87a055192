use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;

use super::{
    AddContextToTranslations, AddDependencyLayersToTheme, DesugaringContext, SubstituteLayer, ValidateTheme,
    layer_id, merge, prepare_layer,
};
use crate::convert::{Concat, Conversion, Converted, Diagnostics, Each, Fuse, On, SetDefault};
use crate::special::{calls_in_rendering, find_special, render_call};

const NOTE_IMPORT_PREFIX: &str = "note_import_";
const NOTES_API: &str = "https://api.openstreetmap.org/api/0.6/notes.json?closed=0&bbox={x_min},{y_min},{x_max},{y_max}";

/// The full theme pipeline. Stops at the first stage that reports an error.
pub fn prepare_theme(ctx: Arc<DesugaringContext>) -> Fuse {
    Fuse::new(
        "PrepareTheme",
        "Substitutes builtin layers, applies overrides and adds default, dependency and import layers",
        vec![
            Box::new(AddContextToTranslations::new("themes:")),
            Box::new(PreparePersonalTheme::new(ctx.clone())),
            Box::new(WarnForUnsubstitutedLayersInTheme),
            Box::new(On::new(
                "layers",
                Box::new(Concat::new(Box::new(SubstituteLayer::new(ctx.clone())))),
            )),
            Box::new(SetDefault::new(
                "socialImage",
                json!(ctx.settings.default_social_image),
                false,
            )),
            Box::new(On::new("layers", Box::new(Each::new(Box::new(prepare_layer(ctx.clone())))))),
            Box::new(ApplyOverrideAll),
            Box::new(On::new("layers", Box::new(Each::new(Box::new(prepare_layer(ctx.clone())))))),
            Box::new(AddDefaultLayers::new(ctx.clone())),
            Box::new(AddDependencyLayersToTheme::new(ctx.clone())),
            Box::new(AddImportLayers::new(ctx.clone())),
            Box::new(AddNodeDatabaseFlag),
            Box::new(ValidateTheme::new(ctx)),
        ],
    )
}

fn layers_of(theme: &Value) -> &[Value] {
    theme
        .get("layers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn with_layers(theme: &Value, layers: Vec<Value>) -> Value {
    let mut output = theme.clone();
    if let Some(object) = output.as_object_mut() {
        object.insert("layers".to_string(), Value::Array(layers));
    }
    output
}

/// The theme `personal` shows every public layer.
pub struct PreparePersonalTheme {
    ctx: Arc<DesugaringContext>,
}

impl PreparePersonalTheme {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        PreparePersonalTheme { ctx }
    }
}

impl Conversion<Value> for PreparePersonalTheme {
    fn name(&self) -> &str {
        "PreparePersonalTheme"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["layers".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        if input.get("id").and_then(Value::as_str) != Some("personal") {
            return Converted::success(input.clone());
        }
        let layers: Vec<Value> = self
            .ctx
            .public_layers
            .iter()
            .map(|id| Value::String(id.clone()))
            .collect();
        let mut diagnostics = Diagnostics::default();
        diagnostics.info(context, format!("the personal theme shows {} public layers", layers.len()));
        diagnostics.finish(with_layers(input, layers))
    }
}

/// Inline layer definitions can not be reused by other themes; warn about
/// them in themes listed in the overview.
pub struct WarnForUnsubstitutedLayersInTheme;

impl Conversion<Value> for WarnForUnsubstitutedLayersInTheme {
    fn name(&self) -> &str {
        "WarnForUnsubstitutedLayersInTheme"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        if input.get("hideFromOverview").and_then(Value::as_bool) == Some(true) {
            return Converted::success(input.clone());
        }
        let mut diagnostics = Diagnostics::default();
        for (i, layer) in layers_of(input).iter().enumerate() {
            let Value::Object(map) = layer else {
                continue;
            };
            if map.contains_key("builtin") {
                continue;
            }
            let id = layer_id(layer).unwrap_or("<unnamed>");
            diagnostics.warn(
                &format!("{context}.layers[{i}]"),
                format!(
                    "layer '{id}' is defined inline; move it into its own layer file so that other themes can reuse it"
                ),
            );
        }
        diagnostics.finish(input.clone())
    }
}

/// Merges `overrideAll` onto every layer, then removes it.
pub struct ApplyOverrideAll;

impl Conversion<Value> for ApplyOverrideAll {
    fn name(&self) -> &str {
        "ApplyOverrideAll"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["layers".to_string(), "overrideAll".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(override_all) = input.get("overrideAll") else {
            return Converted::success(input.clone());
        };
        let override_context = format!("{context}.overrideAll");
        let Value::Object(override_map) = override_all else {
            return Converted::failure(&override_context, "overrideAll must be an object");
        };
        if override_map.contains_key("tagRenderings") {
            return Converted::failure(
                &override_context,
                "overrideAll must not contain 'tagRenderings': it would replace the renderings of every layer. Use '+tagRenderings' or 'tagRenderings+' instead",
            );
        }

        let mut diagnostics = Diagnostics::default();
        let mut layers = Vec::with_capacity(layers_of(input).len());
        for (i, layer) in layers_of(input).iter().enumerate() {
            let layer_context = format!("{context}.layers[{i}]");
            if !layer.is_object() {
                diagnostics.error(&layer_context, format!("layer {layer} has not been substituted"));
                continue;
            }
            match merge(override_all, layer) {
                Ok(merged) => layers.push(merged),
                Err(message) => diagnostics.error(&layer_context, format!("cannot apply overrideAll: {message}")),
            }
        }
        let mut output = with_layers(input, layers);
        if let Some(object) = output.as_object_mut() {
            object.remove("overrideAll");
        }
        diagnostics.finish(output)
    }
}

/// Appends the layers every theme carries, e.g. `gps_location`.
pub struct AddDefaultLayers {
    ctx: Arc<DesugaringContext>,
}

impl AddDefaultLayers {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        AddDefaultLayers { ctx }
    }
}

impl Conversion<Value> for AddDefaultLayers {
    fn name(&self) -> &str {
        "AddDefaultLayers"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["layers".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let mut diagnostics = Diagnostics::default();
        let mut layers = layers_of(input).to_vec();
        let present: HashSet<String> = layers.iter().filter_map(layer_id).map(str::to_string).collect();
        for id in &self.ctx.settings.added_by_default {
            if present.contains(id) {
                diagnostics.warn(
                    context,
                    format!("the theme defines a layer '{id}', which collides with a default layer; the default is not added"),
                );
                continue;
            }
            match self.ctx.shared_layers.get(id) {
                Some(layer) => layers.push(layer.clone()),
                None => diagnostics.error(context, format!("default layer '{id}' is not a builtin layer")),
            }
        }
        diagnostics.finish(with_layers(input, layers))
    }
}

/// Adds a `note_import_<id>` layer for every layer users can add points to,
/// showing OSM notes that propose such a point together with an import button.
pub struct AddImportLayers {
    ctx: Arc<DesugaringContext>,
}

impl AddImportLayers {
    pub fn new(ctx: Arc<DesugaringContext>) -> Self {
        AddImportLayers { ctx }
    }

    fn is_importable(&self, layer: &Map<String, Value>) -> bool {
        let Some(id) = layer.get("id").and_then(Value::as_str) else {
            return false;
        };
        if self.ctx.settings.is_privileged(id) || id.starts_with(NOTE_IMPORT_PREFIX) {
            return false;
        }
        let osm_source = match layer.get("source") {
            Some(Value::Object(source)) => source.contains_key("osmTags") && !source.contains_key("geoJson"),
            _ => false,
        };
        let has_presets = layer
            .get("presets")
            .and_then(Value::as_array)
            .is_some_and(|presets| !presets.is_empty());
        osm_source && has_presets && layer.contains_key("title") && layer.contains_key("name")
    }
}

fn note_import_layer(id: &str, min_zoom: f64) -> Value {
    let import_args: Vec<String> = [id, "$tags", "Import this point", "", "", "", "id"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    json!({
        "id": format!("{NOTE_IMPORT_PREFIX}{id}"),
        "name": {"en": format!("Possible {id} from notes")},
        "description": format!("OSM notes proposing a feature for the layer '{id}'"),
        "source": {
            "osmTags": "id~*",
            "geoJson": NOTES_API,
            "geoJsonZoomLevel": 10,
            "maxCacheAge": 0
        },
        "minzoom": min_zoom.max(12.0),
        "title": {"render": {"en": "Import candidate"}},
        "tagRenderings": [
            {"id": "import", "render": render_call("import_button", &import_args)},
            {"id": "close_note", "render": "{close_note(Does not exist,,id,This feature does not exist)}"},
            {"id": "add_note_comment", "render": "{add_note_comment()}"}
        ],
        "mapRendering": [{"location": ["point"], "icon": "./assets/svg/note.svg", "iconSize": "40,40"}]
    })
}

impl Conversion<Value> for AddImportLayers {
    fn name(&self) -> &str {
        "AddImportLayers"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["layers".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let enabled = input
            .get("enableNoteImports")
            .and_then(Value::as_bool)
            .unwrap_or(self.ctx.settings.note_imports);
        if !enabled {
            return Converted::success(input.clone());
        }
        let mut diagnostics = Diagnostics::default();
        let mut layers = layers_of(input).to_vec();
        let present: HashSet<&str> = layers_of(input).iter().filter_map(layer_id).collect();
        let mut added = Vec::new();
        for layer in layers_of(input) {
            let Value::Object(map) = layer else {
                continue;
            };
            if !self.is_importable(map) {
                continue;
            }
            let Some(id) = layer_id(layer) else {
                continue;
            };
            let import_id = format!("{NOTE_IMPORT_PREFIX}{id}");
            if present.contains(import_id.as_str()) {
                continue;
            }
            let min_zoom = layer.get("minzoom").and_then(Value::as_f64).unwrap_or(0.0);
            diagnostics.info(context, format!("added note import layer '{import_id}'"));
            added.push(note_import_layer(id, min_zoom));
        }
        layers.extend(added);
        diagnostics.finish(with_layers(input, layers))
    }
}

/// Sets `enableNodeDatabase` when a rendering uses a special visualisation
/// that needs every loaded node.
pub struct AddNodeDatabaseFlag;

impl Conversion<Value> for AddNodeDatabaseFlag {
    fn name(&self) -> &str {
        "AddNodeDatabaseFlag"
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec!["enableNodeDatabase".to_string()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let needing: Vec<String> = layers_of(input)
            .iter()
            .flat_map(|layer| {
                let renderings = layer
                    .get("tagRenderings")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                renderings.iter().chain(layer.get("title")).flat_map(calls_in_rendering)
            })
            .filter(|call| find_special(&call.name).is_some_and(|s| s.needs_node_database))
            .map(|call| call.name)
            .collect();
        let Some(first) = needing.first() else {
            return Converted::success(input.clone());
        };
        let mut diagnostics = Diagnostics::default();
        diagnostics.info(context, format!("enabling the node database: '{first}' needs it"));
        let mut output = input.clone();
        if let Some(object) = output.as_object_mut() {
            object.insert("enableNodeDatabase".to_string(), json!(true));
        }
        diagnostics.finish(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LayoutConfig;
    use crate::prepare::fixtures;

    fn ids(theme: &Value) -> Vec<&str> {
        layers_of(theme).iter().filter_map(layer_id).collect()
    }

    fn theme(layers: Value) -> Value {
        json!({"id": "aed", "title": {"en": "Defibrillators"}, "layers": layers})
    }

    #[test]
    fn test_defibrillator_theme_end_to_end() {
        let out = prepare_theme(fixtures::context()).convert(&theme(json!(["defibrillator"])), "themes:aed");
        assert!(out.errors.is_empty(), "{:?}", out.errors);
        let expanded = out.result.unwrap();
        assert_eq!(ids(&expanded), vec!["walls_and_buildings", "defibrillator"]);
        assert_eq!(expanded["layers"][0]["forceLoad"], json!(true));
        assert_eq!(expanded["socialImage"], json!("assets/SocialImage.png"));
        assert_eq!(expanded["title"]["_context"], json!("themes:aed.title"));

        let layout = LayoutConfig::from_json(&expanded, "themes").unwrap();
        assert_eq!(layout.layers.len(), 2);
    }

    #[test]
    fn test_unknown_layer_aborts_theme() {
        let out = prepare_theme(fixtures::context())
            .convert(&json!({"id": "t1", "layers": ["nonexistent_layer"]}), "themes:t1");
        assert!(out.result.is_none());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("nonexistent_layer"));
        assert!(out.errors[0].contains("not found as a builtin layer"));
        assert!(out.errors[0].starts_with("[On(layers, Concat(SubstituteLayer))]"));
    }

    #[test]
    fn test_override_all_reaches_every_layer_and_expands() {
        let input = json!({
            "id": "aed",
            "title": "AED",
            "layers": ["benches", "defibrillator"],
            "overrideAll": {"minzoom": 15, "tagRenderings+": ["images"]}
        });
        let out = prepare_theme(fixtures::context()).convert(&input, "themes:aed").result.unwrap();
        assert!(out.get("overrideAll").is_none());
        for layer in layers_of(&out).iter().filter(|l| l["id"] != "walls_and_buildings") {
            assert_eq!(layer["minzoom"], json!(15));
            let last = layer["tagRenderings"].as_array().unwrap().last().unwrap();
            assert_eq!(last["id"], json!("images"));
        }
    }

    #[test]
    fn test_override_all_must_not_replace_renderings() {
        let input = json!({"id": "t", "layers": [fixtures::benches()], "overrideAll": {"tagRenderings": []}});
        let out = ApplyOverrideAll.convert(&input, "themes:t");
        assert!(out.result.is_none());
        assert!(out.errors[0].contains("'+tagRenderings'"));
    }

    #[test]
    fn test_personal_theme_lists_public_layers() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.public_layers = ["defibrillator", "benches"].iter().map(|s| s.to_string()).collect();
        let input = json!({"id": "personal", "title": "Personal", "layers": []});
        let out = PreparePersonalTheme::new(Arc::new(ctx)).convert(&input, "themes:personal");
        assert_eq!(out.result.unwrap()["layers"], json!(["benches", "defibrillator"]));
        assert_eq!(out.information.len(), 1);
    }

    #[test]
    fn test_inline_layers_warn_unless_hidden() {
        let inline = json!({"id": "mine", "source": {"osmTags": "a=b"}});
        let out = WarnForUnsubstitutedLayersInTheme.convert(&theme(json!([inline, "benches"])), "themes:aed");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].starts_with("themes:aed.layers[0]"));

        let mut hidden = theme(json!([inline]));
        hidden["hideFromOverview"] = json!(true);
        assert!(WarnForUnsubstitutedLayersInTheme.convert(&hidden, "c").warnings.is_empty());
    }

    #[test]
    fn test_default_layers_are_appended_once() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.added_by_default = vec!["gps_location".to_string()];
        let step = AddDefaultLayers::new(Arc::new(ctx));

        let out = step.convert(&theme(json!([fixtures::benches()])), "themes:aed");
        assert_eq!(ids(out.result.as_ref().unwrap()), vec!["benches", "gps_location"]);

        let own = json!({"id": "gps_location", "source": "special", "minzoom": 3});
        let out = step.convert(&theme(json!([own])), "themes:aed");
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.result.unwrap()["layers"][0]["minzoom"], json!(3));
    }

    #[test]
    fn test_missing_default_layer_is_an_error() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.added_by_default = vec!["home_location".to_string()];
        let out = AddDefaultLayers::new(Arc::new(ctx)).convert(&theme(json!([])), "themes:aed");
        assert!(out.result.is_none());
        assert!(out.errors[0].contains("'home_location'"));
    }

    #[test]
    fn test_note_import_layers() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.note_imports = true;
        let step = AddImportLayers::new(Arc::new(ctx));
        let input = theme(json!([fixtures::walls_and_buildings(), fixtures::defibrillator(), fixtures::benches()]));
        let out = step.convert(&input, "themes:aed").result.unwrap();
        assert_eq!(
            ids(&out),
            vec![
                "walls_and_buildings",
                "defibrillator",
                "benches",
                "note_import_defibrillator",
                "note_import_benches"
            ]
        );
        let import = &out["layers"][4];
        assert_eq!(import["minzoom"], json!(17.0));
        assert_eq!(
            import["tagRenderings"][0]["render"],
            json!("{import_button(benches,$tags,Import this point,,,,id)}")
        );
        assert_eq!(out["layers"][3]["minzoom"], json!(12.0));

        // Running again adds nothing
        assert_eq!(step.convert(&out, "themes:aed").result.unwrap(), out);
    }

    #[test]
    fn test_theme_can_switch_note_imports() {
        let mut ctx = (*fixtures::context()).clone();
        ctx.settings.note_imports = true;
        let step = AddImportLayers::new(Arc::new(ctx));
        let mut input = theme(json!([fixtures::benches()]));
        input["enableNoteImports"] = json!(false);
        let out = step.convert(&input, "themes:aed").result.unwrap();
        assert_eq!(ids(&out), vec!["benches"]);

        let step = AddImportLayers::new(fixtures::context());
        input["enableNoteImports"] = json!(true);
        let out = step.convert(&input, "themes:aed").result.unwrap();
        assert_eq!(ids(&out), vec!["benches", "note_import_benches"]);
    }

    #[test]
    fn test_node_database_flag() {
        let way_import = json!({
            "id": "buildings",
            "source": {"osmTags": "building~*"},
            "tagRenderings": [{"id": "i", "render": "{import_way_button(buildings,building=yes)}"}]
        });
        let out = AddNodeDatabaseFlag.convert(&theme(json!([way_import])), "c").result.unwrap();
        assert_eq!(out["enableNodeDatabase"], json!(true));

        let plain = theme(json!([fixtures::benches()]));
        assert_eq!(AddNodeDatabaseFlag.convert(&plain, "c").result.unwrap(), plain);
    }

    #[test]
    fn test_pipeline_is_repeatable() {
        let input = theme(json!(["defibrillator", {"builtin": "benches", "override": {"minzoom": 12}}]));
        let pipeline = prepare_theme(fixtures::context());
        let first = pipeline.convert(&input, "themes:aed");
        let second = pipeline.convert(&input, "themes:aed");
        assert_eq!(first, second);
        assert!(first.is_ok());
    }
}

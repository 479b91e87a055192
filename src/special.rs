//! Special visualisations: `{name(arg, ...)}` widgets embedded in render texts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::utils::collect_strings;

#[derive(Debug)]
pub struct SpecialArg {
    pub name: &'static str,
    pub default: Option<&'static str>,
    /// The argument names one or more layers (separated by `;` or `,`).
    pub is_layer: bool,
}

#[derive(Debug)]
pub struct SpecialVisualisation {
    pub name: &'static str,
    pub docs: &'static str,
    pub args: &'static [SpecialArg],
    pub needs_node_database: bool,
}

impl SpecialVisualisation {
    /// Argument values by position, with defaults filled in for missing or
    /// empty ones.
    pub fn resolve_args(&self, given: &[String]) -> Vec<(&'static str, Option<String>)> {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                let value = given
                    .get(i)
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .or_else(|| arg.default.map(str::to_string));
                (arg.name, value)
            })
            .collect()
    }

    pub fn arg_names(&self) -> Vec<String> {
        self.args.iter().map(|a| a.name.to_string()).collect()
    }
}

macro_rules! arg {
    ($name:literal) => {
        SpecialArg { name: $name, default: None, is_layer: false }
    };
    ($name:literal, $default:literal) => {
        SpecialArg { name: $name, default: Some($default), is_layer: false }
    };
}

macro_rules! layer_arg {
    ($name:literal) => {
        SpecialArg { name: $name, default: None, is_layer: true }
    };
}

const fn special(
    name: &'static str,
    docs: &'static str,
    args: &'static [SpecialArg],
) -> SpecialVisualisation {
    SpecialVisualisation {
        name,
        docs,
        args,
        needs_node_database: false,
    }
}

pub static SPECIAL_VISUALISATIONS: &[SpecialVisualisation] = &[
    special("all_tags", "Table with every tag of the feature", &[]),
    special(
        "image_carousel",
        "Images linked from the feature",
        &[arg!("image_key", "image;mapillary;image:*;wikidata;wikipedia;wikimedia_commons")],
    ),
    special(
        "image_upload",
        "Button to upload a picture",
        &[arg!("image_key", "image"), arg!("label")],
    ),
    special(
        "wikipedia",
        "Wikipedia article of the feature",
        &[arg!("keyToShowWikipediaFor", "wikidata;wikipedia")],
    ),
    special("wikidata_label", "Label of a wikidata item", &[arg!("keyToShowWikidataFor", "wikidata")]),
    special(
        "minimap",
        "Small map around the feature",
        &[arg!("zoomlevel", "18"), arg!("idKey", "id")],
    ),
    special(
        "questions",
        "The questions of this layer that are still open",
        &[arg!("labels"), arg!("blacklisted-labels")],
    ),
    special(
        "reviews",
        "Reviews of the feature",
        &[arg!("subjectKey", "name"), arg!("fallback")],
    ),
    special(
        "opening_hours_table",
        "Opening hours as a table",
        &[arg!("key", "opening_hours"), arg!("prefix"), arg!("postfix")],
    ),
    special("canonical", "Value of a unit-aware key", &[arg!("key")]),
    SpecialVisualisation {
        name: "import_button",
        docs: "Button to import a point into OSM",
        args: &[
            layer_arg!("targetLayer"),
            arg!("tags"),
            arg!("text", "Import this data into OpenStreetMap"),
            arg!("icon"),
            layer_arg!("snap_onto_layers"),
            arg!("max_snap_distance", "5"),
            arg!("note_id"),
            arg!("maproulette_id"),
        ],
        needs_node_database: false,
    },
    SpecialVisualisation {
        name: "import_way_button",
        docs: "Button to import a way into OSM",
        args: &[
            layer_arg!("targetLayer"),
            arg!("tags"),
            arg!("text", "Import this data into OpenStreetMap"),
            arg!("icon"),
            arg!("snap_to_point_if"),
            arg!("max_snap_distance", "0.05"),
            arg!("move_osm_point_if"),
            arg!("max_move_distance", "0.05"),
            layer_arg!("snap_onto_layers"),
            arg!("snap_to_layer_max_distance", "0.1"),
        ],
        needs_node_database: true,
    },
    SpecialVisualisation {
        name: "conflate_button",
        docs: "Button to copy a geometry onto an existing way",
        args: &[
            layer_arg!("targetLayer"),
            arg!("way_to_conflate"),
            arg!("text", "Import this data into OpenStreetMap"),
        ],
        needs_node_database: true,
    },
    special(
        "tag_apply",
        "Button to apply a set of tags",
        &[
            arg!("tags_to_apply"),
            arg!("message"),
            arg!("image"),
            arg!("id_of_object_to_apply_this_one"),
        ],
    ),
    special(
        "auto_apply",
        "Applies a tag rendering to a list of features",
        &[
            arg!("target_layer"),
            arg!("target_feature_ids"),
            arg!("tag_rendering_id"),
            arg!("text"),
            arg!("icon"),
        ],
    ),
    special("export_as_gpx", "Download the feature as GPX", &[]),
    special("export_as_geojson", "Download the feature as GeoJSON", &[]),
    special("open_in_iD", "Link to the iD editor", &[]),
    special("open_in_josm", "Remote-control link to JOSM", &[]),
    special(
        "close_note",
        "Button to close an OSM note",
        &[
            arg!("text"),
            arg!("icon", "checkmark.svg"),
            arg!("idkey", "id"),
            arg!("comment"),
            arg!("minZoom"),
            arg!("zoomButton"),
        ],
    ),
    special("add_note_comment", "Comment box for an OSM note", &[arg!("Id-key", "id")]),
    special(
        "multi_apply",
        "Copies tags onto other features",
        &[
            arg!("feature_ids"),
            arg!("keys"),
            arg!("text"),
            arg!("autoapply"),
            arg!("overwrite"),
        ],
    ),
    special(
        "link",
        "A link with substituted href",
        &[arg!("text"), arg!("href"), arg!("class"), arg!("download")],
    ),
    special("share_link", "Share this feature", &[arg!("url")]),
    special("nearby_images", "Nearby street-level pictures", &[arg!("mode", "expandable")]),
    special(
        "steal",
        "Shows a tag rendering of another feature",
        &[arg!("featureId"), arg!("tagRenderingId")],
    ),
    special("language_chooser", "Choose the interface language", &[]),
    special(
        "histogram",
        "Histogram of the values of a key",
        &[arg!("key"), arg!("title"), arg!("countHeader"), arg!("colors*")],
    ),
];

pub fn find_special(name: &str) -> Option<&'static SpecialVisualisation> {
    SPECIAL_VISUALISATIONS.iter().find(|s| s.name == name)
}

pub fn special_names() -> Vec<String> {
    SPECIAL_VISUALISATIONS.iter().map(|s| s.name.to_string()).collect()
}

static SPECIAL_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\(([^)]*)\)(?::([^}]*))?\}")
        .expect("special visualisation pattern is valid")
});

/// One `{name(args):style}` occurrence in a template.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialCall {
    pub name: String,
    pub args: Vec<String>,
    pub style: Option<String>,
}

/// Every special call in a template, known or not.
pub fn parse_template(template: &str) -> Vec<SpecialCall> {
    SPECIAL_CALL
        .captures_iter(template)
        .map(|caps| {
            let raw_args = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let args = if raw_args.trim().is_empty() {
                Vec::new()
            } else {
                raw_args.split(',').map(|a| a.trim().to_string()).collect()
            };
            SpecialCall {
                name: caps[1].to_string(),
                args,
                style: caps.get(3).map(|m| m.as_str().to_string()),
            }
        })
        .collect()
}

/// `{name(a,b)}` as it appears in a render text.
pub fn render_call(name: &str, args: &[String]) -> String {
    format!("{{{name}({})}}", args.join(","))
}

/// Special calls in the `render` and mapping `then` texts of a tag rendering,
/// in every language.
pub fn calls_in_rendering(rendering: &Value) -> Vec<SpecialCall> {
    let mut texts = Vec::new();
    if let Some(render) = rendering.get("render") {
        collect_strings(render, &mut texts);
    }
    if let Some(Value::Array(mappings)) = rendering.get("mappings") {
        for mapping in mappings {
            if let Some(then) = mapping.get("then") {
                collect_strings(then, &mut texts);
            }
        }
    }
    calls_in_texts(texts.iter().map(String::as_str))
}

pub fn calls_in_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<SpecialCall> {
    texts.into_iter().flat_map(parse_template).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_calls_with_args_and_style() {
        let calls = parse_template("Hi {name}, {minimap(17, id):height:10rem} and {wikipedia()}");
        assert_eq!(
            calls,
            vec![
                SpecialCall {
                    name: "minimap".into(),
                    args: vec!["17".into(), "id".into()],
                    style: Some("height:10rem".into()),
                },
                SpecialCall {
                    name: "wikipedia".into(),
                    args: vec![],
                    style: None,
                },
            ]
        );
    }

    #[test]
    fn test_resolves_defaults() {
        let minimap = find_special("minimap").unwrap();
        let resolved = minimap.resolve_args(&["".to_string()]);
        assert_eq!(
            resolved,
            vec![("zoomlevel", Some("18".to_string())), ("idKey", Some("id".to_string()))]
        );
    }

    #[test]
    fn test_finds_calls_in_translations_and_mappings() {
        let rendering = json!({
            "render": {"en": "{import_button(shops, amenity=shop)}", "nl": "{all_tags()}"},
            "mappings": [{"if": "a=b", "then": "{open_in_josm()}"}]
        });
        let names: Vec<String> = calls_in_rendering(&rendering).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["import_button", "all_tags", "open_in_josm"]);
    }

    #[test]
    fn test_registry_flags_node_database() {
        assert!(find_special("import_way_button").unwrap().needs_node_database);
        assert!(!find_special("import_button").unwrap().needs_node_database);
        assert!(find_special("nope").is_none());
    }
}

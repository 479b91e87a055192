use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::convert::{Conversion, Converted};

/// Fields whose value may be a translation object.
const TRANSLATABLE: &[&str] = &[
    "name",
    "title",
    "description",
    "shortDescription",
    "question",
    "render",
    "then",
    "placeholder",
    "text",
    "message",
    "before",
    "after",
];

static LANGUAGE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\*|[a-z]{2,3}([_-][A-Za-z]{2,4})?)$").expect("language pattern is valid"));

fn is_translation(map: &Map<String, Value>) -> bool {
    let mut languages = map.iter().filter(|(key, _)| !key.starts_with('_')).peekable();
    languages.peek().is_some()
        && languages.all(|(key, value)| value.is_string() && LANGUAGE_CODE.is_match(key))
}

/// Adds a `_context` key to every translation object with the dotted path to
/// it, e.g. `themes:cyclofix.layers.bike_shop.tagRenderings.repair.question`.
/// List elements that have an `id` use it as their path segment.
pub struct AddContextToTranslations {
    prefix: String,
}

impl AddContextToTranslations {
    /// `prefix` is `"themes:"` or `"layers:"`.
    pub fn new(prefix: impl Into<String>) -> Self {
        AddContextToTranslations { prefix: prefix.into() }
    }
}

fn annotate(value: &Value, path: &str, translatable: bool) -> Value {
    match value {
        Value::Object(map) if translatable && is_translation(map) => {
            let mut output = map.clone();
            output
                .entry("_context")
                .or_insert_with(|| Value::String(path.to_string()));
            Value::Object(output)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, child)| {
                    let child_path = format!("{path}.{key}");
                    let child_translatable = TRANSLATABLE.contains(&key.as_str());
                    (key.clone(), annotate(child, &child_path, child_translatable))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let segment = item
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| i.to_string());
                    annotate(item, &format!("{path}.{segment}"), translatable)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Conversion<Value> for AddContextToTranslations {
    fn name(&self) -> &str {
        "AddContextToTranslations"
    }

    fn doc(&self) -> &str {
        "Annotates every translation with the path where it was defined"
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(id) = input.get("id").and_then(Value::as_str) else {
            return Converted::failure(context, "cannot add translation context: the document has no id");
        };
        Converted::success(annotate(input, &format!("{}{id}", self.prefix), false))
    }
}

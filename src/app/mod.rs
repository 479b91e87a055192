use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::CompilerSettings;
use crate::convert::{Conversion, Converted, Fuse};
use crate::prepare::{AddContextToTranslations, DesugaringContext, ValidateLayer, prepare_layer, prepare_theme};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory with the builtin layers, one JSON file per layer
    #[arg(short, long)]
    pub layers: PathBuf,

    /// Directory with the themes, one JSON file per theme
    #[arg(long)]
    pub themes: PathBuf,

    /// Shared tag renderings: a JSON object keyed by id, or a list of renderings
    #[arg(long)]
    pub tag_renderings: Option<PathBuf>,

    /// Output directory; receives layers/<id>.json and themes/<id>.json
    #[arg(short, long)]
    pub output: PathBuf,

    /// Compiler settings file (YAML or JSON)
    #[arg(short, long, env = "THEMEC_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Only compile these themes (repeatable)
    #[arg(long = "only", value_name = "THEME")]
    pub only: Vec<String>,

    /// Number of threads (default: all cores)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Counts of one compiler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub layers_compiled: usize,
    pub layers_failed: usize,
    pub themes_compiled: usize,
    pub themes_failed: usize,
}

impl Summary {
    pub fn failures(&self) -> usize {
        self.layers_failed + self.themes_failed
    }
}

pub fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("IO: Failed to read {path:?}"))?;
    serde_json::from_str(&text).with_context(|| format!("Parse: {path:?} is not valid JSON"))
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("IO: Failed to write {path:?}"))
}

/// Every `*.json` file of `dir`, sorted by path.
pub fn read_documents(dir: &Path) -> Result<Vec<(PathBuf, Value)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("IO: Failed to list {dir:?}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|path| read_json(&path).map(|doc| (path, doc)))
        .collect()
}

pub fn load_tag_renderings(path: &Path) -> Result<BTreeMap<String, Value>> {
    let renderings = match read_json(path)? {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|tr| {
                let id = tr.get("id").and_then(Value::as_str)?.to_string();
                Some((id, tr))
            })
            .collect(),
        _ => anyhow::bail!("Parse: {path:?} must hold an object or a list of tag renderings"),
    };
    Ok(renderings)
}

/// Builtin layers referenced by themes listed in the overview.
pub fn public_layers(themes: &[Value]) -> BTreeSet<String> {
    let mut public = BTreeSet::new();
    for theme in themes {
        if theme.get("hideFromOverview").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let Some(Value::Array(layers)) = theme.get("layers") else {
            continue;
        };
        for layer in layers {
            match layer.get("builtin").unwrap_or(layer) {
                Value::String(id) => {
                    public.insert(id.clone());
                }
                Value::Array(ids) => public.extend(ids.iter().filter_map(Value::as_str).map(str::to_string)),
                _ => {}
            }
        }
    }
    public
}

fn document_id(path: &Path, doc: &Value) -> String {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
}

/// Log the diagnostics of one document; true when it compiled.
fn report<T>(kind: &str, id: &str, converted: &Converted<T>) -> bool {
    for message in &converted.information {
        tracing::debug!("{kind} {id}: {message}");
    }
    for message in &converted.warnings {
        tracing::warn!("{kind} {id}: {message}");
    }
    for message in &converted.errors {
        tracing::error!("{kind} {id}: {message}");
    }
    converted.is_ok()
}

fn compile_layer_pipeline(ctx: Arc<DesugaringContext>) -> Fuse {
    Fuse::new(
        "CompileLayer",
        "Expands and validates one builtin layer",
        vec![
            Box::new(AddContextToTranslations::new("layers:")),
            Box::new(prepare_layer(ctx)),
            Box::new(ValidateLayer),
        ],
    )
}

/// Compile every builtin layer against the raw layers. Failed layers are
/// logged and left out of the returned registry.
pub fn compile_layers(
    documents: &[(PathBuf, Value)],
    ctx: Arc<DesugaringContext>,
) -> (BTreeMap<String, Value>, usize) {
    let pipeline = compile_layer_pipeline(ctx);
    let results: Vec<(String, Option<Value>)> = documents
        .par_iter()
        .map(|(path, doc)| {
            let id = document_id(path, doc);
            let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
            if stem.as_deref() != Some(id.as_str()) {
                tracing::error!("layer {id}: the file {path:?} must be named {id}.json");
                return (id, None);
            }
            let converted = pipeline.convert(doc, &format!("layers:{id}"));
            let ok = report("layer", &id, &converted);
            (id, if ok { converted.result } else { None })
        })
        .collect();

    let mut compiled = BTreeMap::new();
    let mut failed = 0;
    for (id, result) in results {
        match result {
            Some(layer) => {
                compiled.insert(id, layer);
            }
            None => failed += 1,
        }
    }
    (compiled, failed)
}

/// Compile themes in parallel; a failing theme does not stop the others.
pub fn compile_themes(
    documents: &[(PathBuf, Value)],
    ctx: Arc<DesugaringContext>,
) -> Vec<(String, Option<Value>)> {
    let pipeline = prepare_theme(ctx);
    documents
        .par_iter()
        .map(|(path, doc)| {
            let id = document_id(path, doc);
            let converted = pipeline.convert(doc, &format!("themes:{id}"));
            let ok = report("theme", &id, &converted);
            if ok {
                let layer_count = converted
                    .result
                    .as_ref()
                    .and_then(|t| t.get("layers"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                tracing::info!("theme {id}: {layer_count} layers");
            }
            (id, if ok { converted.result } else { None })
        })
        .collect()
}

pub fn run(cli: &Cli) -> Result<Summary> {
    let settings = match &cli.settings {
        Some(path) => CompilerSettings::load(path)
            .with_context(|| format!("Config: Failed to load settings from {path:?}"))?,
        None => CompilerSettings::default(),
    };
    let tag_renderings = match &cli.tag_renderings {
        Some(path) => load_tag_renderings(path)?,
        None => BTreeMap::new(),
    };
    tracing::info!("Loaded {} shared tag renderings", tag_renderings.len());

    let layer_documents = read_documents(&cli.layers)?;
    let raw_layers: BTreeMap<String, Value> = layer_documents
        .iter()
        .map(|(path, doc)| (document_id(path, doc), doc.clone()))
        .collect();
    let layer_ctx = Arc::new(DesugaringContext::new(raw_layers, tag_renderings.clone(), settings.clone()));
    let (compiled_layers, layers_failed) = compile_layers(&layer_documents, layer_ctx);

    let layers_dir = cli.output.join("layers");
    let themes_dir = cli.output.join("themes");
    std::fs::create_dir_all(&layers_dir).with_context(|| format!("IO: Failed to create {layers_dir:?}"))?;
    std::fs::create_dir_all(&themes_dir).with_context(|| format!("IO: Failed to create {themes_dir:?}"))?;
    for (id, layer) in &compiled_layers {
        write_json(&layers_dir.join(format!("{id}.json")), layer)?;
    }
    tracing::info!("Compiled {} layers ({} failed)", compiled_layers.len(), layers_failed);

    let theme_documents: Vec<(PathBuf, Value)> = read_documents(&cli.themes)?;
    let all_themes: Vec<Value> = theme_documents.iter().map(|(_, doc)| doc.clone()).collect();
    let selected: Vec<(PathBuf, Value)> = theme_documents
        .into_iter()
        .filter(|(path, doc)| cli.only.is_empty() || cli.only.contains(&document_id(path, doc)))
        .collect();

    let mut theme_ctx = DesugaringContext::new(compiled_layers.clone(), tag_renderings, settings);
    theme_ctx.public_layers = public_layers(&all_themes);
    let results = compile_themes(&selected, Arc::new(theme_ctx));

    let mut summary = Summary {
        layers_compiled: compiled_layers.len(),
        layers_failed,
        ..Summary::default()
    };
    for (id, theme) in results {
        match theme {
            Some(theme) => {
                write_json(&themes_dir.join(format!("{id}.json")), &theme)?;
                summary.themes_compiled += 1;
            }
            None => summary.themes_failed += 1,
        }
    }
    tracing::info!(
        "Compiled {} themes ({} failed)",
        summary.themes_compiled,
        summary.themes_failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_public_layers_skip_hidden_themes() {
        let themes = vec![
            json!({"id": "a", "layers": ["benches", {"builtin": ["toilets", "shops"]}, {"id": "inline"}]}),
            json!({"id": "b", "hideFromOverview": true, "layers": ["secret"]}),
        ];
        let public: Vec<String> = public_layers(&themes).into_iter().collect();
        assert_eq!(public, vec!["benches", "shops", "toilets"]);
    }

    #[test]
    fn test_tag_renderings_from_object_or_list() {
        let dir = tempfile::tempdir().unwrap();
        let object = dir.path().join("object.json");
        std::fs::write(&object, r#"{"images": {"id": "images", "render": "{image_carousel()}"}}"#).unwrap();
        assert!(load_tag_renderings(&object).unwrap().contains_key("images"));

        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"id": "wikipedia", "render": "{wikipedia()}"}, {"render": "no id"}]"#).unwrap();
        let renderings = load_tag_renderings(&list).unwrap();
        assert_eq!(renderings.keys().collect::<Vec<_>>(), vec!["wikipedia"]);
    }

    #[test]
    fn test_layer_file_name_must_match_id() {
        let documents = vec![(
            PathBuf::from("layers/bench.json"),
            json!({"id": "benches", "source": {"osmTags": "amenity=bench"}}),
        )];
        let (compiled, failed) = compile_layers(&documents, Arc::new(DesugaringContext::default()));
        assert!(compiled.is_empty());
        assert_eq!(failed, 1);
    }
}

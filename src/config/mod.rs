use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs of the theme compiler, read from a YAML or JSON file and merged over
/// the defaults.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompilerSettings {
    /// Layers appended to every theme.
    pub added_by_default: Vec<String>,
    /// Layers managed by the runtime; they get no generated questions,
    /// minimaps or note imports.
    pub privileged_layers: Vec<String>,
    pub default_social_image: String,
    /// Generate `note_import_<layer>` companion layers.
    pub note_imports: bool,
    /// Append a `leftover-questions` rendering to layers with questions.
    pub add_question_box: bool,
}

const ADDED_BY_DEFAULT: [&str; 7] = [
    "selected_element",
    "gps_location",
    "gps_location_history",
    "home_location",
    "gps_track",
    "range",
    "last_click",
];

const PRIVILEGED_ONLY: [&str; 6] = [
    "type_node",
    "note",
    "import_candidate",
    "direction",
    "conflation",
    "split_point",
];

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            added_by_default: ADDED_BY_DEFAULT.iter().map(|s| s.to_string()).collect(),
            privileged_layers: ADDED_BY_DEFAULT
                .iter()
                .chain(PRIVILEGED_ONLY.iter())
                .map(|s| s.to_string())
                .collect(),
            default_social_image: "assets/SocialImage.png".to_string(),
            note_imports: true,
            add_question_box: true,
        }
    }
}

impl CompilerSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn is_privileged(&self, layer_id: &str) -> bool {
        self.privileged_layers.iter().any(|id| id == layer_id)
    }
}

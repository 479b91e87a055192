//! The desugaring pipeline that turns authored layer and theme documents into
//! fully expanded ones.

mod dependencies;
mod layer;
mod merge;
mod substitute;
mod theme;
mod translations;
mod validation;

pub use dependencies::{AddDependencyLayersToTheme, LayerDependency, layer_dependencies};
pub use layer::{
    AddMiniMap, AddQuestionBox, ExpandFilter, ExpandRewrite, ExpandTagRendering, ExpandTitleIcon,
    RewriteLegacyMapRendering, RewriteSpecial, UniqueInlineIds, prepare_layer,
};
pub use merge::merge;
pub use substitute::SubstituteLayer;
pub use theme::{
    AddDefaultLayers, AddImportLayers, AddNodeDatabaseFlag, ApplyOverrideAll, PreparePersonalTheme,
    WarnForUnsubstitutedLayersInTheme, prepare_theme,
};
pub use translations::AddContextToTranslations;
pub use validation::{ValidateLayer, ValidateTheme};

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::CompilerSettings;

/// Read-only registries the pipeline resolves references against.
#[derive(Debug, Clone, Default)]
pub struct DesugaringContext {
    /// Builtin layers by id.
    pub shared_layers: BTreeMap<String, Value>,
    /// Shared tag renderings by id.
    pub tag_renderings: BTreeMap<String, Value>,
    /// Layers shown by at least one theme listed in the overview.
    pub public_layers: BTreeSet<String>,
    pub settings: CompilerSettings,
}

impl DesugaringContext {
    pub fn new(
        shared_layers: BTreeMap<String, Value>,
        tag_renderings: BTreeMap<String, Value>,
        settings: CompilerSettings,
    ) -> Self {
        DesugaringContext {
            shared_layers,
            tag_renderings,
            public_layers: BTreeSet::new(),
            settings,
        }
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = &String> {
        self.shared_layers.keys()
    }
}

/// The `id` of a layer entry, if it is a layer object.
pub(crate) fn layer_id(layer: &Value) -> Option<&str> {
    layer.get("id").and_then(Value::as_str)
}

//! Typed, validated views of fully expanded layer and theme documents.
//!
//! Construction is the last line of defence: anything structurally wrong is
//! reported as a [`ConfigError`] carrying the JSON path of the offending value.

mod layer;
mod layout;
mod tag_rendering;
mod translation;

pub use layer::{FilterConfig, FilterOption, LayerConfig, PresetConfig, SourceConfig};
pub(crate) use layer::layer_list;
pub use layout::LayoutConfig;
pub use tag_rendering::{Freeform, HideInAnswer, Mapping, TagRenderingConfig};
pub use translation::Translation;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tags::{TagsFilter, TagsFilterError, parse_tags_filter};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{context}: {message}")]
    Invalid { context: String, message: String },

    #[error("{context}: {source}")]
    Tag {
        context: String,
        #[source]
        source: TagsFilterError,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(context: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            context: context.to_string(),
            message: message.into(),
        }
    }
}

/// Layer and theme ids: lowercase letters, digits, `_` and `-`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub(crate) fn parse_filter(value: &Value, context: &str) -> Result<TagsFilter, ConfigError> {
    parse_tags_filter(value).map_err(|source| ConfigError::Tag {
        context: context.to_string(),
        source,
    })
}

pub(crate) fn from_json<T: DeserializeOwned>(value: &Value, context: &str) -> Result<T, ConfigError> {
    T::deserialize(value).map_err(|source| ConfigError::Json {
        context: context.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format() {
        assert!(is_valid_id("walls_and_buildings"));
        assert!(is_valid_id("note_import_shops-2"));
        assert!(!is_valid_id("Benches"));
        assert!(!is_valid_id("bench points"));
        assert!(!is_valid_id(""));
    }
}

use serde_json::Value;
use std::collections::BTreeMap;

use super::ConfigError;

/// Text per language code; `*` is the fallback for every language.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Translation {
    pub texts: BTreeMap<String, String>,
}

impl Translation {
    /// A plain string or a `{language: text}` object. Keys starting with `_`
    /// (such as the `_context` annotation) are metadata and skipped.
    pub fn from_json(value: &Value, context: &str) -> Result<Self, ConfigError> {
        match value {
            Value::String(text) => Ok(Translation {
                texts: BTreeMap::from([("*".to_string(), text.clone())]),
            }),
            Value::Object(map) => {
                let mut texts = BTreeMap::new();
                for (language, text) in map {
                    if language.starts_with('_') {
                        continue;
                    }
                    let Some(text) = text.as_str() else {
                        return Err(ConfigError::invalid(
                            &format!("{context}.{language}"),
                            "a translation must be a string",
                        ));
                    };
                    texts.insert(language.clone(), text.to_string());
                }
                Ok(Translation { texts })
            }
            other => Err(ConfigError::invalid(
                context,
                format!("expected a text or a translation object, got {other}"),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.texts.values().all(|t| t.trim().is_empty())
    }

    /// English, the fallback, or whatever comes first.
    pub fn text(&self) -> Option<&str> {
        self.texts
            .get("en")
            .or_else(|| self.texts.get("*"))
            .or_else(|| self.texts.values().next())
            .map(String::as_str)
    }

    pub fn all_texts(&self) -> impl Iterator<Item = &str> {
        self.texts.values().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skips_context_annotation() {
        let t = Translation::from_json(
            &json!({"en": "Bench", "nl": "Zitbank", "_context": "layers:benches.name"}),
            "name",
        )
        .unwrap();
        assert_eq!(t.texts.len(), 2);
        assert_eq!(t.text(), Some("Bench"));
    }

    #[test]
    fn test_plain_string_is_fallback() {
        let t = Translation::from_json(&json!("Bench"), "name").unwrap();
        assert_eq!(t.texts.get("*").map(String::as_str), Some("Bench"));
    }

    #[test]
    fn test_rejects_non_text() {
        assert!(Translation::from_json(&json!({"en": 3}), "name").is_err());
        assert!(Translation::from_json(&json!([1]), "name").is_err());
    }
}

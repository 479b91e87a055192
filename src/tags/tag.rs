use super::Properties;

/// Exact `key=value` match. An empty value means "the key is absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        properties.get(&self.key).map(String::as_str).unwrap_or("") == self.value
    }

    /// The smallest property set for which this tag holds.
    pub fn assignment(&self) -> Properties {
        let mut properties = Properties::new();
        if !self.value.is_empty() {
            properties.insert(self.key.clone(), self.value.clone());
        }
        properties
    }

    pub fn as_human_string(&self) -> String {
        format!("{}={}", self.key, self.value)
    }

    pub fn as_overpass(&self) -> String {
        if self.value.is_empty() {
            format!(r#"[!"{}"]"#, escape(&self.key))
        } else {
            format!(r#"["{}"="{}"]"#, escape(&self.key), escape(&self.value))
        }
    }
}

/// `key:=template`: the value is computed from other properties when written,
/// e.g. `_moved_from:={lat},{lon}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutingTag {
    pub key: String,
    pub template: String,
}

impl SubstitutingTag {
    pub fn new(key: impl Into<String>, template: impl Into<String>) -> Self {
        SubstitutingTag {
            key: key.into(),
            template: template.into(),
        }
    }

    /// Replace every `{key}` in the template by the matching property; unknown
    /// keys become the empty string.
    pub fn substitute(&self, properties: &Properties) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            out.push_str(&rest[..start]);
            let key = &rest[start + 1..start + len];
            out.push_str(properties.get(key).map(String::as_str).unwrap_or(""));
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        out
    }

    pub fn placeholders(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            keys.push(rest[start + 1..start + len].to_string());
            rest = &rest[start + len + 1..];
        }
        keys
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        properties.get(&self.key).map(String::as_str).unwrap_or("") == self.substitute(properties)
    }

    pub fn as_change(&self, existing: &Properties) -> (String, String) {
        (self.key.clone(), self.substitute(existing))
    }

    pub fn as_human_string(&self) -> String {
        format!("{}:={}", self.key, self.template)
    }

    /// Only the key can be prefiltered; the value depends on the object.
    pub fn as_overpass(&self) -> String {
        format!(r#"["{}"]"#, escape(&self.key))
    }
}

pub(crate) fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::props;

    #[test]
    fn test_empty_value_means_absent() {
        let tag = Tag::new("fixme", "");
        assert!(tag.matches(&props(&[("amenity", "bench")])));
        assert!(!tag.matches(&props(&[("fixme", "check")])));
        assert_eq!(tag.as_overpass(), r#"[!"fixme"]"#);
    }

    #[test]
    fn test_overpass_escapes_quotes() {
        let tag = Tag::new("name", "The \"Bench\"");
        assert_eq!(tag.as_overpass(), r#"["name"="The \"Bench\""]"#);
    }

    #[test]
    fn test_substitution() {
        let tag = SubstitutingTag::new("ref:source", "{id}/{version}");
        let existing = props(&[("id", "node/42"), ("version", "3")]);
        assert_eq!(tag.substitute(&existing), "node/42/3");
        assert_eq!(
            tag.as_change(&existing),
            ("ref:source".to_string(), "node/42/3".to_string())
        );
        assert_eq!(tag.placeholders(), vec!["id".to_string(), "version".to_string()]);
    }

    #[test]
    fn test_substituting_match_uses_current_properties() {
        let tag = SubstitutingTag::new("copy", "{name}");
        assert!(tag.matches(&props(&[("name", "x"), ("copy", "x")])));
        assert!(!tag.matches(&props(&[("name", "x"), ("copy", "y")])));
    }
}

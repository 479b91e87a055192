use regex::Regex;

use super::tag::escape;
use super::{Properties, TagsFilter, TagsFilterError};

/// An anchored, dot-all regex that remembers its source text.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, TagsFilterError> {
        let regex = Regex::new(&format!("(?s)^(?:{source})$")).map_err(|e| {
            TagsFilterError::InvalidRegex {
                pattern: source.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Either a literal string or a pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Exact(String),
    Pattern(Pattern),
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == value,
            Matcher::Pattern(pattern) => pattern.is_match(value),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Matcher::Exact(value) => value,
            Matcher::Pattern(pattern) => pattern.source(),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Matcher::Exact(_))
    }
}

/// Pattern match on a value, optionally on the key as well.
///
/// With an exact key the value (empty when absent) is tested; with a key
/// pattern the tag matches when any key/value pair matches both patterns.
/// `invert` flips the outcome in both cases.
#[derive(Debug, Clone, PartialEq)]
pub struct RegexTag {
    pub key: Matcher,
    pub value: Matcher,
    pub invert: bool,
}

impl RegexTag {
    pub fn new(key: Matcher, value: Matcher, invert: bool) -> Self {
        RegexTag { key, value, invert }
    }

    /// `key!=`: the key has some non-empty value.
    pub fn present(key: impl Into<String>) -> Self {
        RegexTag::new(Matcher::Exact(key.into()), Matcher::Exact(String::new()), true)
    }

    pub fn exact_key(&self) -> Option<&str> {
        match &self.key {
            Matcher::Exact(key) => Some(key),
            Matcher::Pattern(_) => None,
        }
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        match &self.key {
            Matcher::Exact(key) => {
                let value = properties.get(key).map(String::as_str).unwrap_or("");
                self.value.matches(value) != self.invert
            }
            Matcher::Pattern(key_pattern) => {
                let hit = properties
                    .iter()
                    .any(|(k, v)| key_pattern.is_match(k) && self.value.matches(v));
                hit != self.invert
            }
        }
    }

    pub fn negated(&self) -> RegexTag {
        RegexTag {
            invert: !self.invert,
            ..self.clone()
        }
    }

    /// A non-inverted literal match is just a [`super::Tag`].
    pub fn simplified(&self) -> TagsFilter {
        match (&self.key, &self.value, self.invert) {
            (Matcher::Exact(key), Matcher::Exact(value), false) => TagsFilter::tag(key, value),
            _ => TagsFilter::Regex(self.clone()),
        }
    }

    pub fn is_usable_as_answer(&self) -> bool {
        !self.invert && self.key.is_exact() && self.value.is_exact()
    }

    pub fn as_change(&self) -> Result<(String, String), TagsFilterError> {
        match (&self.key, &self.value, self.invert) {
            (Matcher::Exact(key), Matcher::Exact(value), false) => Ok((key.clone(), value.clone())),
            _ => Err(TagsFilterError::UnsupportedOperation {
                filter: self.as_human_string(),
                operation: "as_change",
                reason: "only a literal, non-negated match can be written".to_string(),
            }),
        }
    }

    pub fn as_human_string(&self) -> String {
        match (&self.key, &self.value) {
            (Matcher::Exact(key), Matcher::Exact(value)) if value.is_empty() && self.invert => {
                format!("{key}~*")
            }
            (Matcher::Exact(key), Matcher::Exact(value)) => {
                let op = if self.invert { "!=" } else { "=" };
                format!("{key}{op}{value}")
            }
            (Matcher::Exact(key), Matcher::Pattern(value)) => {
                let op = if self.invert { "!~" } else { "~" };
                format!("{key}{op}{}", value.source())
            }
            (Matcher::Pattern(key), value) => {
                let op = if self.invert { "!~~" } else { "~~" };
                format!("{}{op}{}", key.source(), value.as_str())
            }
        }
    }

    pub fn as_overpass(&self) -> String {
        match (&self.key, &self.value) {
            (Matcher::Exact(key), Matcher::Exact(value)) => match (value.is_empty(), self.invert) {
                (true, true) => format!(r#"["{}"]"#, escape(key)),
                (true, false) => format!(r#"[!"{}"]"#, escape(key)),
                (false, true) => format!(r#"["{}"!="{}"]"#, escape(key), escape(value)),
                (false, false) => format!(r#"["{}"="{}"]"#, escape(key), escape(value)),
            },
            (Matcher::Exact(key), Matcher::Pattern(value)) => {
                let op = if self.invert { "!~" } else { "~" };
                format!(r#"["{}"{op}"^({})$"]"#, escape(key), escape(value.source()))
            }
            // Overpass cannot negate a key regex; the empty fragment keeps
            // the query a superset.
            (Matcher::Pattern(_), _) if self.invert => String::new(),
            (Matcher::Pattern(key), value) => {
                let value = match value {
                    Matcher::Exact(v) => regex::escape(v),
                    Matcher::Pattern(p) => p.source().to_string(),
                };
                format!(r#"[~"^({})$"~"^({})$"]"#, escape(key.source()), escape(&value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::props;

    fn pattern(s: &str) -> Matcher {
        Matcher::Pattern(Pattern::new(s).unwrap())
    }

    #[test]
    fn test_pattern_is_anchored() {
        let tag = RegexTag::new(Matcher::Exact("highway".into()), pattern("primary|secondary"), false);
        assert!(tag.matches(&props(&[("highway", "primary")])));
        assert!(!tag.matches(&props(&[("highway", "primary_link")])));
    }

    #[test]
    fn test_inverted_matches_absent_key() {
        let tag = RegexTag::new(Matcher::Exact("access".into()), Matcher::Exact("private".into()), true);
        assert!(tag.matches(&props(&[])));
        assert!(tag.matches(&props(&[("access", "yes")])));
        assert!(!tag.matches(&props(&[("access", "private")])));
    }

    #[test]
    fn test_key_pattern_matches_any_key() {
        let tag = RegexTag::new(pattern("name:.*"), pattern(".+"), false);
        assert!(tag.matches(&props(&[("name:nl", "Bank")])));
        assert!(!tag.matches(&props(&[("name", "Bank")])));
        assert!(tag.negated().matches(&props(&[("name", "Bank")])));
    }

    #[test]
    fn test_present() {
        let tag = RegexTag::present("name");
        assert!(tag.matches(&props(&[("name", "x")])));
        assert!(!tag.matches(&props(&[])));
        assert_eq!(tag.as_human_string(), "name~*");
        assert_eq!(tag.as_overpass(), r#"["name"]"#);
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        assert!(matches!(
            Pattern::new("(unclosed"),
            Err(TagsFilterError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_simplified_literal_becomes_tag() {
        let tag = RegexTag::new(Matcher::Exact("a".into()), Matcher::Exact("b".into()), false);
        assert_eq!(tag.simplified(), TagsFilter::tag("a", "b"));
    }

    #[test]
    fn test_overpass_of_pattern() {
        let tag = RegexTag::new(Matcher::Exact("shop".into()), pattern("bakery|pastry"), true);
        assert_eq!(tag.as_overpass(), r#"["shop"!~"^(bakery|pastry)$"]"#);
    }
}

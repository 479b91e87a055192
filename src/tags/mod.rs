//! Boolean expressions over OSM tags.
//!
//! A [`TagsFilter`] is an immutable tree. Leaves test a single key (or, for the
//! multi-key regex form, every key matching a pattern); inner nodes combine
//! children with `and` / `or`. Every operation returns fresh values; nothing
//! here mutates a filter in place.
//!
//! Syntax of the string leaves:
//!   key=value               - exact match
//!   key=                    - key absent
//!   key!=value              - absent or any other value
//!   key!=  /  key~*         - key present
//!   key~regex, key!~regex   - (negated) anchored regex match on the value
//!   keyre~~valuere          - some key matching `keyre` has a value matching `valuere`
//!   key:=template           - substituting tag, `{other}` filled in when written
//!   key<n, key<=n, ...      - numeric comparison

mod comparing;
mod lexer;
mod optimize;
mod regex_tag;
mod tag;
mod tag_utils;

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub use comparing::{CompareOp, ComparingTag};
pub use lexer::parse_tag_string;
pub use optimize::{MAX_OPTIMIZE_DEPTH, MAX_OPTIMIZE_PASSES};
pub use regex_tag::{Matcher, Pattern, RegexTag};
pub use tag::{SubstitutingTag, Tag};
pub use tag_utils::{
    flatten_multi_answer, is_opposite, negate_leaf, parse_tags_filter, sort_filters, split_keys,
};

/// Key/value properties of a single OSM object.
pub type Properties = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TagsFilterError {
    #[error("'{filter}' does not support {operation}: {reason}")]
    UnsupportedOperation {
        filter: String,
        operation: &'static str,
        reason: String,
    },

    #[error("could not parse tag expression '{input}': {message}")]
    Parse { input: String, message: String },

    #[error("invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// A boolean expression over tags.
#[derive(Debug, Clone, PartialEq)]
pub enum TagsFilter {
    Tag(Tag),
    Substituting(SubstitutingTag),
    Regex(RegexTag),
    Comparing(ComparingTag),
    And(Vec<TagsFilter>),
    Or(Vec<TagsFilter>),
}

/// Result of [`TagsFilter::optimize`]: either a simplified tree or one of the
/// absorbing constants.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimized {
    True,
    False,
    Filter(TagsFilter),
}

impl Optimized {
    pub fn from_bool(value: bool) -> Self {
        if value { Optimized::True } else { Optimized::False }
    }

    pub fn matches_properties(&self, properties: &Properties) -> bool {
        match self {
            Optimized::True => true,
            Optimized::False => false,
            Optimized::Filter(filter) => filter.matches_properties(properties),
        }
    }

    /// The constants become `And([])` and `Or([])`.
    pub fn into_filter(self) -> TagsFilter {
        match self {
            Optimized::True => TagsFilter::And(Vec::new()),
            Optimized::False => TagsFilter::Or(Vec::new()),
            Optimized::Filter(filter) => filter,
        }
    }

    pub fn as_filter(&self) -> Option<&TagsFilter> {
        match self {
            Optimized::Filter(filter) => Some(filter),
            _ => None,
        }
    }
}

impl TagsFilter {
    pub fn tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagsFilter::Tag(Tag::new(key, value))
    }

    pub fn and(children: Vec<TagsFilter>) -> Self {
        TagsFilter::And(children)
    }

    pub fn or(children: Vec<TagsFilter>) -> Self {
        TagsFilter::Or(children)
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, TagsFilter::And(_) | TagsFilter::Or(_))
    }

    pub fn matches_properties(&self, properties: &Properties) -> bool {
        match self {
            TagsFilter::Tag(tag) => tag.matches(properties),
            TagsFilter::Substituting(tag) => tag.matches(properties),
            TagsFilter::Regex(tag) => tag.matches(properties),
            TagsFilter::Comparing(tag) => tag.matches(properties),
            TagsFilter::And(children) => children.iter().all(|c| c.matches_properties(properties)),
            TagsFilter::Or(children) => children.iter().any(|c| c.matches_properties(properties)),
        }
    }

    pub fn as_human_string(&self) -> String {
        match self {
            TagsFilter::Tag(tag) => tag.as_human_string(),
            TagsFilter::Substituting(tag) => tag.as_human_string(),
            TagsFilter::Regex(tag) => tag.as_human_string(),
            TagsFilter::Comparing(tag) => tag.as_human_string(),
            TagsFilter::And(children) => children
                .iter()
                .map(|c| match c {
                    TagsFilter::Or(_) => format!("({})", c.as_human_string()),
                    _ => c.as_human_string(),
                })
                .collect::<Vec<_>>()
                .join("&"),
            TagsFilter::Or(children) => children
                .iter()
                .map(|c| c.as_human_string())
                .collect::<Vec<_>>()
                .join("|"),
        }
    }

    /// Overpass query fragments. Each returned string is one alternative; the
    /// caller must union the alternatives, never concatenate them.
    pub fn as_overpass(&self) -> Vec<String> {
        match self {
            TagsFilter::Tag(tag) => vec![tag.as_overpass()],
            TagsFilter::Substituting(tag) => vec![tag.as_overpass()],
            TagsFilter::Regex(tag) => vec![tag.as_overpass()],
            TagsFilter::Comparing(tag) => vec![tag.as_overpass()],
            TagsFilter::And(children) => {
                let mut alternatives = vec![String::new()];
                for child in children {
                    let child_alternatives = child.as_overpass();
                    alternatives = alternatives
                        .iter()
                        .flat_map(|prefix| {
                            child_alternatives
                                .iter()
                                .map(move |suffix| format!("{prefix}{suffix}"))
                        })
                        .collect();
                }
                alternatives
            }
            TagsFilter::Or(children) => children.iter().flat_map(|c| c.as_overpass()).collect(),
        }
    }

    /// The key/value pairs to upload when this filter is chosen as an answer.
    pub fn as_change(&self, existing: &Properties) -> Result<Vec<(String, String)>, TagsFilterError> {
        match self {
            TagsFilter::Tag(tag) => Ok(vec![(tag.key.clone(), tag.value.clone())]),
            TagsFilter::Substituting(tag) => Ok(vec![tag.as_change(existing)]),
            TagsFilter::Regex(tag) => tag.as_change().map(|change| vec![change]),
            TagsFilter::Comparing(tag) => Err(TagsFilterError::UnsupportedOperation {
                filter: tag.as_human_string(),
                operation: "as_change",
                reason: "a comparison has no single value to write".to_string(),
            }),
            TagsFilter::And(children) => {
                let mut changes = Vec::new();
                for child in children {
                    changes.extend(child.as_change(existing)?);
                }
                Ok(changes)
            }
            TagsFilter::Or(children) if children.len() == 1 => children[0].as_change(existing),
            TagsFilter::Or(_) => Err(TagsFilterError::UnsupportedOperation {
                filter: self.as_human_string(),
                operation: "as_change",
                reason: "it is ambiguous which branch of an 'or' should be written".to_string(),
            }),
        }
    }

    /// `a.shadows(b)`: whenever `a` matches, `b` matches too. Conservative:
    /// `false` means "could not prove it", not "does not hold".
    pub fn shadows(&self, other: &TagsFilter) -> bool {
        optimize::implies(self, other)
    }

    pub fn is_usable_as_answer(&self) -> bool {
        match self {
            TagsFilter::Tag(_) | TagsFilter::Substituting(_) => true,
            TagsFilter::Regex(tag) => tag.is_usable_as_answer(),
            TagsFilter::Comparing(_) => false,
            TagsFilter::And(children) => children.iter().all(|c| c.is_usable_as_answer()),
            TagsFilter::Or(children) => children.len() == 1 && children[0].is_usable_as_answer(),
        }
    }

    /// True when the filter matches objects without any tags, i.e. it would
    /// select almost everything.
    pub fn is_negative(&self) -> bool {
        match self {
            TagsFilter::Tag(tag) => tag.value.is_empty(),
            TagsFilter::Substituting(_) | TagsFilter::Comparing(_) => false,
            TagsFilter::Regex(tag) => tag.matches(&Properties::new()),
            TagsFilter::And(children) => children.iter().all(|c| c.is_negative()),
            TagsFilter::Or(children) => children.iter().any(|c| c.is_negative()),
        }
    }

    /// Whether an object without any tags matches.
    pub fn matches_empty(&self) -> bool {
        self.matches_properties(&Properties::new())
    }

    pub fn optimize(&self) -> Optimized {
        optimize::optimize(self)
    }

    /// Keys this filter reads, or `None` when a key regex makes the set open.
    pub fn used_keys(&self) -> Option<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let mut open = false;
        self.visit(&mut |filter| match filter {
            TagsFilter::Tag(tag) => {
                keys.insert(tag.key.clone());
            }
            TagsFilter::Substituting(tag) => {
                keys.insert(tag.key.clone());
                keys.extend(tag.placeholders());
            }
            TagsFilter::Regex(tag) => match &tag.key {
                Matcher::Exact(key) => {
                    keys.insert(key.clone());
                }
                Matcher::Pattern(_) => open = true,
            },
            TagsFilter::Comparing(tag) => {
                keys.insert(tag.key.clone());
            }
            TagsFilter::And(_) | TagsFilter::Or(_) => {}
        });
        if open { None } else { Some(keys) }
    }

    /// Depth-first, parents before children.
    pub fn visit(&self, f: &mut impl FnMut(&TagsFilter)) {
        f(self);
        if let TagsFilter::And(children) | TagsFilter::Or(children) = self {
            for child in children {
                child.visit(f);
            }
        }
    }

    /// The JSON form accepted by [`parse_tags_filter`].
    pub fn to_json(&self) -> Value {
        match self {
            TagsFilter::And(children) => {
                serde_json::json!({ "and": children.iter().map(|c| c.to_json()).collect::<Vec<_>>() })
            }
            TagsFilter::Or(children) => {
                serde_json::json!({ "or": children.iter().map(|c| c.to_json()).collect::<Vec<_>>() })
            }
            leaf => Value::String(leaf.as_human_string()),
        }
    }

    pub(crate) fn sort_key(&self) -> (u8, String) {
        let rank = match self {
            TagsFilter::Tag(_) => 0,
            TagsFilter::Substituting(_) => 1,
            TagsFilter::Regex(_) => 2,
            TagsFilter::Comparing(_) => 3,
            TagsFilter::And(_) => 4,
            TagsFilter::Or(_) => 5,
        };
        (rank, self.as_human_string())
    }
}

impl fmt::Display for TagsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_human_string())
    }
}

#[cfg(test)]
pub(crate) fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

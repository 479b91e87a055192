//! Parsing of loosely-typed JSON tag specifications and canonicalization helpers.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{Properties, TagsFilter, TagsFilterError, parse_tag_string};

/// Parse `"key=value"` strings and `{"and": [...]}` / `{"or": [...]}` objects,
/// recursively.
pub fn parse_tags_filter(json: &Value) -> Result<TagsFilter, TagsFilterError> {
    match json {
        Value::String(s) => parse_tag_string(s),
        Value::Object(map) => {
            let (combinator, children) = match (map.get("and"), map.get("or")) {
                (Some(children), None) => ("and", children),
                (None, Some(children)) => ("or", children),
                _ => {
                    return Err(TagsFilterError::Parse {
                        input: json.to_string(),
                        message: "an object must have exactly one of 'and' or 'or'".to_string(),
                    });
                }
            };
            if map.len() != 1 {
                let extra: Vec<&str> = map
                    .keys()
                    .map(String::as_str)
                    .filter(|k| *k != combinator)
                    .collect();
                return Err(TagsFilterError::Parse {
                    input: json.to_string(),
                    message: format!("unexpected keys next to '{combinator}': {}", extra.join(", ")),
                });
            }
            let Value::Array(children) = children else {
                return Err(TagsFilterError::Parse {
                    input: json.to_string(),
                    message: format!("'{combinator}' must be a list"),
                });
            };
            let parsed = children
                .iter()
                .map(parse_tags_filter)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if combinator == "and" {
                TagsFilter::And(parsed)
            } else {
                TagsFilter::Or(parsed)
            })
        }
        other => Err(TagsFilterError::Parse {
            input: other.to_string(),
            message: "expected a tag string or an object with 'and' or 'or'".to_string(),
        }),
    }
}

/// The exact negation of a leaf, when one can be expressed.
pub fn negate_leaf(filter: &TagsFilter) -> Option<TagsFilter> {
    match filter {
        TagsFilter::Tag(tag) => Some(TagsFilter::Regex(super::RegexTag::new(
            super::Matcher::Exact(tag.key.clone()),
            super::Matcher::Exact(tag.value.clone()),
            true,
        ))),
        TagsFilter::Regex(tag) => Some(tag.negated().simplified()),
        _ => None,
    }
}

/// Whether `a` and `b` are each other's exact negation, e.g. `k=v` and `k!=v`.
pub fn is_opposite(a: &TagsFilter, b: &TagsFilter) -> bool {
    negate_leaf(a).is_some_and(|not_a| &not_a == b)
}

/// The key/value pairs of several answers, grouped per key in first-seen order
/// of values.
pub fn split_keys(filters: &[TagsFilter]) -> Result<BTreeMap<String, Vec<String>>, TagsFilterError> {
    let empty = Properties::new();
    let mut per_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for filter in filters {
        for (key, value) in filter.as_change(&empty)? {
            let values = per_key.entry(key).or_default();
            if !value.is_empty() && !values.contains(&value) {
                values.push(value);
            }
        }
    }
    Ok(per_key)
}

/// Combine the answers of a multi-answer question into one filter: values of
/// the same key are joined with `;`.
pub fn flatten_multi_answer(filters: &[TagsFilter]) -> Result<TagsFilter, TagsFilterError> {
    let per_key = split_keys(filters)?;
    let tags = per_key
        .into_iter()
        .map(|(key, values)| TagsFilter::tag(key, values.join(";")))
        .collect();
    Ok(TagsFilter::And(tags))
}

/// Deterministic order: leaves before combinators, then by human string.
pub fn sort_filters(filters: &mut [TagsFilter]) {
    filters.sort_by_cached_key(|f| f.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_nested() {
        let filter = parse_tags_filter(&json!({
            "and": ["amenity=bench", {"or": ["backrest=yes", "backrest="]}]
        }))
        .unwrap();
        assert_eq!(
            filter,
            TagsFilter::And(vec![
                TagsFilter::tag("amenity", "bench"),
                TagsFilter::Or(vec![
                    TagsFilter::tag("backrest", "yes"),
                    TagsFilter::tag("backrest", ""),
                ]),
            ])
        );
    }

    #[test]
    fn test_parse_rejects_malformed_objects() {
        assert!(parse_tags_filter(&json!({"and": ["a=b"], "or": []})).is_err());
        assert!(parse_tags_filter(&json!({"and": "a=b"})).is_err());
        assert!(parse_tags_filter(&json!({"not": ["a=b"]})).is_err());
        assert!(parse_tags_filter(&json!(42)).is_err());
        assert!(parse_tags_filter(&json!({"and": ["a=b"], "extra": 1})).is_err());
    }

    #[test]
    fn test_flatten_multi_answer() {
        let answers = vec![
            parse_tag_string("cuisine=pizza").unwrap(),
            parse_tag_string("cuisine=pasta").unwrap(),
            TagsFilter::And(vec![
                parse_tag_string("cuisine=pizza").unwrap(),
                parse_tag_string("diet:vegan=yes").unwrap(),
            ]),
        ];
        assert_eq!(
            flatten_multi_answer(&answers).unwrap(),
            TagsFilter::And(vec![
                TagsFilter::tag("cuisine", "pizza;pasta"),
                TagsFilter::tag("diet:vegan", "yes"),
            ])
        );
    }

    #[test]
    fn test_flatten_rejects_non_answers() {
        let answers = vec![parse_tag_string("cuisine~pi.*").unwrap()];
        assert!(flatten_multi_answer(&answers).is_err());
    }

    #[test]
    fn test_opposites() {
        let a = parse_tag_string("k=v").unwrap();
        let b = parse_tag_string("k!=v").unwrap();
        assert!(is_opposite(&a, &b));
        assert!(is_opposite(&b, &a));
        assert!(!is_opposite(&a, &parse_tag_string("k!=w").unwrap()));
    }

    #[test]
    fn test_sort_is_deterministic() {
        let mut filters = vec![
            TagsFilter::Or(vec![]),
            parse_tag_string("b=1").unwrap(),
            parse_tag_string("a~x").unwrap(),
            parse_tag_string("a=1").unwrap(),
        ];
        sort_filters(&mut filters);
        let rendered: Vec<String> = filters.iter().map(|f| f.as_human_string()).collect();
        assert_eq!(rendered, vec!["a=1", "b=1", "a~x", ""]);
    }
}

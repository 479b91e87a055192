use serde::Deserialize;
use serde_json::Value;

use super::{ConfigError, Translation, from_json, parse_filter};
use crate::tags::{TagsFilter, parse_tag_string};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagRenderingJson {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    question: Option<Value>,
    #[serde(default)]
    render: Option<Value>,
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    freeform: Option<FreeformJson>,
    #[serde(default)]
    multi_answer: bool,
    #[serde(default)]
    mappings: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FreeformJson {
    key: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    add_extra_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingJson {
    #[serde(rename = "if")]
    if_tags: Value,
    then: Value,
    #[serde(default)]
    if_not: Option<Value>,
    #[serde(default)]
    hide_in_answer: Option<Value>,
    #[serde(default)]
    add_extra_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HideInAnswer {
    Never,
    Always,
    /// Hidden when the feature matches.
    When(TagsFilter),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub if_tags: TagsFilter,
    pub if_not: Option<TagsFilter>,
    pub then: Translation,
    pub hide_in_answer: HideInAnswer,
    pub add_extra_tags: Vec<TagsFilter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Freeform {
    pub key: String,
    pub kind: String,
    pub add_extra_tags: Vec<TagsFilter>,
}

/// One question/answer unit of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRenderingConfig {
    pub id: String,
    pub labels: Vec<String>,
    pub group: Option<String>,
    pub question: Option<Translation>,
    pub render: Option<Translation>,
    pub condition: Option<TagsFilter>,
    pub freeform: Option<Freeform>,
    pub multi_answer: bool,
    pub mappings: Vec<Mapping>,
}

fn parse_extra_tags(tags: &[String], context: &str) -> Result<Vec<TagsFilter>, ConfigError> {
    tags.iter()
        .enumerate()
        .map(|(i, tag)| {
            parse_tag_string(tag).map_err(|source| ConfigError::Tag {
                context: format!("{context}.addExtraTags[{i}]"),
                source,
            })
        })
        .collect()
}

impl Mapping {
    fn from_json(value: &Value, context: &str) -> Result<Self, ConfigError> {
        let raw: MappingJson = from_json(value, context)?;
        let hide_in_answer = match &raw.hide_in_answer {
            None | Some(Value::Bool(false)) => HideInAnswer::Never,
            Some(Value::Bool(true)) => HideInAnswer::Always,
            Some(tags) => HideInAnswer::When(parse_filter(tags, &format!("{context}.hideInAnswer"))?),
        };
        Ok(Mapping {
            if_tags: parse_filter(&raw.if_tags, &format!("{context}.if"))?,
            if_not: raw
                .if_not
                .as_ref()
                .map(|tags| parse_filter(tags, &format!("{context}.ifnot")))
                .transpose()?,
            then: Translation::from_json(&raw.then, &format!("{context}.then"))?,
            hide_in_answer,
            add_extra_tags: parse_extra_tags(&raw.add_extra_tags, context)?,
        })
    }

    pub fn is_hidden(&self) -> bool {
        !matches!(self.hide_in_answer, HideInAnswer::Never)
    }
}

impl TagRenderingConfig {
    pub fn from_json(value: &Value, context: &str) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::invalid(
                context,
                format!("tag rendering {value} has not been expanded into an object"),
            ));
        }
        let raw: TagRenderingJson = from_json(value, context)?;

        let translation = |field: &Option<Value>, name: &str| {
            field
                .as_ref()
                .map(|v| Translation::from_json(v, &format!("{context}.{name}")))
                .transpose()
        };
        let question = translation(&raw.question, "question")?;
        let render = translation(&raw.render, "render")?;

        let freeform = match raw.freeform {
            Some(freeform) => {
                if render.is_none() {
                    return Err(ConfigError::invalid(
                        context,
                        format!("freeform key '{}' is given but there is no render text to show it", freeform.key),
                    ));
                }
                Some(Freeform {
                    add_extra_tags: parse_extra_tags(&freeform.add_extra_tags, &format!("{context}.freeform"))?,
                    key: freeform.key,
                    kind: freeform.kind.unwrap_or_else(|| "string".to_string()),
                })
            }
            None => None,
        };

        let mappings = raw
            .mappings
            .iter()
            .enumerate()
            .map(|(i, m)| Mapping::from_json(m, &format!("{context}.mappings[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;

        if question.is_some() && freeform.is_none() && mappings.is_empty() {
            return Err(ConfigError::invalid(
                context,
                "a question is given but there is neither a freeform key nor a mapping to answer it",
            ));
        }

        Ok(TagRenderingConfig {
            id: raw.id.unwrap_or_default(),
            labels: raw.labels,
            group: raw.group,
            question,
            render,
            condition: raw
                .condition
                .as_ref()
                .map(|c| parse_filter(c, &format!("{context}.condition")))
                .transpose()?,
            freeform,
            multi_answer: raw.multi_answer,
            mappings,
        })
    }

    pub fn is_question(&self) -> bool {
        self.question.is_some()
    }

    /// The render text and every mapping text, in all languages.
    pub fn shown_texts(&self) -> Vec<&str> {
        let mut texts: Vec<&str> = self.render.iter().flat_map(|r| r.all_texts()).collect();
        for mapping in &self.mappings {
            texts.extend(mapping.then.all_texts());
        }
        texts
    }
}

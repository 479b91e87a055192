//! Lexer/parser for single tag expressions such as `amenity=bench`.

use winnow::combinator::alt;
use winnow::prelude::*;
use winnow::token::take_while;

use super::{
    CompareOp, ComparingTag, Matcher, Pattern, RegexTag, SubstitutingTag, TagsFilter,
    TagsFilterError,
};

/// Operator between key and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,          // =
    Ne,          // !=
    Match,       // ~
    NotMatch,    // !~
    KeyMatch,    // ~~
    NotKeyMatch, // !~~
    Substitute,  // :=
    Compare(CompareOp),
}

type PResult<T> = Result<T, winnow::error::ErrMode<winnow::error::ContextError>>;

/// Everything up to the first operator character. A trailing `:` is split off
/// later, as `key:=` is the substitution operator.
fn lex_key<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., |c: char| !matches!(c, '=' | '!' | '~' | '<' | '>')).parse_next(input)
}

fn lex_operator(input: &mut &str) -> PResult<Operator> {
    alt((
        // Longest operators first
        "!~~".value(Operator::NotKeyMatch),
        "~~".value(Operator::KeyMatch),
        "!~".value(Operator::NotMatch),
        "!=".value(Operator::Ne),
        "<=".value(Operator::Compare(CompareOp::Le)),
        ">=".value(Operator::Compare(CompareOp::Ge)),
        "~".value(Operator::Match),
        "=".value(Operator::Eq),
        "<".value(Operator::Compare(CompareOp::Lt)),
        ">".value(Operator::Compare(CompareOp::Gt)),
    ))
    .parse_next(input)
}

fn parse_error(input: &str, message: impl Into<String>) -> TagsFilterError {
    TagsFilterError::Parse {
        input: input.to_string(),
        message: message.into(),
    }
}

/// Parse one tag expression into a leaf filter.
pub fn parse_tag_string(input: &str) -> Result<TagsFilter, TagsFilterError> {
    let trimmed = input.trim();
    let mut remaining = trimmed;

    let key = lex_key(&mut remaining).map_err(|_| parse_error(input, "missing key"))?;
    let op = lex_operator(&mut remaining).map_err(|_| {
        parse_error(
            input,
            "expected one of =, !=, ~, !~, ~~, :=, <, <=, >, >= after the key",
        )
    })?;
    let value = remaining;

    let (key, op) = match key.strip_suffix(':') {
        Some(stripped) if op == Operator::Eq => (stripped, Operator::Substitute),
        _ => (key, op),
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(parse_error(input, "missing key"));
    }
    if key.contains('&') || (op == Operator::Eq && value.contains('&')) {
        return Err(parse_error(
            input,
            "'&' is not an operator; use {\"and\": [...]} to combine tags",
        ));
    }

    let exact = |s: &str| Matcher::Exact(s.to_string());
    let pattern = |s: &str| Pattern::new(s).map(Matcher::Pattern);

    let filter = match op {
        Operator::Eq if value == "*" => TagsFilter::Regex(RegexTag::present(key)),
        Operator::Eq => TagsFilter::tag(key, value),
        Operator::Ne => TagsFilter::Regex(RegexTag::new(exact(key), exact(value), true)),
        Operator::Match if value == "*" => TagsFilter::Regex(RegexTag::present(key)),
        Operator::Match => TagsFilter::Regex(RegexTag::new(exact(key), pattern(value)?, false)),
        Operator::NotMatch => TagsFilter::Regex(RegexTag::new(exact(key), pattern(value)?, true)),
        Operator::KeyMatch => TagsFilter::Regex(RegexTag::new(pattern(key)?, pattern(value)?, false)),
        Operator::NotKeyMatch => {
            TagsFilter::Regex(RegexTag::new(pattern(key)?, pattern(value)?, true))
        }
        Operator::Substitute => TagsFilter::Substituting(SubstitutingTag::new(key, value)),
        Operator::Compare(op) => {
            let number: f64 = value
                .trim()
                .parse()
                .map_err(|_| parse_error(input, format!("'{value}' is not a number")))?;
            TagsFilter::Comparing(ComparingTag::new(key, op, number))
        }
    };
    Ok(filter)
}

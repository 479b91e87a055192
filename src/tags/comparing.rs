use std::fmt;

use super::Properties;
use super::tag::escape;
use crate::utils::parse_numeric;

/// Numeric comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Lt => write!(f, "<"),
            CompareOp::Le => write!(f, "<="),
            CompareOp::Gt => write!(f, ">"),
            CompareOp::Ge => write!(f, ">="),
        }
    }
}

impl CompareOp {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// `key<n`, `key>=n`, ...: holds when the value parses as a number (leading
/// number of values such as `50 mph`) and satisfies the comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparingTag {
    pub key: String,
    pub op: CompareOp,
    pub value: f64,
}

impl ComparingTag {
    pub fn new(key: impl Into<String>, op: CompareOp, value: f64) -> Self {
        ComparingTag {
            key: key.into(),
            op,
            value,
        }
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        properties
            .get(&self.key)
            .and_then(|v| parse_numeric(v))
            .is_some_and(|actual| self.op.apply(actual, self.value))
    }

    /// Whether every value accepted by `self` is accepted by `other`.
    pub fn implies(&self, other: &ComparingTag) -> bool {
        if self.key != other.key {
            return false;
        }
        let (a, b) = (self.value, other.value);
        match (self.op, other.op) {
            (CompareOp::Gt, CompareOp::Gt | CompareOp::Ge) => a >= b,
            (CompareOp::Ge, CompareOp::Gt) => a > b,
            (CompareOp::Ge, CompareOp::Ge) => a >= b,
            (CompareOp::Lt, CompareOp::Lt | CompareOp::Le) => a <= b,
            (CompareOp::Le, CompareOp::Lt) => a < b,
            (CompareOp::Le, CompareOp::Le) => a <= b,
            _ => false,
        }
    }

    pub fn as_human_string(&self) -> String {
        format!("{}{}{}", self.key, self.op, self.value)
    }

    /// Only key presence can be prefiltered.
    pub fn as_overpass(&self) -> String {
        format!(r#"["{}"]"#, escape(&self.key))
    }
}

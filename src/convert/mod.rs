//! Named, composable transformations over configuration documents.
//!
//! A [`Conversion`] never mutates its input. It reports problems as data in
//! [`Converted`]: any error makes the result unusable, warnings and
//! information are advisory.

mod combinators;

pub use combinators::{Bypass, Concat, Each, Fuse, On, Pass, SetDefault};

use anyhow::anyhow;
use serde_json::Value;

/// Errors, warnings and information collected while converting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub information: Vec<String>,
}

impl Diagnostics {
    pub fn error(&mut self, context: &str, message: impl AsRef<str>) {
        self.errors.push(format!("{context}: {}", message.as_ref()));
    }

    pub fn warn(&mut self, context: &str, message: impl AsRef<str>) {
        self.warnings.push(format!("{context}: {}", message.as_ref()));
    }

    pub fn info(&mut self, context: &str, message: impl AsRef<str>) {
        self.information.push(format!("{context}: {}", message.as_ref()));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.information.extend(other.information);
    }

    /// Take over the diagnostics of a nested conversion and hand back its result.
    pub fn absorb<T>(&mut self, converted: Converted<T>) -> Option<T> {
        let (result, diagnostics) = converted.into_parts();
        self.extend(diagnostics);
        result
    }

    /// Wrap up: the result is dropped when any error was recorded.
    pub fn finish<T>(self, result: T) -> Converted<T> {
        let result = if self.has_errors() { None } else { Some(result) };
        Converted::from_parts(result, self)
    }
}

/// Outcome of a conversion step.
#[derive(Debug, Clone, PartialEq)]
pub struct Converted<T> {
    pub result: Option<T>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub information: Vec<String>,
}

impl<T> Converted<T> {
    pub fn success(result: T) -> Self {
        Converted::from_parts(Some(result), Diagnostics::default())
    }

    pub fn failure(context: &str, message: impl AsRef<str>) -> Self {
        let mut diagnostics = Diagnostics::default();
        diagnostics.error(context, message);
        Converted::from_parts(None, diagnostics)
    }

    pub fn from_parts(result: Option<T>, diagnostics: Diagnostics) -> Self {
        Converted {
            result,
            errors: diagnostics.errors,
            warnings: diagnostics.warnings,
            information: diagnostics.information,
        }
    }

    pub fn into_parts(self) -> (Option<T>, Diagnostics) {
        (
            self.result,
            Diagnostics {
                errors: self.errors,
                warnings: self.warnings,
                information: self.information,
            },
        )
    }

    /// True when there is a result and no error.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.result.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Converted<U> {
        let (result, diagnostics) = self.into_parts();
        Converted::from_parts(result.map(f), diagnostics)
    }
}

/// A named transformation from `I` to `O`.
pub trait Conversion<I, O = I>: Send + Sync {
    fn name(&self) -> &str;

    fn doc(&self) -> &str {
        ""
    }

    /// The top-level attributes this step may add, change or remove.
    fn modified_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    fn convert(&self, input: &I, context: &str) -> Converted<O>;

    /// Run the conversion and fold every error into one `anyhow::Error`.
    fn convert_strict(&self, input: &I, context: &str) -> anyhow::Result<O> {
        let converted = self.convert(input, context);
        if !converted.errors.is_empty() {
            return Err(anyhow!(converted.errors.join("\n")));
        }
        converted
            .result
            .ok_or_else(|| anyhow!("{context}: {} did not produce a result", self.name()))
    }
}

/// A boxed document-to-document step.
pub type Step = Box<dyn Conversion<Value>>;

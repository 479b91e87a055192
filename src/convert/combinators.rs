use serde_json::Value;
use tracing::debug;

use super::{Conversion, Converted, Diagnostics, Step};

/// Runs steps in order, feeding each the output of the previous one. Stops at
/// the first step that reports an error and names that step in its errors.
pub struct Fuse {
    name: String,
    doc: String,
    steps: Vec<Step>,
}

impl Fuse {
    pub fn new(name: impl Into<String>, doc: impl Into<String>, steps: Vec<Step>) -> Self {
        Fuse {
            name: name.into(),
            doc: doc.into(),
            steps,
        }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }
}

impl Conversion<Value> for Fuse {
    fn name(&self) -> &str {
        &self.name
    }

    fn doc(&self) -> &str {
        &self.doc
    }

    fn modified_attributes(&self) -> Vec<String> {
        let mut attributes: Vec<String> = Vec::new();
        for attribute in self.steps.iter().flat_map(|step| step.modified_attributes()) {
            if !attributes.contains(&attribute) {
                attributes.push(attribute);
            }
        }
        attributes
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let mut diagnostics = Diagnostics::default();
        let mut current = input.clone();
        for step in &self.steps {
            debug!(step = step.name(), context, "running conversion step");
            let (result, mut step_diagnostics) = step.convert(&current, context).into_parts();
            if step_diagnostics.has_errors() || result.is_none() {
                if step_diagnostics.errors.is_empty() {
                    step_diagnostics.error(context, "no result was produced");
                }
                step_diagnostics.errors = step_diagnostics
                    .errors
                    .into_iter()
                    .map(|e| format!("[{}] {e}", step.name()))
                    .collect();
                diagnostics.extend(step_diagnostics);
                return Converted::from_parts(None, diagnostics);
            }
            diagnostics.extend(step_diagnostics);
            if let Some(result) = result {
                current = result;
            }
        }
        diagnostics.finish(current)
    }
}

/// Applies a step to one field of an object and puts the result back.
/// Objects without the field pass unchanged.
pub struct On {
    name: String,
    key: String,
    step: Step,
}

impl On {
    pub fn new(key: impl Into<String>, step: Step) -> Self {
        let key = key.into();
        On {
            name: format!("On({key}, {})", step.name()),
            key,
            step,
        }
    }
}

impl Conversion<Value> for On {
    fn name(&self) -> &str {
        &self.name
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec![self.key.clone()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(field) = input.get(&self.key) else {
            return Converted::success(input.clone());
        };
        let field_context = format!("{context}.{}", self.key);
        let (result, diagnostics) = self.step.convert(field, &field_context).into_parts();
        let result = result.map(|converted_field| {
            let mut output = input.clone();
            if let Some(object) = output.as_object_mut() {
                object.insert(self.key.clone(), converted_field);
            }
            output
        });
        Converted::from_parts(result, diagnostics)
    }
}

/// Applies a step to every element of an array.
pub struct Each {
    name: String,
    step: Step,
}

impl Each {
    pub fn new(step: Step) -> Self {
        Each {
            name: format!("Each({})", step.name()),
            step,
        }
    }
}

impl Conversion<Value> for Each {
    fn name(&self) -> &str {
        &self.name
    }

    fn modified_attributes(&self) -> Vec<String> {
        self.step.modified_attributes()
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Value::Array(items) = input else {
            return Converted::failure(context, "expected a list");
        };
        let mut diagnostics = Diagnostics::default();
        let mut output = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let item_context = format!("{context}[{i}]");
            if let Some(converted) = diagnostics.absorb(self.step.convert(item, &item_context)) {
                output.push(converted);
            }
        }
        diagnostics.finish(Value::Array(output))
    }
}

/// Like [`Each`], but every element may expand into zero or more elements.
pub struct Concat {
    name: String,
    step: Box<dyn Conversion<Value, Vec<Value>>>,
}

impl Concat {
    pub fn new(step: Box<dyn Conversion<Value, Vec<Value>>>) -> Self {
        Concat {
            name: format!("Concat({})", step.name()),
            step,
        }
    }
}

impl Conversion<Value> for Concat {
    fn name(&self) -> &str {
        &self.name
    }

    fn modified_attributes(&self) -> Vec<String> {
        self.step.modified_attributes()
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Value::Array(items) = input else {
            return Converted::failure(context, "expected a list");
        };
        let mut diagnostics = Diagnostics::default();
        let mut output = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let item_context = format!("{context}[{i}]");
            if let Some(expanded) = diagnostics.absorb(self.step.convert(item, &item_context)) {
                output.extend(expanded);
            }
        }
        diagnostics.finish(Value::Array(output))
    }
}

/// Fills in a field. With `only_if_undefined` unset, an empty string or an
/// empty list is replaced as well.
pub struct SetDefault {
    name: String,
    key: String,
    value: Value,
    only_if_undefined: bool,
}

impl SetDefault {
    pub fn new(key: impl Into<String>, value: Value, only_if_undefined: bool) -> Self {
        let key = key.into();
        SetDefault {
            name: format!("SetDefault({key})"),
            key,
            value,
            only_if_undefined,
        }
    }
}

impl Conversion<Value> for SetDefault {
    fn name(&self) -> &str {
        &self.name
    }

    fn modified_attributes(&self) -> Vec<String> {
        vec![self.key.clone()]
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        let Some(object) = input.as_object() else {
            return Converted::failure(context, "expected an object");
        };
        let missing = match object.get(&self.key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => !self.only_if_undefined && s.is_empty(),
            Some(Value::Array(items)) => !self.only_if_undefined && items.is_empty(),
            Some(_) => false,
        };
        if !missing {
            return Converted::success(input.clone());
        }
        let mut output = object.clone();
        output.insert(self.key.clone(), self.value.clone());
        Converted::success(Value::Object(output))
    }
}

/// Identity.
pub struct Pass {
    name: String,
}

impl Pass {
    pub fn new(name: impl Into<String>) -> Self {
        Pass { name: name.into() }
    }
}

impl Conversion<Value> for Pass {
    fn name(&self) -> &str {
        &self.name
    }

    fn convert(&self, input: &Value, _context: &str) -> Converted<Value> {
        Converted::success(input.clone())
    }
}

/// Applies `step` only when `predicate` holds; other documents pass unchanged.
pub struct Bypass {
    name: String,
    predicate: fn(&Value) -> bool,
    step: Step,
}

impl Bypass {
    pub fn new(predicate: fn(&Value) -> bool, step: Step) -> Self {
        Bypass {
            name: format!("Bypass({})", step.name()),
            predicate,
            step,
        }
    }
}

impl Conversion<Value> for Bypass {
    fn name(&self) -> &str {
        &self.name
    }

    fn modified_attributes(&self) -> Vec<String> {
        self.step.modified_attributes()
    }

    fn convert(&self, input: &Value, context: &str) -> Converted<Value> {
        if (self.predicate)(input) {
            self.step.convert(input, context)
        } else {
            Converted::success(input.clone())
        }
    }
}

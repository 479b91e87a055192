use serde_json::Value;

/// Deep-merge `source` onto a copy of `target`.
///
/// - `"+key": [...]` prepends to the list at `key`,
/// - `"key+": [...]` appends to it,
/// - objects merge recursively, anything else replaces.
pub fn merge(source: &Value, target: &Value) -> Result<Value, String> {
    let (Value::Object(source), Value::Object(target)) = (source, target) else {
        return Ok(source.clone());
    };
    let mut output = target.clone();
    for (key, value) in source {
        if let Some(field) = key.strip_prefix('+') {
            let additions = list_for(key, value)?;
            let existing = existing_list(&output, field)?;
            let combined = additions.iter().chain(existing.iter()).cloned().collect();
            output.insert(field.to_string(), Value::Array(combined));
        } else if let Some(field) = key.strip_suffix('+') {
            let additions = list_for(key, value)?;
            let existing = existing_list(&output, field)?;
            let combined = existing.iter().chain(additions.iter()).cloned().collect();
            output.insert(field.to_string(), Value::Array(combined));
        } else {
            let merged = match (value, output.get(key)) {
                (Value::Object(_), Some(current @ Value::Object(_))) => merge(value, current)?,
                _ => value.clone(),
            };
            output.insert(key.clone(), merged);
        }
    }
    Ok(Value::Object(output))
}

fn list_for<'a>(key: &str, value: &'a Value) -> Result<&'a Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("'{key}' adds to a list, so its value must be a list"))
}

fn existing_list(object: &serde_json::Map<String, Value>, field: &str) -> Result<Vec<Value>, String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(format!("cannot add items to '{field}': it is not a list")),
    }
}

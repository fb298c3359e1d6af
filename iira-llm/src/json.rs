use crate::error::{LlmError, Result};
use serde::de::DeserializeOwned;

/// Pull the outermost JSON object out of free-form model text.
///
/// Models wrap JSON in prose or code fences; the slice from the first `{` to
/// the last `}` is parsed. Anything that is not a JSON object is an error.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(LlmError::ResponseFormat(
            "no JSON object found in model output".to_string(),
        ));
    };
    if end < start {
        return Err(LlmError::ResponseFormat(
            "unbalanced JSON object in model output".to_string(),
        ));
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end])?;
    if !value.is_object() {
        return Err(LlmError::ResponseFormat(
            "model output is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

/// Extract and deserialize into a strict schema.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = extract_json_object(text)?;
    serde_json::from_value(value).map_err(LlmError::from)
}

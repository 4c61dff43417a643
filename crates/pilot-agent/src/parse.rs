//! Recovers one structured action object from arbitrary model text.
//!
//! Models wrap JSON in fences, prepend prose, or truncate mid-object. The
//! parser strips fences, tries a direct decode, then falls back to a
//! depth-counted scan for the first balanced object, skipping over quoted
//! string content.

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("No JSON object found in model response.")]
    NoObject,
    #[error("Unterminated JSON object in model response.")]
    Unterminated,
    #[error("Invalid JSON object in model response: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub fn extract_json(text: &str) -> Result<Value, ParseError> {
    let mut raw = text.trim();
    let unfenced;
    if raw.starts_with("```") {
        let stripped = raw.trim_matches('`').trim();
        unfenced = stripped
            .strip_prefix("json")
            .unwrap_or(stripped)
            .trim()
            .to_string();
        raw = &unfenced;
    }

    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(value);
    }

    // Fallback: locate the first balanced JSON object and decode just that.
    let bytes = raw.as_bytes();
    let start = raw.find('{').ok_or(ParseError::NoObject)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &raw[start..=idx];
                    return Ok(serde_json::from_str(candidate)?);
                }
            }
            _ => {}
        }
    }
    Err(ParseError::Unterminated)
}

//! Locating a JSON object inside free-form model output.

use serde_json::Value;

use crate::traits::PipelineError;

/// Returns the first balanced JSON object embedded in `input`.
///
/// Vision models wrap their answer in prose and sometimes return it
/// escaped (`\"Name\": ...`, literal `\n`). The raw text is tried first and
/// an unescaped copy second.
///
/// # Errors
///
/// [`PipelineError::ExtractionEngine`] when there is no `{`, no matching
/// `}`, or the balanced slice is not valid JSON.
pub fn extract_json(input: &str) -> Result<Value, PipelineError> {
    match first_object(input) {
        Ok(value) => Ok(value),
        Err(err) => {
            let unescaped = unescape(input);
            if unescaped == input {
                return Err(err);
            }
            first_object(&unescaped).map_err(|_| err)
        }
    }
}

fn first_object(text: &str) -> Result<Value, PipelineError> {
    let start = text
        .find('{')
        .ok_or_else(|| PipelineError::ExtractionEngine("no JSON found in text".to_string()))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| {
        PipelineError::ExtractionEngine("no matching closing brace found".to_string())
    })?;

    serde_json::from_str(&text[start..end]).map_err(|e| {
        PipelineError::ExtractionEngine(format!("extracted text is not valid JSON: {}", e))
    })
}

fn unescape(input: &str) -> String {
    input
        .replace("\\n", " ")
        .replace("\\r", " ")
        .replace("\\t", " ")
        .replace("\\\"", "\"")
}

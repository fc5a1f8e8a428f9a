//! Helpers for pulling structured data out of free-form agent text.

use serde::de::DeserializeOwned;

/// Extract the outermost JSON object from text that may contain other content.
///
/// Braces inside JSON string literals are ignored, so `{"a": "}"}` is
/// returned whole.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON object embedded in `text` into `T`.
pub fn parse_embedded_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))
}

/// Truncate to at most `max` characters, appending an ellipsis if cut.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

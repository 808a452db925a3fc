//! Extraction of a structured payload from model prose.

use serde_json::Value;

/// Find the first well-formed JSON object embedded in `text`.
///
/// Models sometimes wrap a structured payload in explanatory prose or a
/// markdown fence; the gateway only cares about the first balanced block
/// that parses.
pub fn first_json_block(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if start.is_some() => in_string = true,
            b'{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                let Some(open) = start else { continue };
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[open..=i];
                    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                        return Some(value);
                    }
                    // Not valid JSON after all; keep scanning.
                    start = None;
                }
            }
            _ => {}
        }
    }
    None
}

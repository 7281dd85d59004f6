//! Lenient JSON extraction from model output.
//!
//! Synthesis responses may arrive wrapped in markdown code fences or with
//! prose around the JSON payload. Extraction never errors: malformed output
//! yields `None` and the caller degrades to an empty result.

/// Strip markdown code fences and surrounding prose, then parse.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let stripped = strip_fences(text);

    // Fast path: the whole stripped text is valid JSON.
    if let Ok(value) = serde_json::from_str(stripped) {
        return Some(value);
    }

    // Fall back to the outermost balanced {...} or [...] span.
    for open in ['{', '['] {
        if let Some(span) = balanced_span(stripped, open) {
            if let Ok(value) = serde_json::from_str(span) {
                return Some(value);
            }
        }
    }

    None
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line ("json", "JSON", or empty).
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end_matches("```").trim()
}

/// Find the first balanced span starting at `open`, respecting strings.
fn balanced_span(text: &str, open: char) -> Option<&str> {
    let close = if open == '{' { '}' } else { ']' };
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
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
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

//! Small helpers shared across modules.

/// Extract the first complete JSON object from text that may contain other
/// content, such as a generator reply wrapped in prose or a code fence.
///
/// Braces inside string literals are ignored.
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

/// `s` with everything but ASCII alphanumerics, `-` and `_` replaced by `_`.
pub fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        assert_eq!(extract_json_object(r#"{"key": "value"}"#), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_json_object_with_prose_and_fence() {
        let text = "Here you go:\n```json\n{\"verdicts\": [\"keep\"]}\n```\nDone.";
        assert_eq!(extract_json_object(text), Some(r#"{"verdicts": ["keep"]}"#));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing {"second": 1}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": "value"}}"#));
    }

    #[test]
    fn test_extract_json_object_braces_in_strings() {
        let text = r#"{"reason": "unbalanced } here", "quote": "say \"{\""} rest"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"reason": "unbalanced } here", "quote": "say \"{\""}"#)
        );
    }

    #[test]
    fn test_extract_json_object_missing_or_unclosed() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("abc-123_x"), "abc-123_x");
        assert_eq!(file_safe("a/b c.d"), "a_b_c_d");
    }
}

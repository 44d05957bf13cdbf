mod analyzer;
mod evaluator;
mod summary;

pub use analyzer::Analyzer;
pub use evaluator::Evaluator;
pub use summary::build_completion_summary;

/// Extract the first balanced top-level JSON object from model output.
///
/// Models wrap JSON in prose or markdown fences more often than not, so
/// this scans for `{`, then tracks brace depth while skipping string
/// literals and escapes. Returns the slice spanning the balanced object,
/// or None when no complete object is present.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        assert_eq!(extract_json_object(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn extracts_object_wrapped_in_prose_and_fences() {
        let text = "Here is the analysis:\n```json\n{\"intent\": \"fix\"}\n```\nDone.";
        assert_eq!(extract_json_object(text), Some("{\"intent\": \"fix\"}"));
    }

    #[test]
    fn nested_objects_stay_balanced() {
        let text = r#"{"plan": {"steps": [{"id": 1}]}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"plan": {"steps": [{"id": 1}]}}"#)
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let text = r#"{"reason": "use {braces} careful\"ly", "ok": true}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn unbalanced_object_yields_none() {
        assert_eq!(extract_json_object(r#"{"a": {"b": 1}"#), None);
        assert_eq!(extract_json_object("no json here"), None);
    }
}

//! JSON-event extraction from model output.
//!
//! Provider output is scanned for embedded objects of the form
//! `{"event": "ns:action", "data": {...}}`. Well-formed matches are
//! re-emitted on the bus; near-miss candidates (single quotes, trailing
//! commas) are collected so the emitting agent can be sent corrective
//! feedback. This feedback loop is how autonomous agents learn to emit
//! valid JSON.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// What a scan of one response produced.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    /// Well-formed `(event_name, data)` pairs, in appearance order.
    pub events: Vec<(String, Value)>,
    /// Malformed candidate snippets, in appearance order.
    pub malformed: Vec<String>,
}

fn single_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\s*'event'").expect("static regex"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*[}\]]").expect("static regex"))
}

/// Take the balanced-brace substring starting at `start`, honouring
/// string literals (both quote styles) and escapes. Returns the end
/// index (exclusive), or `None` if braces never balance.
fn balanced_object(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (offset, &byte) in bytes.iter().enumerate().skip(start) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == quote {
                in_string = None;
            }
            continue;
        }
        match byte {
            b'"' | b'\'' => in_string = Some(byte),
            b'{' => depth = depth.saturating_add(1),
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(offset.saturating_add(1));
                }
            },
            _ => {},
        }
    }
    None
}

/// Whether the candidate at `start` looks like an event object
/// (`{"event"` or `{'event'`).
fn looks_like_event(candidate: &str) -> bool {
    let trimmed_prefix: String = candidate.chars().take(16).collect();
    trimmed_prefix
        .split_whitespace()
        .collect::<String>()
        .starts_with("{\"event\"")
        || single_quote_re().is_match(candidate)
}

/// Scan `text` for embedded event objects.
#[must_use]
pub fn extract_events(text: &str) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();
    let mut cursor = 0usize;

    while let Some(relative) = text.get(cursor..).and_then(|rest| rest.find('{')) {
        let start = cursor.saturating_add(relative);
        let Some(end) = balanced_object(text, start) else {
            // Unbalanced from here on; nothing more to find.
            break;
        };
        let candidate = &text[start..end];

        if !looks_like_event(candidate) {
            cursor = start.saturating_add(1);
            continue;
        }

        match serde_json::from_str::<Value>(candidate) {
            Ok(parsed) => {
                if let Some(event_name) = parsed.get("event").and_then(Value::as_str) {
                    let data = parsed
                        .get("data")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                    outcome.events.push((event_name.to_string(), data));
                    cursor = end;
                    continue;
                }
                cursor = start.saturating_add(1);
            },
            Err(_) => {
                if single_quote_re().is_match(candidate)
                    || trailing_comma_re().is_match(candidate)
                {
                    outcome.malformed.push(candidate.to_string());
                    cursor = end;
                } else {
                    cursor = start.saturating_add(1);
                }
            },
        }
    }

    outcome
}

/// Build the feedback text for a response containing malformed event
/// candidates. Returned injections carry `is_feedback: true`.
#[must_use]
pub fn feedback_message(malformed: &[String]) -> String {
    let mut message = String::from(
        "Some event JSON in your last response could not be parsed. \
         Emit events as strict JSON: double quotes around keys and strings, \
         no trailing commas. The malformed patterns were:\n",
    );
    for (index, snippet) in malformed.iter().enumerate() {
        message.push_str(&format!("{}. {}\n", index.saturating_add(1), snippet));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_valid_event() {
        let text = r#"Sure. {"event": "state:set", "data": {"key": "k", "value": "v"}} Done."#;
        let outcome = extract_events(text);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].0, "state:set");
        assert_eq!(outcome.events[0].1, json!({"key": "k", "value": "v"}));
        assert!(outcome.malformed.is_empty());
    }

    #[test]
    fn test_mixed_valid_and_malformed() {
        // One valid, one single-quoted, one with a trailing comma: the
        // valid one extracts, the other two are reported as malformed.
        let text = concat!(
            r#"1. {"event": "state:set", "data": {"key": "k", "value": "v"}}"#,
            "\n",
            r#"2. {'event': 'state:set', 'data': {'key': 'k2'}}"#,
            "\n",
            r#"3. {"event": "state:set", "data": {"key": "k3",}}"#,
        );
        let outcome = extract_events(text);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.malformed.len(), 2);
        assert!(outcome.malformed[0].starts_with("{'event'"));
        assert!(outcome.malformed[1].contains("\"k3\","));
    }

    #[test]
    fn test_ignores_plain_objects() {
        let text = r#"Here is data: {"key": "value", "count": 3} and text."#;
        let outcome = extract_events(text);
        assert!(outcome.events.is_empty());
        assert!(outcome.malformed.is_empty());
    }

    #[test]
    fn test_nested_braces_in_strings() {
        let text = r#"{"event": "state:set", "data": {"key": "has { braces }", "value": 1}}"#;
        let outcome = extract_events(text);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].1["key"], "has { braces }");
    }

    #[test]
    fn test_event_without_data_gets_empty_object() {
        let text = r#"{"event": "system:health"}"#;
        let outcome = extract_events(text);
        assert_eq!(outcome.events[0].1, json!({}));
    }

    #[test]
    fn test_multiple_events_in_order() {
        let text = concat!(
            r#"{"event": "a:one", "data": {}} then "#,
            r#"{"event": "b:two", "data": {}}"#,
        );
        let outcome = extract_events(text);
        let names: Vec<&str> = outcome.events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a:one", "b:two"]);
    }

    #[test]
    fn test_feedback_message_enumerates() {
        let message = feedback_message(&[
            "{'event': 'x'}".to_string(),
            r#"{"event": "y",}"#.to_string(),
        ]);
        assert!(message.contains("1. {'event': 'x'}"));
        assert!(message.contains("2. "));
        assert!(message.contains("trailing commas"));
    }
}

//! ============================================================================
//! Tolerant Field Extraction
//! ============================================================================
//! The gateway's response and webhook documents vary in shape between
//! accounts and API versions. Each lookup is an ordered list of pure rules;
//! the first rule that yields a value wins.
//! ============================================================================

use serde_json::Value;

/// A path into a JSON document, e.g. `&["data", "call_id"]`
pub type FieldPath = &'static [&'static str];

/// Identifier lookup for a call-placement response
pub const RESPONSE_CALL_ID_RULES: &[FieldPath] = &[
    &["call_id"],
    &["id"],
    &["uuid"],
    &["data", "call_id"],
    &["data", "id"],
    &["call", "id"],
    &["result", "call_id"],
];

/// Identifier lookup for a webhook delivery
pub const WEBHOOK_CALL_ID_RULES: &[FieldPath] = &[
    &["data", "call_id"],
    &["data", "id"],
    &["call_id"],
    &["id"],
];

/// Event type lookup, in preference order: description, code, generic field
pub const EVENT_TYPE_RULES: &[FieldPath] = &[
    &["event_description"],
    &["description"],
    &["type"],
    &["code"],
    &["event_code"],
    &["event"],
    &["event_type"],
];

pub const DURATION_RULES: &[FieldPath] = &[&["data", "duration"], &["duration"], &["data", "billsec"]];

pub const COST_RULES: &[FieldPath] = &[&["data", "cost"], &["cost"], &["data", "price"]];

pub const RECORDING_URL_RULES: &[FieldPath] = &[
    &["data", "recording_url"],
    &["data", "record_url"],
    &["recording_url"],
];

/// Walk a path through nested objects
pub fn lookup<'a>(doc: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter().try_fold(doc, |node, key| node.as_object()?.get(*key))
}

/// Render a scalar as an identifier-like string. Empty strings, nulls,
/// booleans, arrays and objects do not count as a value.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Every non-empty string or integer found under the given rules, in rule order
pub fn texts<'a>(doc: &'a Value, rules: &'a [FieldPath]) -> impl Iterator<Item = String> + 'a {
    rules
        .iter()
        .filter_map(move |path| lookup(doc, path).and_then(scalar_text))
}

/// First non-empty string or integer found under the given rules
pub fn first_text(doc: &Value, rules: &[FieldPath]) -> Option<String> {
    texts(doc, rules).next()
}

/// First numeric value (number or numeric string) found under the given rules
pub fn first_f64(doc: &Value, rules: &[FieldPath]) -> Option<f64> {
    rules.iter().find_map(|path| {
        let number = match lookup(doc, path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        number.filter(|v| v.is_finite())
    })
}

/// Gateway call identifier from a placement response
pub fn response_call_id(doc: &Value) -> Option<String> {
    first_text(doc, RESPONSE_CALL_ID_RULES)
}

/// Gateway call identifier from a webhook delivery
pub fn webhook_call_id(doc: &Value) -> Option<String> {
    first_text(doc, WEBHOOK_CALL_ID_RULES)
}

/// Normalized event type: lower-cased and trimmed, numbers in decimal,
/// `"unknown"` when no rule matches.
pub fn event_type(doc: &Value) -> String {
    first_text(doc, EVENT_TYPE_RULES)
        .map(|t| t.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Outcome fields reported with a finished call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutcome {
    pub duration: Option<u64>,
    pub cost: Option<f64>,
    pub recording_url: Option<String>,
}

impl CallOutcome {
    pub fn from_payload(doc: &Value) -> Self {
        Self {
            duration: first_f64(doc, DURATION_RULES)
                .filter(|d| *d >= 0.0)
                .map(|d| d.round() as u64),
            cost: first_f64(doc, COST_RULES),
            recording_url: first_text(doc, RECORDING_URL_RULES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_call_id_shapes() {
        assert_eq!(response_call_id(&json!({"call_id": "abc"})), Some("abc".into()));
        assert_eq!(response_call_id(&json!({"id": 12345})), Some("12345".into()));
        assert_eq!(
            response_call_id(&json!({"data": {"call_id": "nested"}})),
            Some("nested".into())
        );
        assert_eq!(response_call_id(&json!({"call": {"id": "deep"}})), Some("deep".into()));
        assert_eq!(response_call_id(&json!({"call_id": "", "id": "fallback"})), Some("fallback".into()));
        assert_eq!(response_call_id(&json!({"status": "queued"})), None);
        assert_eq!(response_call_id(&json!(["abc"])), None);
    }

    #[test]
    fn test_webhook_call_id_prefers_data() {
        let doc = json!({"id": "delivery-1", "data": {"call_id": "abc"}});
        assert_eq!(webhook_call_id(&doc), Some("abc".into()));

        let flat = json!({"call_id": "xyz"});
        assert_eq!(webhook_call_id(&flat), Some("xyz".into()));

        assert_eq!(webhook_call_id(&json!({"type": 2000})), None);
    }

    #[test]
    fn test_event_type_preference_order() {
        let doc = json!({"description": "Answered", "type": 2000, "event": "call.update"});
        assert_eq!(event_type(&doc), "answered");

        let code_only = json!({"type": 2002, "event": "call.update"});
        assert_eq!(event_type(&code_only), "2002");

        let generic = json!({"event": " Transferred "});
        assert_eq!(event_type(&generic), "transferred");

        assert_eq!(event_type(&json!({"data": {}})), "unknown");
    }

    #[test]
    fn test_texts_yields_every_candidate() {
        let doc = json!({"description": "Call finished", "type": 2002, "event": ""});
        let all: Vec<String> = texts(&doc, EVENT_TYPE_RULES).collect();
        assert_eq!(all, vec!["Call finished".to_string(), "2002".to_string()]);
    }

    #[test]
    fn test_outcome_from_payload() {
        let doc = json!({"type": 2002, "data": {"call_id": "abc", "duration": 42, "cost": 0.5}});
        let outcome = CallOutcome::from_payload(&doc);
        assert_eq!(outcome.duration, Some(42));
        assert_eq!(outcome.cost, Some(0.5));
        assert_eq!(outcome.recording_url, None);

        let strings = json!({"duration": "17.6", "data": {"price": "0.12", "record_url": "https://rec/1.mp3"}});
        let outcome = CallOutcome::from_payload(&strings);
        assert_eq!(outcome.duration, Some(18));
        assert_eq!(outcome.cost, Some(0.12));
        assert_eq!(outcome.recording_url.as_deref(), Some("https://rec/1.mp3"));
    }
}

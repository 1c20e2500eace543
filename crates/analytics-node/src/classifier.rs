//! Severity classification of analysis payloads
//!
//! Rules are evaluated in a fixed order and the first one that decides wins:
//!
//! 1. an `error` key marks a failed call: critical
//! 2. a non-empty `defects` list: critical if any defect is severe, otherwise warning
//! 3. an `objects` list: more than 10 entries is a warning, more than 5 is
//!    info and stops evaluation
//! 4. any asset whose status is maintenance, inactive or error: warning
//! 5. a numeric `confidence` below 0.5: warning
//! 6. otherwise info
//!
//! Classification never fails; unexpected shapes simply do not match a rule.

use common::analysis::{AnalysisPayload, Severity};
use serde_json::Value;

const CROWDED_SCENE: usize = 10;
const BUSY_SCENE: usize = 5;
const LOW_CONFIDENCE: f64 = 0.5;
const ATTENTION_STATUSES: [&str; 3] = ["maintenance", "inactive", "error"];

/// Confidence recorded on a result when the payload carries none
pub const DEFAULT_CONFIDENCE: f64 = 0.85;

pub fn classify(payload: &AnalysisPayload) -> Severity {
    if payload.contains_key("error") {
        return Severity::Critical;
    }

    if let Some(defects) = non_empty_list(payload, "defects") {
        return if defects.iter().any(|d| field_is(d, "severity", "severe")) {
            Severity::Critical
        } else {
            Severity::Warning
        };
    }

    if let Some(objects) = payload.get("objects").and_then(Value::as_array) {
        if objects.len() > CROWDED_SCENE {
            return Severity::Warning;
        }
        if objects.len() > BUSY_SCENE {
            return Severity::Info;
        }
    }

    if let Some(assets) = payload.get("assets").and_then(Value::as_array) {
        let needs_attention = assets.iter().any(|asset| {
            ATTENTION_STATUSES
                .iter()
                .any(|status| field_is(asset, "status", status))
        });
        if needs_attention {
            return Severity::Warning;
        }
    }

    let confidence = payload
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    if confidence < LOW_CONFIDENCE {
        return Severity::Warning;
    }

    Severity::Info
}

/// Confidence to record on a result, clamped to `[0, 1]`
pub fn result_confidence(payload: &AnalysisPayload) -> f64 {
    payload
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE)
}

fn non_empty_list<'a>(payload: &'a AnalysisPayload, key: &str) -> Option<&'a Vec<Value>> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
}

fn field_is(entry: &Value, field: &str, expected: &str) -> bool {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(|value| value.trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

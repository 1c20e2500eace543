//! Analysis result contracts.
//!
//! These types describe what a stream worker publishes after running a frame
//! through an analysis backend, and the envelope delivered to real-time
//! subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Backend-specific structured payload (object lists, defect lists, asset lists, flat status)
pub type AnalysisPayload = serde_json::Map<String, serde_json::Value>;

/// Alert severity, ordered `Info < Warning < Critical`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// One classified backend outcome for one dispatched frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub stream_id: String,
    pub model_name: String,
    /// Wall-clock time of the dispatch (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,
    pub payload: AnalysisPayload,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub severity: Severity,
}

/// Message pushed to real-time subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResultMessage {
    AiResult(AnalysisResult),
}

/// Liveness probe and its fixed reply on the real-time channel
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Filters for a history query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsFilters {
    pub stream_id: Option<String>,
    pub alert_level: Option<Severity>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub results: Vec<AnalysisResult>,
    pub total: usize,
    pub filters: ResultsFilters,
}

/// Alert counts per severity over the alert window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertBreakdown {
    pub critical: usize,
    pub warning: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub active_streams: usize,
    pub total_streams: usize,
    /// Results published in the last minute
    pub recent_results: usize,
    /// Warning and critical results in the last five minutes
    pub alerts: usize,
    pub alert_breakdown: AlertBreakdown,
    pub subscribers: usize,
    pub timestamp: DateTime<Utc>,
}

/// Backend model advertised to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub mode: String,
    pub description: String,
    pub anthropic_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub models: BTreeMap<String, ModelInfo>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_result() -> AnalysisResult {
        let mut payload = AnalysisPayload::new();
        payload.insert("processed".to_string(), serde_json::json!(true));
        AnalysisResult {
            stream_id: "cam-1".to_string(),
            model_name: "general".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            payload,
            confidence: 0.9,
            severity: Severity::Warning,
        }
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!("Critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("error".parse::<Severity>().is_err());
        assert_eq!(Severity::Warning.to_string(), "warning");
    }

    #[test]
    fn test_result_message_envelope() {
        let message = ResultMessage::AiResult(sample_result());
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "ai_result");
        assert_eq!(value["data"]["stream_id"], "cam-1");
        assert_eq!(value["data"]["model_name"], "general");
        assert_eq!(value["data"]["severity"], "warning");
        assert_eq!(value["data"]["timestamp"], "2024-05-01T12:30:00Z");
        assert_eq!(value["data"]["payload"]["processed"], true);
    }
}

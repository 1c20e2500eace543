//! Anthropic Messages API vision backend
//!
//! Frames are JPEG-encoded off the async runtime, sent as a base64 image
//! block with a mode-specific instruction, and the reply text is recovered
//! into a JSON object as well as the model's formatting allows.

use super::{AnalysisBackend, AnalysisMode, BackendError};
use crate::source::Frame;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::analysis::AnalysisPayload;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1000;
const JPEG_QUALITY: u8 = 85;
/// Error bodies are truncated to this many characters in logs and payloads
const MAX_ERROR_BODY: usize = 512;

/// Confidence assigned when the reply could not be parsed as JSON
pub const RAW_RESPONSE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl VisionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct VisionBackend {
    client: reqwest::Client,
    config: VisionConfig,
}

impl VisionBackend {
    pub fn new(config: VisionConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Instruction text for each analysis mode
pub fn prompt(mode: AnalysisMode) -> &'static str {
    match mode {
        AnalysisMode::ObjectInventory => {
            "Analyze this image and identify all objects visible. For each object, provide:\n\
             1. Object type/class\n\
             2. Confidence level (0-1)\n\
             3. Approximate location description\n\
             4. Size estimation (small/medium/large)\n\n\
             Return the response in JSON format with an 'objects' array."
        }
        AnalysisMode::DefectInspection => {
            "Examine this image for any defects, anomalies, or quality issues. Look for:\n\
             1. Scratches, dents, or surface damage\n\
             2. Color inconsistencies\n\
             3. Structural problems\n\
             4. Missing components\n\n\
             For each defect found, provide:\n\
             - Type of defect\n\
             - Severity level (minor/moderate/severe)\n\
             - Location description\n\
             - Confidence level\n\n\
             Also provide an overall quality score (0-1). Return in JSON format with a 'defects' array."
        }
        AnalysisMode::AssetTracking => {
            "Analyze this image to identify and track assets/equipment. Look for:\n\
             1. Industrial equipment\n\
             2. Vehicles\n\
             3. People/personnel\n\
             4. Tools or machinery\n\
             5. Safety equipment\n\n\
             For each asset, provide:\n\
             - Asset type\n\
             - Status (operational/maintenance/inactive)\n\
             - Location in frame\n\
             - Any safety concerns\n\n\
             Return in JSON format with an 'assets' array."
        }
        AnalysisMode::Generic => {
            "Perform a comprehensive analysis of this image. Identify:\n\
             1. All visible objects and their types\n\
             2. Any potential safety hazards\n\
             3. Overall scene description\n\
             4. Activity level (high/medium/low)\n\
             5. Any anomalies or points of interest\n\n\
             Return the analysis in JSON format."
        }
    }
}

/// Encode a packed RGB24 frame as JPEG
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, BackendError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
        .ok_or_else(|| {
            BackendError::Encode(format!(
                "pixel buffer of {} bytes does not match {}",
                frame.pixels.len(),
                frame.size_label()
            ))
        })?;

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&image)
        .map_err(|e| BackendError::Encode(e.to_string()))?;
    Ok(jpeg)
}

/// Recover a structured payload from the model's reply text.
///
/// Tries the whole text as a JSON object, then the span between the first
/// `{` and the last `}`, and finally wraps the raw text. Empty text is
/// unusable.
pub fn recover_payload(text: &str) -> Result<AnalysisPayload, BackendError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(BackendError::Unusable("empty response".to_string()));
    }

    if let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(payload);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(&trimmed[start..=end])
            {
                return Ok(payload);
            }
        }
    }

    debug!("vision reply is not JSON; keeping raw text");
    let mut payload = AnalysisPayload::new();
    payload.insert("analysis".to_string(), json!(text));
    payload.insert("confidence".to_string(), json!(RAW_RESPONSE_CONFIDENCE));
    payload.insert("raw_response".to_string(), json!(true));
    Ok(payload)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[async_trait]
impl AnalysisBackend for VisionBackend {
    fn id(&self) -> &'static str {
        "anthropic_vision"
    }

    fn is_external(&self) -> bool {
        true
    }

    async fn analyze(
        &self,
        frame: &Frame,
        mode: AnalysisMode,
    ) -> Result<AnalysisPayload, BackendError> {
        let owned = frame.clone();
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&owned))
            .await
            .map_err(|e| BackendError::Encode(e.to_string()))??;

        let body = json!({
            "model": self.config.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": STANDARD.encode(&jpeg),
                        }
                    },
                    {"type": "text", "text": prompt(mode)}
                ]
            }]
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.config.request_timeout)
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), mode = %mode, "vision request rejected");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let reply: MessagesResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unusable(e.to_string()))?;

        let text = reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .unwrap_or_default();

        recover_payload(&text)
    }
}

use crate::backend::vision::{VisionConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::source::ffmpeg::FfmpegSettings;
use crate::source::OpenTimeouts;
use crate::worker::WorkerSettings;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const MIN_API_KEY_LEN: usize = 10;
const MIN_RESULTS: usize = 100;

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub host: String,
    pub port: u16,
    pub frame_skip: u64,
    pub max_results: usize,
    pub max_concurrent_streams: usize,
    pub default_fps: u32,
    pub width: u32,
    pub height: u32,
    pub device_timeout: Duration,
    pub network_timeout: Duration,
    pub backend_timeout: Duration,
    pub min_dispatch_interval: Duration,
    pub stop_grace: Duration,
    pub enable_anthropic: bool,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub cors_origins: Vec<String>,
    pub ffmpeg_path: String,
    /// Register the demo streams at startup
    pub demo_streams: bool,
    /// Sample clip for the file demo stream
    pub demo_video_path: Option<String>,
}

impl AnalyticsConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup (the process environment
    /// in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (width, height) = match get("VIDEO_RESOLUTION") {
            Some(value) => parse_resolution(&value)
                .with_context(|| format!("Invalid VIDEO_RESOLUTION '{}'", value))?,
            None => (640, 480),
        };

        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: get("BACKEND_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "BACKEND_PORT", 8000)?,
            frame_skip: parse_or(&get, "FRAME_SKIP", 30u64)?.max(1),
            max_results: parse_or(&get, "MAX_RESULTS", 1000usize)?.max(MIN_RESULTS),
            max_concurrent_streams: parse_or(&get, "MAX_CONCURRENT_STREAMS", 10usize)?.max(1),
            default_fps: parse_or(&get, "DEFAULT_FPS", 30u32)?.max(1),
            width,
            height,
            device_timeout: Duration::from_secs(parse_or(&get, "WEBCAM_TIMEOUT", 5)?),
            network_timeout: Duration::from_secs(parse_or(&get, "RTSP_TIMEOUT", 10)?),
            backend_timeout: Duration::from_secs(parse_or(&get, "AI_PROCESSING_TIMEOUT", 30)?),
            min_dispatch_interval: Duration::from_millis(parse_or(
                &get,
                "MIN_DISPATCH_INTERVAL_MS",
                1000,
            )?),
            stop_grace: Duration::from_millis(parse_or(&get, "STOP_GRACE_MS", 2000)?),
            enable_anthropic: parse_bool(get("ENABLE_ANTHROPIC").as_deref(), true),
            anthropic_api_key: get("ANTHROPIC_API_KEY").map(|k| k.trim().to_string()),
            anthropic_model: get("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            anthropic_base_url: get("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            cors_origins,
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            demo_streams: parse_bool(get("DEMO_STREAMS").as_deref(), false),
            demo_video_path: get("DEMO_VIDEO_PATH").map(|p| p.trim().to_string()),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.default_fps.max(1)))
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            frame_skip: self.frame_skip,
            min_dispatch_interval: self.min_dispatch_interval,
            frame_interval: self.frame_interval(),
            open_timeouts: OpenTimeouts {
                device: self.device_timeout,
                network: self.network_timeout,
                file: self.device_timeout,
            },
            stop_grace: self.stop_grace,
            ..WorkerSettings::default()
        }
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            binary: self.ffmpeg_path.clone(),
            width: self.width,
            height: self.height,
        }
    }

    /// Vision backend settings, if the real backend should be used
    pub fn vision_config(&self) -> Option<VisionConfig> {
        if !self.enable_anthropic {
            return None;
        }
        let key = self.anthropic_api_key.as_deref()?;
        if key.len() < MIN_API_KEY_LEN {
            warn!("ANTHROPIC_API_KEY looks invalid (too short), using mock analysis");
            return None;
        }

        Some(VisionConfig {
            api_key: key.to_string(),
            model: self.anthropic_model.clone(),
            base_url: self.anthropic_base_url.clone(),
            request_timeout: self.backend_timeout,
        })
    }

    /// Settings outside their recommended range
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.frame_skip < 10 {
            warnings.push(format!(
                "FRAME_SKIP={} is very low and may overload analysis backends",
                self.frame_skip
            ));
        }
        if self.frame_skip > 100 {
            warnings.push(format!(
                "FRAME_SKIP={} is very high; analysis will be infrequent",
                self.frame_skip
            ));
        }
        if self.default_fps > 60 {
            warnings.push(format!("DEFAULT_FPS={} is above 60", self.default_fps));
        }
        if self.width > 1920 || self.height > 1080 {
            warnings.push(format!(
                "VIDEO_RESOLUTION={}x{} is above 1080p and may slow processing",
                self.width, self.height
            ));
        }
        if self.max_results > 10_000 {
            warnings.push(format!(
                "MAX_RESULTS={} may use a lot of memory",
                self.max_results
            ));
        }
        if self.max_concurrent_streams > 20 {
            warnings.push(format!(
                "MAX_CONCURRENT_STREAMS={} may exceed system capacity",
                self.max_concurrent_streams
            ));
        }
        warnings
    }

    /// Log the effective configuration once at startup
    pub fn log_summary(&self) {
        info!(
            bind_addr = %self.bind_addr(),
            frame_skip = self.frame_skip,
            max_results = self.max_results,
            max_concurrent_streams = self.max_concurrent_streams,
            fps = self.default_fps,
            resolution = %format!("{}x{}", self.width, self.height),
            backend_timeout_secs = self.backend_timeout.as_secs(),
            anthropic = self.enable_anthropic && self.anthropic_api_key.is_some(),
            demo_streams = self.demo_streams,
            "configuration loaded"
        );
        for warning in self.warnings() {
            warn!("{}", warning);
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Invalid {} '{}'", key, value)),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .split_once([',', 'x'])
        .ok_or_else(|| anyhow!("expected WIDTH,HEIGHT"))?;
    let width: u32 = w.trim().parse().context("width")?;
    let height: u32 = h.trim().parse().context("height")?;
    if width == 0 || height == 0 {
        return Err(anyhow!("width and height must be positive"));
    }
    Ok((width, height))
}

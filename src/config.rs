use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::session::{ConnectionParameters, Credentials, RtpTransport};
use crate::window::{RetryPolicy, WindowSettings};

const DEFAULT_STREAM_URL: &str = "stub://camera";
const DEFAULT_OUTPUT_DIR: &str = "capture";
const DEFAULT_THRESHOLD_SECS: u64 = 2;
const DEFAULT_RETRY_DELAY_SECS: u64 = 1;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DEVICE_ID: &str = "capture-device";
const DEFAULT_RTSP_PORT: u16 = 554;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    capture_enabled: Option<bool>,
    stream: Option<StreamConfigFile>,
    output_dir: Option<PathBuf>,
    window: Option<WindowConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    transport: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WindowConfigFile {
    threshold_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
    max_connect_attempts: Option<u32>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    device_id: Option<String>,
    connection_string: Option<String>,
}

/// Immutable capture configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub capture_enabled: bool,
    pub stream_url: String,
    pub credentials: Credentials,
    pub transport: RtpTransport,
    pub output_dir: PathBuf,
    pub threshold: Duration,
    pub retry_delay: Duration,
    pub max_connect_attempts: Option<u32>,
    pub idle_timeout: Option<Duration>,
    pub device_id: String,
    pub upload_connection_string: Option<String>,
}

impl CaptureConfig {
    /// Load from `CAPTURE_CONFIG` (JSON, optional), then environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CAPTURE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => CaptureConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let stream = file.stream.unwrap_or_default();
        let window = file.window.unwrap_or_default();
        let upload = file.upload.unwrap_or_default();
        let transport = match stream.transport.as_deref() {
            Some(transport) => transport
                .parse::<RtpTransport>()
                .with_context(|| format!("invalid stream.transport '{}'", transport))?,
            None => RtpTransport::default(),
        };
        Ok(Self {
            capture_enabled: file.capture_enabled.unwrap_or(true),
            stream_url: stream
                .url
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            credentials: Credentials::new(
                stream.username.unwrap_or_default(),
                stream.password.unwrap_or_default(),
            ),
            transport,
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            threshold: Duration::from_secs(window.threshold_secs.unwrap_or(DEFAULT_THRESHOLD_SECS)),
            retry_delay: Duration::from_secs(
                window.retry_delay_secs.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
            ),
            max_connect_attempts: window.max_connect_attempts.filter(|n| *n > 0),
            idle_timeout: non_zero_secs(
                window
                    .idle_timeout_secs
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            device_id: upload
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            upload_connection_string: upload.connection_string,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(enabled) = env_non_empty("RTSP_CAPTURE_VIDEO") {
            self.capture_enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("RTSP_CAPTURE_VIDEO must be true or false"))?;
        }
        if let Some(host) = env_non_empty("RTSP_HOST") {
            let port = match env_non_empty("RTSP_PORT") {
                Some(port) => port
                    .parse::<u16>()
                    .map_err(|_| anyhow!("RTSP_PORT must be a port number"))?,
                None => DEFAULT_RTSP_PORT,
            };
            let path = env_non_empty("RTSP_PATH").unwrap_or_default();
            self.stream_url = format!("rtsp://{}:{}/{}", host, port, path.trim_start_matches('/'));
        }
        if let Some(url) = env_non_empty("RTSP_URL") {
            self.stream_url = url;
        }
        if let Some(username) = env_non_empty("RTSP_USERNAME") {
            self.credentials.username = username;
        }
        if let Some(password) = env_non_empty("RTSP_PASSWORD") {
            self.credentials.password = password;
        }
        if let Some(transport) = env_non_empty("RTSP_TRANSPORT") {
            self.transport = transport.parse()?;
        }
        if let Some(dir) = env_non_empty("RTSP_STORAGE_FOLDER_CAPTURE_VIDEO") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = env_non_empty("RTSP_THRESHOLD") {
            self.threshold = Duration::from_secs(parse_secs("RTSP_THRESHOLD", &threshold)?);
        }
        if let Some(delay) = env_non_empty("RTSP_RETRY_DELAY_SECS") {
            self.retry_delay = Duration::from_secs(parse_secs("RTSP_RETRY_DELAY_SECS", &delay)?);
        }
        if let Some(attempts) = env_non_empty("RTSP_MAX_CONNECT_ATTEMPTS") {
            let attempts: u32 = attempts.parse().map_err(|_| {
                anyhow!("RTSP_MAX_CONNECT_ATTEMPTS must be a non-negative integer")
            })?;
            self.max_connect_attempts = Some(attempts).filter(|n| *n > 0);
        }
        if let Some(idle) = env_non_empty("RTSP_IDLE_TIMEOUT_SECS") {
            self.idle_timeout = non_zero_secs(parse_secs("RTSP_IDLE_TIMEOUT_SECS", &idle)?);
        }
        if let Some(device_id) = env_non_empty("DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Some(conn) = env_non_empty("EDGE_CONN_STR") {
            self.upload_connection_string = Some(conn);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let url = self.stream_uri()?;
        match url.scheme() {
            "rtsp" | "rtsps" | "stub" => {}
            other => {
                return Err(anyhow!(
                    "unsupported stream scheme '{}'; expected rtsp, rtsps or stub",
                    other
                ))
            }
        }
        if self.threshold.is_zero() {
            return Err(anyhow!("capture threshold must be greater than zero"));
        }
        if self.retry_delay.is_zero() {
            return Err(anyhow!("retry delay must be greater than zero"));
        }
        if self.device_id.trim().is_empty() {
            return Err(anyhow!("device id must not be empty"));
        }
        Ok(())
    }

    pub fn stream_uri(&self) -> Result<Url> {
        Url::parse(&self.stream_url)
            .with_context(|| format!("invalid stream address '{}'", self.stream_url))
    }

    pub fn connection_parameters(&self) -> Result<ConnectionParameters> {
        Ok(ConnectionParameters {
            uri: self.stream_uri()?,
            credentials: self.credentials.clone(),
            transport: self.transport,
        })
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            output_dir: self.output_dir.clone(),
            threshold: self.threshold,
            retry: RetryPolicy {
                delay: self.retry_delay,
                max_attempts: self.max_connect_attempts,
            },
            idle_timeout: self.idle_timeout,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of seconds", key))
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_module() {
        let cfg = CaptureConfig::from_file(CaptureConfigFile::default()).unwrap();
        assert!(cfg.capture_enabled);
        assert_eq!(cfg.threshold, Duration::from_secs(2));
        assert_eq!(cfg.retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_connect_attempts, None);
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.transport, RtpTransport::Udp);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let mut cfg = CaptureConfig::from_file(CaptureConfigFile::default()).unwrap();
        cfg.stream_url = "http://camera/stream".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_attempt_budget_means_unlimited() {
        let file = CaptureConfigFile {
            window: Some(WindowConfigFile {
                max_connect_attempts: Some(0),
                idle_timeout_secs: Some(0),
                ..WindowConfigFile::default()
            }),
            ..CaptureConfigFile::default()
        };
        let cfg = CaptureConfig::from_file(file).unwrap();
        assert_eq!(cfg.max_connect_attempts, None);
        assert_eq!(cfg.idle_timeout, None);
    }
}

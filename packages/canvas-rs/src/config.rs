use crate::line_protocol::{points_per_upload, LineEncoder};
use crate::reader::{MalformedPolicy, ReaderOptions, DEFAULT_BATCH_SIZE};
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;
use crate::signal::TimestampMode;
use crate::transport::{TransportConfig, DEFAULT_TIMEOUT_MS};
use crate::types::StreamKind;
use crate::queue::QueueOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which destination to upload to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Database,
    Memory,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" | "grafana" => Ok(TransportKind::Direct),
            "database" | "influx" | "influxdb" => Ok(TransportKind::Database),
            "memory" => Ok(TransportKind::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown transport '{}' (expected direct, database or memory)",
                other
            ))),
        }
    }
}

/// Uploader configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub transport: TransportKind,
    /// Pace uploads to one per `upload_interval`
    pub live: bool,
    pub influx_host: String,
    pub influx_port: u16,
    pub influx_database: String,
    pub influx_username: Option<String>,
    pub influx_password: Option<String>,
    pub measurement: String,
    /// Drop the measurement before uploading
    pub clear_measurement: bool,
    pub grafana_url: String,
    pub grafana_stream: String,
    pub grafana_token: Option<String>,
    pub request_timeout_ms: u64,
    pub stream: StreamKind,
    /// Seconds between uploads in live mode
    pub upload_interval: f64,
    /// Seconds between data points, for synthetic timestamps and averaging
    pub data_point_interval: f64,
    /// Frames averaged per uploaded line; derived from the intervals if unset
    pub average_points: Option<usize>,
    pub synthetic_timestamps: bool,
    pub center: bool,
    pub on_malformed: MalformedPolicy,
    pub batch_size: usize,
    pub queue_depth: usize,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Time index the first uploaded file starts at
    pub start_index: u64,
    /// Preconfigured upload list used by `upload --index`
    pub files: Vec<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Database,
            live: false,
            influx_host: "localhost".to_string(),
            influx_port: 8086,
            influx_database: "ocs_feeds".to_string(),
            influx_username: None,
            influx_password: None,
            measurement: "LIVE_MEASUREMENTS".to_string(),
            clear_measurement: false,
            grafana_url: "http://localhost:3000".to_string(),
            grafana_stream: "canvas/detector".to_string(),
            grafana_token: None,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            stream: StreamKind::Amplitude,
            upload_interval: 0.1,
            data_point_interval: 0.05,
            average_points: None,
            synthetic_timestamps: false,
            center: false,
            on_malformed: MalformedPolicy::Skip,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_depth: 4,
            retry_attempts: 5,
            retry_initial_ms: 100,
            retry_max_ms: 5000,
            start_index: 0,
            files: Vec::new(),
        }
    }
}

impl UploaderConfig {
    /// Load configuration from `.env` and `CANVAS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let influx_port = match get("CANVAS_INFLUX_PORT") {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(ConfigError::InvalidPort),
            },
            None => defaults.influx_port,
        };

        let config = Self {
            transport: match get("CANVAS_TRANSPORT") {
                Some(raw) => raw.parse()?,
                None => defaults.transport,
            },
            live: parse_bool(&get, "CANVAS_LIVE", defaults.live)?,
            influx_host: get("CANVAS_INFLUX_HOST").unwrap_or(defaults.influx_host),
            influx_port,
            influx_database: get("CANVAS_INFLUX_DATABASE").unwrap_or(defaults.influx_database),
            influx_username: get("CANVAS_INFLUX_USERNAME"),
            influx_password: get("CANVAS_INFLUX_PASSWORD"),
            measurement: get("CANVAS_MEASUREMENT").unwrap_or(defaults.measurement),
            clear_measurement: parse_bool(&get, "CANVAS_CLEAR", defaults.clear_measurement)?,
            grafana_url: get("CANVAS_GRAFANA_URL").unwrap_or(defaults.grafana_url),
            grafana_stream: get("CANVAS_GRAFANA_STREAM").unwrap_or(defaults.grafana_stream),
            grafana_token: get("CANVAS_GRAFANA_TOKEN"),
            request_timeout_ms: parse_var(&get, "CANVAS_TIMEOUT_MS", defaults.request_timeout_ms)?,
            stream: match get("CANVAS_STREAM") {
                Some(raw) => parse_stream(&raw)?,
                None => defaults.stream,
            },
            upload_interval: parse_var(&get, "CANVAS_UPLOAD_INTERVAL", defaults.upload_interval)?,
            data_point_interval: parse_var(
                &get,
                "CANVAS_DATA_POINT_INTERVAL",
                defaults.data_point_interval,
            )?,
            average_points: match get("CANVAS_AVERAGE_POINTS") {
                Some(_) => Some(parse_var(&get, "CANVAS_AVERAGE_POINTS", 1usize)?),
                None => None,
            },
            synthetic_timestamps: match get("CANVAS_TIMESTAMPS") {
                Some(raw) => match raw.trim().to_lowercase().as_str() {
                    "synthetic" => true,
                    "actual" => false,
                    other => {
                        return Err(ConfigError::InvalidValue(format!(
                            "CANVAS_TIMESTAMPS must be 'actual' or 'synthetic', got '{}'",
                            other
                        )))
                    }
                },
                None => defaults.synthetic_timestamps,
            },
            center: parse_bool(&get, "CANVAS_CENTER", defaults.center)?,
            on_malformed: match get("CANVAS_ON_MALFORMED") {
                Some(raw) => match raw.trim().to_lowercase().as_str() {
                    "skip" => MalformedPolicy::Skip,
                    "abort" => MalformedPolicy::Abort,
                    other => {
                        return Err(ConfigError::InvalidValue(format!(
                            "CANVAS_ON_MALFORMED must be 'skip' or 'abort', got '{}'",
                            other
                        )))
                    }
                },
                None => defaults.on_malformed,
            },
            batch_size: parse_var(&get, "CANVAS_BATCH_SIZE", defaults.batch_size)?,
            queue_depth: parse_var(&get, "CANVAS_QUEUE_DEPTH", defaults.queue_depth)?,
            retry_attempts: parse_var(&get, "CANVAS_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_initial_ms: parse_var(&get, "CANVAS_RETRY_INITIAL_MS", defaults.retry_initial_ms)?,
            retry_max_ms: parse_var(&get, "CANVAS_RETRY_MAX_MS", defaults.retry_max_ms)?,
            start_index: parse_var(&get, "CANVAS_START_INDEX", defaults.start_index)?,
            files: get("CANVAS_FILES")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("influx host", &self.influx_host),
            ("influx database", &self.influx_database),
            ("measurement", &self.measurement),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue(format!("{} must not be empty", name)));
            }
        }
        if self.influx_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("batch size must be at least 1".to_string()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue("queue depth must be at least 1".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if !(self.upload_interval > 0.0) || !(self.data_point_interval > 0.0) {
            return Err(ConfigError::InvalidValue(
                "upload and data point intervals must be positive".to_string(),
            ));
        }
        if self.average_points == Some(0) {
            return Err(ConfigError::InvalidValue(
                "average points must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Frames averaged per line: explicit setting, otherwise
    /// `upload_interval / data_point_interval` in live mode and 1 otherwise
    pub fn effective_average_points(&self) -> usize {
        match self.average_points {
            Some(n) => n,
            None if self.live => {
                points_per_upload(self.upload_interval, self.data_point_interval).unwrap_or(1)
            }
            None => 1,
        }
    }

    pub fn encoder(&self) -> crate::Result<LineEncoder> {
        LineEncoder::new(&self.measurement, self.stream, self.effective_average_points())
    }

    pub fn transport_config(&self) -> TransportConfig {
        let base = match self.transport {
            TransportKind::Direct => TransportConfig::Direct {
                url: self.grafana_url.clone(),
                stream: self.grafana_stream.clone(),
                token: self.grafana_token.clone(),
                timeout_ms: self.request_timeout_ms,
            },
            TransportKind::Database => TransportConfig::Database {
                host: self.influx_host.clone(),
                port: self.influx_port,
                database: self.influx_database.clone(),
                username: self.influx_username.clone(),
                password: self.influx_password.clone(),
                clear: self.clear_measurement,
                timeout_ms: self.request_timeout_ms,
            },
            TransportKind::Memory => TransportConfig::Memory,
        };
        if self.live {
            TransportConfig::Live {
                interval_ms: ((self.upload_interval * 1000.0).round() as u64).max(1),
                inner: Box::new(base),
            }
        } else {
            base
        }
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        if self.synthetic_timestamps {
            TimestampMode::synthetic_from_now(self.data_point_interval)
        } else {
            TimestampMode::Actual
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            batch_size: self.batch_size,
            malformed: self.on_malformed,
            timestamps: self.timestamp_mode(),
            center: self.center,
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_ms),
            max_backoff: Duration::from_millis(self.retry_max_ms.max(self.retry_initial_ms)),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue: QueueOptions {
                reader: self.reader_options(),
                ..Default::default()
            },
            queue_depth: self.queue_depth,
            retry: self.retry_policy(),
            ..Default::default()
        }
    }
}

/// Accepts the names the dashboard has used for each stream
pub fn parse_stream(raw: &str) -> Result<StreamKind, ConfigError> {
    match raw.trim().to_lowercase().replace('_', "-").as_str() {
        "amplitude" | "amplitudes" => Ok(StreamKind::Amplitude),
        "phase" | "phases" => Ok(StreamKind::Phase),
        "frequency-delta" | "frequency-deltas" | "dfs" => Ok(StreamKind::FrequencyDelta),
        other => Err(ConfigError::InvalidValue(format!(
            "unknown stream '{}' (expected amplitude, phase or frequency-delta)",
            other
        ))),
    }
}

fn parse_var<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}='{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!("{}='{}'", key, raw))),
        },
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<UploaderConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        UploaderConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.influx_host, "localhost");
        assert_eq!(config.influx_port, 8086);
        assert_eq!(config.influx_database, "ocs_feeds");
        assert_eq!(config.measurement, "LIVE_MEASUREMENTS");
        assert_eq!(config.batch_size, 1024);
        assert_eq!(config.queue_depth, 4);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.effective_average_points(), 1);
        assert!(matches!(config.transport_config(), TransportConfig::Database { .. }));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CANVAS_TRANSPORT", "direct"),
            ("CANVAS_LIVE", "true"),
            ("CANVAS_STREAM", "PHASES"),
            ("CANVAS_UPLOAD_INTERVAL", "1.0"),
            ("CANVAS_DATA_POINT_INTERVAL", "0.25"),
            ("CANVAS_FILES", "a.npy, b.csv,,"),
            ("CANVAS_ON_MALFORMED", "abort"),
            ("CANVAS_START_INDEX", "250"),
        ])
        .unwrap();
        assert_eq!(config.start_index, 250);
        assert_eq!(config.stream, StreamKind::Phase);
        assert_eq!(config.effective_average_points(), 4);
        assert_eq!(config.on_malformed, MalformedPolicy::Abort);
        assert_eq!(
            config.files,
            vec![PathBuf::from("a.npy"), PathBuf::from("b.csv")]
        );
        match config.transport_config() {
            TransportConfig::Live { interval_ms, inner } => {
                assert_eq!(interval_ms, 1000);
                assert!(matches!(*inner, TransportConfig::Direct { .. }));
            }
            other => panic!("expected live transport, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("CANVAS_INFLUX_PORT", "0")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[("CANVAS_INFLUX_PORT", "70000")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(load(&[("CANVAS_BATCH_SIZE", "lots")]).is_err());
        assert!(load(&[("CANVAS_BATCH_SIZE", "0")]).is_err());
        assert!(load(&[("CANVAS_TRANSPORT", "carrier-pigeon")]).is_err());
        assert!(load(&[("CANVAS_LIVE", "maybe")]).is_err());
        assert!(load(&[("CANVAS_TIMESTAMPS", "later")]).is_err());
        assert!(load(&[("CANVAS_START_INDEX", "-3")]).is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = load(&[("CANVAS_INFLUX_HOST", "  "), ("CANVAS_BATCH_SIZE", "")]).unwrap();
        assert_eq!(config.influx_host, "localhost");
        assert_eq!(config.batch_size, 1024);
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(parse_stream("amplitudes").unwrap(), StreamKind::Amplitude);
        assert_eq!(parse_stream("frequency_delta").unwrap(), StreamKind::FrequencyDelta);
        assert_eq!(parse_stream("DFS").unwrap(), StreamKind::FrequencyDelta);
        assert!(parse_stream("temperature").is_err());
    }
}

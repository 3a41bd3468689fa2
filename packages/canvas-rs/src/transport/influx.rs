use super::{check_status, request_error, Transport};
use crate::error::{Result, UploadError};
use crate::line_protocol::LineEncoder;
use crate::types::Batch;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Writes batches into an InfluxDB 1.x database over its HTTP API
pub struct InfluxTransport {
    client: Client,
    base_url: String,
    database: String,
    credentials: Option<(String, String)>,
    clear_on_open: bool,
    encoder: LineEncoder,
    open: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxTransport {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        timeout: Duration,
        encoder: LineEncoder,
    ) -> Result<Self> {
        if host.trim().is_empty() || database.trim().is_empty() {
            return Err(UploadError::InvalidParameter(
                "database host and name must be non-empty".to_string(),
            ));
        }
        if port == 0 {
            return Err(UploadError::InvalidParameter(
                "port must be within the TCP port range 1-65535".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::InvalidParameter(format!("HTTP client error: {}", e)))?;

        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host.trim_end_matches('/'), port)
        } else {
            format!("http://{}:{}", host, port)
        };

        Ok(Self {
            client,
            base_url,
            database: database.to_string(),
            credentials: None,
            clear_on_open: false,
            encoder,
            open: false,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Drop the measurement when the connection opens
    pub fn with_clear(mut self, clear: bool) -> Self {
        self.clear_on_open = clear;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.query(&[("u", user.as_str()), ("p", pass.as_str())]),
            None => request,
        }
    }

    async fn query(&self, q: &str, with_db: bool) -> Result<QueryResponse> {
        let mut request = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[("q", q)]);
        if with_db {
            request = request.query(&[("db", self.database.as_str())]);
        }
        let response = self
            .auth(request)
            .send()
            .await
            .map_err(|e| request_error("InfluxDB query", e))?;
        let response = check_status("InfluxDB query", response).await?;
        response
            .json::<QueryResponse>()
            .await
            .map_err(|e| UploadError::TransportRejected(format!("unreadable query response: {}", e)))
    }

    async fn database_exists(&self) -> Result<bool> {
        let response = self.query("SHOW DATABASES", false).await?;
        if let Some(err) = response.results.iter().find_map(|r| r.error.clone()) {
            return Err(UploadError::TransportRejected(err));
        }
        Ok(response
            .results
            .iter()
            .flat_map(|r| r.series.iter())
            .flat_map(|s| s.values.iter())
            .any(|row| row.first().and_then(|v| v.as_str()) == Some(self.database.as_str())))
    }

    /// `DROP MEASUREMENT` for the encoder's measurement. Failures are logged
    /// and do not prevent the upload.
    async fn clear_measurement(&self) {
        let q = format!("DROP MEASUREMENT \"{}\"", self.encoder.measurement_name());
        match self.query(&q, true).await {
            Ok(response) => match response.results.iter().find_map(|r| r.error.clone()) {
                Some(err) => warn!("Failed to clear the measurement: {}", err),
                None => info!("Cleared measurement {}", self.encoder.measurement_name()),
            },
            Err(err) => warn!("Failed to clear the measurement: {}", err),
        }
    }
}

#[async_trait]
impl Transport for InfluxTransport {
    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }

        let ping = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(|e| request_error("InfluxDB ping", e))?;
        check_status("InfluxDB ping", ping).await?;

        if !self.database_exists().await? {
            return Err(UploadError::TransportRejected(format!(
                "database '{}' does not exist",
                self.database
            )));
        }
        if self.clear_on_open {
            self.clear_measurement().await;
        }

        info!("Connected to InfluxDB at {} (db {})", self.base_url, self.database);
        self.open = true;
        Ok(())
    }

    async fn send(&mut self, batch: &Batch) -> Result<()> {
        if !self.open {
            self.open().await?;
        }
        if batch.is_empty() {
            return Ok(());
        }

        let body = self.encoder.encode(batch);
        let request = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(body);
        let response = self
            .auth(request)
            .send()
            .await
            .map_err(|e| request_error("InfluxDB write", e))?;
        check_status("InfluxDB write", response).await?;

        debug!(
            "Wrote batch {} ({} records) to {}",
            batch.sequence,
            batch.len(),
            self.database
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn name(&self) -> &str {
        "influxdb"
    }

    fn frames_per_line(&self) -> usize {
        self.encoder.average_points()
    }
}

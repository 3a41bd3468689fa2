use super::{check_status, request_error, Transport};
use crate::error::{Result, UploadError};
use crate::line_protocol::LineEncoder;
use crate::types::Batch;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use std::time::Duration;

/// Pushes line protocol straight into a Grafana Live stream, which the canvas
/// panel subscribes to without a database in between.
pub struct GrafanaLiveTransport {
    client: Client,
    base_url: String,
    stream: String,
    token: Option<String>,
    encoder: LineEncoder,
    open: bool,
}

impl GrafanaLiveTransport {
    pub fn new(
        url: &str,
        stream: &str,
        token: Option<String>,
        timeout: Duration,
        encoder: LineEncoder,
    ) -> Result<Self> {
        let base_url = url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(UploadError::InvalidParameter(format!(
                "Grafana URL must start with http:// or https://, got '{}'",
                url
            )));
        }
        let stream = stream.trim_matches('/');
        if stream.is_empty() {
            return Err(UploadError::InvalidParameter(
                "Grafana Live stream id must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::InvalidParameter(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            stream: stream.to_string(),
            token,
            encoder,
            open: false,
        })
    }

    pub fn push_url(&self) -> String {
        format!("{}/api/live/push/{}", self.base_url, self.stream)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Transport for GrafanaLiveTransport {
    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let response = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await
            .map_err(|e| request_error("Grafana health check", e))?;
        check_status("Grafana health check", response).await?;

        info!("Connected to Grafana Live at {}", self.push_url());
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

        let request = self
            .client
            .post(self.push_url())
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(self.encoder.encode(batch));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| request_error("Grafana Live push", e))?;
        check_status("Grafana Live push", response).await?;

        debug!("Pushed batch {} to {}", batch.sequence, self.stream);
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
        "grafana-live"
    }

    fn frames_per_line(&self) -> usize {
        self.encoder.average_points()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamKind;

    fn encoder() -> LineEncoder {
        LineEncoder::new("detector", StreamKind::Phase, 1).unwrap()
    }

    #[test]
    fn test_push_url() {
        let t = GrafanaLiveTransport::new(
            "http://localhost:3000/",
            "/canvas/detector/",
            None,
            Duration::from_secs(1),
            encoder(),
        )
        .unwrap();
        assert_eq!(t.push_url(), "http://localhost:3000/api/live/push/canvas/detector");
    }

    #[test]
    fn test_validation() {
        assert!(GrafanaLiveTransport::new("localhost:3000", "s", None, Duration::from_secs(1), encoder())
            .is_err());
        assert!(GrafanaLiveTransport::new("http://g", "//", None, Duration::from_secs(1), encoder())
            .is_err());
    }
}

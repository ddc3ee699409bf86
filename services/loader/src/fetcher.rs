//! HTTP range fetcher for pixel data.
//!
//! Issues one GET per fetch instruction, optionally restricted to a byte
//! range, folds ranged responses into the session's partial buffers and
//! unwraps multipart envelopes.

use crate::config::{HttpAuthConfig, HttpConfig};
use crate::error::LoadError;
use crate::loader::LoadSession;
use crate::multipart::{parse_envelope, DEFAULT_CONTENT_TYPE};
use crate::options::{ByteRange, QualityStatus};
use crate::reassembly::Ticket;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// A single pixel data request
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub uri: String,
    /// Key for partial response reassembly
    pub image_id: String,
    /// `Accept` override; the configured default is used when absent
    pub media_type: Option<String>,
    pub range: Option<ByteRange>,
    pub quality_status: QualityStatus,
}

impl FetchRequest {
    /// A full-resolution request for the whole representation.
    pub fn new(uri: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            image_id: image_id.into(),
            media_type: None,
            range: None,
            quality_status: QualityStatus::FullResolution,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_quality(mut self, quality_status: QualityStatus) -> Self {
        self.quality_status = quality_status;
        self
    }

    /// Whether a successful response is the best available representation.
    ///
    /// An open-ended range reaches the end of the representation; combined
    /// with the chunks before it the frame is complete.
    pub fn is_final(&self) -> bool {
        self.quality_status == QualityStatus::FullResolution
            && self.range.map_or(true, |range| range.is_open_ended())
    }
}

/// A parsed pixel data response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub content_type: String,
    /// Payload bytes, sharing storage with the (combined) response buffer
    pub payload: Bytes,
    pub quality_status: QualityStatus,
    pub is_final: bool,
}

/// HTTP client issuing pixel data requests
#[derive(Debug, Clone)]
pub struct RangeFetcher {
    client: Client,
    config: HttpConfig,
}

impl RangeFetcher {
    pub fn new(config: HttpConfig) -> Result<Self, LoadError> {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("progressive-loader/", env!("CARGO_PKG_VERSION")).to_string());

        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(user_agent)
            .build()
            .map_err(LoadError::Client)?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Fetch `request` within `session`.
    ///
    /// A ranged request reserves its place in the session's partial buffers
    /// before this returns, so chunks for one image are combined in call
    /// order regardless of which response arrives first.
    pub fn fetch(
        &self,
        session: &LoadSession,
        request: FetchRequest,
    ) -> impl Future<Output = Result<FetchResult, LoadError>> + '_ {
        let ticket = request
            .range
            .map(|_| session.buffers().reserve(&request.image_id));
        self.execute(session.cancel_token().clone(), request, ticket)
    }

    #[instrument(
        skip_all,
        fields(image_id = %request.image_id, status = %request.quality_status, range = ?request.range)
    )]
    async fn execute(
        &self,
        cancel: CancellationToken,
        request: FetchRequest,
        ticket: Option<Ticket>,
    ) -> Result<FetchResult, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let started = Instant::now();
        let (content_type, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            response = self.get_with_retry(&request) => response?,
        };

        metrics::counter!("loader.fetch.bytes").increment(body.len() as u64);
        metrics::histogram!("loader.fetch.duration_seconds").record(started.elapsed().as_secs_f64());

        let body = match ticket {
            Some(ticket) => ticket.accumulate(body).await?,
            None => body,
        };

        let envelope = parse_envelope(&content_type, body).map_err(|e| {
            metrics::counter!("loader.fetch.parse_errors").increment(1);
            LoadError::from(e)
        })?;

        debug!(
            content_type = %envelope.content_type,
            payload_len = envelope.payload.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched pixel data"
        );

        Ok(FetchResult {
            content_type: envelope.content_type,
            payload: envelope.payload,
            quality_status: request.quality_status,
            is_final: request.is_final(),
        })
    }

    /// Execute the request, retrying transient transport failures with
    /// exponential backoff.
    async fn get_with_retry(&self, request: &FetchRequest) -> Result<(String, Bytes), LoadError> {
        let mut backoff = self.retry_backoff();
        let mut attempts = 0u32;

        loop {
            match self.get_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    attempts += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.retry_max_delay());
                    metrics::counter!("loader.fetch.retries").increment(1);
                    warn!(
                        uri = %request.uri,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("loader.fetch.failures").increment(1);
                    return Err(e);
                }
            }
        }
    }

    fn retry_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry_base_delay(),
            max_interval: self.config.retry_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };
        // The literal keeps the crate's default current interval
        backoff.reset();
        backoff
    }

    async fn get_once(&self, request: &FetchRequest) -> Result<(String, Bytes), LoadError> {
        metrics::counter!("loader.fetch.requests").increment(1);

        let network = |source| LoadError::Network {
            uri: request.uri.clone(),
            source,
        };

        let response = self.build_request(request).send().await.map_err(network)?;

        // 206 Partial Content is a success like 200
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                uri: request.uri.clone(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let body = response.bytes().await.map_err(network)?;
        Ok((content_type, body))
    }

    fn build_request(&self, request: &FetchRequest) -> RequestBuilder {
        let media_type = request
            .media_type
            .as_deref()
            .unwrap_or(&self.config.default_media_type);

        let mut builder = self.client.get(&request.uri).header(ACCEPT, media_type);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }
        self.apply_auth(builder)
    }

    fn apply_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.auth {
            Some(HttpAuthConfig::Bearer { token }) => {
                builder.header(AUTHORIZATION, format!("Bearer {token}"))
            }
            Some(HttpAuthConfig::CustomHeader { name, value }) => {
                builder.header(name.as_str(), value.as_str())
            }
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fetcher(auth: Option<HttpAuthConfig>) -> RangeFetcher {
        RangeFetcher::new(HttpConfig {
            auth,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_is_final() {
        let request = FetchRequest::new("http://pacs/frames/1", "img");
        assert!(request.is_final());
        assert!(!request.clone().with_range(ByteRange::new(0, 99)).is_final());
        assert!(request.clone().with_range(ByteRange::from_offset(100)).is_final());
        assert!(!request.with_quality(QualityStatus::Lossy).is_final());
    }

    #[test]
    fn test_request_headers() {
        let request = FetchRequest::new("http://pacs/frames/1", "img")
            .with_media_type("image/jls")
            .with_range(ByteRange::new(0, 65535));
        let built = fetcher(None).build_request(&request).build().unwrap();

        assert_eq!(built.headers()[ACCEPT], "image/jls");
        assert_eq!(built.headers()[RANGE], "bytes=0-65535");
        assert!(built.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_default_media_type_without_range() {
        let request = FetchRequest::new("http://pacs/frames/1", "img");
        let built = fetcher(None).build_request(&request).build().unwrap();

        assert_eq!(
            built.headers()[ACCEPT],
            HttpConfig::default().default_media_type.as_str()
        );
        assert!(built.headers().get(RANGE).is_none());
    }

    #[test]
    fn test_auth_headers() {
        let request = FetchRequest::new("http://pacs/frames/1", "img");

        let bearer = fetcher(Some(HttpAuthConfig::Bearer {
            token: "abc".to_string(),
        }));
        let built = bearer.build_request(&request).build().unwrap();
        assert_eq!(built.headers()[AUTHORIZATION], "Bearer abc");

        let custom = fetcher(Some(HttpAuthConfig::CustomHeader {
            name: "x-api-key".to_string(),
            value: "secret".to_string(),
        }));
        let built = custom.build_request(&request).build().unwrap();
        assert_eq!(built.headers()["x-api-key"], "secret");
    }

    #[test]
    fn test_retry_backoff_starts_at_base_delay() {
        let fetcher = RangeFetcher::new(HttpConfig {
            retry_base_delay_ms: 40,
            retry_max_delay_ms: 400,
            ..Default::default()
        })
        .unwrap();

        let mut backoff = fetcher.retry_backoff();
        assert_eq!(backoff.current_interval, Duration::from_millis(40));

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(20), "{first:?}");
        assert!(first <= Duration::from_millis(61), "{first:?}");
    }

    #[tokio::test]
    async fn test_cancelled_session_skips_request() {
        let session = LoadSession::new();
        session.cancel();

        // Nothing listens on this port; a cancelled session must not try.
        let request = FetchRequest::new("http://127.0.0.1:9/frames/1", "img")
            .with_range(ByteRange::new(0, 9));
        let result = fetcher(None).fetch(&session, request).await;

        assert!(matches!(result, Err(LoadError::Cancelled)));
        assert!(session.buffers().is_empty());
    }
}

use std::time::Duration;

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, REFERER};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::Config;

/// Transport-level outcome classification. The retry policy dispatches on
/// this, and the collector maps each class to a per-date outcome.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    /// The endpoint has no file for this request. Normal for weekends,
    /// holidays, and not-yet-published dates; never retried.
    #[error("no data published (HTTP 404)")]
    NotFound,

    /// The exchange rejected the session; a cookie re-seed usually fixes it.
    #[error("access denied (HTTP 403)")]
    Forbidden,

    #[error("server error (HTTP {0})")]
    Server(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::Forbidden
                | FetchError::Server(_)
                | FetchError::Transport(_)
        )
    }
}

/// Browser-like headers the exchange endpoints expect; requests without a
/// plausible User-Agent get rejected outright.
pub fn browser_headers(referer: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(referer) {
        headers.insert(REFERER, value);
    }
    headers
}

struct Session {
    client: Client,
    downloads: u32,
    warmed: bool,
}

/// Pooled HTTP client with retry, exponential backoff, and cookie-session
/// management. Knows nothing about sources or caching; transport only.
pub struct FetchClient {
    tag: String,
    headers: HeaderMap,
    home_url: Option<String>,
    timeout: Duration,
    retry_attempts: u32,
    base_delay: Duration,
    refresh_every: u32,
    session: Mutex<Session>,
}

impl FetchClient {
    /// `home_url` is the exchange homepage used to seed session cookies;
    /// pass `None` for endpoints that don't need one.
    pub fn new(
        tag: &str,
        headers: HeaderMap,
        home_url: Option<String>,
        config: &Config,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = build_client(&headers, timeout)?;

        Ok(Self {
            tag: tag.to_string(),
            headers,
            home_url,
            timeout,
            retry_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            refresh_every: config.session_refresh_every.max(1),
            session: Mutex::new(Session {
                client,
                downloads: 0,
                warmed: false,
            }),
        })
    }

    /// Fetch `url` and return the raw body, retrying retryable failures up
    /// to the configured attempt cap. `label` is only used for logging.
    pub async fn fetch(
        &self,
        url: &str,
        query: &[(String, String)],
        label: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let mut last_error = FetchError::Transport("no attempt made".to_string());

        for attempt in 1..=self.retry_attempts {
            let client = self.checkout_client().await?;

            debug!(
                "[{}]  GET {} (attempt {}/{})",
                self.tag, label, attempt, self.retry_attempts
            );

            match self.fetch_once(&client, url, query).await {
                Ok(body) => {
                    debug!("[{}]  {}: OK ({} bytes)", self.tag, label, body.len());
                    return Ok(body);
                }
                Err(FetchError::NotFound) => {
                    debug!("[{}]  {}: not published yet (404)", self.tag, label);
                    return Err(FetchError::NotFound);
                }
                Err(e) if e.is_retryable() => {
                    warn!("[{}]  {}: {} (attempt {})", self.tag, label, e, attempt);
                    if matches!(e, FetchError::Forbidden) {
                        self.refresh_session().await;
                    }
                    last_error = e;
                    if attempt < self.retry_attempts {
                        let delay = self.base_delay * 2u32.pow(attempt - 1);
                        debug!("[{}]  Retry in {:?}", self.tag, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn fetch_once(
        &self,
        client: &Client,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Vec<u8>, FetchError> {
        let response = client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                let body = response.bytes().await.map_err(classify_reqwest_error)?;
                Ok(body.to_vec())
            }
            404 => Err(FetchError::NotFound),
            403 => Err(FetchError::Forbidden),
            code => Err(FetchError::Server(code)),
        }
    }

    /// Hand out the pooled client, warming the session on first use and
    /// re-seeding cookies every `refresh_every` downloads.
    async fn checkout_client(&self) -> Result<Client, FetchError> {
        let mut session = self.session.lock().await;

        if !session.warmed {
            self.warm_up(&session.client).await;
            session.warmed = true;
        }

        session.downloads += 1;
        if session.downloads >= self.refresh_every {
            info!("[{}] Periodic session refresh ...", self.tag);
            match build_client(&self.headers, self.timeout) {
                Ok(client) => {
                    self.warm_up(&client).await;
                    session.client = client;
                    session.downloads = 0;
                }
                Err(e) => warn!("[{}] Session rebuild failed: {}", self.tag, e),
            }
        }

        Ok(session.client.clone())
    }

    async fn refresh_session(&self) {
        let mut session = self.session.lock().await;
        info!("[{}] HTTP 403 — refreshing session", self.tag);
        match build_client(&self.headers, self.timeout) {
            Ok(client) => {
                self.warm_up(&client).await;
                session.client = client;
                session.downloads = 0;
            }
            Err(e) => warn!("[{}] Session rebuild failed: {}", self.tag, e),
        }
    }

    /// Seed session cookies from the exchange homepage. Failure is logged
    /// and ignored; the next request will show whether it mattered.
    async fn warm_up(&self, client: &Client) {
        let Some(home) = &self.home_url else { return };
        match client.get(home).send().await {
            Ok(response) => {
                debug!("[{}] Cookie seed: HTTP {}", self.tag, response.status());
            }
            Err(e) => warn!("[{}] Cookie seed failed: {}", self.tag, e),
        }
    }
}

fn build_client(headers: &HeaderMap, timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .default_headers(headers.clone())
        .cookie_store(true)
        .build()?)
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.to_string())
    }
}

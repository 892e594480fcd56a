use encoding_rs::{Encoding, UTF_8};
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::util::UrlPolicy;

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while retrieving a document over HTTP.
#[derive(Debug, Error)]
pub enum FetchError {
    /// URL could not be parsed or is rejected by the URL policy
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Timeouts, retry policy and size cap applied to every fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_body_size: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl From<&Config> for FetchOptions {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            max_body_size: config.max_feed_size_bytes,
        }
    }
}

/// A successfully retrieved document, decoded to text.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// URL after redirects
    pub url: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedDocument {
    /// Whether the server labelled the body as an HTML page.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("text/html") || ct.contains("application/xhtml")
            })
            .unwrap_or(false)
    }
}

/// HTTP GET with retries, a size cap and charset-aware decoding.
///
/// Cheap to clone: the inner `reqwest::Client` is reference counted.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    options: FetchOptions,
    policy: UrlPolicy,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, options: FetchOptions, policy: UrlPolicy) -> Self {
        Self {
            client,
            options,
            policy,
        }
    }

    /// Builds a fetcher with a client carrying the configured User-Agent,
    /// request timeout and a redirect policy that re-checks every hop.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let policy = config.url_policy();
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy(policy))
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(client, FetchOptions::from(config), policy))
    }

    pub fn policy(&self) -> UrlPolicy {
        self.policy
    }

    /// Fetches `url` and returns its body as text.
    ///
    /// The timeout bounds each attempt as a whole, body included. Timeouts,
    /// connection failures, 5xx, 429 and truncated bodies are retried with
    /// exponential backoff.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] - URL (or a redirect target) rejected by the URL policy
    /// - [`FetchError::Network`] - Connection or TLS errors after retries
    /// - [`FetchError::Timeout`] - Attempt exceeded the configured timeout after retries
    /// - [`FetchError::HttpStatus`] - Non-2xx response (5xx after retries)
    /// - [`FetchError::RateLimited`] - 429 response after max retries
    /// - [`FetchError::ResponseTooLarge`] - Body exceeded the size cap
    /// - [`FetchError::IncompleteResponse`] - Truncated body after retries
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let validated = self
            .policy
            .validate(url)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let mut retry_count = 0;

        loop {
            let result = tokio::time::timeout(self.options.timeout, self.fetch_once(&validated))
                .await
                .unwrap_or(Err(FetchError::Timeout));

            let err = match result {
                Ok(doc) => {
                    tracing::debug!(url = %url, bytes = doc.body.len(), "Fetched document");
                    return Ok(doc);
                }
                Err(e) => e,
            };

            if !err.is_transient() || retry_count >= self.options.max_retries {
                return Err(match err {
                    FetchError::HttpStatus(429) => FetchError::RateLimited(self.options.max_retries),
                    other => other,
                });
            }

            let delay = self.backoff(retry_count);
            tracing::warn!(
                url = %url,
                error = %err,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Transient fetch failure, retrying after delay"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    /// One request: send, check status and final URL, read and decode the body.
    async fn fetch_once(&self, url: &Url) -> Result<FetchedDocument, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(FetchError::from_request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        // Clients built elsewhere may follow redirects without checking them
        let final_url = response.url().clone();
        if final_url != *url {
            self.policy.validate(final_url.as_str()).map_err(|e| {
                FetchError::InvalidUrl(format!("redirect to {final_url} rejected: {e}"))
            })?;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = read_limited_bytes(response, self.options.max_body_size).await?;
        let body = decode_body(&bytes, content_type.as_deref());
        Ok(FetchedDocument {
            url: final_url.to_string(),
            content_type,
            body,
        })
    }

    /// Exponential backoff: base, 2×base, 4×base, ...
    fn backoff(&self, retry_count: u32) -> Duration {
        self.options
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }
}

impl FetchError {
    fn from_request(err: reqwest::Error) -> Self {
        if err.is_redirect() {
            let reason = std::error::Error::source(&err)
                .map(|source| source.to_string())
                .unwrap_or_else(|| err.to_string());
            FetchError::InvalidUrl(format!("redirect rejected: {reason}"))
        } else if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }

    /// Whether another attempt might succeed.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus(status) => *status == 429 || *status >= 500,
            FetchError::Network(e) => e.is_connect() || e.is_timeout() || e.is_body(),
            FetchError::Timeout | FetchError::IncompleteResponse { .. } => true,
            FetchError::InvalidUrl(_)
            | FetchError::RateLimited(_)
            | FetchError::ResponseTooLarge => false,
        }
    }
}

/// Redirect policy with a hop cap, loop detection and the URL policy
/// applied to every hop.
pub(crate) fn redirect_policy(policy: UrlPolicy) -> Policy {
    Policy::custom(move |attempt| {
        match check_redirect(policy, attempt.url(), attempt.previous()) {
            Ok(()) => {
                tracing::debug!(
                    from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
                    to = %attempt.url(),
                    hop = attempt.previous().len() + 1,
                    "Following redirect"
                );
                attempt.follow()
            }
            Err(reason) => attempt.error(reason),
        }
    })
}

fn check_redirect(policy: UrlPolicy, next: &Url, previous: &[Url]) -> Result<(), String> {
    if previous.len() >= MAX_REDIRECTS {
        return Err(format!("Too many redirects (max {MAX_REDIRECTS})"));
    }
    if previous.iter().any(|prev| prev.as_str() == next.as_str()) {
        return Err("Redirect loop detected".to_owned());
    }
    policy
        .validate(next.as_str())
        .map(|_| ())
        .map_err(|e| format!("{next}: {e}"))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_request)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

/// Decodes a response body to text.
///
/// Encoding precedence: byte-order mark, `charset` in the Content-Type
/// header, `encoding` in the XML declaration, then UTF-8. Invalid
/// sequences are replaced rather than rejected.
fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_param)
        .or_else(|| xml_declared_encoding(bytes))
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(encoding = used.name(), "Body contained invalid sequences");
    }
    text.into_owned()
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_owned())
        } else {
            None
        }
    })
}

fn xml_declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(256)];
    let head = String::from_utf8_lossy(head);
    let decl = head.trim_start_matches('\u{feff}').trim_start();
    let decl = &decl[..decl.strip_prefix("<?xml")?.find("?>")? + 5];
    let start = decl.find("encoding=")? + "encoding=".len();
    let rest = &decl[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &rest[1..];
    Some(inner[..inner.find(quote)?].to_owned())
}

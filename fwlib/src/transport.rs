use std::{
    error::Error as StdError,
    fmt,
    future::Future,
    io,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, Response, StatusCode,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] reqwest::Error),
    #[error("Server error: HTTP {0}")]
    ServerError(StatusCode),
    #[error("Request rejected by server: HTTP {0}")]
    ClientError(StatusCode),
    #[error("Giving up after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<TransportError>,
    },
    #[error("HTTP request error: {0}")]
    Request(#[source] reqwest::Error),
}

impl TransportError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_) | Self::ServerError(_))
    }

    /// The HTTP status that caused this error, if any. For exhausted retries,
    /// this is the status of the last attempt.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ServerError(s) | Self::ClientError(s) => Some(*s),
            Self::ExhaustedRetries { source, .. } => source.status(),
            Self::Request(e) | Self::ConnectionFailed(e) => e.status(),
            Self::Timeout => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::Request(e)
        } else if e.is_connect() || e.is_request() || e.is_body() || has_connection_io_error(&e) {
            // Includes the server closing or resetting the connection before
            // the response is complete
            Self::ConnectionFailed(e)
        } else {
            Self::Request(e)
        }
    }
}

/// Whether an I/O error indicating a dropped connection appears anywhere in
/// the error's source chain.
fn has_connection_io_error(e: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(e);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        current = e.source();
    }

    false
}

/// Map an HTTP status to the transport's failure classes. Anything below 400
/// is a success.
pub fn check_status(status: StatusCode) -> Result<(), TransportError> {
    let code = status.as_u16();

    if code >= 500 {
        Err(TransportError::ServerError(status))
    } else if code >= 400 {
        Err(TransportError::ClientError(status))
    } else {
        Ok(())
    }
}

/// Bounded exponential backoff settings for a single logical request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_retries: u32,
    /// Delay after the first failed attempt. Doubles after each failure.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    /// Delay to wait after the specified (1-based) attempt failed:
    /// `backoff_base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(multiplier)
    }

    /// A request is always attempted at least once.
    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETRIES, Self::DEFAULT_BACKOFF_BASE)
    }
}

/// Information about a failed attempt that is about to be retried.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    pub max_retries: u32,
    /// How long the transport will sleep before the next attempt
    pub delay: Duration,
    pub cause: &'a TransportError,
}

impl fmt::Display for RetryNotice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Attempt {}/{} failed ({}); retrying in {:.1}s ...",
            self.attempt,
            self.max_retries,
            self.cause,
            self.delay.as_secs_f64(),
        )
    }
}

/// Callback invoked before each backoff sleep. It is purely informational.
pub type RetryHook = Arc<dyn Fn(&RetryNotice<'_>) + Send + Sync>;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt limit is reached. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    hook: Option<&RetryHook>,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_retries = policy.attempts();
    let mut attempt = 1;

    loop {
        let e = match op(attempt).await {
            Ok(v) => {
                if attempt > 1 {
                    debug!("Request succeeded on attempt {attempt}/{max_retries}");
                }
                return Ok(v);
            }
            Err(e) => e,
        };

        if !e.is_transient() {
            debug!("Not retrying after fatal error: {e}");
            return Err(e);
        } else if attempt >= max_retries {
            return Err(TransportError::ExhaustedRetries {
                attempts: attempt,
                source: Box::new(e),
            });
        }

        let notice = RetryNotice {
            attempt,
            max_retries,
            delay: policy.delay_after(attempt),
            cause: &e,
        };
        warn!("{notice}");
        if let Some(h) = hook {
            h(&notice);
        }

        tokio::time::sleep(notice.delay).await;
        attempt += 1;
    }
}

/// Per-request settings applied on every attempt.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    /// Bound on the time until the response headers are received
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP client wrapper that retries transient failures.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    policy: RetryPolicy,
    on_retry: Option<RetryHook>,
}

impl HttpTransport {
    /// Create a transport with a default reqwest client. This function fails
    /// if the TLS backend fails to initialize.
    pub fn new(policy: RetryPolicy) -> Result<Self, TransportError> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .referer(false)
            // The firmware server expects `Type` and `Beta`, not `type` and `beta`
            .http1_title_case_headers()
            .build()
            .map_err(TransportError::Request)?;

        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            on_retry: None,
        }
    }

    /// Register a callback that is notified about every retry.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryNotice<'_>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send a request, retrying timeouts, connection failures, and HTTP 5xx
    /// responses. HTTP 4xx responses fail immediately. The response body is
    /// not read, so the caller can stream it.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let method = &method;

        retry(self.policy, self.on_retry.as_ref(), move |attempt| {
            self.send(method, url, options, attempt)
        }).await
    }

    /// Like [`Self::execute`], but also read the whole response body as part
    /// of each attempt. A body that stalls past the request timeout or is cut
    /// off is retried like any other transient failure.
    pub async fn execute_bytes(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Bytes, TransportError> {
        let method = &method;

        retry(self.policy, self.on_retry.as_ref(), move |attempt| async move {
            let response = self.send(method, url, options, attempt).await?;
            let read = response.bytes();

            let data = match options.timeout {
                Some(t) => tokio::time::timeout(t, read).await
                    .map_err(|_| TransportError::Timeout)??,
                None => read.await?,
            };

            debug!("Received {} byte body", data.len());

            Ok::<_, TransportError>(data)
        }).await
    }

    /// Single attempt: send the request and check the status.
    async fn send(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        attempt: u32,
    ) -> Result<Response, TransportError> {
        debug!("[attempt {attempt}] {method} {url}");

        let send = self.client
            .request(method.clone(), url)
            .headers(options.headers.clone())
            .send();

        let response = match options.timeout {
            Some(t) => tokio::time::timeout(t, send).await
                .map_err(|_| TransportError::Timeout)??,
            None => send.await?,
        };

        debug!("Response status: {}", response.status());
        check_status(response.status())?;

        Ok(response)
    }
}

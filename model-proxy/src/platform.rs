use std::future::Future;
use std::time::Duration;

use anyhow::Context as _;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use camino::Utf8Path;
use futures::StreamExt as _;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt as _;
use url::Url;

use crate::config::AuthInfo;

/// Per-attempt timeout and attempt count used for artifact downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const DOWNLOAD_ATTEMPTS: u32 = 10;

/// Delay between retry attempts.
#[derive(Debug, Clone, Copy)]
pub enum RetryDelay {
    Fixed(Duration),
    Exponential,
}

enum Schedule {
    Fixed(Duration),
    Exponential(Box<ExponentialBackoff>),
}

impl Schedule {
    fn next(&mut self) -> Duration {
        match self {
            Schedule::Fixed(delay) => *delay,
            Schedule::Exponential(backoff) => backoff.next_backoff().unwrap_or(Duration::from_secs(60)),
        }
    }
}

/// HTTP client for the platform API: base-URL joining, bearer-or-basic
/// auth, and bounded retries on transport errors and 5xx responses.
pub struct RetryClient {
    http: reqwest::Client,
    base: Url,
    auth: AuthInfo,
    attempts: u32,
    delay: RetryDelay,
}

impl RetryClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        attempts: u32,
        delay: RetryDelay,
        auth: AuthInfo,
    ) -> anyhow::Result<Self> {
        let base: Url = base_url.parse().with_context(|| format!("invalid base url: {base_url}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("unsupported scheme of base url: {}", base.scheme());
        }
        if attempts == 0 {
            anyhow::bail!("attempts must be at least 1");
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(RetryClient {
            http,
            base,
            auth,
            attempts,
            delay,
        })
    }

    pub fn build_url(&self, path: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }
        url
    }

    /// A request builder with platform credentials applied.
    pub fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        if !self.auth.auth_token.is_empty() {
            builder.bearer_auth(&self.auth.auth_token)
        } else {
            builder.basic_auth(&self.auth.user_id, Some(&self.auth.personal_token))
        }
    }

    /// A request builder without credentials, for pre-signed URLs.
    pub fn request_unauthenticated(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    /// Sends the request produced by `make`, retrying transport errors and
    /// 5xx responses. `make` is re-invoked for every attempt so streamed
    /// bodies can be rebuilt.
    pub async fn execute_with<F, Fut>(&self, make: F) -> anyhow::Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<reqwest::RequestBuilder>>,
    {
        let mut schedule = match self.delay {
            RetryDelay::Fixed(delay) => Schedule::Fixed(delay),
            RetryDelay::Exponential => Schedule::Exponential(Box::new(ExponentialBackoff::default())),
        };

        let mut attempt = 1;
        loop {
            let result = make().await?.send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(_) => true,
            };
            if !retryable || attempt >= self.attempts {
                return result.context("platform request failed");
            }

            let delay = schedule.next();
            match &result {
                Ok(response) => {
                    warn!(attempt, status = response.status().as_u16(), delay = ?delay, "platform request failed, retrying")
                }
                Err(error) => warn!(attempt, %error, delay = ?delay, "platform request failed, retrying"),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> anyhow::Result<T> {
        let url = self.build_url(path, params);
        let response = self
            .execute_with(async || Ok(self.request(reqwest::Method::GET, url.clone())))
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            anyhow::bail!("response error with StatusCode: {}", status.as_u16());
        }
        response.json().await.context("failed to decode platform response")
    }
}

/// Metadata response pointing at the real payload; the URL shapes differ
/// per API, the pattern does not.
pub trait DownloadDescriptor: DeserializeOwned {
    fn download_url(&self) -> &str;

    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// Two-step artifact fetch: metadata JSON carrying a pre-signed URL, then
/// a streamed GET of that URL into a file on disk.
pub struct Downloader {
    client: RetryClient,
}

impl Downloader {
    pub fn new(base_url: &str, auth: AuthInfo) -> anyhow::Result<Self> {
        let client = RetryClient::new(base_url, DOWNLOAD_TIMEOUT, DOWNLOAD_ATTEMPTS, RetryDelay::Exponential, auth)
            .context("failed to build http client")?;
        Ok(Downloader { client })
    }

    pub fn client(&self) -> &RetryClient {
        &self.client
    }

    /// Fetches `api_path`'s descriptor, streams the payload it points at
    /// into `dest`, and returns the descriptor for the caller's use.
    pub async fn download<T: DownloadDescriptor>(&self, api_path: &str, dest: &Utf8Path) -> anyhow::Result<T> {
        let descriptor: T = self
            .client
            .get_json(api_path, &[])
            .await
            .with_context(|| format!("failed to request to {api_path}"))?;

        let signed_url: Url = descriptor
            .download_url()
            .parse()
            .context("platform returned an invalid download url")?;

        let response = self
            .client
            .execute_with(async || Ok(self.client.request_unauthenticated(reqwest::Method::GET, signed_url.clone())))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to download from {signed_url} with status {status}, body = [{body}]");
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to open {dest}"))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("failed to read download stream")?;
            file.write_all(&chunk).await.context("failed to write download to disk")?;
        }
        file.flush().await?;

        Ok(descriptor)
    }
}

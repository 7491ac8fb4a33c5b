//! HTTP client for image payloads.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, instrument};

use super::error::DownloadError;
use super::robots;
use crate::user_agent;

/// HTTP client wrapper with the crawler identity and directive policy baked in.
///
/// Cheap to clone; clones share one connection pool.
///
/// # Example
///
/// ```no_run
/// use shardfetch::download::HttpClient;
/// use std::collections::BTreeSet;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(Duration::from_secs(10), None, BTreeSet::new())?;
/// let body = client.fetch("https://example.com/cat.jpg").await?;
/// println!("{} bytes", body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    user_agent_token: Option<String>,
    disallowed_directives: BTreeSet<String>,
}

impl HttpClient {
    /// Builds a client with a whole-request `timeout`.
    ///
    /// `user_agent_token` is announced in the User-Agent and scopes
    /// `X-Robots-Tag` matching. An empty `disallowed_directives` set
    /// disables the directive check.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the TLS backend cannot be initialized.
    pub fn new(
        timeout: Duration,
        user_agent_token: Option<String>,
        disallowed_directives: BTreeSet<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(user_agent::download_user_agent(user_agent_token.as_deref()))
            .build()?;
        Ok(Self {
            client,
            user_agent_token,
            disallowed_directives,
        })
    }

    /// Downloads `url` into memory.
    ///
    /// Non-success statuses fail before the directive check; a disallowed
    /// response fails before its body is read.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures, timeouts, error
    /// statuses and disallowing `X-Robots-Tag` headers.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status));
        }

        if robots::is_disallowed(
            response.headers(),
            self.user_agent_token.as_deref(),
            &self.disallowed_directives,
        ) {
            debug!("response disallowed by X-Robots-Tag");
            return Err(DownloadError::Disallowed {
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))
    }
}

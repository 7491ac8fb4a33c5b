//! Error types for the download module.
//!
//! [`DownloadError`] is one failed fetch attempt. Its `Display` text becomes
//! the sample's `error_message` and a status-counter label, so messages are
//! kept free of per-URL detail wherever the underlying error allows.

use thiserror::Error;

/// Message recorded for responses refused by an `X-Robots-Tag` directive.
pub const DISALLOWED_MESSAGE: &str = "Use of image disallowed by X-Robots-Tag directive";

/// Message recorded when a payload does not match its reference digest.
pub const HASH_MISMATCH_MESSAGE: &str = "hash mismatch";

/// Errors of a single fetch attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The host could not be resolved through the nameserver pool.
    #[error("DNS resolution failed: {reason} for {domain}")]
    DnsResolution {
        /// Host part of the URL.
        domain: String,
        /// Normalized resolver message.
        reason: String,
    },

    /// Connection, TLS or body transfer failure.
    #[error("{source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying error, stripped of its URL.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("The read operation timed out")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP Error {status}: {reason}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Canonical reason phrase.
        reason: String,
    },

    /// The URL is malformed or has no host.
    #[error("invalid URL: {reason}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The response carried a disallowing `X-Robots-Tag` directive.
    #[error("Use of image disallowed by X-Robots-Tag directive")]
    Disallowed {
        /// The URL whose response was refused.
        url: String,
    },
}

impl DownloadError {
    /// Classifies a reqwest error. The URL is removed from the error so the
    /// message aggregates across hosts.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network {
                url,
                source: source.without_url(),
            }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// URL of the failed attempt, when there is one.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::HttpStatus { url, .. }
            | Self::InvalidUrl { url, .. }
            | Self::Disallowed { url } => Some(url),
            Self::DnsResolution { .. } => None,
        }
    }
}

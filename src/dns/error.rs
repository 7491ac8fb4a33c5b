//! Error types for DNS resolution and answer caching.

use std::net::IpAddr;

use thiserror::Error;

/// Canonical phrase for NXDOMAIN answers.
pub const NAME_DOES_NOT_EXIST: &str = "The DNS query name does not exist.";

/// Canonical phrase for NOERROR answers without a usable record.
pub const NO_ANSWER: &str = "The DNS response does not contain an answer to the question.";

/// Canonical phrase for servers refusing or failing the query.
pub const ALL_NAMESERVERS_FAILED: &str = "All nameservers failed to answer the query.";

/// Failure of a single query against a single nameserver.
///
/// Display strings embed the queried name, which makes them useless for
/// aggregation; [`normalize_dns_error`] collapses them back to a handful of
/// canonical phrases.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The name could not be turned into a DNS query.
    #[error("invalid domain name {name}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Parser message.
        reason: String,
    },

    /// The nameserver answered NXDOMAIN.
    #[error("The DNS query name does not exist: {name}")]
    NxDomain {
        /// The queried name.
        name: String,
    },

    /// The nameserver answered without an address record.
    #[error("The DNS response does not contain an answer to the question: {name} IN A")]
    NoAnswer {
        /// The queried name.
        name: String,
    },

    /// The nameserver answered with a failure rcode (SERVFAIL, REFUSED, ...).
    #[error("All nameservers failed to answer the query {name} IN A: Server {nameserver} answered {rcode}")]
    ServerFailure {
        /// The queried name.
        name: String,
        /// The nameserver that failed.
        nameserver: IpAddr,
        /// Textual response code.
        rcode: String,
    },

    /// No reply within the query timeout.
    #[error("The DNS operation timed out.")]
    Timeout {
        /// The nameserver that did not answer.
        nameserver: IpAddr,
    },

    /// Socket-level failure talking to the nameserver.
    #[error("DNS transport error talking to {nameserver}: {source}")]
    Io {
        /// The nameserver being queried.
        nameserver: IpAddr,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The reply could not be decoded or did not match the query.
    #[error("malformed DNS response from {nameserver}: {reason}")]
    Malformed {
        /// The nameserver that sent the reply.
        nameserver: IpAddr,
        /// What was wrong with it.
        reason: String,
    },
}

/// Failure of a remote answer store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQL backend failure.
    #[error("store query failed: {0}")]
    Sql(#[from] sqlx::Error),

    /// Failed to open or migrate the backing database.
    #[error(transparent)]
    Db(#[from] crate::db::DbError),

    /// Redis connection or command failure.
    #[error("redis store error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure of a resolver cache operation.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed.
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    /// A cached answer could not be encoded or decoded.
    #[error("cache entry {key} could not be (de)serialized: {source}")]
    Codec {
        /// Store key of the entry.
        key: String,
        /// Codec error.
        #[source]
        source: postcard::Error,
    },
}

/// Collapses resolver error text to a low-cardinality canonical phrase.
///
/// Resolver messages carry the queried domain, so aggregating them verbatim
/// yields one bucket per domain. Recognized failure families are mapped to a
/// fixed phrase; anything else is returned unchanged.
#[must_use]
pub fn normalize_dns_error(message: &str) -> String {
    if message.contains("The DNS query name does not exist") {
        NAME_DOES_NOT_EXIST.to_string()
    } else if message.contains("The DNS response does not contain an answer to the question") {
        NO_ANSWER.to_string()
    } else if message.contains("All nameservers failed to answer the query") {
        ALL_NAMESERVERS_FAILED.to_string()
    } else {
        message.to_string()
    }
}

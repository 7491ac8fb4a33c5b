//! `X-Robots-Tag` response-header directives.
//!
//! A header value is either a directive list (`noai, noimageai`) applying to
//! every crawler, or a user-agent token followed by a colon and a directive
//! list (`mybot: noindex`) applying only to that crawler. Matching is
//! case-insensitive.

use std::collections::BTreeSet;

use reqwest::header::HeaderMap;
use tracing::debug;

/// Header carrying the directives.
pub const X_ROBOTS_TAG: &str = "x-robots-tag";

/// Directives that forbid using an image for dataset construction.
pub const DEFAULT_DISALLOWED_DIRECTIVES: [&str; 4] = ["noai", "noimageai", "noindex", "noimageindex"];

/// [`DEFAULT_DISALLOWED_DIRECTIVES`] as a set.
#[must_use]
pub fn default_disallowed_directives() -> BTreeSet<String> {
    DEFAULT_DISALLOWED_DIRECTIVES
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Whether any `X-Robots-Tag` header disallows use of the response.
///
/// A header counts when it is unscoped or scoped to `user_agent_token`, and
/// lists at least one directive from `disallowed`. `disallowed` must hold
/// lowercase directives. Headers that are not valid text are skipped.
#[must_use]
pub fn is_disallowed(
    headers: &HeaderMap,
    user_agent_token: Option<&str>,
    disallowed: &BTreeSet<String>,
) -> bool {
    if disallowed.is_empty() {
        return false;
    }
    headers.get_all(X_ROBOTS_TAG).iter().any(|value| {
        let Ok(value) = value.to_str() else {
            debug!("skipping non-text X-Robots-Tag header");
            return false;
        };
        header_disallows(value, user_agent_token, disallowed)
    })
}

fn header_disallows(value: &str, user_agent_token: Option<&str>, disallowed: &BTreeSet<String>) -> bool {
    let (scope, directives) = match value.split_once(':') {
        Some((token, directives)) => (Some(token.trim().to_lowercase()), directives),
        None => (None, value),
    };
    let applies = match scope {
        None => true,
        Some(scope) => user_agent_token.is_some_and(|token| token.eq_ignore_ascii_case(&scope)),
    };
    applies
        && directives
            .split(',')
            .map(|directive| directive.trim().to_lowercase())
            .any(|directive| disallowed.contains(&directive))
}

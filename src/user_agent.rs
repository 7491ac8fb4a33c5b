//! User-Agent string sent with every image request.

/// Project URL advertised next to an operator token.
const PROJECT_UA_URL: &str = "https://github.com/rom1504/img2dataset";

/// Browser string many image hosts expect.
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:72.0) Gecko/20100101 Firefox/72.0";

/// User-Agent for image downloads.
///
/// With a token the string gains a `(compatible; {token}; +{url})` suffix so
/// site operators can scope `X-Robots-Tag` directives to this crawler.
#[must_use]
pub fn download_user_agent(token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() => {
            format!("{BROWSER_USER_AGENT} (compatible; {token}; +{PROJECT_UA_URL})")
        }
        _ => BROWSER_USER_AGENT.to_string(),
    }
}

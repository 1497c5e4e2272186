//! SSRF-safe URL fetcher.
//!
//! Every target is validated *before* any connection is made: scheme must be
//! http(s), the hostname must clear a denylist, and every resolved address
//! must fall outside loopback, private, link-local (including the cloud
//! metadata address), CGNAT, and their IPv6 equivalents. Redirects are
//! followed manually (at most [`MAX_REDIRECTS`] hops) and every hop is
//! re-validated; an HTTPS→HTTP downgrade or a non-http(s) scheme ends the
//! fetch. Bodies are capped at [`MAX_BODY_BYTES`], enforced both by
//! `Content-Length` and by streaming accumulation. Each URL gets
//! [`FETCH_TIMEOUT`] in total.
//!
//! Batch fetching de-duplicates input URLs and runs at most
//! [`FETCH_CONCURRENCY`] requests in parallel. Partial success is the
//! normal mode: the result carries successes and per-URL typed errors side
//! by side, and one bad URL never aborts a batch.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Maximum redirect hops per URL.
pub const MAX_REDIRECTS: usize = 5;
/// Maximum response body size.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Total wall-clock budget per URL, redirects included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum URLs fetched in parallel per batch.
pub const FETCH_CONCURRENCY: usize = 5;

/// Hostnames rejected outright, before DNS resolution.
const DENIED_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
];

/// Per-URL failure. These surface in the ingest response `errors[]`; none
/// of them aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("blocked by SSRF guard")]
    SsrfBlocked,
    #[error("fetch timed out")]
    Timeout,
    #[error("response body too large")]
    TooLarge,
    #[error("too many redirects")]
    RedirectLimit,
    #[error("fetch failed: {0}")]
    Failed(String),
}

impl FetchError {
    /// Stable machine-readable reason for the API error list.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::SsrfBlocked => "ssrf_blocked",
            FetchError::Timeout => "timeout",
            FetchError::TooLarge => "too_large",
            FetchError::RedirectLimit => "redirect_limit",
            FetchError::Failed(_) => "fetch_failed",
        }
    }
}

/// A successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL the content was finally served from (after redirects).
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Outcome of a batch fetch: successes keyed by the *requested* URL, plus
/// typed per-URL errors.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub pages: HashMap<String, FetchedPage>,
    pub errors: Vec<(String, FetchError)>,
}

/// True when an address must never be fetched.
///
/// Covers: IPv4 loopback `127/8`, private `10/8`, `172.16/12`,
/// `192.168/16`, link-local `169.254/16`, CGNAT `100.64/10`, `0.0.0.0`,
/// broadcast; IPv6 loopback, unspecified, link-local `fe80::/10`, unique
/// local `fc00::/7`, site-local `fec0::/10`, and v4-mapped addresses that
/// resolve to any of the above.
pub fn ip_is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4_is_blocked(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return v4_is_blocked(mapped);
            }
            v6_is_blocked(v6)
        }
    }
}

fn v4_is_blocked(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}

fn v6_is_blocked(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // unique local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // deprecated site-local fec0::/10
        || (segments[0] & 0xffc0) == 0xfec0
}

/// Validate a parsed URL: scheme, hostname denylist, and every resolved
/// address. Returns the error a caller should report for this URL.
async fn validate_target(url: &Url) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(FetchError::SsrfBlocked),
    }

    let host = url.host_str().ok_or(FetchError::SsrfBlocked)?;
    let host_lower = host.trim_end_matches('.').to_ascii_lowercase();

    if DENIED_HOSTS.contains(&host_lower.as_str()) || host_lower.ends_with(".localhost") {
        return Err(FetchError::SsrfBlocked);
    }

    // IP literals skip DNS. Strip brackets for v6 literals.
    let bare = host_lower.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return if ip_is_blocked(ip) {
            Err(FetchError::SsrfBlocked)
        } else {
            Ok(())
        };
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host_lower.as_str(), port))
        .await
        .map_err(|e| FetchError::Failed(format!("DNS resolution failed: {}", e)))?;

    let mut any = false;
    for addr in addrs {
        any = true;
        if ip_is_blocked(addr.ip()) {
            return Err(FetchError::SsrfBlocked);
        }
    }
    if !any {
        return Err(FetchError::Failed("hostname resolved to no addresses".into()));
    }
    Ok(())
}

/// Build the client the fetcher uses: redirects disabled (hops are walked
/// manually so each target is re-validated).
pub fn build_client() -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| FetchError::Failed(format!("client build failed: {}", e)))
}

/// Fetch one URL under the full guard set and the per-URL time budget.
pub async fn fetch_url(client: &reqwest::Client, raw_url: &str) -> Result<FetchedPage, FetchError> {
    match tokio::time::timeout(FETCH_TIMEOUT, fetch_with_redirects(client, raw_url)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    }
}

async fn fetch_with_redirects(
    client: &reqwest::Client,
    raw_url: &str,
) -> Result<FetchedPage, FetchError> {
    let mut current = Url::parse(raw_url)
        .map_err(|e| FetchError::Failed(format!("invalid URL: {}", e)))?;

    for _hop in 0..=MAX_REDIRECTS {
        validate_target(&current).await?;

        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Failed(e.to_string())
                }
            })?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::Failed("redirect without Location".into()))?;

            let next = current
                .join(location)
                .map_err(|e| FetchError::Failed(format!("invalid redirect target: {}", e)))?;

            match next.scheme() {
                "http" | "https" => {}
                _ => return Err(FetchError::SsrfBlocked),
            }
            if current.scheme() == "https" && next.scheme() == "http" {
                return Err(FetchError::SsrfBlocked);
            }

            debug!(from = %current, to = %next, "following redirect");
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(FetchError::Failed(format!("HTTP {}", status)));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_BODY_BYTES {
                return Err(FetchError::TooLarge);
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Stream the body so an unbounded response is cancelled mid-flight,
        // not after it landed in memory.
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| FetchError::Failed(e.to_string()))?;
            if body.len() + piece.len() > MAX_BODY_BYTES {
                return Err(FetchError::TooLarge);
            }
            body.extend_from_slice(&piece);
        }

        return Ok(FetchedPage {
            final_url: current.to_string(),
            content_type,
            body,
        });
    }

    Err(FetchError::RedirectLimit)
}

/// Fetch a batch of URLs: de-duplicate, then fan out with at most
/// [`FETCH_CONCURRENCY`] in flight. Order of `errors` follows the
/// de-duplicated input order.
pub async fn fetch_batch(client: &reqwest::Client, urls: &[String]) -> BatchOutcome {
    let mut seen = std::collections::HashSet::new();
    let unique: Vec<String> = urls
        .iter()
        .filter(|u| seen.insert(u.as_str()))
        .cloned()
        .collect();

    let results: Vec<(String, Result<FetchedPage, FetchError>)> = stream::iter(unique)
        .map(|u| async move {
            let outcome = fetch_url(client, &u).await;
            (u, outcome)
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;

    let mut outcome = BatchOutcome::default();
    // buffer_unordered scrambles completion order; re-key by URL.
    let mut by_url: HashMap<String, Result<FetchedPage, FetchError>> = results.into_iter().collect();
    for u in urls {
        if let Some(result) = by_url.remove(u) {
            match result {
                Ok(page) => {
                    outcome.pages.insert(u.clone(), page);
                }
                Err(e) => outcome.errors.push((u.clone(), e)),
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn private_range_172_boundaries() {
        assert!(!ip_is_blocked(v4("172.15.255.255")));
        assert!(ip_is_blocked(v4("172.16.0.0")));
        assert!(ip_is_blocked(v4("172.31.255.255")));
        assert!(!ip_is_blocked(v4("172.32.0.0")));
    }

    #[test]
    fn cgnat_boundaries() {
        assert!(!ip_is_blocked(v4("100.63.255.255")));
        assert!(ip_is_blocked(v4("100.64.0.0")));
        assert!(ip_is_blocked(v4("100.127.255.255")));
        assert!(!ip_is_blocked(v4("100.128.0.0")));
    }

    #[test]
    fn loopback_private_linklocal_blocked() {
        assert!(ip_is_blocked(v4("127.0.0.1")));
        assert!(ip_is_blocked(v4("127.255.255.255")));
        assert!(ip_is_blocked(v4("10.0.0.1")));
        assert!(ip_is_blocked(v4("192.168.1.1")));
        assert!(ip_is_blocked(v4("169.254.169.254"))); // cloud metadata
        assert!(ip_is_blocked(v4("0.0.0.0")));
        assert!(ip_is_blocked(v4("255.255.255.255")));
    }

    #[test]
    fn public_addresses_allowed() {
        assert!(!ip_is_blocked(v4("8.8.8.8")));
        assert!(!ip_is_blocked(v4("93.184.216.34")));
        assert!(!ip_is_blocked(v4("1.1.1.1")));
    }

    #[test]
    fn v6_ranges() {
        assert!(ip_is_blocked("::1".parse().unwrap()));
        assert!(ip_is_blocked("::".parse().unwrap()));
        assert!(ip_is_blocked("fe80::1".parse().unwrap()));
        assert!(ip_is_blocked("fc00::1".parse().unwrap()));
        assert!(ip_is_blocked("fd12:3456::1".parse().unwrap()));
        assert!(ip_is_blocked("fec0::1".parse().unwrap()));
        assert!(!ip_is_blocked("2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn v4_mapped_v6_blocked() {
        assert!(ip_is_blocked("::ffff:127.0.0.1".parse().unwrap()));
        assert!(ip_is_blocked("::ffff:10.0.0.5".parse().unwrap()));
        assert!(!ip_is_blocked("::ffff:8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn non_http_scheme_rejected() {
        let url = Url::parse("ftp://example.com/file").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));

        let url = Url::parse("file:///etc/passwd").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));
    }

    #[tokio::test]
    async fn denied_hostnames_rejected_without_dns() {
        for host in ["localhost", "LOCALHOST", "localhost.", "ip6-localhost"] {
            let url = Url::parse(&format!("http://{}/x", host)).unwrap();
            assert_eq!(
                validate_target(&url).await,
                Err(FetchError::SsrfBlocked),
                "{} should be denied",
                host
            );
        }
        let url = Url::parse("http://svc.localhost/x").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));
    }

    #[tokio::test]
    async fn ip_literal_targets_validated() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));

        let url = Url::parse("http://169.254.169.254/latest/meta-data").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));

        let url = Url::parse("http://[::1]:8080/").unwrap();
        assert_eq!(validate_target(&url).await, Err(FetchError::SsrfBlocked));
    }

    #[test]
    fn error_reasons_are_stable() {
        assert_eq!(FetchError::SsrfBlocked.reason(), "ssrf_blocked");
        assert_eq!(FetchError::Timeout.reason(), "timeout");
        assert_eq!(FetchError::TooLarge.reason(), "too_large");
        assert_eq!(FetchError::RedirectLimit.reason(), "redirect_limit");
        assert_eq!(FetchError::Failed("x".into()).reason(), "fetch_failed");
    }
}

//! SSRF Guard (§4.12): shared host-allowlist + pinned-DNS fetch utility.
//! Every outbound media fetch performed on behalf of a chat message
//! (attachments, pairing-code avatars, file uploads staged for
//! re-delivery) is expected to route through [`fetch`] rather than
//! calling `reqwest` directly, so the private-network guard and the
//! DNS-rebinding pin live in exactly one place.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use reqwest::Url;
use tracing::instrument;

use crate::{AppError, Result};

/// Options governing a single guarded fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Hosts the target is permitted to resolve to. Empty means "no
    /// allowlist restriction" (still subject to the private-range checks).
    pub allowed_hosts: Vec<String>,
    /// Hard cap on the response body, in bytes.
    pub max_bytes: u64,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            max_bytes: 25 * 1024 * 1024,
            timeout: Duration::from_secs(20),
        }
    }
}

/// A guarded fetch's result: the response plus a `release` the caller
/// must invoke to close the underlying connection, even on early
/// abandonment (e.g. the caller stops reading after `maxBytes`).
pub struct GuardedFetch {
    /// The HTTP response, truncated to at most `maxBytes` by [`read_body`].
    pub response: reqwest::Response,
    max_bytes: u64,
}

impl GuardedFetch {
    /// Drain the body up to `maxBytes`, returning `AppError::SsrfBlocked`
    /// if the response exceeds the cap.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SsrfBlocked` if the body is larger than
    /// `maxBytes`, or `AppError::Io` on a transport-level read failure.
    pub async fn read_body(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        while let Some(chunk) = self
            .response
            .chunk()
            .await
            .map_err(|err| AppError::Io(err.to_string()))?
        {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > self.max_bytes {
                self.release();
                return Err(AppError::SsrfBlocked(format!(
                    "response exceeded max_bytes ({})",
                    self.max_bytes
                )));
            }
        }
        Ok(buf)
    }

    /// Close the underlying connection without reading further. Reqwest
    /// closes the connection when the response is dropped, so this is a
    /// named no-op that makes the "callers must release" contract
    /// explicit at call sites rather than relying on drop order.
    pub fn release(self) {
        drop(self);
    }
}

/// Returns `true` if `ip` belongs to a private, loopback, link-local, or
/// otherwise non-public network range — the set of ranges a DNS-rebinding
/// or internal-pivot SSRF attempt would target.
#[must_use]
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || is_v4_shared_address(ip)
        || is_v4_documentation(ip)
        || is_v4_benchmarking(ip)
}

/// 100.64.0.0/10 — shared address space (RFC 6598 / CGNAT).
fn is_v4_shared_address(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xC0) == 64
}

/// Documentation ranges: 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24.
fn is_v4_documentation(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)
}

/// Benchmarking range: 198.18.0.0/15.
fn is_v4_benchmarking(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 198 && (o[1] & 0xFE) == 18
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || is_v6_unique_local(ip) || is_v6_link_local(ip)
}

/// Unique-local addresses: fc00::/7 (in practice fd00::/8).
fn is_v6_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xFE00) == 0xFC00
}

/// Link-local addresses: fe80::/10.
fn is_v6_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xFFC0) == 0xFE80
}

fn host_is_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    allowed_hosts.is_empty() || allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Resolve `host:port` once and return every socket address it maps to.
///
/// # Errors
///
/// Returns `AppError::SsrfBlocked` if DNS resolution fails or returns no
/// addresses.
fn resolve_once(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| AppError::SsrfBlocked(format!("DNS resolution failed for {host}: {err}")))?
        .collect();
    if addrs.is_empty() {
        return Err(AppError::SsrfBlocked(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    Ok(addrs)
}

/// Validate `url` against the SSRF guard's rules (§4.12 step 1-2):
/// http(s) only, host on the allowlist (if non-empty), and every resolved
/// address public — then return the pinned address to connect to.
///
/// # Errors
///
/// Returns `AppError::SsrfBlocked` describing the first rule violated.
fn validate_and_resolve(url: &Url, allowed_hosts: &[String]) -> Result<SocketAddr> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(AppError::SsrfBlocked(format!("blocked scheme: {other}://"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::SsrfBlocked("url has no host".to_owned()))?;
    if !host_is_allowed(host, allowed_hosts) {
        return Err(AppError::SsrfBlocked(format!("host not in allowlist: {host}")));
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = resolve_once(host, port)?;

    for addr in &addrs {
        if is_private_ip(&addr.ip()) {
            return Err(AppError::SsrfBlocked(format!(
                "blocked request to private/internal address: {host} resolves to {}",
                addr.ip()
            )));
        }
    }

    // Pin the first resolved address: the same address the private-range
    // check above just approved is the one the connection actually uses,
    // closing the DNS-rebinding TOCTOU window between check and connect.
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| AppError::SsrfBlocked(format!("no usable address for {host}")))
}

/// Fetch `url` under the SSRF guard (§4.12): scheme/allowlist/private-range
/// validation, DNS resolved once and pinned for the connection, `Host`
/// header preserved as the original hostname.
///
/// # Errors
///
/// Returns `AppError::SsrfBlocked` for an invalid scheme, disallowed host,
/// private/loopback-resolved address, or `AppError::Io` if the request
/// itself fails.
#[instrument(skip(options), fields(url = %url))]
pub async fn fetch(url: &str, options: FetchOptions) -> Result<GuardedFetch> {
    let parsed = Url::parse(url).map_err(|err| AppError::SsrfBlocked(format!("invalid url: {err}")))?;
    let pinned = validate_and_resolve(&parsed, &options.allowed_hosts)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::SsrfBlocked("url has no host".to_owned()))?
        .to_owned();

    let client = reqwest::Client::builder()
        .timeout(options.timeout)
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&host, pinned)
        .build()
        .map_err(|err| AppError::Io(format!("failed to build guarded http client: {err}")))?;

    let response = client
        .get(parsed)
        .send()
        .await
        .map_err(|err| AppError::Io(format!("guarded fetch failed: {err}")))?;

    Ok(GuardedFetch {
        response,
        max_bytes: options.max_bytes,
    })
}

//! HTTP fetch client using reqwest.
//!
//! Returns the raw status and body without judging non-2xx statuses — the
//! core's classifier decides what a 403 or 503 means. Transport-level
//! failures surface as [`AppError::Transient`]. SSRF protection is enabled
//! by default: requests to private/reserved IP ranges are refused before
//! any connection is made.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use url::Url;

use forager_core::error::AppError;
use forager_core::traits::{FetchClient, FetchRequest, FetchResponse};

/// Configuration for the HTTP fetch client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    /// Refuse URLs that resolve to private/reserved addresses. Disable
    /// only where the operator controls the machine.
    pub ssrf_protection: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Forager/{} (price watcher)", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            ssrf_protection: true,
        }
    }
}

impl HttpClientConfig {
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

/// Reqwest-backed [`FetchClient`].
#[derive(Clone)]
pub struct HttpFetchClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpFetchClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

impl FetchClient for HttpFetchClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, AppError> {
        if self.config.ssrf_protection {
            guard_against_ssrf(&request.url).await?;
        }

        let response = self.client.get(&request.url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Transient(format!(
                    "request to {} timed out after {}s",
                    request.url,
                    self.config.timeout.as_secs()
                ))
            } else {
                AppError::Transient(format!("request to {} failed: {e}", request.url))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Transient(format!("failed to read response body: {e}")))?;

        tracing::debug!(url = %request.url, status, bytes = body.len(), "Fetched");
        Ok(FetchResponse { status, body })
    }
}

/// Reject URLs that are not plain http(s) to a public address.
async fn guard_against_ssrf(raw: &str) -> Result<(), AppError> {
    let url =
        Url::parse(raw).map_err(|e| AppError::Permanent(format!("invalid URL '{raw}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Permanent(format!(
            "URL scheme '{}' is not allowed",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Permanent(format!("URL '{raw}' has no host")))?;

    // IP literals are checked directly; hostnames resolve first.
    let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = url.port_or_known_default().unwrap_or(443);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| AppError::Transient(format!("DNS resolution failed for {host}: {e}")))?
                .map(|addr| addr.ip())
                .collect()
        }
    };

    if addrs.is_empty() {
        return Err(AppError::Transient(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for ip in addrs {
        if is_private_ip(ip) {
            return Err(AppError::Permanent(format!(
                "refusing to fetch {host}: resolves to private/reserved address {ip}"
            )));
        }
    }

    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata (169.254.169.254)
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // CGN
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // link-local
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // unique local
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

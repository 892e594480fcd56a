use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL carries embedded credentials.
    #[error("Credentials in URL not allowed")]
    Credentials,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Which hosts the engine is willing to contact.
///
/// The default rejects localhost and private ranges so a subscribed feed
/// (or a link found during discovery) cannot make the engine probe the
/// local network. Test setups and self-hosted deployments that poll an
/// intranet can opt out via `allow_private_hosts` in the config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlPolicy {
    pub allow_private_hosts: bool,
}

impl UrlPolicy {
    pub const fn permissive() -> Self {
        Self {
            allow_private_hosts: true,
        }
    }

    /// Validates a URL string for use as a feed or discovery source.
    ///
    /// Always rejects non-HTTP(S) schemes and embedded credentials.
    /// Unless private hosts are allowed, also rejects localhost, loopback,
    /// RFC 1918, link-local and unique-local addresses.
    pub fn validate(&self, url_str: &str) -> Result<Url, UrlValidationError> {
        let url = Url::parse(url_str)?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(UrlValidationError::Credentials);
        }

        if self.allow_private_hosts {
            return Ok(url);
        }

        if let Some(host) = url.host_str() {
            if host.eq_ignore_ascii_case("localhost") {
                return Err(UrlValidationError::Localhost);
            }

            // Strip brackets from IPv6 addresses for parsing
            let host_for_parse = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);

            if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
                if ip.is_loopback() {
                    return Err(UrlValidationError::Localhost);
                }
                if is_private_ip(&ip) {
                    return Err(UrlValidationError::PrivateIp(ip.to_string()));
                }
            }
        }

        Ok(url)
    }
}

/// Prepends `https://` to user input that has no scheme.
///
/// `example.com/blog` becomes `https://example.com/blog`; input that
/// already names a scheme is returned trimmed but otherwise untouched.
pub fn with_default_scheme(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        trimmed.to_owned()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        format!("https://{trimmed}")
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

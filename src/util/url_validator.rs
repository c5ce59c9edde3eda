use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Rejection reasons for feed URLs that fail registration policy.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a URL for use as a feed source.
///
/// Feed URLs arrive in untrusted OPML files and the ingestion loop will
/// fetch them unattended, so registration rejects anything that could be
/// aimed at internal infrastructure: non-HTTP(S) schemes, localhost, and
/// private or link-local address ranges.
///
/// ```
/// use weir::util::validate_url;
///
/// assert!(validate_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// assert!(validate_url("http://10.0.0.1/feed").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            // Url lowercases hostnames during parsing.
            if domain == "localhost" {
                return Err(UrlValidationError::Localhost);
            }
        }
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_v4(ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_v6(ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
        None => {}
    }

    Ok(url)
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() {
        return true;
    }
    // An IPv4-mapped address smuggles a v4 host through the v6 parser.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return v4.is_loopback() || is_private_v4(v4);
    }
    let segments = ip.segments();
    // Unique Local (fc00::/7)
    let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
    // Link-Local (fe80::/10)
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    is_unique_local || is_link_local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls_accepted() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://news.example.org").is_ok());
        assert!(validate_url("https://example.com:8443/feed.xml").is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("gopher://example.com").is_err());
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(validate_url("http://localhost/feed").is_err());
        assert!(validate_url("http://127.0.0.1/feed").is_err());
        assert!(validate_url("http://[::1]/feed").is_err());
    }

    #[test]
    fn test_private_ranges_rejected() {
        assert!(validate_url("http://192.168.1.1/feed").is_err());
        assert!(validate_url("http://10.0.0.1/feed").is_err());
        assert!(validate_url("http://172.16.0.1/feed").is_err());
        assert!(validate_url("http://169.254.1.1/feed").is_err());
        assert!(validate_url("http://0.0.0.0/feed").is_err());
    }

    #[test]
    fn test_private_ipv6_rejected() {
        assert!(validate_url("http://[fe80::1]/feed").is_err());
        assert!(validate_url("http://[fc00::1]/feed").is_err());
        assert!(validate_url("http://[fd12:3456::1]/feed").is_err());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_rejected() {
        assert!(validate_url("http://[::ffff:127.0.0.1]/feed").is_err());
        assert!(validate_url("http://[::ffff:192.168.1.1]/feed").is_err());
    }

    #[test]
    fn test_port_does_not_bypass_policy() {
        assert!(validate_url("http://192.168.1.1:8080/feed").is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed").is_err());
    }

    #[test]
    fn test_unparseable_rejected() {
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("").is_err());
    }
}

//! Client identifier extraction.

use std::net::SocketAddr;

/// Pick the identifier a request is throttled under.
///
/// Preference order: the first address in `X-Forwarded-For`, then
/// `X-Real-IP`, then the peer address without its port. A peer address that
/// does not parse is used verbatim.
pub fn client_identifier(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: &str,
) -> String {
    if let Some(xff) = forwarded_for.filter(|v| !v.trim().is_empty()) {
        let first = xff.split(',').next().unwrap_or(xff);
        return first.trim().to_string();
    }

    if let Some(xri) = real_ip.filter(|v| !v.trim().is_empty()) {
        return xri.trim().to_string();
    }

    match remote_addr.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => remote_addr.to_string(),
    }
}

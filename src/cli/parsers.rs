//! Shared CLI argument parsers.

use snapvisor::clone::ExternalDisks;
use std::net::SocketAddr;

/// Parse a listen address (e.g., "127.0.0.1:8090").
pub fn parse_listen(s: &str) -> Result<SocketAddr, String> {
    s.parse()
        .map_err(|e| format!("invalid listen address '{}': {}", s, e))
}

/// Parse an external-disk policy ("link" or "detach").
pub fn parse_external_disks(s: &str) -> Result<ExternalDisks, String> {
    match s.to_ascii_lowercase().as_str() {
        "link" => Ok(ExternalDisks::Link),
        "detach" => Ok(ExternalDisks::Detach),
        other => Err(format!(
            "invalid external disk policy '{}': expected link or detach",
            other
        )),
    }
}

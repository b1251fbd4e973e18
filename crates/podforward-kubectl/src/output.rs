//! Parsing of kubectl port-forward output

use podforward_session::LocalEndpoint;

const FORWARDING_PREFIX: &str = "Forwarding from ";

/// Whether kubectl reported the listener as ready
pub fn is_forwarding_line(line: &str) -> bool {
    line.trim_start().starts_with(FORWARDING_PREFIX)
}

/// Extract the local endpoint from a line like
/// `Forwarding from 127.0.0.1:9001 -> 8080` or `Forwarding from [::1]:9001 -> 8080`
pub fn parse_forwarding_line(line: &str) -> Option<LocalEndpoint> {
    let rest = line.trim().strip_prefix(FORWARDING_PREFIX)?;
    let (local, _remote) = rest.split_once(" -> ")?;
    let (host, port) = local.trim().rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some(LocalEndpoint::new(host, port))
}

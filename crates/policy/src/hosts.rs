//! Hostname allowlist matching.
//!
//! Entries match case-insensitively and exactly; a wildcard entry
//! (`*.example.com`) matches exactly one label.

/// Pull the hostname out of a URL or bare host string.
pub fn extract_host(raw: &str) -> String {
    let without_scheme = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(raw);
    let host_port = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    // Strip credentials and port.
    let host = host_port
        .rsplit_once('@')
        .map(|(_, h)| h)
        .unwrap_or(host_port);
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Does `pattern` cover `host`? Both are compared case-insensitively.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        // Exactly one extra label: "a.example.com" matches
        // "*.example.com"; "a.b.example.com" does not.
        match host.strip_suffix(suffix) {
            Some(prefix) => {
                let label = prefix.strip_suffix('.');
                label.is_some_and(|l| !l.is_empty() && !l.contains('.'))
            }
            None => false,
        }
    } else {
        pattern == host
    }
}

//! Endpoint URL normalization

/// Remote endpoint used when the caller supplies none
pub const DEFAULT_REMOTE_URL: &str = "wss://nebulaservices.org/wisp/";

/// DNS-over-HTTPS resolver used when the caller supplies none
pub const DEFAULT_RESOLVER_URL: &str = "https://cloudflare-dns.com/dns-query";

/// Normalize a remote tunnel endpoint
///
/// Blank input yields [`DEFAULT_REMOTE_URL`]. A URL without a `ws://` or
/// `wss://` scheme gets `wss://` prepended, and the result always ends in `/`.
pub fn normalize_remote_url(input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return DEFAULT_REMOTE_URL.to_string();
    }

    let mut url = if input.starts_with("ws://") || input.starts_with("wss://") {
        input.to_string()
    } else {
        format!("wss://{}", input)
    };

    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Normalize a DNS-over-HTTPS resolver URL
///
/// Blank input yields [`DEFAULT_RESOLVER_URL`]. Anything not already on
/// `https://` (compared case-insensitively) is moved onto it; a plain
/// `http://` scheme is upgraded rather than nested.
pub fn normalize_resolver_url(input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return DEFAULT_RESOLVER_URL.to_string();
    }

    if has_scheme(input, "https://") {
        input.to_string()
    } else if has_scheme(input, "http://") {
        format!("https://{}", &input["http://".len()..])
    } else {
        format!("https://{}", input)
    }
}

fn has_scheme(url: &str, scheme: &str) -> bool {
    url.get(..scheme.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_uses_defaults() {
        assert_eq!(normalize_remote_url(""), DEFAULT_REMOTE_URL);
        assert_eq!(normalize_remote_url("   "), DEFAULT_REMOTE_URL);
        assert_eq!(normalize_resolver_url(""), DEFAULT_RESOLVER_URL);
    }

    #[test]
    fn test_bare_hosts() {
        assert_eq!(normalize_remote_url("example.com"), "wss://example.com/");
        assert_eq!(normalize_resolver_url("example.org"), "https://example.org");
    }

    #[test]
    fn test_remote_keeps_scheme() {
        assert_eq!(normalize_remote_url("ws://relay.test/wisp"), "ws://relay.test/wisp/");
        assert_eq!(normalize_remote_url("wss://relay.test/"), "wss://relay.test/");
    }

    #[test]
    fn test_resolver_scheme_is_case_insensitive() {
        assert_eq!(
            normalize_resolver_url("HTTPS://resolver.test/dns-query"),
            "HTTPS://resolver.test/dns-query"
        );
    }

    #[test]
    fn test_resolver_upgrades_plain_http() {
        assert_eq!(
            normalize_resolver_url("http://resolver.test/dns-query"),
            "https://resolver.test/dns-query"
        );
    }

    #[test]
    fn test_non_ascii_input_does_not_panic() {
        assert_eq!(normalize_resolver_url("дns.test"), "https://дns.test");
    }
}

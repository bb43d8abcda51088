//! Small shared helpers

/// Split a `host:port` address into its parts.
///
/// Returns `None` when the address has no port separator, an empty host,
/// or a port that does not fit in `u16`. The port is taken after the last
/// colon so bracketless IPv6 forms like `::1:9000` still split.
pub fn parse_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("127.0.0.1:9000"),
            Some(("127.0.0.1".to_string(), 9000))
        );
        assert_eq!(
            parse_host_port("db.example.com:8123"),
            Some(("db.example.com".to_string(), 8123))
        );
        assert_eq!(parse_host_port("::1:9000"), Some(("::1".to_string(), 9000)));
    }

    #[test]
    fn test_parse_host_port_invalid() {
        assert_eq!(parse_host_port("no-port"), None);
        assert_eq!(parse_host_port(":9000"), None);
        assert_eq!(parse_host_port("host:"), None);
        assert_eq!(parse_host_port("host:notaport"), None);
        assert_eq!(parse_host_port("host:99999"), None);
        assert_eq!(parse_host_port(""), None);
    }
}

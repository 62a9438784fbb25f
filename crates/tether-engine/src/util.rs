use std::time::Duration;

/// Check if a TCP endpoint is reachable within the given timeout.
pub async fn check_tcp_reachable(target: &str, timeout: Duration) -> bool {
    let host = extract_host(target);
    if host.is_empty() {
        return false;
    }
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&host))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Extract `host:port` from a bare endpoint or a URL.
///
/// Handles `http://`, `https://` and `tcp://`, and strips any path.
pub fn extract_host(target: &str) -> String {
    let stripped = target
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_start_matches("tcp://");
    stripped.split('/').next().unwrap_or("").to_string()
}

/// Whether `program` resolves to an existing file, either as a path or via
/// `$PATH`.
pub fn binary_available(program: &str) -> bool {
    if program.contains('/') {
        return std::path::Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_host_strips_scheme_and_path() {
        assert_eq!(extract_host("192.168.100.1:9200"), "192.168.100.1:9200");
        assert_eq!(extract_host("https://hooks.example.net:443/x/y"), "hooks.example.net:443");
        assert_eq!(extract_host("tcp://1.1.1.1:443"), "1.1.1.1:443");
        assert_eq!(extract_host(""), "");
    }

    #[test]
    fn binary_lookup() {
        assert!(!binary_available("definitely-not-a-real-binary-7f3a"));
        assert!(!binary_available("/nonexistent/dir/gpsctl"));
    }

    #[tokio::test]
    async fn unreachable_when_host_empty() {
        assert!(!check_tcp_reachable("", Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn reachable_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(check_tcp_reachable(&addr, Duration::from_secs(1)).await);
    }
}

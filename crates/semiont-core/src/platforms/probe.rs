//! Reachability probes shared by the process and external platforms.

use crate::results::HealthInfo;
use std::time::{Duration, Instant};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// True when a TCP connection to `host:port` succeeds within `timeout`.
pub async fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// GET `url` and report health. Any 2xx/3xx status counts as healthy;
/// connection failures and timeouts come back as unhealthy rather than as
/// errors.
pub async fn http_health(url: &str, timeout: Duration) -> HealthInfo {
    let started = Instant::now();
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => return unhealthy(url, e.to_string()),
    };
    match client.get(url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let mut info = HealthInfo {
                healthy: status.is_success() || status.is_redirection(),
                endpoint: Some(url.to_string()),
                response_time_ms: Some(started.elapsed().as_millis() as u64),
                ..Default::default()
            };
            info.details
                .insert("statusCode".into(), status.as_u16().into());
            info
        }
        Err(e) => unhealthy(url, e.to_string()),
    }
}

fn unhealthy(url: &str, reason: String) -> HealthInfo {
    let mut info = HealthInfo {
        healthy: false,
        endpoint: Some(url.to_string()),
        ..Default::default()
    };
    info.details.insert("error".into(), reason.into());
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_probe_sees_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_reachable("127.0.0.1", port, PROBE_TIMEOUT).await);
        drop(listener);
    }

    #[tokio::test]
    async fn tcp_probe_reports_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!tcp_reachable("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn http_probe_reports_status() {
        let mut server = mockito::Server::new_async().await;
        let ok = server.mock("GET", "/api/health").with_status(200).create_async().await;
        let bad = server.mock("GET", "/broken").with_status(503).create_async().await;

        let healthy = http_health(&format!("{}/api/health", server.url()), PROBE_TIMEOUT).await;
        assert!(healthy.healthy);
        assert_eq!(healthy.details["statusCode"], 200);

        let broken = http_health(&format!("{}/broken", server.url()), PROBE_TIMEOUT).await;
        assert!(!broken.healthy);
        assert_eq!(broken.details["statusCode"], 503);

        ok.assert_async().await;
        bad.assert_async().await;
    }
}

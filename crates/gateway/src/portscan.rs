//! Listening-port probe over the web-terminal range.

use std::time::Duration;

use {
    futures::{StreamExt, stream},
    serde::Serialize,
    tokio::net::TcpStream,
};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const PROBE_CONCURRENCY: usize = 32;

/// A port observed listening on loopback, with its owning session when the
/// port is leased to one.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// Probe `start..=max` on loopback and return the ports accepting
/// connections, annotated with lease owners.
pub async fn scan_listening(start: u16, max: u16, leases: &[(u16, String)]) -> Vec<PortStatus> {
    if start > max {
        return Vec::new();
    }

    let mut open: Vec<u16> = stream::iter(start..=max)
        .map(|port| async move {
            let probe = TcpStream::connect(("127.0.0.1", port));
            match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
                Ok(Ok(_)) => Some(port),
                _ => None,
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(std::future::ready)
        .collect()
        .await;
    open.sort_unstable();

    open.into_iter()
        .map(|port| PortStatus {
            port,
            sid: leases
                .iter()
                .find(|(leased, _)| *leased == port)
                .map(|(_, sid)| sid.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::net::TcpListener};

    #[tokio::test]
    async fn finds_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let leases = vec![(port, "s1".to_string())];
        let open = scan_listening(port, port, &leases).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].port, port);
        assert_eq!(open[0].sid.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn closed_ports_are_omitted() {
        // Bind then drop to get a (very likely) closed port.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let open = scan_listening(port, port, &[]).await;
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn inverted_range_is_empty() {
        assert!(scan_listening(9000, 8000, &[]).await.is_empty());
    }
}

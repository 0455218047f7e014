use std::error::Error;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub enum ConnectError {
    Dns(std::io::Error),
    NoRouteToHost,
    Timeout,
}

impl Error for ConnectError {}

impl Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Opens a TCP connection to the origin within one overall `budget`. Only
/// IPv4 addresses are attempted; resolving into a dual-stack answer and
/// waiting out unreachable v6 routes is what the budget is meant to avoid.
pub async fn connect(host: &str, port: u16, budget: Duration) -> Result<TcpStream, ConnectError> {
    let deadline = Instant::now() + budget;

    let resolved = timeout_at(deadline, lookup_host((host, port)))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(ConnectError::Dns)?;

    let addrs: Vec<SocketAddr> = resolved.filter(|a| a.is_ipv4()).collect();
    if addrs.is_empty() {
        debug!("No IPv4 addresses for {host}");
        return Err(ConnectError::NoRouteToHost);
    }

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectError::Timeout);
        }

        trace!("Connecting to {addr} (budget {remaining:?})");
        match timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                warn!("Connect to {addr} failed: {err}");
                continue;
            }
            Err(_) => return Err(ConnectError::Timeout),
        }
    }

    Err(ConnectError::NoRouteToHost)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn refused_port_is_no_route() {
        // Bind-then-drop to find a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NoRouteToHost));
    }

    #[tokio::test]
    async fn unresolvable_host_is_dns_error() {
        let err = connect("nxdomain.invalid", 80, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Dns(_) | ConnectError::NoRouteToHost
        ));
    }
}

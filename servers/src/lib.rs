//! Loopback origin stubs for integration tests. Each server answers every
//! request with one pre-scripted byte response and records the raw request
//! bytes it received.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use snitcher_shared::{SnitcherCA, io::local_tcp_listener, tls::TlsConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Raw request byte blobs, one per served connection.
pub type RequestLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Plain-TCP origin replying with `response` verbatim, then closing.
pub async fn scripted_origin(
    response: Vec<u8>,
) -> Result<(SocketAddr, JoinHandle<()>, RequestLog), Box<dyn Error>> {
    let listener = local_tcp_listener(None).await?;
    let addr = listener.local_addr()?;
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let serve_log = log.clone();
    let handle = tokio::spawn(async move {
        info!("Scripted origin listening on {addr}");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("Origin request from {peer}");
                    let response = response.clone();
                    let log = serve_log.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, response, log).await {
                            error!("Origin serve error: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("Origin accept failed: {err}");
                    break;
                }
            }
        }
    });

    Ok((addr, handle, log))
}

/// TLS origin presenting a leaf for `host` minted by `ca`.
pub async fn scripted_tls_origin(
    ca: &SnitcherCA,
    host: &str,
    response: Vec<u8>,
) -> Result<(SocketAddr, JoinHandle<()>, RequestLog), Box<dyn Error>> {
    let listener = local_tcp_listener(None).await?;
    let addr = listener.local_addr()?;
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let (leaf, key) = ca.sign_leaf(host)?;
    let server_config = TlsConfig::default().server_config(vec![leaf], key)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let serve_log = log.clone();
    let handle = tokio::spawn(async move {
        info!("Scripted TLS origin listening on {addr}");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("TLS origin request from {peer}");
                    let acceptor = acceptor.clone();
                    let response = response.clone();
                    let log = serve_log.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls) => {
                                if let Err(err) = serve(tls, response, log).await {
                                    error!("TLS origin serve error: {err}");
                                }
                            }
                            Err(err) => warn!("TLS origin handshake failed: {err}"),
                        }
                    });
                }
                Err(err) => {
                    warn!("TLS origin accept failed: {err}");
                    break;
                }
            }
        }
    });

    Ok((addr, handle, log))
}

async fn serve<S>(
    mut stream: S,
    response: Vec<u8>,
    log: RequestLog,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_request(&mut stream).await?;
    if let Ok(mut guard) = log.lock() {
        guard.push(request);
    }
    stream.write_all(&response).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Reads one request: the head, plus a Content-Length body when declared.
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            match content_length(&buf[..head_end + 4]) {
                Some(length) if buf.len() < head_end + 4 + length => continue,
                _ => break,
            }
        }
    }
    Ok(buf)
}

fn content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

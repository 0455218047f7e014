use std::error::Error;
use std::fmt::Display;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use snitcher_shared::CaError;
use snitcher_shared::tls::PermissiveClientConfig;

use crate::flow::{Flow, FlowEvent, Headers, HttpRequest, HttpResponse, Scheme, next_id};
use crate::h1::{H1Codec, ParseError, encode_request, encode_response};
use crate::proxy::ProxyContext;
use crate::replay_stream::ReplayStream;
use crate::upstream::{self, ConnectError};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\nBad Gateway";

#[derive(Debug)]
pub enum HandlerError {
    Parse(ParseError),
    Protocol(String),
    Upstream(String),
    Client(String),
    Timeout,
    Certificate(String),
    Internal(String),
}

impl Error for HandlerError {}

impl Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<ParseError> for HandlerError {
    fn from(value: ParseError) -> Self {
        match value {
            ParseError::MissingHost => HandlerError::Protocol("missing Host header".into()),
            ParseError::ConnectionClosed => {
                HandlerError::Client("closed before sending a request".into())
            }
            ParseError::Io(err) => HandlerError::Client(format!("read failed: {err}")),
            other => HandlerError::Parse(other),
        }
    }
}

impl From<ConnectError> for HandlerError {
    fn from(value: ConnectError) -> Self {
        match value {
            ConnectError::Timeout => HandlerError::Timeout,
            other => HandlerError::Upstream(other.to_string()),
        }
    }
}

impl From<CaError> for HandlerError {
    fn from(value: CaError) -> Self {
        HandlerError::Certificate(value.to_string())
    }
}

fn upstream_parse_error(err: ParseError) -> HandlerError {
    HandlerError::Upstream(format!("origin response: {err}"))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn error_response(status: u16, reason: &str) -> Vec<u8> {
    encode_response(&HttpResponse {
        status,
        reason: reason.to_string(),
        version: 1,
        headers: Headers::new(),
        body: Bytes::copy_from_slice(reason.as_bytes()),
    })
}

/// Maps a failure class onto the wire: parse and protocol faults earn a
/// 400, anything upstream-shaped a 502, client faults nothing at all.
async fn respond_error<S: tokio::io::AsyncWrite + Unpin>(codec: &mut H1Codec<S>, err: &HandlerError) {
    let bytes = match err {
        HandlerError::Parse(_) | HandlerError::Protocol(_) => error_response(400, "Bad Request"),
        HandlerError::Upstream(_) | HandlerError::Timeout | HandlerError::Certificate(_) => {
            error_response(502, "Bad Gateway")
        }
        HandlerError::Client(_) | HandlerError::Internal(_) => return,
    };
    if let Err(write_err) = codec.write_all(&bytes).await {
        trace!("Failed to deliver error response: {write_err}");
    }
}

/// Per-connection entry point. Binds a flow to the client endpoint, runs
/// the state machine, and finalizes the flow on every exit path; nothing
/// escapes into the acceptor.
pub async fn handle_connection(
    cxt: ProxyContext,
    stream: TcpStream,
    client_addr: SocketAddr,
    cancel: CancellationToken,
) {
    let mut flow = Flow::new(next_id().await, client_addr.to_string());

    let outcome = {
        // Panics (a misbehaving interceptor, most likely) must not skip
        // finalization; they surface as InternalError like any other fault.
        let drive = AssertUnwindSafe(drive(&cxt, stream, &mut flow, client_addr)).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Handler for {client_addr} cancelled");
                Err(HandlerError::Client("proxy shutting down".into()))
            }
            result = drive => match result {
                Ok(result) => result,
                Err(payload) => Err(HandlerError::Internal(panic_message(payload.as_ref()))),
            },
        }
    };

    match &outcome {
        Ok(()) => trace!("Connection from {client_addr} done"),
        Err(HandlerError::Client(reason)) => debug!("Client {client_addr}: {reason}"),
        Err(err) => warn!("Connection from {client_addr} failed: {err}"),
    }
    if let Err(err) = outcome {
        flow.error = Some(err.to_string());
    }

    flow.finish();
    let flow = Arc::new(flow);
    cxt.flow_store.store(flow.clone());
    if cxt.events.send(FlowEvent::Captured(flow)).is_err() {
        trace!("Flow event channel closed");
    }
}

async fn drive(
    cxt: &ProxyContext,
    stream: TcpStream,
    flow: &mut Flow,
    client_addr: SocketAddr,
) -> Result<(), HandlerError> {
    let mut codec = H1Codec::new(stream);

    let req = match codec.read_request().await {
        Ok(req) => req,
        Err(err) => {
            let err = HandlerError::from(err);
            respond_error(&mut codec, &err).await;
            codec.shutdown().await;
            return Err(err);
        }
    };

    trace!("{client_addr}: {} {}", req.method, req.url());
    flow.request = req.clone();

    if req.is_connect() {
        flow.connect_target = Some(req.target_host());
        if cxt.config.intercept_https {
            tls_tunnel(cxt, codec, flow, req).await
        } else {
            opaque_tunnel(cxt, codec, flow, req).await
        }
    } else {
        plain_http(cxt, &mut codec, flow, req).await
    }
}

fn ensure_host(req: &mut HttpRequest) {
    if !req.headers.contains("Host") {
        let value = if req.port == req.scheme.default_port() {
            req.host.clone()
        } else {
            req.target_host()
        };
        req.headers.append("Host", value);
    }
}

async fn plain_http(
    cxt: &ProxyContext,
    codec: &mut H1Codec<TcpStream>,
    flow: &mut Flow,
    mut req: HttpRequest,
) -> Result<(), HandlerError> {
    let result = exchange_plain(cxt, flow, &mut req).await;

    let outcome = match result {
        Ok(res) => codec
            .write_all(&encode_response(&res))
            .await
            .map_err(|err| HandlerError::Client(format!("write response: {err}"))),
        Err(err) => {
            respond_error(codec, &err).await;
            Err(err)
        }
    };
    codec.shutdown().await;
    outcome
}

async fn exchange_plain(
    cxt: &ProxyContext,
    flow: &mut Flow,
    req: &mut HttpRequest,
) -> Result<HttpResponse, HandlerError> {
    ensure_host(req);
    cxt.pipeline.apply_request(req, flow);
    flow.request = req.clone();

    let origin = upstream::connect(&req.host, req.port, cxt.config.upstream_connect_timeout).await?;
    let mut origin = H1Codec::new(origin);

    origin
        .write_all(&encode_request(req))
        .await
        .map_err(|err| HandlerError::Upstream(format!("write to origin: {err}")))?;
    let mut res = origin.read_response().await.map_err(upstream_parse_error)?;
    origin.shutdown().await;

    cxt.pipeline.apply_response(&mut res, flow);
    flow.response = Some(res.clone());
    Ok(res)
}

/// The interception path: terminate TLS toward the client with a minted
/// leaf, re-originate TLS toward the origin, and relay exactly one parsed
/// exchange through the pipeline. No byte pumps are started here.
async fn tls_tunnel(
    cxt: &ProxyContext,
    codec: H1Codec<TcpStream>,
    flow: &mut Flow,
    connect_req: HttpRequest,
) -> Result<(), HandlerError> {
    let (mut stream, leftover) = codec.into_parts();
    stream
        .write_all(CONNECT_ESTABLISHED)
        .await
        .map_err(|err| HandlerError::Client(format!("write CONNECT response: {err}")))?;

    let (leaf, key) = cxt.ca.sign_leaf(&connect_req.host)?;
    let server_config = cxt
        .tls_config
        .server_config(vec![leaf], key)
        .map_err(|err| HandlerError::Certificate(format!("server config: {err}")))?;

    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let client_tls = acceptor
        .accept(ReplayStream::new(leftover.freeze(), stream))
        .await
        .map_err(|err| HandlerError::Client(format!("client TLS handshake: {err}")))?;
    let mut client = H1Codec::new(client_tls);

    let result = intercept_exchange(cxt, flow, &mut client, &connect_req).await;
    if let Err(err) = &result {
        respond_error(&mut client, err).await;
    }
    client.shutdown().await;
    result
}

async fn intercept_exchange(
    cxt: &ProxyContext,
    flow: &mut Flow,
    client: &mut H1Codec<tokio_rustls::server::TlsStream<ReplayStream<TcpStream>>>,
    connect_req: &HttpRequest,
) -> Result<(), HandlerError> {
    let origin_tcp = upstream::connect(
        &connect_req.host,
        connect_req.port,
        cxt.config.upstream_connect_timeout,
    )
    .await?;

    let PermissiveClientConfig {
        verifier,
        client_config,
    } = cxt.tls_config.client_config();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(connect_req.host.clone())
        .map_err(|_| HandlerError::Upstream(format!("invalid SNI host {}", connect_req.host)))?;

    let origin_tls = connector
        .connect(server_name, origin_tcp)
        .await
        .map_err(|err| HandlerError::Upstream(format!("origin TLS handshake: {err}")))?;
    flow.origin_certs = verifier.captured();
    let mut origin = H1Codec::new(origin_tls);

    let mut req = client.read_request().await?;
    req.scheme = Scheme::Https;
    if req.host.is_empty() {
        req.host = connect_req.host.clone();
    }
    req.port = connect_req.port;
    ensure_host(&mut req);
    cxt.pipeline.apply_request(&mut req, flow);
    flow.request = req.clone();

    origin
        .write_all(&encode_request(&req))
        .await
        .map_err(|err| HandlerError::Upstream(format!("write to origin: {err}")))?;
    let mut res = origin.read_response().await.map_err(upstream_parse_error)?;
    origin.shutdown().await;

    cxt.pipeline.apply_response(&mut res, flow);
    flow.response = Some(res.clone());
    client
        .write_all(&encode_response(&res))
        .await
        .map_err(|err| HandlerError::Client(format!("write response: {err}")))?;
    Ok(())
}

/// Interception disabled: forward encrypted bytes both ways untouched. The
/// flow records only the CONNECT target and byte counts.
async fn opaque_tunnel(
    cxt: &ProxyContext,
    codec: H1Codec<TcpStream>,
    flow: &mut Flow,
    connect_req: HttpRequest,
) -> Result<(), HandlerError> {
    let (mut stream, leftover) = codec.into_parts();

    let origin = match upstream::connect(
        &connect_req.host,
        connect_req.port,
        cxt.config.upstream_connect_timeout,
    )
    .await
    {
        Ok(origin) => origin,
        Err(err) => {
            let _ = stream.write_all(CONNECT_FAILED).await;
            let _ = stream.shutdown().await;
            return Err(err.into());
        }
    };

    stream
        .write_all(CONNECT_ESTABLISHED)
        .await
        .map_err(|err| HandlerError::Client(format!("write CONNECT response: {err}")))?;

    flow.response = Some(HttpResponse {
        status: 200,
        reason: "Connection Established".into(),
        version: 1,
        headers: Headers::new(),
        body: Bytes::new(),
    });

    let mut client = ReplayStream::new(leftover.freeze(), stream);
    let mut origin = origin;
    match tokio::io::copy_bidirectional(&mut client, &mut origin).await {
        Ok((up, down)) => {
            flow.bytes_up = up;
            flow.bytes_down = down;
            trace!(
                "Tunnel to {} closed ({up} up / {down} down)",
                connect_req.target_host()
            );
        }
        Err(err) => {
            // Abrupt teardown is routine for opaque TLS tunnels.
            debug!("Tunnel to {} ended: {err}", connect_req.target_host());
        }
    }
    Ok(())
}

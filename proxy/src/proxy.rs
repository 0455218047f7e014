use std::error::Error;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace, warn};

use snitcher_shared::{SnitcherCA, tls::TlsConfig};

use crate::flow::{DEFAULT_MAX_FLOWS, FlowEvent, FlowStore, FlowSubscriber};
use crate::http::handle_connection;
use crate::interceptor::InterceptorPipeline;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: IpAddr,
    /// 0 picks an ephemeral port.
    pub listen_port: u16,
    /// When false, CONNECT is handled as an opaque tunnel.
    pub intercept_https: bool,
    pub ca_cert_path: PathBuf,
    pub ca_password: String,
    pub max_flows: usize,
    pub upstream_connect_timeout: Duration,
    pub enable_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 7865,
            intercept_https: true,
            ca_cert_path: default_ca_path(),
            ca_password: "snitcher".to_string(),
            max_flows: DEFAULT_MAX_FLOWS,
            upstream_connect_timeout: Duration::from_secs(10),
            enable_logging: false,
        }
    }
}

pub fn default_ca_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".snitcher")
        .join("snitcher-ca.p12")
}

#[derive(Debug)]
pub enum ServerError {
    AlreadyRunning,
    BindFailed(std::io::Error),
}

impl Error for ServerError {}

impl Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything a connection handler needs, cloned into its task.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub ca: SnitcherCA,
    pub tls_config: TlsConfig,
    pub flow_store: FlowStore,
    pub pipeline: Arc<InterceptorPipeline>,
    pub events: UnboundedSender<FlowEvent>,
}

/// The acceptor: owns the listener, one task per inbound connection, and
/// the event-publish loop that fans `FlowCaptured` out to subscribers.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: SnitcherCA,
    tls_config: TlsConfig,
    flow_store: FlowStore,
    pipeline: InterceptorPipeline,
    subscribers: Vec<Arc<dyn FlowSubscriber>>,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
    publish: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        ca: SnitcherCA,
        tls_config: TlsConfig,
        flow_store: FlowStore,
    ) -> Self {
        ProxyServer {
            config,
            ca,
            tls_config,
            flow_store,
            pipeline: InterceptorPipeline::new(),
            subscribers: Vec::new(),
            running: None,
        }
    }

    /// Interceptor registration point. Changes after `start` do not affect
    /// the running acceptor.
    pub fn pipeline_mut(&mut self) -> &mut InterceptorPipeline {
        &mut self.pipeline
    }

    /// Registers a flow-event subscriber; call before `start`.
    pub fn subscribe(&mut self, subscriber: Arc<dyn FlowSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn flow_store(&self) -> FlowStore {
        self.flow_store.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Binds the listener and returns as soon as the address is known; the
    /// accept loop runs in its own task until `stop`.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        if self.config.enable_logging {
            crate::init_logging(true);
        }

        let listener =
            TcpListener::bind((self.config.listen_addr, self.config.listen_port))
                .await
                .map_err(ServerError::BindFailed)?;
        let local_addr = listener.local_addr().map_err(ServerError::BindFailed)?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events, events_rx) = mpsc::unbounded_channel();

        let cxt = ProxyContext {
            config: Arc::new(self.config.clone()),
            ca: self.ca.clone(),
            tls_config: self.tls_config.clone(),
            flow_store: self.flow_store.clone(),
            pipeline: Arc::new(self.pipeline.clone()),
            events,
        };

        let publish = tokio::spawn(publish_loop(events_rx, Arc::new(self.subscribers.clone())));
        let accept = tokio::spawn(accept_loop(
            listener,
            cxt,
            cancel.clone(),
            tracker.clone(),
        ));

        info!("Proxy listening on {local_addr}");
        self.running = Some(Running {
            cancel,
            tracker,
            accept,
            publish,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Cancels the acceptor and waits for in-flight handlers to observe
    /// cancellation and finalize their flows.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.accept.await;
            running.tracker.close();
            running.tracker.wait().await;
            // All event senders are gone now, so the publish loop drains
            // remaining events and exits.
            let _ = running.publish.await;
            info!("Proxy stopped");
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
            running.accept.abort();
            running.publish.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    cxt: ProxyContext,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                trace!("Accepted connection from {addr}");
                let cxt = cxt.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    handle_connection(cxt, stream, addr, cancel).await;
                });
            }
            Err(err) => {
                warn!("Accept failed: {err}");
                continue;
            }
        }
    }
    trace!("Acceptor loop finished");
}

async fn publish_loop(
    mut events: UnboundedReceiver<FlowEvent>,
    subscribers: Arc<Vec<Arc<dyn FlowSubscriber>>>,
) {
    while let Some(event) = events.recv().await {
        let FlowEvent::Captured(flow) = event;
        for subscriber in subscribers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.flow_captured(&flow)
            }));
            if result.is_err() {
                warn!("Flow subscriber panicked; continuing with the rest");
            }
        }
    }
    trace!("Event publish loop finished");
}

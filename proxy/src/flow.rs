use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use snowflake::SnowflakeIdGenerator;
use tracing::warn;

static ID_GENERATOR: Lazy<tokio::sync::Mutex<SnowflakeIdGenerator>> = Lazy::new(|| {
    let generator = SnowflakeIdGenerator::new(1, 1);
    tokio::sync::Mutex::new(generator)
});

pub async fn next_id() -> i64 {
    ID_GENERATOR.lock().await.generate()
}

/// Ordered header list. Lookup is case-insensitive and returns the first
/// match; duplicates are kept and emitted in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces the first occurrence in place (keeping its position) and
    /// drops any further duplicates; appends when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path and query, always `/`-prefixed for parsed requests.
    pub path: String,
    /// Uppercased ASCII token.
    pub method: String,
    /// HTTP/1.x minor version.
    pub version: u8,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    pub fn target_host(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn version_str(&self) -> &str {
        match self.version {
            0 => "1.0",
            _ => "1.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn version_str(&self) -> &str {
        match self.version {
            0 => "1.0",
            _ => "1.1",
        }
    }

    pub fn status_line(&self) -> String {
        format!("HTTP/{} {} {}", self.version_str(), self.status, self.reason)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum FlowStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// One observed transaction. Mutated only by the handler that owns it; once
/// stored it is shared read-only as `Arc<Flow>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub client_addr: String,
    pub timestamp: DateTime<Utc>,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    pub duration: Duration,
    pub status: FlowStatus,
    /// Authority of the `CONNECT` that opened this flow, when there was one.
    pub connect_target: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// DER certificates the origin presented during interception.
    pub origin_certs: Vec<Bytes>,
    pub error: Option<String>,
}

impl Flow {
    pub fn new(id: i64, client_addr: String) -> Self {
        Self {
            id,
            client_addr,
            timestamp: Utc::now(),
            request: HttpRequest::default(),
            response: None,
            duration: Duration::ZERO,
            status: FlowStatus::Pending,
            connect_target: None,
            bytes_up: 0,
            bytes_down: 0,
            origin_certs: Vec::new(),
            error: None,
        }
    }

    /// Stamps the terminal status and duration. Completed iff a response
    /// with a real status code was produced.
    pub fn finish(&mut self) {
        self.duration = (Utc::now() - self.timestamp).to_std().unwrap_or_default();
        self.status = if self.response.as_ref().is_some_and(|r| r.status > 0) {
            FlowStatus::Completed
        } else {
            FlowStatus::Failed
        };
    }
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    Captured(Arc<Flow>),
}

/// Delivery is best effort and per-subscriber isolated; a panicking
/// subscriber does not starve the rest.
pub trait FlowSubscriber: Send + Sync + std::fmt::Debug + 'static {
    fn flow_captured(&self, flow: &Arc<Flow>);
}

/// Bounded in-memory store. All operations go through one mutex; when an
/// insert pushes the size past `max_flows` the oldest flows by timestamp are
/// evicted down to the cap.
#[derive(Debug, Clone)]
pub struct FlowStore {
    inner: Arc<Mutex<HashMap<i64, Arc<Flow>>>>,
    max_flows: usize,
}

pub const DEFAULT_MAX_FLOWS: usize = 10_000;

impl FlowStore {
    pub fn new(max_flows: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_flows,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Arc<Flow>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn store(&self, flow: Arc<Flow>) {
        let mut flows = self.lock();
        flows.insert(flow.id, flow);

        if flows.len() > self.max_flows {
            let excess = flows.len() - self.max_flows;
            let oldest: Vec<i64> = flows
                .values()
                .sorted_by_key(|f| (f.timestamp, f.id))
                .take(excess)
                .map(|f| f.id)
                .collect();
            for id in oldest {
                flows.remove(&id);
            }
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<Flow>> {
        self.lock().get(&id).cloned()
    }

    /// Flows matching `pred`, newest first.
    pub fn find(&self, pred: impl Fn(&Flow) -> bool) -> Vec<Arc<Flow>> {
        self.lock()
            .values()
            .filter(|f| pred(f))
            .sorted_by_key(|f| std::cmp::Reverse((f.timestamp, f.id)))
            .cloned()
            .collect()
    }

    /// The `limit` newest flows.
    pub fn recent(&self, limit: usize) -> Vec<Arc<Flow>> {
        self.lock()
            .values()
            .sorted_by_key(|f| std::cmp::Reverse((f.timestamp, f.id)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FLOWS)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::error::Error for StoreError {}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Json(value)
    }
}

/// File-backed variant: one `<id>.json` per flow. Subscribing it to the
/// proxy's flow events persists every captured flow as it terminates.
#[derive(Debug, Clone)]
pub struct FileFlowStore {
    dir: PathBuf,
}

impl FileFlowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: i64) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn store(&self, flow: &Flow) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(flow)?;
        fs::write(self.path_for(flow.id), json)?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<Flow> {
        let path = self.path_for(id);
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(flow) => Some(flow),
                Err(err) => {
                    warn!("Skipping unreadable flow file {}: {err}", path.display());
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// All stored flows, newest first. `limit: None` returns everything;
    /// unreadable files are logged and skipped.
    pub fn flows(&self, limit: Option<usize>) -> Vec<Flow> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Failed to read flow dir {}: {err}", self.dir.display());
                return Vec::new();
            }
        };

        let mut flows: Vec<Flow> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().is_none_or(|e| e != "json") {
                    return None;
                }
                match fs::read(&path).map_err(StoreError::from).and_then(|data| {
                    serde_json::from_slice::<Flow>(&data).map_err(StoreError::from)
                }) {
                    Ok(flow) => Some(flow),
                    Err(err) => {
                        warn!("Skipping unreadable flow file {}: {err}", path.display());
                        None
                    }
                }
            })
            .collect();

        flows.sort_by_key(|f| std::cmp::Reverse((f.timestamp, f.id)));
        match limit {
            Some(limit) => {
                flows.truncate(limit);
                flows
            }
            None => flows,
        }
    }
}

impl FlowSubscriber for FileFlowStore {
    fn flow_captured(&self, flow: &Arc<Flow>) {
        if let Err(err) = self.store(flow) {
            warn!("Failed to persist flow {}: {err}", flow.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn flow_at(id: i64, secs_ago: i64) -> Arc<Flow> {
        let mut flow = Flow::new(id, "127.0.0.1:1234".into());
        flow.timestamp = Utc::now() - chrono::Duration::seconds(secs_ago);
        flow.response = Some(HttpResponse {
            status: 200,
            reason: "OK".into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        });
        flow.finish();
        Arc::new(flow)
    }

    #[test]
    fn headers_are_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("X-Test", "one");
        headers.append("x-test", "two");

        assert_eq!(headers.get("ACCEPT"), Some("text/html"));
        assert_eq!(headers.get("x-Test"), Some("one"));
        assert_eq!(headers.get_all("X-TEST"), vec!["one", "two"]);

        let order: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["Accept", "X-Test", "x-test"]);
    }

    #[test]
    fn headers_set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.append("X", "a");
        headers.append("Other", "o");
        headers.append("x", "b");
        headers.set("X", "c");

        assert_eq!(headers.get_all("x"), vec!["c"]);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn store_evicts_oldest_past_cap() {
        let store = FlowStore::new(3);
        for i in 0..5 {
            store.store(flow_at(i, 100 - i));
        }

        assert_eq!(store.len(), 3);
        // Oldest two (largest secs_ago) are gone.
        assert!(store.get(0).is_none());
        assert!(store.get(1).is_none());
        assert!(store.get(4).is_some());
    }

    #[test]
    fn find_returns_newest_first() {
        let store = FlowStore::new(10);
        store.store(flow_at(1, 30));
        store.store(flow_at(2, 10));
        store.store(flow_at(3, 20));

        let all = store.find(|_| true);
        let ids: Vec<i64> = all.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);

        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, 2);
    }

    #[test]
    fn file_store_round_trips_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::new(dir.path()).unwrap();

        let a = flow_at(10, 20);
        let b = flow_at(11, 10);
        store.store(&a).unwrap();
        store.store(&b).unwrap();
        fs::write(dir.path().join("999.json"), b"not json").unwrap();

        let loaded = store.get(10).unwrap();
        assert_eq!(loaded.id, 10);
        assert_eq!(loaded.status, FlowStatus::Completed);

        let all = store.flows(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 11);

        let limited = store.flows(Some(1));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, 11);
    }
}

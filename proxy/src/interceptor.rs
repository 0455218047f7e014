use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

use tracing::{info, warn};

use crate::flow::{Flow, HttpRequest, HttpResponse};

#[derive(Debug)]
pub enum InterceptError {
    Failed(String),
}

impl Error for InterceptError {}

impl Display for InterceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Request-side mutator. `flow` is read-only context; only the message may
/// change. Lower priority runs first.
pub trait RequestInterceptor: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32 {
        0
    }
    fn intercept(&self, req: &mut HttpRequest, flow: &Flow) -> Result<(), InterceptError>;
}

/// Response-side mutator, same contract as [`RequestInterceptor`].
pub trait ResponseInterceptor: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32 {
        0
    }
    fn intercept(&self, res: &mut HttpResponse, flow: &Flow) -> Result<(), InterceptError>;
}

/// Ordered application of the two interceptor chains. Stages run
/// sequentially in ascending priority (ties keep registration order); a
/// failing stage is logged and its input continues unchanged.
#[derive(Debug, Clone, Default)]
pub struct InterceptorPipeline {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request.push(interceptor);
        self.request.sort_by_key(|i| i.priority());
    }

    pub fn add_response(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response.push(interceptor);
        self.response.sort_by_key(|i| i.priority());
    }

    pub fn apply_request(&self, req: &mut HttpRequest, flow: &Flow) {
        for stage in &self.request {
            let snapshot = req.clone();
            if let Err(err) = stage.intercept(req, flow) {
                warn!("Request interceptor {} failed: {err}", stage.name());
                *req = snapshot;
            }
        }
    }

    pub fn apply_response(&self, res: &mut HttpResponse, flow: &Flow) {
        for stage in &self.response {
            let snapshot = res.clone();
            if let Err(err) = stage.intercept(res, flow) {
                warn!("Response interceptor {} failed: {err}", stage.name());
                *res = snapshot;
            }
        }
    }
}

/// Adds headers to requests, only where the header is not already present.
#[derive(Debug)]
pub struct HeaderInjector {
    priority: i32,
    headers: Vec<(String, String)>,
}

impl HeaderInjector {
    pub fn new(priority: i32, headers: Vec<(String, String)>) -> Self {
        Self { priority, headers }
    }
}

impl RequestInterceptor for HeaderInjector {
    fn name(&self) -> &'static str {
        "header-injector"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn intercept(&self, req: &mut HttpRequest, _flow: &Flow) -> Result<(), InterceptError> {
        for (name, value) in &self.headers {
            if !req.headers.contains(name) {
                req.headers.append(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Replaces the User-Agent, but only when the client sent one.
#[derive(Debug)]
pub struct UserAgentRewriter {
    priority: i32,
    agent: String,
}

impl UserAgentRewriter {
    pub fn new(priority: i32, agent: impl Into<String>) -> Self {
        Self {
            priority,
            agent: agent.into(),
        }
    }
}

impl RequestInterceptor for UserAgentRewriter {
    fn name(&self) -> &'static str {
        "user-agent-rewriter"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn intercept(&self, req: &mut HttpRequest, _flow: &Flow) -> Result<(), InterceptError> {
        if req.headers.contains("User-Agent") {
            req.headers.set("User-Agent", self.agent.clone());
        }
        Ok(())
    }
}

/// Substitutes response status codes according to a table.
#[derive(Debug)]
pub struct StatusCodeRemap {
    priority: i32,
    map: HashMap<u16, u16>,
}

impl StatusCodeRemap {
    pub fn new(priority: i32, map: HashMap<u16, u16>) -> Self {
        Self { priority, map }
    }
}

impl ResponseInterceptor for StatusCodeRemap {
    fn name(&self) -> &'static str {
        "status-code-remap"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn intercept(&self, res: &mut HttpResponse, _flow: &Flow) -> Result<(), InterceptError> {
        if let Some(mapped) = self.map.get(&res.status) {
            res.status = *mapped;
        }
        Ok(())
    }
}

/// Logs every response passing through; never mutates anything the caller
/// can see.
#[derive(Debug, Default)]
pub struct ResponseLogger {
    priority: i32,
}

impl ResponseLogger {
    pub fn new(priority: i32) -> Self {
        Self { priority }
    }
}

impl ResponseInterceptor for ResponseLogger {
    fn name(&self) -> &'static str {
        "response-logger"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn intercept(&self, res: &mut HttpResponse, flow: &Flow) -> Result<(), InterceptError> {
        info!(
            "{} {} -> {} {} ({} bytes)",
            flow.request.method,
            flow.request.url(),
            res.status,
            res.reason,
            res.body.len()
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::flow::{Headers, Scheme};
    use bytes::Bytes;

    fn request() -> HttpRequest {
        HttpRequest {
            scheme: Scheme::Http,
            host: "h.test".into(),
            port: 80,
            path: "/".into(),
            method: "GET".into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    fn flow() -> Flow {
        Flow::new(1, "127.0.0.1:9999".into())
    }

    #[derive(Debug)]
    struct Appender {
        priority: i32,
        header: &'static str,
        suffix: &'static str,
    }

    impl RequestInterceptor for Appender {
        fn name(&self) -> &'static str {
            "appender"
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn intercept(&self, req: &mut HttpRequest, _flow: &Flow) -> Result<(), InterceptError> {
            match req.headers.get(self.header) {
                Some(existing) => {
                    let appended = format!("{existing}{}", self.suffix);
                    req.headers.set(self.header, appended);
                }
                None => req.headers.append(self.header, self.suffix),
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Exploder;

    impl RequestInterceptor for Exploder {
        fn name(&self) -> &'static str {
            "exploder"
        }
        fn priority(&self) -> i32 {
            15
        }
        fn intercept(&self, req: &mut HttpRequest, _flow: &Flow) -> Result<(), InterceptError> {
            // Half-applied mutation that must not leak out.
            req.headers.set("X", "corrupted");
            Err(InterceptError::Failed("boom".into()))
        }
    }

    #[test]
    fn stages_apply_in_priority_order() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.add_request(Arc::new(Appender {
            priority: 20,
            header: "X",
            suffix: ",b",
        }));
        pipeline.add_request(Arc::new(Appender {
            priority: 10,
            header: "X",
            suffix: "a",
        }));

        let mut req = request();
        pipeline.apply_request(&mut req, &flow());
        assert_eq!(req.headers.get("X"), Some("a,b"));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.add_request(Arc::new(Appender {
            priority: 10,
            header: "X",
            suffix: "1",
        }));
        pipeline.add_request(Arc::new(Appender {
            priority: 10,
            header: "X",
            suffix: "2",
        }));

        let mut req = request();
        pipeline.apply_request(&mut req, &flow());
        assert_eq!(req.headers.get("X"), Some("12"));
    }

    #[test]
    fn failed_stage_is_isolated_and_input_continues() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.add_request(Arc::new(Appender {
            priority: 10,
            header: "X",
            suffix: "a",
        }));
        pipeline.add_request(Arc::new(Exploder));
        pipeline.add_request(Arc::new(Appender {
            priority: 20,
            header: "X",
            suffix: ",b",
        }));

        let mut req = request();
        pipeline.apply_request(&mut req, &flow());
        // The exploder's half-applied write was rolled back.
        assert_eq!(req.headers.get("X"), Some("a,b"));
    }

    #[test]
    fn noop_chain_is_identity() {
        let mut pipeline = InterceptorPipeline::new();
        pipeline.add_response(Arc::new(ResponseLogger::new(0)));

        let mut res = HttpResponse {
            status: 200,
            reason: "OK".into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::from_static(b"body"),
        };
        let before = res.clone();
        pipeline.apply_response(&mut res, &flow());
        pipeline.apply_response(&mut res, &flow());
        assert_eq!(res, before);
    }

    #[test]
    fn header_injector_only_adds_when_absent() {
        let injector = HeaderInjector::new(0, vec![("X-Injected".into(), "yes".into())]);
        let mut req = request();
        req.headers.append("X-Injected", "original");
        injector.intercept(&mut req, &flow()).unwrap();
        assert_eq!(req.headers.get_all("X-Injected"), vec!["original"]);
    }

    #[test]
    fn user_agent_rewriter_requires_presence() {
        let rewriter = UserAgentRewriter::new(0, "snitcher/1.0");

        let mut req = request();
        rewriter.intercept(&mut req, &flow()).unwrap();
        assert!(!req.headers.contains("User-Agent"));

        req.headers.append("User-Agent", "curl/8.0");
        rewriter.intercept(&mut req, &flow()).unwrap();
        assert_eq!(req.headers.get("User-Agent"), Some("snitcher/1.0"));
    }

    #[test]
    fn status_remap_substitutes_from_table() {
        let remap = StatusCodeRemap::new(0, HashMap::from([(404, 200)]));
        let mut res = HttpResponse {
            status: 404,
            reason: "Not Found".into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        };
        remap.intercept(&mut res, &flow()).unwrap();
        assert_eq!(res.status, 200);
    }
}

//! The `http` capability: opens websockets and validates URLs.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, info};
use url::Url;

use crate::config::WebsocketConfig;
use crate::dispatch::{method_table, CallContext, CallError, Capability, HostObject, MethodResult};
use crate::events::EventQueue;
use crate::resources::{Closeable, ResourceTracker, Tracking};
use crate::value::{Args, Value};

use super::websocket::{self, ConnectionState, WebsocketConnection};

method_table! {
    pub enum HttpMethod {
        Websocket => "websocket",
        CheckUrl => "checkURL",
    }
}

pub struct HttpApi {
    queue: EventQueue,
    tracker: Arc<ResourceTracker>,
    tracking: Arc<Tracking>,
    config: WebsocketConfig,
    runtime: Handle,
    connections: Mutex<Vec<Weak<WebsocketConnection>>>,
}

impl HttpApi {
    pub fn new(
        queue: EventQueue,
        tracker: Arc<ResourceTracker>,
        tracking: Arc<Tracking>,
        config: WebsocketConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            queue,
            tracker,
            tracking,
            config,
            runtime,
            connections: Mutex::new(Vec::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, Vec<Weak<WebsocketConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Websockets that are connecting or open.
    pub fn open_connections(&self) -> usize {
        let mut connections = self.connections();
        connections.retain(|c| {
            c.upgrade().is_some_and(|c| {
                matches!(c.state(), ConnectionState::Connecting | ConnectionState::Open)
            })
        });
        connections.len()
    }

    /// Validates a websocket URL without connecting.
    pub fn check_url(&self, address: &str) -> Result<Url, CallError> {
        if !self.config.enabled {
            return Err(CallError::message("Websocket connections are disabled"));
        }
        let url = Url::parse(address).map_err(|_| CallError::message("URL malformed"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CallError::message(format!(
                "Invalid protocol '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CallError::message("URL malformed"))?;
        if !self.config.is_allowed(host) {
            return Err(CallError::message("Domain not permitted"));
        }
        Ok(url)
    }

    fn build_request(url: &Url, args: Args<'_>) -> Result<Request, CallError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|_| CallError::message("URL malformed"))?;
        if let Some(headers) = args.opt_map(1)? {
            for (name, value) in headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| CallError::message(format!("Invalid header name '{name}'")))?;
                let value = HeaderValue::from_str(&value.to_text())
                    .map_err(|_| CallError::message(format!("Invalid value for header '{name}'")))?;
                request.headers_mut().insert(name, value);
            }
        }
        Ok(request)
    }

    fn open_websocket(&self, args: Args<'_>) -> Result<MethodResult, CallError> {
        let url = self.check_url(args.string(0)?)?;
        let request = Self::build_request(&url, args)?;
        let max = self.config.max_connections;
        if max > 0 && self.open_connections() >= max {
            return Err(CallError::message("Too many websockets already open"));
        }

        let connection =
            WebsocketConnection::new(args.string(0)?, self.queue.clone(), self.tracking.clone());
        self.tracker.track(&connection);
        self.connections().push(Arc::downgrade(&connection));
        info!("Opening websocket to {url}");
        self.runtime.spawn(websocket::run(connection, request));
        Ok(MethodResult::of(true))
    }

    fn dispatch(&self, method: HttpMethod, args: Args<'_>) -> Result<MethodResult, CallError> {
        match method {
            HttpMethod::Websocket => self.open_websocket(args),
            HttpMethod::CheckUrl => {
                let address = args.string(0)?;
                Ok(match self.check_url(address) {
                    Ok(_) => MethodResult::of(true),
                    Err(e) => {
                        debug!("checkURL rejected {address}: {e}");
                        MethodResult::values(vec![Value::from(false), Value::from(e.to_string())])
                    }
                })
            }
        }
    }
}

impl HostObject for HttpApi {
    fn method_names(&self) -> &'static [&'static str] {
        HttpMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        match HttpMethod::from_index(method) {
            Some(method) => self.dispatch(method, Args::new(args)).into(),
            None => CallError::NoSuchMethod.into(),
        }
    }
}

impl Capability for HttpApi {
    fn names(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn shutdown(&self) {
        let connections: Vec<_> = self.connections().drain(..).collect();
        let mut closed = 0;
        for connection in connections.iter().filter_map(Weak::upgrade) {
            if connection.state() != ConnectionState::Closed {
                connection.close();
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closed {closed} websocket(s) on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn api(config: WebsocketConfig) -> HttpApi {
        HttpApi::new(
            EventQueue::new(16),
            ResourceTracker::new(),
            Tracking::new(),
            config,
            Handle::current(),
        )
    }

    fn call(api: &HttpApi, method: HttpMethod, args: Vec<Value>) -> MethodResult {
        api.call(&CallContext::new(0, 0), method as usize, &args)
    }

    fn failure(result: MethodResult) -> String {
        match result {
            MethodResult::Failure(msg) => msg,
            other => panic!("Expected Failure, got {other:?}"),
        }
    }

    fn immediate(result: MethodResult) -> Vec<Value> {
        match result {
            MethodResult::Immediate(values) => values,
            other => panic!("Expected Immediate, got {other:?}"),
        }
    }

    // ── checkURL tests ────────────────────────────────────

    #[tokio::test]
    async fn test_check_url_accepts_websocket_schemes() {
        let api = api(WebsocketConfig::default());
        for url in ["ws://example.com/", "wss://example.com:8443/path?q=1"] {
            assert_eq!(
                immediate(call(&api, HttpMethod::CheckUrl, vec![url.into()])),
                vec![Value::from(true)]
            );
        }
    }

    #[tokio::test]
    async fn test_check_url_reports_reason() {
        let api = api(WebsocketConfig::default());
        assert_eq!(
            immediate(call(&api, HttpMethod::CheckUrl, vec!["http://example.com".into()])),
            vec![Value::from(false), Value::from("Invalid protocol 'http'")]
        );
        assert_eq!(
            immediate(call(&api, HttpMethod::CheckUrl, vec!["not a url".into()])),
            vec![Value::from(false), Value::from("URL malformed")]
        );
    }

    #[tokio::test]
    async fn test_domain_not_permitted() {
        let api = api(WebsocketConfig {
            allowed_hosts: vec!["*.example.com".into()],
            ..WebsocketConfig::default()
        });
        assert_eq!(
            failure(call(&api, HttpMethod::Websocket, vec!["ws://evil.org/".into()])),
            "Domain not permitted"
        );
    }

    #[tokio::test]
    async fn test_disabled() {
        let api = api(WebsocketConfig {
            enabled: false,
            ..WebsocketConfig::default()
        });
        assert_eq!(
            failure(call(&api, HttpMethod::Websocket, vec!["ws://example.com/".into()])),
            "Websocket connections are disabled"
        );
    }

    // ── websocket tests ───────────────────────────────────

    #[tokio::test]
    async fn test_websocket_requires_string_url() {
        let api = api(WebsocketConfig::default());
        assert_eq!(
            failure(call(&api, HttpMethod::Websocket, vec![])),
            "bad argument #1 (string expected, got nil)"
        );
    }

    #[tokio::test]
    async fn test_bad_header_is_rejected_before_connecting() {
        let api = api(WebsocketConfig::default());
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), Value::from("x"));
        assert_eq!(
            failure(call(
                &api,
                HttpMethod::Websocket,
                vec!["ws://127.0.0.1:1/".into(), Value::Map(headers)]
            )),
            "Invalid header name 'bad header'"
        );
        assert_eq!(api.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let api = api(WebsocketConfig {
            max_connections: 1,
            ..WebsocketConfig::default()
        });
        // Nothing listens on port 1; the attempt stays Connecting until it fails.
        assert_eq!(
            immediate(call(&api, HttpMethod::Websocket, vec!["ws://127.0.0.1:1/".into()])),
            vec![Value::from(true)]
        );
        let second = call(&api, HttpMethod::Websocket, vec!["ws://127.0.0.1:1/".into()]);
        assert_eq!(failure(second), "Too many websockets already open");
    }

    #[tokio::test]
    async fn test_refused_connection_emits_failure() {
        let api = api(WebsocketConfig::default());
        call(&api, HttpMethod::Websocket, vec!["ws://127.0.0.1:1/".into()]);
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), api.queue.recv())
            .await
            .unwrap();
        assert_eq!(event.name, websocket::FAILURE_EVENT);
        assert_eq!(
            event.args,
            vec![Value::from("ws://127.0.0.1:1/"), Value::from("Could not connect")]
        );
        assert_eq!(api.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ordinal() {
        let api = api(WebsocketConfig::default());
        assert_eq!(failure(api.call(&CallContext::new(0, 0), 2, &[])), "No such method");
    }
}

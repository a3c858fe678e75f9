//! One outbound websocket connection.
//!
//! The connection is an explicit state machine shared between the
//! script's handle and a tokio I/O task. The I/O task drives the
//! transitions (`on_open`, `on_message`, `on_remote_close`, `on_error`)
//! and every transition a script can observe is published on the
//! computer's [`EventQueue`]. Script calls never touch the socket
//! directly; outbound frames go through an unbounded channel.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::dispatch::{method_table, CallContext, CallError, HostObject, MethodResult};
use crate::events::EventQueue;
use crate::resources::{Closeable, Registration, Tracking, TrackingField};
use crate::value::{Args, Value};

pub const SUCCESS_EVENT: &str = "websocket_success";
pub const FAILURE_EVENT: &str = "websocket_failure";
pub const CLOSE_EVENT: &str = "websocket_closed";
pub const MESSAGE_EVENT: &str = "websocket_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// A script close in progress; the transport is being torn down.
    Closing,
    Closed,
}

/// Why a connection never reached `Open`.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The server answered but refused the upgrade.
    #[error("{0}")]
    Handshake(String),
    /// Anything else: DNS, TCP, TLS. The detail is for logs only.
    #[error("Could not connect")]
    Connect(String),
}

impl ConnectError {
    pub fn detail(&self) -> &str {
        match self {
            ConnectError::Handshake(msg) | ConnectError::Connect(msg) => msg,
        }
    }
}

impl From<tungstenite::Error> for ConnectError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                ConnectError::Handshake(format!("Invalid handshake response: {}", response.status()))
            }
            tungstenite::Error::Protocol(e) => ConnectError::Handshake(e.to_string()),
            other => ConnectError::Connect(other.to_string()),
        }
    }
}

method_table! {
    enum WebsocketMethod {
        Receive => "receive",
        Send => "send",
        Close => "close",
    }
}

struct Link {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

type SharedLink = Arc<Mutex<Link>>;

fn lock(link: &SharedLink) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WebsocketConnection {
    url: String,
    queue: EventQueue,
    tracking: Arc<Tracking>,
    link: SharedLink,
    registration: Registration,
}

impl WebsocketConnection {
    pub fn new(url: impl Into<String>, queue: EventQueue, tracking: Arc<Tracking>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            queue,
            tracking,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Connecting,
                outbound: None,
            })),
            registration: Registration::default(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    // ── Transport transitions ─────────────────────────────

    /// The handshake completed. Returns false if the connection was
    /// closed while connecting, in which case the caller drops the socket.
    pub fn on_open(self: &Arc<Self>, outbound: mpsc::UnboundedSender<Message>) -> bool {
        {
            let mut link = lock(&self.link);
            if link.state != ConnectionState::Connecting {
                return false;
            }
            link.state = ConnectionState::Open;
            link.outbound = Some(outbound);
        }
        info!("Websocket connected: {}", self.url);
        let handle: Arc<dyn HostObject> = self.clone();
        self.queue.push(
            SUCCESS_EVENT,
            vec![Value::from(self.url.as_str()), Value::Object(handle)],
        );
        true
    }

    /// An inbound frame. Returns false once the connection is no longer
    /// open, including while a host-side close is in progress.
    pub fn on_message(&self, message: Message) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        let payload = match message {
            Message::Text(text) => {
                self.tracking.add(TrackingField::WebsocketIncoming, text.len() as u64);
                Value::String(text)
            }
            Message::Binary(data) => {
                self.tracking.add(TrackingField::WebsocketIncoming, data.len() as u64);
                Value::Bytes(data)
            }
            Message::Close(frame) => {
                debug!("Close frame from {}: {frame:?}", self.url);
                self.on_remote_close();
                return false;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return true,
        };
        self.queue
            .push(MESSAGE_EVENT, vec![Value::from(self.url.as_str()), payload]);
        true
    }

    /// The peer closed the connection or the transport was lost. Emits
    /// the close event unless the script already closed its side.
    pub fn on_remote_close(&self) {
        {
            let mut link = lock(&self.link);
            if link.state != ConnectionState::Open {
                link.state = ConnectionState::Closed;
                return;
            }
            link.state = ConnectionState::Closed;
            link.outbound = None;
        }
        self.registration.release();
        info!("Websocket closed by remote: {}", self.url);
        self.queue.push(CLOSE_EVENT, vec![Value::from(self.url.as_str())]);
    }

    /// A connect or handshake failure. After `Open` an error counts as
    /// losing the transport.
    pub fn on_error(&self, err: ConnectError) {
        let state = {
            let mut link = lock(&self.link);
            let state = link.state;
            if state == ConnectionState::Connecting {
                link.state = ConnectionState::Closed;
            }
            state
        };
        match state {
            ConnectionState::Connecting => {
                warn!("Websocket to {} failed: {}", self.url, err.detail());
                self.registration.release();
                self.queue.push(
                    FAILURE_EVENT,
                    vec![Value::from(self.url.as_str()), Value::from(err.to_string())],
                );
            }
            ConnectionState::Open => {
                warn!("Websocket to {} lost: {}", self.url, err.detail());
                self.on_remote_close();
            }
            ConnectionState::Closing => self.finish_close(),
            ConnectionState::Closed => {}
        }
    }

    // ── Script operations ─────────────────────────────────

    fn check_open(&self) -> Result<(), CallError> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(CallError::Closed)
        }
    }

    fn receive(&self) -> Result<MethodResult, CallError> {
        self.check_open()?;
        Ok(wait_for_message(self.url.clone(), self.link.clone()))
    }

    fn send(&self, args: Args<'_>) -> Result<MethodResult, CallError> {
        let message = match args.get(0) {
            Value::Bytes(data) => Message::Binary(data.clone()),
            other => Message::Text(other.to_text()),
        };
        let link = lock(&self.link);
        let outbound = match (&link.state, &link.outbound) {
            (ConnectionState::Open, Some(outbound)) => outbound,
            _ => return Err(CallError::Closed),
        };
        self.tracking
            .add(TrackingField::WebsocketOutgoing, message.len() as u64);
        if outbound.send(message).is_err() {
            debug!("Websocket I/O task for {} already gone", self.url);
        }
        Ok(MethodResult::empty())
    }

    /// Closes from the host side. Idempotent and silent: no close event.
    fn close_silently(&self) {
        let was_live = {
            let mut link = lock(&self.link);
            let was_live = matches!(
                link.state,
                ConnectionState::Connecting | ConnectionState::Open
            );
            if was_live {
                link.state = ConnectionState::Closing;
            }
            // Dropping the sender tells the I/O task to send a close frame.
            link.outbound = None;
            was_live
        };
        self.registration.release();
        if was_live {
            info!("Websocket closed: {}", self.url);
        }
    }

    /// The I/O task finished tearing down a host-side close.
    fn finish_close(&self) {
        lock(&self.link).state = ConnectionState::Closed;
    }
}

/// Suspends until a message for `url` arrives, skipping messages for
/// other connections.
fn wait_for_message(url: String, link: SharedLink) -> MethodResult {
    MethodResult::pull_event(MESSAGE_EVENT, move |args| {
        if args.len() >= 2 && args[0].as_str() == Some(url.as_str()) {
            return MethodResult::of(args[1].clone());
        }
        if lock(&link).state != ConnectionState::Open {
            return CallError::Closed.into();
        }
        wait_for_message(url, link)
    })
}

impl HostObject for WebsocketConnection {
    fn method_names(&self) -> &'static [&'static str] {
        WebsocketMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        let result = match WebsocketMethod::from_index(method) {
            Some(WebsocketMethod::Receive) => self.receive(),
            Some(WebsocketMethod::Send) => self.send(Args::new(args)),
            Some(WebsocketMethod::Close) => {
                self.close_silently();
                Ok(MethodResult::empty())
            }
            None => Err(CallError::NoSuchMethod),
        };
        result.into()
    }
}

impl Closeable for WebsocketConnection {
    fn close(&self) {
        self.close_silently();
    }

    fn registration(&self) -> &Registration {
        &self.registration
    }
}

// ── I/O task ──────────────────────────────────────────

/// Connects and pumps frames until either side closes. Spawned once per
/// connection on the host runtime.
pub async fn run(connection: Arc<WebsocketConnection>, request: Request) {
    debug!("Connecting websocket to {}", connection.url());
    let stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            connection.on_error(e.into());
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (mut sink, mut source) = stream.split();
    if !connection.on_open(outbound_tx) {
        debug!("Websocket {} closed while connecting", connection.url());
        let _ = sink.close().await;
        connection.finish_close();
        return;
    }

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(message)) => {
                    if !connection.on_message(message) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    connection.on_error(ConnectError::Connect(e.to_string()));
                    break;
                }
                None => {
                    connection.on_remote_close();
                    break;
                }
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        connection.on_error(ConnectError::Connect(e.to_string()));
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Any exit during a host-side close still owes the peer a close frame.
    if connection.state() == ConnectionState::Closing {
        let _ = sink.close().await;
        connection.finish_close();
    }
    debug!("Websocket I/O task for {} finished", connection.url());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CallOutcome, PendingCall};
    use crate::events::Event;
    use crate::resources::ResourceTracker;

    const URL: &str = "ws://example.test/socket";

    struct Fixture {
        queue: EventQueue,
        tracking: Arc<Tracking>,
        tracker: Arc<ResourceTracker>,
        conn: Arc<WebsocketConnection>,
    }

    fn fixture() -> Fixture {
        let queue = EventQueue::new(16);
        let tracking = Tracking::new();
        let tracker = ResourceTracker::new();
        let conn = WebsocketConnection::new(URL, queue.clone(), tracking.clone());
        tracker.track(&conn);
        Fixture {
            queue,
            tracking,
            tracker,
            conn,
        }
    }

    fn open(f: &Fixture) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(f.conn.on_open(tx));
        f.queue.clear();
        rx
    }

    fn call(conn: &WebsocketConnection, method: WebsocketMethod, args: Vec<Value>) -> MethodResult {
        conn.call(&CallContext::new(0, 0), method as usize, &args)
    }

    fn failure(result: MethodResult) -> String {
        match result {
            MethodResult::Failure(msg) => msg,
            other => panic!("Expected Failure, got {other:?}"),
        }
    }

    fn pending(result: MethodResult) -> PendingCall {
        match result.into_outcome(CallContext::new(0, 0)) {
            CallOutcome::Waiting(p) => p,
            other => panic!("Expected Waiting, got {other:?}"),
        }
    }

    fn message_event(url: &str, payload: &str) -> Event {
        Event::new(MESSAGE_EVENT, vec![url.into(), payload.into()])
    }

    // ── Transition tests ──────────────────────────────────

    #[test]
    fn test_open_emits_success_with_handle() {
        let f = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(f.conn.on_open(tx));
        assert_eq!(f.conn.state(), ConnectionState::Open);

        let event = f.queue.pop().unwrap();
        assert_eq!(event.name, SUCCESS_EVENT);
        assert_eq!(event.args[0], Value::from(URL));
        let handle = event.args[1].as_object().unwrap();
        assert_eq!(handle.method_names(), &["receive", "send", "close"]);
    }

    #[test]
    fn test_handshake_failure_passes_message_through() {
        let f = fixture();
        f.conn.on_error(ConnectError::Handshake("Invalid handshake response: 404 Not Found".into()));
        let event = f.queue.pop().unwrap();
        assert_eq!(event.name, FAILURE_EVENT);
        assert_eq!(
            event.args,
            vec![Value::from(URL), Value::from("Invalid handshake response: 404 Not Found")]
        );
        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert_eq!(f.tracker.open_count(), 0);
    }

    #[test]
    fn test_transport_failure_is_generic() {
        let f = fixture();
        f.conn.on_error(ConnectError::Connect("Connection refused (os error 111)".into()));
        let event = f.queue.pop().unwrap();
        assert_eq!(event.args[1], Value::from("Could not connect"));
    }

    #[test]
    fn test_messages_become_events() {
        let f = fixture();
        let _rx = open(&f);
        assert!(f.conn.on_message(Message::Text("hello".into())));
        assert!(f.conn.on_message(Message::Binary(vec![1, 2, 3])));
        assert!(f.conn.on_message(Message::Ping(vec![])));

        let events = f.queue.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], message_event(URL, "hello"));
        assert_eq!(events[1].args[1], Value::Bytes(vec![1, 2, 3]));
        assert_eq!(f.tracking.get(TrackingField::WebsocketIncoming), 8);
    }

    #[test]
    fn test_remote_close_emits_close_event_once() {
        let f = fixture();
        let _rx = open(&f);
        assert!(!f.conn.on_message(Message::Close(None)));
        f.conn.on_remote_close();

        let events = f.queue.drain();
        assert_eq!(events, vec![Event::new(CLOSE_EVENT, vec![URL.into()])]);
        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert_eq!(f.tracker.open_count(), 0);
    }

    #[test]
    fn test_error_after_open_counts_as_close() {
        let f = fixture();
        let _rx = open(&f);
        f.conn.on_error(ConnectError::Connect("reset".into()));
        assert_eq!(f.queue.pop().unwrap().name, CLOSE_EVENT);
    }

    #[test]
    fn test_open_after_shutdown_close_is_refused() {
        let f = fixture();
        f.tracker.close_all();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!f.conn.on_open(tx));
        assert!(f.queue.is_empty());
    }

    // ── Script operation tests ────────────────────────────

    #[test]
    fn test_send_forwards_frames_and_tracks_bytes() {
        let f = fixture();
        let mut rx = open(&f);
        call(&f.conn, WebsocketMethod::Send, vec!["ping".into()]);
        call(&f.conn, WebsocketMethod::Send, vec![Value::Bytes(vec![9, 9])]);
        assert_eq!(rx.try_recv().unwrap(), Message::Text("ping".into()));
        assert_eq!(rx.try_recv().unwrap(), Message::Binary(vec![9, 9]));
        assert_eq!(f.tracking.get(TrackingField::WebsocketOutgoing), 6);
    }

    #[test]
    fn test_send_requires_open() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.conn, WebsocketMethod::Send, vec!["x".into()])),
            "attempt to use a closed file"
        );
        let _rx = open(&f);
        f.conn.on_remote_close();
        assert_eq!(
            failure(call(&f.conn, WebsocketMethod::Send, vec!["x".into()])),
            "attempt to use a closed file"
        );
    }

    #[test]
    fn test_script_close_is_silent_and_idempotent() {
        let f = fixture();
        let mut rx = open(&f);
        call(&f.conn, WebsocketMethod::Close, vec![]);
        call(&f.conn, WebsocketMethod::Close, vec![]);
        assert_eq!(f.conn.state(), ConnectionState::Closing);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.tracker.open_count(), 0);

        // The peer's close frame arriving afterwards stays silent.
        f.conn.on_remote_close();
        assert_eq!(f.conn.state(), ConnectionState::Closed);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_receive_filters_by_url() {
        let f = fixture();
        let _rx = open(&f);
        let waiting = pending(call(&f.conn, WebsocketMethod::Receive, vec![]));
        assert_eq!(waiting.event_name(), MESSAGE_EVENT);

        let CallOutcome::Waiting(waiting) = waiting.offer(&message_event("ws://other/", "nope"))
        else {
            panic!("Expected to keep waiting");
        };
        match waiting.offer(&message_event(URL, "mine")) {
            CallOutcome::Complete(_, values) => assert_eq!(values, vec![Value::from("mine")]),
            other => panic!("Expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_receive_fails_once_closed() {
        let f = fixture();
        assert_eq!(
            failure(call(&f.conn, WebsocketMethod::Receive, vec![])),
            "attempt to use a closed file"
        );

        let _rx = open(&f);
        let waiting = pending(call(&f.conn, WebsocketMethod::Receive, vec![]));
        call(&f.conn, WebsocketMethod::Close, vec![]);
        match waiting.offer(&message_event("ws://other/", "x")) {
            CallOutcome::Failed(_, msg) => assert_eq!(msg, "attempt to use a closed file"),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_error_classification() {
        let err: ConnectError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, ConnectError::Connect(_)));
        assert_eq!(err.to_string(), "Could not connect");
    }
}

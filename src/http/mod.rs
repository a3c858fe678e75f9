//! Network bridge: the `http` capability and websocket connections.
pub mod api;
pub mod websocket;

pub use api::HttpApi;
pub use websocket::{ConnectError, ConnectionState, WebsocketConnection};

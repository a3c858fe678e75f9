//! Host-side capability bridge for a sandboxed scripted computer.
//!
//! A script reaches the host only through capability surfaces (`os`,
//! `fs`, `http`) that answer each call immediately, fail it, or suspend
//! it until an event arrives on the computer's queue.
pub mod clock;
pub mod computer;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod events;
pub mod fs;
pub mod http;
pub mod resources;
pub mod value;

pub use computer::Computer;
pub use dispatch::{CallContext, CallError, CallOutcome, MethodResult};
pub use events::{Event, EventQueue};
pub use value::Value;

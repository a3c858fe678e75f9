//! Dispatch core: the single call/response/suspend protocol every
//! capability surface implements.
//!
//! A call is routed by a small integer ordinal into a per-surface method
//! table and produces a [`MethodResult`]: an immediate set of values, a
//! failure message, or a suspension that resumes only when an event with
//! the awaited name is delivered.
use std::fmt;

use thiserror::Error;

use crate::events::Event;
use crate::value::Value;

/// Identifies the calling script's suspended execution.
///
/// Owned by the interpreter; capabilities only carry it through to the
/// pending call so the interpreter knows which coroutine to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallContext {
    pub computer_id: u32,
    pub call_id: u64,
}

impl CallContext {
    pub fn new(computer_id: u32, call_id: u64) -> Self {
        Self {
            computer_id,
            call_id,
        }
    }
}

/// Continuation run against a delivered event's payload.
pub type ResumeFn = Box<dyn FnOnce(&[Value]) -> MethodResult + Send>;

/// Outcome of a host call.
pub enum MethodResult {
    /// Values returned to the script right away.
    Immediate(Vec<Value>),
    /// A call failure raised into the script with this message.
    Failure(String),
    /// Wait for the next event named `event`, then run `resume` on its
    /// payload. `resume` may itself suspend again to keep waiting.
    Suspend { event: String, resume: ResumeFn },
}

impl MethodResult {
    pub fn empty() -> Self {
        MethodResult::Immediate(Vec::new())
    }

    pub fn of(value: impl Into<Value>) -> Self {
        MethodResult::Immediate(vec![value.into()])
    }

    pub fn values(values: Vec<Value>) -> Self {
        MethodResult::Immediate(values)
    }

    pub fn pull_event<F>(event: &str, resume: F) -> Self
    where
        F: FnOnce(&[Value]) -> MethodResult + Send + 'static,
    {
        MethodResult::Suspend {
            event: event.to_string(),
            resume: Box::new(resume),
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, MethodResult::Suspend { .. })
    }

    /// Turns the result into what the interpreter tracks for `context`.
    pub fn into_outcome(self, context: CallContext) -> CallOutcome {
        match self {
            MethodResult::Immediate(values) => CallOutcome::Complete(context, values),
            MethodResult::Failure(message) => CallOutcome::Failed(context, message),
            MethodResult::Suspend { event, resume } => CallOutcome::Waiting(PendingCall {
                context,
                event,
                resume,
            }),
        }
    }
}

impl From<CallError> for MethodResult {
    fn from(err: CallError) -> Self {
        MethodResult::Failure(err.to_string())
    }
}

impl From<Result<MethodResult, CallError>> for MethodResult {
    fn from(result: Result<MethodResult, CallError>) -> Self {
        result.unwrap_or_else(MethodResult::from)
    }
}

impl fmt::Debug for MethodResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodResult::Immediate(values) => f.debug_tuple("Immediate").field(values).finish(),
            MethodResult::Failure(message) => f.debug_tuple("Failure").field(message).finish(),
            MethodResult::Suspend { event, .. } => {
                f.debug_struct("Suspend").field("event", event).finish_non_exhaustive()
            }
        }
    }
}

/// Script-facing call failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
    #[error("bad argument #{index} ({expected} expected, got {got})")]
    BadArgument {
        index: usize,
        expected: &'static str,
        got: String,
    },
    #[error("attempt to use a closed file")]
    Closed,
    #[error("No such method")]
    NoSuchMethod,
    #[error("{0}")]
    Message(String),
}

impl CallError {
    /// `index` is 0-based; the message is 1-based like the script's view.
    pub fn bad_argument(index: usize, expected: &'static str, got: &Value) -> Self {
        CallError::BadArgument {
            index: index + 1,
            expected,
            got: got.type_name().to_string(),
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        CallError::Message(msg.into())
    }
}

// ── Host objects and capabilities ─────────────────────

/// Anything the script can call methods on by ordinal.
pub trait HostObject: Send + Sync {
    /// The method table; a method's position is its dispatch ordinal.
    fn method_names(&self) -> &'static [&'static str];

    fn call(&self, context: &CallContext, method: usize, args: &[Value]) -> MethodResult;
}

/// A named global surface (`os`, `fs`, `http`) with a computer lifecycle.
///
/// `update` runs once per tick on the computer's tick thread.
pub trait Capability: HostObject {
    fn names(&self) -> &'static [&'static str];

    fn startup(&self) {}

    fn update(&self) {}

    fn shutdown(&self) {}
}

/// Resolves a method name to its ordinal in `object`'s table.
pub fn method_index<O: HostObject + ?Sized>(object: &O, name: &str) -> Option<usize> {
    object.method_names().iter().position(|m| *m == name)
}

/// Declares a method tag enum whose discriminants are the dispatch
/// ordinals, together with the name table built from the same list.
macro_rules! method_table {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $method:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($variant,)+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$($method,)+];
            const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn from_index(index: usize) -> Option<Self> {
                Self::ALL.get(index).copied()
            }

            #[allow(dead_code)]
            pub fn name(self) -> &'static str {
                Self::NAMES[self as usize]
            }
        }
    };
}
pub(crate) use method_table;

// ── Suspended calls ───────────────────────────────────

/// Interpreter-side state of a call after dispatch.
pub enum CallOutcome {
    Complete(CallContext, Vec<Value>),
    Failed(CallContext, String),
    Waiting(PendingCall),
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Complete(ctx, values) => {
                f.debug_tuple("Complete").field(ctx).field(values).finish()
            }
            CallOutcome::Failed(ctx, message) => {
                f.debug_tuple("Failed").field(ctx).field(message).finish()
            }
            CallOutcome::Waiting(pending) => f.debug_tuple("Waiting").field(pending).finish(),
        }
    }
}

/// A suspended call waiting for an event by name.
pub struct PendingCall {
    context: CallContext,
    event: String,
    resume: ResumeFn,
}

impl PendingCall {
    pub fn context(&self) -> CallContext {
        self.context
    }

    pub fn event_name(&self) -> &str {
        &self.event
    }

    /// Offers a delivered event. Events with a different name leave the
    /// call waiting untouched; a matching one runs the continuation.
    pub fn offer(self, event: &Event) -> CallOutcome {
        if event.name != self.event {
            return CallOutcome::Waiting(self);
        }
        let context = self.context;
        (self.resume)(&event.args).into_outcome(context)
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("context", &self.context)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    method_table! {
        enum Probe {
            First => "first",
            Second => "second",
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(0, 1)
    }

    /// Waits for a "ping" whose first argument equals `want`.
    fn wait_for(want: i64) -> MethodResult {
        MethodResult::pull_event("ping", move |args| {
            if args.first() == Some(&Value::from(want)) {
                MethodResult::of("matched")
            } else {
                wait_for(want)
            }
        })
    }

    #[test]
    fn test_method_table_ordinals() {
        assert_eq!(Probe::NAMES, &["first", "second"]);
        assert_eq!(Probe::from_index(1), Some(Probe::Second));
        assert_eq!(Probe::from_index(2), None);
        assert_eq!(Probe::First.name(), "first");
    }

    #[test]
    fn test_call_error_into_failure() {
        let result: MethodResult = Err(CallError::Closed).into();
        match result {
            MethodResult::Failure(msg) => assert_eq!(msg, "attempt to use a closed file"),
            other => panic!("Expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn test_immediate_completes() {
        match MethodResult::of(5).into_outcome(ctx()) {
            CallOutcome::Complete(c, values) => {
                assert_eq!(c, ctx());
                assert_eq!(values, vec![Value::from(5)]);
            }
            other => panic!("Expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_ignores_other_event_names() {
        let CallOutcome::Waiting(pending) = wait_for(1).into_outcome(ctx()) else {
            panic!("Expected Waiting");
        };
        let outcome = pending.offer(&Event::new("pong", vec![Value::from(1)]));
        assert!(matches!(outcome, CallOutcome::Waiting(_)));
    }

    #[test]
    fn test_pending_filter_resuspends_until_match() {
        let CallOutcome::Waiting(pending) = wait_for(2).into_outcome(ctx()) else {
            panic!("Expected Waiting");
        };
        let CallOutcome::Waiting(pending) = pending.offer(&Event::new("ping", vec![Value::from(1)]))
        else {
            panic!("Expected still waiting");
        };
        assert_eq!(pending.event_name(), "ping");
        match pending.offer(&Event::new("ping", vec![Value::from(2)])) {
            CallOutcome::Complete(_, values) => assert_eq!(values, vec![Value::from("matched")]),
            other => panic!("Expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_can_fail() {
        let result = MethodResult::pull_event("x", |_| CallError::message("nope").into());
        let CallOutcome::Waiting(pending) = result.into_outcome(ctx()) else {
            panic!("Expected Waiting");
        };
        match pending.offer(&Event::new("x", vec![])) {
            CallOutcome::Failed(_, msg) => assert_eq!(msg, "nope"),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }
}

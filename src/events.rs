//! Per-computer event queue.
//!
//! The one channel through which asynchronous work (timers, alarms,
//! websocket traffic, user input) becomes visible to the cooperative
//! script. Producers on any thread push; the tick thread (or an async
//! consumer) pops in FIFO order.
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::value::Value;

/// Default number of undelivered events a computer will hold.
pub const DEFAULT_QUEUE_LIMIT: usize = 256;

/// A named event with an ordered payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

struct Inner {
    events: Mutex<VecDeque<Event>>,
    limit: usize,
    notify: Notify,
}

/// Thread-safe FIFO of events for one computer. Clones share the queue.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                limit,
                notify: Notify::new(),
            }),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.inner.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues an event. Returns false (and drops the event) when the
    /// queue is already at its limit.
    pub fn push(&self, name: impl Into<String>, args: Vec<Value>) -> bool {
        let event = Event::new(name, args);
        {
            let mut events = self.events();
            if events.len() >= self.inner.limit {
                warn!("Event queue full ({}), dropping '{}'", self.inner.limit, event.name);
                return false;
            }
            debug!("Queued event: {event}");
            events.push_back(event);
        }
        self.inner.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Event> {
        self.events().pop_front()
    }

    /// Removes and returns every queued event, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        self.events().drain(..).collect()
    }

    /// Waits until an event is available and returns it.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.pop() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn clear(&self) {
        self.events().clear();
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::default();
        queue.push("a", vec![]);
        queue.push("b", vec![Value::from(1)]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().name, "a");
        assert_eq!(queue.pop().unwrap(), Event::new("b", vec![Value::from(1)]));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_limit_drops_overflow() {
        let queue = EventQueue::new(2);
        assert!(queue.push("a", vec![]));
        assert!(queue.push("b", vec![]));
        assert!(!queue.push("c", vec![]));
        let names: Vec<String> = queue.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clones_share_queue() {
        let queue = EventQueue::default();
        let producer = queue.clone();
        std::thread::spawn(move || {
            producer.push("from_thread", vec![]);
        })
        .join()
        .unwrap();
        assert_eq!(queue.pop().unwrap().name, "from_thread");
    }

    #[test]
    fn test_display() {
        let event = Event::new("timer", vec![Value::from(3)]);
        assert_eq!(event.to_string(), "timer 3");
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let queue = EventQueue::default();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push("late", vec![]);
        });
        let event = tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .unwrap();
        assert_eq!(event.name, "late");
    }
}

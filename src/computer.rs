//! A simulated computer: its event queue, resources and capability
//! surfaces, with the startup / tick / shutdown lifecycle.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::clock::OsApi;
use crate::config::WebsocketConfig;
use crate::dispatch::{method_index, CallContext, CallError, CallOutcome, Capability, HostObject, PendingCall};
use crate::environment::ComputerEnvironment;
use crate::events::{Event, EventQueue};
use crate::fs::{FileSystem, FsApi};
use crate::http::HttpApi;
use crate::resources::{ResourceTracker, Tracking};
use crate::value::Value;

/// Events taken off the queue in one delivery pass, and the suspended
/// calls they finished.
#[derive(Debug, Default)]
pub struct Delivery {
    pub events: Vec<Event>,
    pub finished: Vec<CallOutcome>,
}

pub struct Computer {
    env: Arc<dyn ComputerEnvironment>,
    queue: EventQueue,
    tracker: Arc<ResourceTracker>,
    tracking: Arc<Tracking>,
    apis: Vec<Arc<dyn Capability>>,
    on: bool,
    next_call: AtomicU64,
}

impl Computer {
    /// A computer with no capabilities yet.
    pub fn new(env: Arc<dyn ComputerEnvironment>, queue_limit: usize) -> Self {
        Self {
            env,
            queue: EventQueue::new(queue_limit),
            tracker: ResourceTracker::new(),
            tracking: Tracking::new(),
            apis: Vec::new(),
            on: false,
            next_call: AtomicU64::new(0),
        }
    }

    /// A computer exposing `os`, `fs` and `http`.
    pub fn with_standard_apis(
        env: Arc<dyn ComputerEnvironment>,
        queue_limit: usize,
        fs: FileSystem,
        websocket: WebsocketConfig,
        runtime: Handle,
    ) -> Self {
        let mut computer = Self::new(env, queue_limit);
        let os = OsApi::new(computer.env.clone(), computer.queue.clone());
        let fs = FsApi::new(Arc::new(fs), computer.tracker.clone(), computer.tracking.clone());
        let http = HttpApi::new(
            computer.queue.clone(),
            computer.tracker.clone(),
            computer.tracking.clone(),
            websocket,
            runtime,
        );
        computer.add_api(Arc::new(os));
        computer.add_api(Arc::new(fs));
        computer.add_api(Arc::new(http));
        computer
    }

    pub fn add_api(&mut self, api: Arc<dyn Capability>) {
        debug!("Registered API {:?}", api.names());
        self.apis.push(api);
    }

    pub fn api(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.apis.iter().find(|api| api.names().contains(&name))
    }

    pub fn id(&self) -> u32 {
        self.env.computer_id()
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn tracking(&self) -> &Arc<Tracking> {
        &self.tracking
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    // ── Lifecycle ─────────────────────────────────────────

    pub fn startup(&mut self) {
        if self.on {
            return;
        }
        self.queue.clear();
        for api in &self.apis {
            api.startup();
        }
        self.on = true;
        info!("Computer {} started", self.id());
    }

    /// Runs one simulation tick. Does nothing while the computer is off.
    pub fn tick(&self) {
        if !self.on {
            return;
        }
        for api in &self.apis {
            api.update();
        }
    }

    /// Stops every capability and force-closes anything the script left
    /// open. Undelivered events are discarded.
    pub fn shutdown(&mut self) {
        if !self.on {
            return;
        }
        for api in self.apis.iter().rev() {
            api.shutdown();
        }
        self.tracker.close_all();
        self.queue.clear();
        self.on = false;
        info!("Computer {} shut down", self.id());
    }

    pub fn reboot(&mut self) {
        self.shutdown();
        self.startup();
    }

    // ── Calls ─────────────────────────────────────────────

    fn next_context(&self) -> CallContext {
        CallContext::new(self.id(), self.next_call.fetch_add(1, Ordering::Relaxed))
    }

    /// Calls `api.method(args)` by name.
    pub fn call(&self, api: &str, method: &str, args: &[Value]) -> CallOutcome {
        let context = self.next_context();
        let Some(capability) = self.api(api) else {
            return CallOutcome::Failed(context, format!("No such API '{api}'"));
        };
        match method_index(capability.as_ref(), method) {
            Some(index) => self.dispatch(context, capability.as_ref(), index, args),
            None => CallOutcome::Failed(context, CallError::NoSuchMethod.to_string()),
        }
    }

    /// Calls a method on a host object (file or websocket handle) by name.
    pub fn call_object(&self, object: &Arc<dyn HostObject>, method: &str, args: &[Value]) -> CallOutcome {
        let context = self.next_context();
        match method_index(object.as_ref(), method) {
            Some(index) => self.dispatch(context, object.as_ref(), index, args),
            None => CallOutcome::Failed(context, CallError::NoSuchMethod.to_string()),
        }
    }

    fn dispatch<O: HostObject + ?Sized>(
        &self,
        context: CallContext,
        object: &O,
        method: usize,
        args: &[Value],
    ) -> CallOutcome {
        if !self.on {
            return CallOutcome::Failed(context, format!("Computer {} is off", self.id()));
        }
        object.call(&context, method, args).into_outcome(context)
    }

    /// Drains the queue and offers each event, in order, to every waiting
    /// call. Calls that finish are moved out of `pending`.
    pub fn deliver_events(&self, pending: &mut Vec<PendingCall>) -> Delivery {
        let mut delivery = Delivery {
            events: self.queue.drain(),
            finished: Vec::new(),
        };
        for event in &delivery.events {
            let waiting = std::mem::take(pending);
            for call in waiting {
                match call.offer(event) {
                    CallOutcome::Waiting(call) => pending.push(call),
                    done => delivery.finished.push(done),
                }
            }
        }
        delivery
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

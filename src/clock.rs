//! Virtual clock and scheduler: the `os` surface.
//!
//! Timers count down in ticks; alarms fire when the in-game
//! `(day, time)` supplied by the environment crosses their instant. Both
//! turn into events on the computer's queue during the per-tick update.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Datelike, Local, NaiveDate, Timelike, Utc};
use tracing::{debug, info};

use crate::dispatch::{method_table, CallContext, CallError, Capability, HostObject, MethodResult};
use crate::environment::{ComputerEnvironment, PowerRequest};
use crate::events::EventQueue;
use crate::value::{Args, Value};

/// Length of one tick in the units `startTimer` and `clock` use.
pub const TICK_LENGTH: f64 = 0.05;

pub const TIMER_EVENT: &str = "timer";
pub const ALARM_EVENT: &str = "alarm";

/// Longest label a computer may carry.
const MAX_LABEL_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Timer {
    ticks_left: i64,
}

#[derive(Debug, Clone, Copy)]
struct Alarm {
    time: f64,
    day: i32,
}

impl Alarm {
    fn instant(&self) -> f64 {
        f64::from(self.day) * 24.0 + self.time
    }
}

/// Something that fired during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Timer(i32),
    Alarm(i32),
}

impl Expiry {
    pub fn event_name(&self) -> &'static str {
        match self {
            Expiry::Timer(_) => TIMER_EVENT,
            Expiry::Alarm(_) => ALARM_EVENT,
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Expiry::Timer(id) | Expiry::Alarm(id) => *id,
        }
    }
}

/// Timers, alarms and the clock snapshot for one computer.
///
/// Ids are never reused for the life of the scheduler, including across
/// restarts of the computer.
#[derive(Debug, Default)]
pub struct Scheduler {
    running: bool,
    clock: u64,
    time: f64,
    day: i32,
    timers: HashMap<i32, Timer>,
    alarms: HashMap<i32, Alarm>,
    next_timer: i32,
    next_alarm: i32,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the running state with a fresh clock and no timers/alarms.
    pub fn start(&mut self, time: f64, day: i32) {
        self.running = true;
        self.clock = 0;
        self.time = time;
        self.day = day;
        self.timers.clear();
        self.alarms.clear();
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.timers.clear();
        self.alarms.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registers a timer firing after `round(duration / TICK_LENGTH)`
    /// updates. Zero or negative durations fire on the next update.
    pub fn start_timer(&mut self, duration: f64) -> i32 {
        let ticks = round_half_up(duration / TICK_LENGTH);
        let id = self.next_timer;
        self.next_timer = self.next_timer.wrapping_add(1);
        self.timers.insert(id, Timer { ticks_left: ticks });
        debug!("Timer {id} started for {ticks} ticks");
        id
    }

    pub fn cancel_timer(&mut self, id: i32) {
        if self.timers.remove(&id).is_some() {
            debug!("Timer {id} cancelled");
        }
    }

    /// Schedules an alarm for the next occurrence of `time`: today if it
    /// is still ahead, otherwise tomorrow.
    pub fn set_alarm(&mut self, time: f64) -> Result<i32, CallError> {
        if !(0.0..24.0).contains(&time) {
            return Err(CallError::message("Number out of range"));
        }
        let day = if time > self.time { self.day } else { self.day + 1 };
        let id = self.next_alarm;
        self.next_alarm = self.next_alarm.wrapping_add(1);
        self.alarms.insert(id, Alarm { time, day });
        debug!("Alarm {id} set for day {day} at {time}");
        Ok(id)
    }

    pub fn cancel_alarm(&mut self, id: i32) {
        if self.alarms.remove(&id).is_some() {
            debug!("Alarm {id} cancelled");
        }
    }

    /// Advances one tick with the environment's current `(time, day)`.
    ///
    /// Timers are decremented and expired ones removed; if the in-game
    /// clock moved forward, every alarm at or before the new instant is
    /// removed. Same-instant alarms come out in no particular order.
    pub fn update(&mut self, time: f64, day: i32) -> Vec<Expiry> {
        let mut fired = Vec::new();
        self.clock += 1;

        self.timers.retain(|id, timer| {
            timer.ticks_left -= 1;
            if timer.ticks_left <= 0 {
                fired.push(Expiry::Timer(*id));
                false
            } else {
                true
            }
        });

        if time > self.time || day > self.day {
            let now = f64::from(day) * 24.0 + time;
            self.alarms.retain(|id, alarm| {
                if now >= alarm.instant() {
                    fired.push(Expiry::Alarm(*id));
                    false
                } else {
                    true
                }
            });
        }

        self.time = time;
        self.day = day;
        fired
    }

    /// Seconds of uptime since startup.
    pub fn uptime(&self) -> f64 {
        self.clock as f64 * TICK_LENGTH
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn day(&self) -> i32 {
        self.day
    }

    /// Milliseconds on the synthetic in-game epoch anchored at day 0.
    pub fn ingame_epoch(&self) -> i64 {
        i64::from(self.day) * 86_400_000 + (self.time * 3_600_000.0) as i64
    }

    pub fn has_timer(&self, id: i32) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn has_alarm(&self, id: i32) -> bool {
        self.alarms.contains_key(&id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn alarm_count(&self) -> usize {
        self.alarms.len()
    }
}

/// `Math.round` semantics: halves round towards positive infinity.
fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

// ── Calendar arithmetic ───────────────────────────────

/// Hour of day with minute/second fractions, in single precision.
pub fn time_for<T: Timelike>(t: &T) -> f32 {
    let mut time = t.hour() as f32;
    time += t.minute() as f32 / 60.0;
    time += t.second() as f32 / (60.0 * 60.0);
    time
}

/// Whole days in the years since 1970 plus the 1-based day of the year,
/// so 1970-01-01 is day 1.
pub fn day_for<T: Datelike>(d: &T) -> i32 {
    let mut day = 0;
    for year in 1970..d.year() {
        day += if is_leap_year(year) { 366 } else { 365 };
    }
    day + d.ordinal() as i32
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

/// Which clock a `time`/`day`/`epoch` query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockScope {
    Utc,
    Local,
    Ingame,
}

impl ClockScope {
    pub fn parse(scope: Option<&str>) -> Result<Self, CallError> {
        match scope.unwrap_or("ingame") {
            "utc" => Ok(ClockScope::Utc),
            "local" => Ok(ClockScope::Local),
            "ingame" => Ok(ClockScope::Ingame),
            _ => Err(CallError::message("Unsupported operation")),
        }
    }
}

/// Restricts a label to printable Latin-1 and the maximum length.
pub fn normalise_label(label: &str) -> String {
    label
        .chars()
        .take(MAX_LABEL_LENGTH)
        .map(|c| match c as u32 {
            0x20..=0x7e | 161..=172 | 174..=255 => c,
            _ => '?',
        })
        .collect()
}

// ── `os` surface ──────────────────────────────────────

method_table! {
    pub enum OsMethod {
        QueueEvent => "queueEvent",
        StartTimer => "startTimer",
        SetAlarm => "setAlarm",
        Shutdown => "shutdown",
        Reboot => "reboot",
        ComputerId => "computerID",
        GetComputerId => "getComputerID",
        SetComputerLabel => "setComputerLabel",
        ComputerLabel => "computerLabel",
        GetComputerLabel => "getComputerLabel",
        Clock => "clock",
        Time => "time",
        Day => "day",
        CancelTimer => "cancelTimer",
        CancelAlarm => "cancelAlarm",
        Epoch => "epoch",
    }
}

pub struct OsApi {
    env: Arc<dyn ComputerEnvironment>,
    queue: EventQueue,
    scheduler: Mutex<Scheduler>,
}

impl OsApi {
    pub fn new(env: Arc<dyn ComputerEnvironment>, queue: EventQueue) -> Self {
        Self {
            env,
            queue,
            scheduler: Mutex::new(Scheduler::new()),
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inspects the scheduler state under its lock.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        f(&self.scheduler())
    }

    fn dispatch(&self, method: OsMethod, args: Args<'_>) -> Result<MethodResult, CallError> {
        match method {
            OsMethod::QueueEvent => {
                let name = args.string(0)?;
                self.queue.push(name, args.rest(1));
                Ok(MethodResult::empty())
            }
            OsMethod::StartTimer => {
                let duration = args.real(0)?;
                Ok(MethodResult::of(self.scheduler().start_timer(duration)))
            }
            OsMethod::SetAlarm => {
                let time = args.real(0)?;
                Ok(MethodResult::of(self.scheduler().set_alarm(time)?))
            }
            OsMethod::Shutdown => {
                self.env.request_power(PowerRequest::Shutdown);
                Ok(MethodResult::empty())
            }
            OsMethod::Reboot => {
                self.env.request_power(PowerRequest::Reboot);
                Ok(MethodResult::empty())
            }
            OsMethod::ComputerId | OsMethod::GetComputerId => {
                Ok(MethodResult::of(self.env.computer_id()))
            }
            OsMethod::SetComputerLabel => {
                let label = args
                    .opt_string(0)?
                    .map(normalise_label)
                    .filter(|l| !l.is_empty());
                self.env.set_label(label);
                Ok(MethodResult::empty())
            }
            OsMethod::ComputerLabel | OsMethod::GetComputerLabel => Ok(match self.env.label() {
                Some(label) => MethodResult::of(label),
                None => MethodResult::empty(),
            }),
            OsMethod::Clock => Ok(MethodResult::of(self.scheduler().uptime())),
            OsMethod::Time => Ok(match ClockScope::parse(args.opt_string(0)?)? {
                ClockScope::Utc => MethodResult::of(time_for(&Utc::now())),
                ClockScope::Local => MethodResult::of(time_for(&Local::now())),
                ClockScope::Ingame => MethodResult::of(self.scheduler().time()),
            }),
            OsMethod::Day => Ok(match ClockScope::parse(args.opt_string(0)?)? {
                ClockScope::Utc => MethodResult::of(day_for(&Utc::now())),
                ClockScope::Local => MethodResult::of(day_for(&Local::now())),
                ClockScope::Ingame => MethodResult::of(self.scheduler().day()),
            }),
            OsMethod::CancelTimer => {
                let id = args.int(0)?;
                if let Ok(id) = i32::try_from(id) {
                    self.scheduler().cancel_timer(id);
                }
                Ok(MethodResult::empty())
            }
            OsMethod::CancelAlarm => {
                let id = args.int(0)?;
                if let Ok(id) = i32::try_from(id) {
                    self.scheduler().cancel_alarm(id);
                }
                Ok(MethodResult::empty())
            }
            OsMethod::Epoch => Ok(match ClockScope::parse(args.opt_string(0)?)? {
                // Milliseconds since the Unix epoch do not depend on the zone.
                ClockScope::Utc | ClockScope::Local => {
                    MethodResult::of(Utc::now().timestamp_millis())
                }
                ClockScope::Ingame => MethodResult::of(self.scheduler().ingame_epoch()),
            }),
        }
    }
}

impl HostObject for OsApi {
    fn method_names(&self) -> &'static [&'static str] {
        OsMethod::NAMES
    }

    fn call(&self, _context: &CallContext, method: usize, args: &[Value]) -> MethodResult {
        match OsMethod::from_index(method) {
            Some(method) => self.dispatch(method, Args::new(args)).into(),
            None => CallError::NoSuchMethod.into(),
        }
    }
}

impl Capability for OsApi {
    fn names(&self) -> &'static [&'static str] {
        &["os"]
    }

    fn startup(&self) {
        let (time, day) = (self.env.time_of_day(), self.env.day());
        self.scheduler().start(time, day);
        info!("Clock started at day {day}, {time:.3}h");
    }

    fn update(&self) {
        let (time, day) = (self.env.time_of_day(), self.env.day());
        let fired = self.scheduler().update(time, day);
        for expiry in fired {
            self.queue.push(expiry.event_name(), vec![Value::from(expiry.id())]);
        }
    }

    fn shutdown(&self) {
        self.scheduler().stop();
        info!("Clock stopped");
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::rpc::{Connection, DispatcherFactory, EventDispatcher};

const EVENT_WAIT_METHOD: &str = "eventWait";
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Default)]
struct EventQueues {
    by_name: Mutex<HashMap<String, VecDeque<Value>>>,
    arrived: Condvar,
}

/// Polls `eventWait` on its own connection and files events by name.
pub struct PollingEventDispatcher {
    connection: Connection,
    poll_timeout_ms: u64,
    queues: Arc<EventQueues>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    trace_id: String,
}

impl PollingEventDispatcher {
    pub fn new(connection: Connection, poll_timeout_ms: u64, trace_id: &str) -> Self {
        Self {
            connection,
            poll_timeout_ms,
            queues: Arc::new(EventQueues::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn factory(poll_timeout_ms: u64, trace_id: &str) -> DispatcherFactory {
        let trace_id = trace_id.to_string();
        Arc::new(move |connection: Connection| -> Arc<dyn EventDispatcher> {
            Arc::new(PollingEventDispatcher::new(connection, poll_timeout_ms, &trace_id))
        })
    }

    /// False once the poller has exited, whether through `clean_up` or
    /// because the connection dropped.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Removes and returns the oldest event named `name`, waiting up to `timeout`.
    pub fn pop_event(&self, name: &str, timeout: Duration) -> Result<Value, AppError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .queues
            .by_name
            .lock()
            .map_err(|_| AppError::system("Event queue lock poisoned", &self.trace_id))?;
        loop {
            if let Some(event) = guard.get_mut(name).and_then(VecDeque::pop_front) {
                return Ok(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::timeout(
                    format!("Timed out after {timeout:?} waiting for event {name}"),
                    &self.trace_id,
                ));
            }
            guard = self
                .queues
                .arrived
                .wait_timeout(guard, deadline - now)
                .map_err(|_| AppError::system("Event queue lock poisoned", &self.trace_id))?
                .0;
        }
    }

    pub fn clear_events(&self, name: &str) {
        if let Ok(mut guard) = self.queues.by_name.lock() {
            guard.remove(name);
        }
    }

    fn file_event(queues: &EventQueues, event: Value) {
        let name = event
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if let Ok(mut guard) = queues.by_name.lock() {
            guard.entry(name).or_default().push_back(event);
        }
        queues.arrived.notify_all();
    }
}

impl EventDispatcher for PollingEventDispatcher {
    fn start(&self) -> Result<(), AppError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| AppError::system("Dispatcher lock poisoned", &self.trace_id))?;
        if worker.is_some() {
            return Ok(());
        }
        self.stop_flag.store(false, Ordering::Relaxed);

        let connection = Arc::clone(&self.connection);
        let queues = Arc::clone(&self.queues);
        let stop_flag = Arc::clone(&self.stop_flag);
        let poll_timeout_ms = self.poll_timeout_ms;
        let trace_id = self.trace_id.clone();
        *worker = Some(thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match connection.call(EVENT_WAIT_METHOD, vec![json!(poll_timeout_ms)]) {
                    Ok(Value::Null) => {}
                    Ok(event) => Self::file_event(&queues, event),
                    // The connection is gone; polling again cannot succeed.
                    Err(err) if err.is_transient() => {
                        if !stop_flag.load(Ordering::Relaxed) {
                            warn!(trace_id = %trace_id, error = %err, "event connection lost, dispatcher stopping");
                        }
                        break;
                    }
                    Err(err) => {
                        if stop_flag.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(trace_id = %trace_id, error = %err, "event poll failed");
                        thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            debug!(trace_id = %trace_id, "event dispatcher stopped");
        }));
        Ok(())
    }

    fn clean_up(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        // Unblocks a pending eventWait.
        if let Err(err) = self.connection.close() {
            warn!(trace_id = %self.trace_id, error = %err, "failed to close event connection");
        }
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if let Ok(mut guard) = self.queues.by_name.lock() {
            guard.clear();
        }
    }
}

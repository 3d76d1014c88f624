//! Shared fakes for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use crate::bus::{Event, EventHandler, HandlerError};
use crate::docker::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CpuCounters, EventStream, LogOptions,
    LogStream, RuntimeError, RuntimeEvent, StatsSample,
};
use crate::producers::{HostProbe, HostSample};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Records every event it is handed.
pub struct RecordingHandler {
    name: String,
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until at least `count` events arrived or `timeout` elapsed, then
    /// return whatever was recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sleeps before succeeding.
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

type EventItem = Result<RuntimeEvent, RuntimeError>;
type LogItem = Result<Vec<u8>, RuntimeError>;

struct FakeState {
    containers: BTreeMap<String, (ContainerDetails, StatsSample)>,
    events_tx: Option<mpsc::UnboundedSender<EventItem>>,
    events_rx: Option<mpsc::UnboundedReceiver<EventItem>>,
    log_feeds: HashMap<String, mpsc::UnboundedReceiver<LogItem>>,
    log_requests: Vec<(String, LogOptions)>,
    inspect_failures: HashMap<String, u16>,
}

/// Scriptable in-memory [`ContainerRuntime`].
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                containers: BTreeMap::new(),
                events_tx: Some(tx),
                events_rx: Some(rx),
                log_feeds: HashMap::new(),
                log_requests: Vec::new(),
                inspect_failures: HashMap::new(),
            }),
        })
    }

    pub fn add_container(&self, details: ContainerDetails, stats: StatsSample) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(details.id.clone(), (details, stats));
    }

    /// Make `inspect(id)` fail with an HTTP error of `status`.
    pub fn fail_inspect(&self, id: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .inspect_failures
            .insert(id.to_string(), status);
    }

    pub fn remove_container(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn push_event(&self, event: RuntimeEvent) {
        self.push_event_result(Ok(event));
    }

    pub fn push_event_error(&self, error: RuntimeError) {
        self.push_event_result(Err(error));
    }

    fn push_event_result(&self, item: EventItem) {
        if let Some(tx) = &self.state.lock().unwrap().events_tx {
            let _ = tx.unbounded_send(item);
        }
    }

    /// End the event stream as a lost daemon connection would.
    pub fn close_events(&self) {
        self.state.lock().unwrap().events_tx = None;
    }

    /// Script the log stream the next `logs(id)` call returns.
    pub fn log_feed(&self, id: &str) -> mpsc::UnboundedSender<LogItem> {
        let (tx, rx) = mpsc::unbounded();
        self.state
            .lock()
            .unwrap()
            .log_feeds
            .insert(id.to_string(), rx);
        tx
    }

    pub fn log_requests(&self) -> Vec<(String, LogOptions)> {
        self.state.lock().unwrap().log_requests.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|(details, _)| all || details.status == "running")
            .map(|(details, _)| ContainerSummary {
                id: details.id.clone(),
                name: details.name.clone(),
                image: details.image.clone(),
                state: details.status.clone(),
                status: details.status.clone(),
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.inspect_failures.get(id) {
            return Err(RuntimeError::Http {
                status: *status,
                message: "daemon error".into(),
            });
        }
        state
            .containers
            .get(id)
            .map(|(details, _)| details.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|(_, stats)| stats.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .events_rx
            .take()
            .map(|rx| rx.boxed())
            .ok_or(RuntimeError::StreamClosed)
    }

    async fn logs(&self, id: &str, options: LogOptions) -> Result<LogStream, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.log_requests.push((id.to_string(), options));
        if let Some(rx) = state.log_feeds.remove(id) {
            return Ok(rx.boxed());
        }
        if state.containers.contains_key(id) {
            return Ok(futures::stream::pending().boxed());
        }
        Err(RuntimeError::NotFound(id.to_string()))
    }
}

pub fn container(id: &str, name: &str, status: &str) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        name: name.to_string(),
        image: "nginx:latest".to_string(),
        status: status.to_string(),
        ..ContainerDetails::default()
    }
}

/// A sample where the container used `cpu_delta` of `system_delta` on
/// `cpus` cores.
pub fn stats_sample(cpu_delta: u64, system_delta: u64, cpus: u32) -> StatsSample {
    StatsSample {
        cpu: CpuCounters {
            total_usage: 1_000 + cpu_delta,
            system_usage: 100_000 + system_delta,
            online_cpus: cpus,
        },
        precpu: CpuCounters {
            total_usage: 1_000,
            system_usage: 100_000,
            online_cpus: cpus,
        },
        memory_usage: 256,
        memory_limit: 1024,
        rx_bytes: 10,
        tx_bytes: 20,
    }
}

pub fn runtime_event(action: &str, id: &str) -> RuntimeEvent {
    RuntimeEvent {
        kind: "container".to_string(),
        action: action.to_string(),
        id: id.to_string(),
        attributes: BTreeMap::new(),
        time: 1_700_000_000,
    }
}

// ---------------------------------------------------------------------------
// Host probe
// ---------------------------------------------------------------------------

/// Hands out queued samples, repeating the last one once exhausted.
pub struct ScriptedProbe {
    samples: VecDeque<HostSample>,
    last: HostSample,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedProbe {
    pub fn new(samples: impl IntoIterator<Item = HostSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            last: HostSample::default(),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        self.calls.clone()
    }
}

impl HostProbe for ScriptedProbe {
    fn sample(&mut self) -> HostSample {
        *self.calls.lock().unwrap() += 1;
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}

pub fn host_sample(cpu_percent: f64, memory_percent: f64) -> HostSample {
    HostSample {
        cpu_percent,
        memory_percent,
        cpu_count: 4,
        ..HostSample::default()
    }
}

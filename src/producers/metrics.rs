//! Host resource sampler with change-gated emission.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sysinfo::{Disks, Networks, ProcessesToUpdate, System};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::event_types::SOURCE_METRICS_SAMPLER;
use crate::bus::{Event, EventBus, EventType, Priority};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub cpu_count: usize,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_percent: f64,
    pub disk_total: u64,
    pub disk_available: u64,
    pub disk_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub load_average: LoadAverage,
    pub process_count: usize,
    pub uptime_secs: u64,
}

/// Blocking OS sampler. Only ever called from the blocking pool.
pub trait HostProbe: Send + 'static {
    fn sample(&mut self) -> HostSample;
}

pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first real sample is meaningful.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl HostProbe for SysinfoProbe {
    fn sample(&mut self) -> HostSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks.list().iter().fold((0u64, 0u64), |acc, d| {
            (acc.0 + d.total_space(), acc.1 + d.available_space())
        });
        let networks = Networks::new_with_refreshed_list();
        let (network_rx, network_tx) = networks.list().values().fold((0u64, 0u64), |acc, n| {
            (acc.0 + n.total_received(), acc.1 + n.total_transmitted())
        });

        let load = System::load_average();
        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();

        HostSample {
            cpu_percent: round2(self.system.global_cpu_usage() as f64),
            cpu_count: self.system.cpus().len(),
            memory_total,
            memory_used,
            memory_available: self.system.available_memory(),
            memory_percent: round2(percent(memory_used, memory_total)),
            disk_total,
            disk_available,
            disk_percent: round2(percent(disk_total.saturating_sub(disk_available), disk_total)),
            network_rx,
            network_tx,
            load_average: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
            process_count: self.system.processes().len(),
            uptime_secs: System::uptime(),
        }
    }
}

/// Decides whether a sample is worth publishing.
#[derive(Debug, Clone)]
pub struct ChangeGate {
    threshold: f64,
    max_silence: Duration,
    last: Option<(Instant, f64, f64)>,
}

impl ChangeGate {
    pub fn new(threshold: f64, max_silence: Duration) -> Self {
        Self {
            threshold,
            max_silence,
            last: None,
        }
    }

    /// Emit on the first sample, on a CPU or memory move of more than
    /// `threshold` points, or once `max_silence` passed since the last
    /// emission. Records the emission when it returns `true`.
    pub fn should_emit(&mut self, sample: &HostSample, now: Instant) -> bool {
        let emit = match self.last {
            None => true,
            Some((at, cpu, memory)) => {
                (sample.cpu_percent - cpu).abs() > self.threshold
                    || (sample.memory_percent - memory).abs() > self.threshold
                    || now.saturating_duration_since(at) >= self.max_silence
            }
        };
        if emit {
            self.last = Some((now, sample.cpu_percent, sample.memory_percent));
        }
        emit
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub interval: Duration,
    pub threshold: f64,
    pub max_silence: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            threshold: 5.0,
            max_silence: Duration::from_secs(30),
        }
    }
}

type ProbeResult = Result<(Box<dyn HostProbe>, std::thread::Result<HostSample>), JoinError>;

/// Everything the sampling task owns. Parked in the sampler while idle.
struct SamplerWorker {
    bus: Arc<EventBus>,
    /// `None` while a read is in flight, and for good once the blocking
    /// worker carrying it was lost.
    probe: Option<Box<dyn HostProbe>>,
    gate: ChangeGate,
    interval: Duration,
}

impl SamplerWorker {
    fn new(bus: Arc<EventBus>, probe: Box<dyn HostProbe>, config: &MetricsConfig) -> Self {
        Self {
            bus,
            probe: Some(probe),
            gate: ChangeGate::new(config.threshold, config.max_silence),
            interval: config.interval,
        }
    }

    async fn run(mut self, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while self.probe.is_some() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        tracing::error!("metrics sampler stopped: host probe unavailable");
        self
    }

    async fn tick(&mut self) -> Option<Event> {
        let sample = self.take_sample().await?;
        if !self.gate.should_emit(&sample, Instant::now()) {
            tracing::trace!(cpu = sample.cpu_percent, memory = sample.memory_percent, "metrics unchanged");
            return None;
        }
        let mut payload = match serde_json::to_value(&sample) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("failed to encode host sample: {e}");
                return None;
            }
        };
        payload["timestamp"] = serde_json::Value::String(Utc::now().to_rfc3339());
        let event = Event::new(EventType::SystemMetrics, SOURCE_METRICS_SAMPLER, payload)
            .with_priority(Priority::Normal);
        self.bus.publish(event.clone());
        Some(event)
    }

    /// The probe travels into the blocking pool and comes back with its
    /// sample, so a blocking read never holds anything shared.
    async fn take_sample(&mut self) -> Option<HostSample> {
        let mut probe = self.probe.take()?;
        let joined = tokio::task::spawn_blocking(move || {
            let sample = std::panic::catch_unwind(AssertUnwindSafe(|| probe.sample()));
            (probe, sample)
        })
        .await;
        self.settle(joined)
    }

    fn settle(&mut self, joined: ProbeResult) -> Option<HostSample> {
        match joined {
            Ok((probe, Ok(sample))) => {
                self.probe = Some(probe);
                Some(sample)
            }
            Ok((probe, Err(_))) => {
                self.probe = Some(probe);
                tracing::warn!("host probe panicked, skipping sample");
                None
            }
            Err(e) => {
                tracing::error!("host probe worker lost, sampling disabled: {e}");
                None
            }
        }
    }
}

struct RunningSampler {
    cancel: CancellationToken,
    handle: JoinHandle<SamplerWorker>,
}

/// Periodically samples the host and publishes `system_metrics`.
pub struct MetricsSampler {
    idle: Mutex<Option<SamplerWorker>>,
    running: Mutex<Option<RunningSampler>>,
}

impl MetricsSampler {
    pub fn new(bus: Arc<EventBus>, probe: Box<dyn HostProbe>, config: MetricsConfig) -> Self {
        Self {
            idle: Mutex::new(Some(SamplerWorker::new(bus, probe, &config))),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut running = self.running.lock().expect("sampler mutex poisoned");
        if running.is_some() {
            return;
        }
        let Some(worker) = self.idle.lock().expect("sampler mutex poisoned").take() else {
            tracing::warn!("metrics sampler has no worker to start");
            return;
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        *running = Some(RunningSampler { cancel, handle });
        tracing::info!("metrics sampler started");
    }

    pub async fn stop(&self) {
        let running = self.running.lock().expect("sampler mutex poisoned").take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(worker) => {
                *self.idle.lock().expect("sampler mutex poisoned") = Some(worker);
                tracing::info!("metrics sampler stopped");
            }
            Err(e) => tracing::error!("metrics sampler ended abnormally: {e}"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .expect("sampler mutex poisoned")
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Take one sample outside the periodic loop. `None` while running or
    /// when the gate suppressed it.
    pub async fn sample_once(&self) -> Option<Event> {
        let mut worker = self.idle.lock().expect("sampler mutex poisoned").take()?;
        let event = worker.tick().await;
        *self.idle.lock().expect("sampler mutex poisoned") = Some(worker);
        event
    }
}

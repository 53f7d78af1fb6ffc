//! Metrics registry.
//!
//! Counters, gauges and histograms recorded at task transitions and tool
//! calls. Atomics only on the hot paths; labeled families shard behind an
//! RwLock keyed by label. Every recording method is a no-op when metrics
//! are disabled, so the dispatcher and task manager call unconditionally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::json;

/// A monotone counter family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    shards: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    fn shard(&self, label: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.shards.read().unwrap().get(label) {
            return Arc::clone(c);
        }
        let mut shards = self.shards.write().unwrap();
        Arc::clone(shards.entry(label.to_string()).or_default())
    }

    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, delta: u64) {
        self.shard(label).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.shards
            .read()
            .unwrap()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> serde_json::Value {
        let shards = self.shards.read().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = shards
            .iter()
            .map(|(k, v)| (k.clone(), json!(v.load(Ordering::Relaxed))))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// A monotone f64 counter family (costs). Values accumulate via CAS on the
/// raw bit pattern.
#[derive(Debug, Default)]
pub struct LabeledSum {
    shards: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl LabeledSum {
    fn shard(&self, label: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.shards.read().unwrap().get(label) {
            return Arc::clone(c);
        }
        let mut shards = self.shards.write().unwrap();
        Arc::clone(shards.entry(label.to_string()).or_default())
    }

    pub fn add(&self, label: &str, delta: f64) {
        let cell = self.shard(label);
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self, label: &str) -> f64 {
        self.shards
            .read()
            .unwrap()
            .get(label)
            .map(|c| f64::from_bits(c.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    fn snapshot(&self) -> serde_json::Value {
        let shards = self.shards.read().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = shards
            .iter()
            .map(|(k, v)| (k.clone(), json!(f64::from_bits(v.load(Ordering::Relaxed)))))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct LabeledGauge {
    shards: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl LabeledGauge {
    fn shard(&self, label: &str) -> Arc<AtomicI64> {
        if let Some(g) = self.shards.read().unwrap().get(label) {
            return Arc::clone(g);
        }
        let mut shards = self.shards.write().unwrap();
        Arc::clone(shards.entry(label.to_string()).or_default())
    }

    pub fn add(&self, label: &str, delta: i64) {
        self.shard(label).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> i64 {
        self.shards
            .read()
            .unwrap()
            .get(label)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> serde_json::Value {
        let shards = self.shards.read().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = shards
            .iter()
            .map(|(k, v)| (k.clone(), json!(v.load(Ordering::Relaxed))))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Fixed-bucket histogram over seconds (or plain values for `task_steps`).
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in micro-units to stay in integer space
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    /// Buckets suited to task-scale durations (seconds).
    pub fn duration_buckets() -> Self {
        Self::new(vec![
            0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
        ])
    }

    /// Buckets suited to step counts.
    pub fn step_buckets() -> Self {
        Self::new(vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0).max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn snapshot(&self) -> serde_json::Value {
        let buckets: Vec<serde_json::Value> = self
            .bounds
            .iter()
            .zip(self.counts.iter())
            .map(|(b, c)| json!({"le": b, "count": c.load(Ordering::Relaxed)}))
            .collect();
        json!({
            "buckets": buckets,
            "overflow": self.counts[self.bounds.len()].load(Ordering::Relaxed),
            "count": self.count(),
            "sum": self.sum(),
        })
    }
}

#[derive(Debug, Default)]
pub struct LabeledHistogram {
    shards: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl LabeledHistogram {
    fn shard(&self, label: &str) -> Arc<Histogram> {
        if let Some(h) = self.shards.read().unwrap().get(label) {
            return Arc::clone(h);
        }
        let mut shards = self.shards.write().unwrap();
        Arc::clone(
            shards
                .entry(label.to_string())
                .or_insert_with(|| Arc::new(Histogram::duration_buckets())),
        )
    }

    pub fn observe(&self, label: &str, value: f64) {
        self.shard(label).observe(value);
    }

    pub fn count(&self, label: &str) -> u64 {
        self.shards
            .read()
            .unwrap()
            .get(label)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    fn snapshot(&self) -> serde_json::Value {
        let shards = self.shards.read().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = shards
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// The process-wide metrics registry. Constructed once at startup and
/// injected by value; tests build their own.
#[derive(Debug)]
pub struct Metrics {
    enabled: bool,
    started: Instant,

    pub created_total: LabeledCounter,
    pub requests_total: LabeledCounter,
    pub tokens_consumed_total: LabeledCounter,
    pub cost_total: LabeledSum,
    pub sandboxes_created_total: LabeledCounter,
    pub errors_total: LabeledCounter,

    pub active_tasks: Gauge,
    pub active_streams: LabeledGauge,

    pub task_execution_duration_seconds: Histogram,
    pub task_queue_wait_duration_seconds: Histogram,
    pub request_duration_seconds: LabeledHistogram,
    pub task_steps: Histogram,
    pub task_latency_seconds: Histogram,

    max_concurrent: usize,
}

impl Metrics {
    pub fn new(enabled: bool, max_concurrent: usize) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            created_total: LabeledCounter::default(),
            requests_total: LabeledCounter::default(),
            tokens_consumed_total: LabeledCounter::default(),
            cost_total: LabeledSum::default(),
            sandboxes_created_total: LabeledCounter::default(),
            errors_total: LabeledCounter::default(),
            active_tasks: Gauge::default(),
            active_streams: LabeledGauge::default(),
            task_execution_duration_seconds: Histogram::duration_buckets(),
            task_queue_wait_duration_seconds: Histogram::duration_buckets(),
            request_duration_seconds: LabeledHistogram::default(),
            task_steps: Histogram::step_buckets(),
            task_latency_seconds: Histogram::duration_buckets(),
            max_concurrent,
        }
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new(Self::new(false, 1))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_task_created(&self, status: &str) {
        if self.enabled {
            self.created_total.inc(status);
        }
    }

    pub fn record_request(&self, method: &str) {
        if self.enabled {
            self.requests_total.inc(method);
        }
    }

    pub fn record_request_duration(&self, method: &str, seconds: f64) {
        if self.enabled {
            self.request_duration_seconds.observe(method, seconds);
        }
    }

    pub fn record_error(&self, method: &str, code: &str) {
        if self.enabled {
            self.errors_total.inc(&format!("{method}:{code}"));
        }
    }

    pub fn record_tokens(&self, input: u64, output: u64) {
        if self.enabled {
            self.tokens_consumed_total.add("input", input);
            self.tokens_consumed_total.add("output", output);
        }
    }

    pub fn record_cost(&self, currency: &str, cost: f64) {
        if self.enabled && cost > 0.0 {
            self.cost_total.add(currency, cost);
        }
    }

    pub fn record_sandbox_created(&self, kind: &str) {
        if self.enabled {
            self.sandboxes_created_total.inc(kind);
        }
    }

    pub fn task_started(&self, queue_wait_seconds: f64) {
        if self.enabled {
            self.active_tasks.add(1);
            self.task_queue_wait_duration_seconds
                .observe(queue_wait_seconds);
        }
    }

    pub fn task_finished(&self, status: &str, duration_seconds: f64, steps: u32) {
        if self.enabled {
            self.active_tasks.add(-1);
            self.created_total.inc(status);
            self.task_execution_duration_seconds
                .observe(duration_seconds);
            self.task_latency_seconds.observe(duration_seconds);
            self.task_steps.observe(steps as f64);
        }
    }

    pub fn stream_opened(&self, method: &str) {
        if self.enabled {
            self.active_streams.add(method, 1);
        }
    }

    pub fn stream_closed(&self, method: &str) {
        if self.enabled {
            self.active_streams.add(method, -1);
        }
    }

    /// Fraction of the admission capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.active_tasks.get().max(0) as f64 / self.max_concurrent as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// JSON snapshot of every family (scrape transport lives elsewhere).
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "enabled": self.enabled,
            "uptime_seconds": self.uptime_seconds(),
            "utilization": self.utilization(),
            "counters": {
                "created_total": self.created_total.snapshot(),
                "requests_total": self.requests_total.snapshot(),
                "tokens_consumed_total": self.tokens_consumed_total.snapshot(),
                "cost_total": self.cost_total.snapshot(),
                "sandboxes_created_total": self.sandboxes_created_total.snapshot(),
                "errors_total": self.errors_total.snapshot(),
            },
            "gauges": {
                "active_tasks": self.active_tasks.get(),
                "active_streams": self.active_streams.snapshot(),
            },
            "histograms": {
                "task_execution_duration_seconds": self.task_execution_duration_seconds.snapshot(),
                "task_queue_wait_duration_seconds": self.task_queue_wait_duration_seconds.snapshot(),
                "request_duration_seconds": self.request_duration_seconds.snapshot(),
                "task_steps": self.task_steps.snapshot(),
                "task_latency_seconds": self.task_latency_seconds.snapshot(),
            },
        })
    }
}

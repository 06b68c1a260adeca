use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::pipe::tunnel::splice::Traffic;

pub const TRAFFIC_LOG_CAPACITY: usize = 1024;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub cid: String,
    pub target: String,
    #[serde(flatten)]
    pub traffic: Traffic,
    pub finished_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrafficTotals {
    pub splices: u64,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Append-only accounting of finished splices.
///
/// Keeps the most recent records for inspection plus cumulative totals; never consulted
/// for control decisions.
#[derive(Debug)]
pub struct TrafficLog {
    recent: Mutex<VecDeque<TrafficRecord>>,
    capacity: usize,
    splices: AtomicU64,
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
}

impl Default for TrafficLog {
    fn default() -> Self {
        Self::with_capacity(TRAFFIC_LOG_CAPACITY)
    }
}

impl TrafficLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(TRAFFIC_LOG_CAPACITY))),
            capacity: capacity.max(1),
            splices: AtomicU64::new(0),
            a_to_b: AtomicU64::new(0),
            b_to_a: AtomicU64::new(0),
        }
    }

    pub fn record(&self, rec: TrafficRecord) {
        self.splices.fetch_add(1, Ordering::Relaxed);
        self.a_to_b.fetch_add(rec.traffic.a_to_b, Ordering::Relaxed);
        self.b_to_a.fetch_add(rec.traffic.b_to_a, Ordering::Relaxed);

        metrics::counter!("pipe_splices_total").increment(1);
        metrics::counter!("pipe_bytes_a_to_b_total").increment(rec.traffic.a_to_b);
        metrics::counter!("pipe_bytes_b_to_a_total").increment(rec.traffic.b_to_a);

        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(rec);
    }

    pub fn totals(&self) -> TrafficTotals {
        TrafficTotals {
            splices: self.splices.load(Ordering::Relaxed),
            a_to_b: self.a_to_b.load(Ordering::Relaxed),
            b_to_a: self.b_to_a.load(Ordering::Relaxed),
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<TrafficRecord> {
        let recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.iter().cloned().collect()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedTraffic = Arc<TrafficLog>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

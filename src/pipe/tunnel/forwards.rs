use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::watch;

use crate::pipe::telemetry;

#[derive(Debug, Clone, Serialize)]
pub struct ForwardSnapshot {
    pub id: u64,
    pub origin: String,
    pub target: String,
    pub created_at_unix_ms: u64,
}

/// One active public-port binding owned by the registry.
///
/// The listener itself lives in the forward's accept loop; the registry holds the
/// stop signal that loop obeys, so removing the forward is what closes the listener.
#[derive(Debug)]
struct Forward {
    info: ForwardSnapshot,
    stop: watch::Sender<bool>,
}

impl Forward {
    fn close(&self) {
        // send_replace never fails and is a no-op once already stopped.
        self.stop.send_replace(true);
    }
}

/// Handle returned to the accept loop that owns the forward's listener.
#[derive(Debug)]
pub struct ForwardHandle {
    pub id: u64,
    pub target: String,
    pub stop: watch::Receiver<bool>,
}

/// Ordered collection of active forwards behind a single lock.
///
/// Mutations are rare (register/cancel), so a linear scan under one mutex is fine.
/// The lock is never held across an await point.
#[derive(Debug)]
pub struct ForwardRegistry {
    seq: AtomicU64,
    forwards: Mutex<Vec<Forward>>,
}

impl Default for ForwardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            forwards: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, origin: String, target: String) -> ForwardHandle {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);

        let fwd = Forward {
            info: ForwardSnapshot {
                id,
                origin,
                target: target.clone(),
                created_at_unix_ms: telemetry::now_unix_ms(),
            },
            stop: stop_tx,
        };

        let mut forwards = self.lock();
        forwards.push(fwd);
        metrics::gauge!("pipe_forwards_active").set(forwards.len() as f64);

        ForwardHandle {
            id,
            target,
            stop: stop_rx,
        }
    }

    /// Closes and removes the first forward bound to `target`. Unknown targets are a no-op.
    pub fn remove_by_target(&self, target: &str) -> bool {
        let mut forwards = self.lock();
        let Some(i) = forwards.iter().position(|f| f.info.target == target) else {
            return false;
        };
        let fwd = forwards.remove(i);
        fwd.close();
        metrics::gauge!("pipe_forwards_active").set(forwards.len() as f64);
        true
    }

    pub fn remove_by_id(&self, id: u64) -> bool {
        let mut forwards = self.lock();
        let Some(i) = forwards.iter().position(|f| f.info.id == id) else {
            return false;
        };
        let fwd = forwards.remove(i);
        fwd.close();
        metrics::gauge!("pipe_forwards_active").set(forwards.len() as f64);
        true
    }

    pub fn close_all(&self) {
        let mut forwards = self.lock();
        for f in forwards.drain(..) {
            f.close();
        }
        metrics::gauge!("pipe_forwards_active").set(0.0);
    }

    pub fn snapshot(&self) -> Vec<ForwardSnapshot> {
        self.lock().iter().map(|f| f.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Forward>> {
        self.forwards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

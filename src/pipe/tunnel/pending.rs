use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;

use crate::pipe::tunnel::protocol::CorrelationId;

struct PendingConn {
    conn: TcpStream,
    created: Instant,
}

/// Inbound user connections waiting for the client to claim them.
///
/// Sharded so that inbound bursts on different ids do not serialize on one lock.
/// Every entry leaves the map exactly once: through `take`, `remove`, or the
/// expiry sweep. Dropping an entry closes its connection.
#[derive(Default)]
pub struct PendingConns {
    conns: DashMap<CorrelationId, PendingConn>,
}

impl std::fmt::Debug for PendingConns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConns")
            .field("len", &self.conns.len())
            .finish()
    }
}

impl PendingConns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the connection back if `id` is already present.
    pub fn put(&self, id: CorrelationId, conn: TcpStream) -> Result<(), TcpStream> {
        use dashmap::mapref::entry::Entry;

        match self.conns.entry(id) {
            Entry::Occupied(_) => Err(conn),
            Entry::Vacant(v) => {
                v.insert(PendingConn {
                    conn,
                    created: Instant::now(),
                });
                metrics::gauge!("pipe_pending_conns").increment(1.0);
                Ok(())
            }
        }
    }

    pub fn take(&self, id: &CorrelationId) -> Option<TcpStream> {
        let (_, p) = self.conns.remove(id)?;
        metrics::gauge!("pipe_pending_conns").decrement(1.0);
        Some(p.conn)
    }

    pub fn remove(&self, id: &CorrelationId) {
        if self.conns.remove(id).is_some() {
            metrics::gauge!("pipe_pending_conns").decrement(1.0);
        }
    }

    /// Drops every entry older than `ttl`, closing its connection.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut expired = 0usize;
        self.conns.retain(|id, p| {
            if now.duration_since(p.created) < ttl {
                return true;
            }
            tracing::debug!(cid = %id, peer = ?p.conn.peer_addr().ok(), "pending: expired unclaimed connection");
            expired += 1;
            false
        });

        if expired > 0 {
            metrics::gauge!("pipe_pending_conns").decrement(expired as f64);
            metrics::counter!("pipe_pending_expired_total").increment(expired as u64);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

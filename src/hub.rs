//! Live subscriptions and fan-out of admitted events.
//!
//! Every connection owns a bounded outbound queue drained by its writer task.
//! Broadcasts never wait: a subscriber whose queue is full loses that
//! subscription and is told so with a `CLOSED` once its writer catches up.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::event::Event;
use crate::filter::{matches_any, Filter};

pub type ConnectionId = u64;

pub const SLOW_CONSUMER: &str = "error: slow consumer";

/// Messages queued for a connection's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event {
        sub_id: String,
        generation: u64,
        event: Arc<Event>,
    },
    Eose {
        sub_id: String,
        generation: u64,
    },
    Closed {
        sub_id: String,
        reason: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Count {
        sub_id: String,
        count: usize,
    },
    Notice(String),
}

/// Queue ends handed to a connection task.
pub struct Connection {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<Outbound>,
    pub rx: mpsc::Receiver<Outbound>,
}

struct Subscription {
    filters: Vec<Filter>,
    generation: u64,
    /// Live events held back while the backfill is still being sent.
    parked: Option<Vec<Arc<Event>>>,
}

struct Conn {
    tx: mpsc::Sender<Outbound>,
    subs: HashMap<String, Subscription>,
    dropped: Vec<String>,
}

/// Registry of open subscriptions across all connections.
pub struct Hub {
    conns: RwLock<HashMap<ConnectionId, Conn>>,
    next_conn: AtomicU64,
    next_generation: AtomicU64,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            buffer: buffer.max(2),
        }
    }

    pub fn connect(&self) -> Connection {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.conns.write().insert(
            id,
            Conn {
                tx: tx.clone(),
                subs: HashMap::new(),
                dropped: Vec::new(),
            },
        );
        debug!(conn = id, "connection opened");
        Connection { id, tx, rx }
    }

    /// Forget a connection and every subscription it holds.
    pub fn disconnect(&self, conn: ConnectionId) {
        if let Some(c) = self.conns.write().remove(&conn) {
            debug!(conn, subs = c.subs.len(), "connection closed");
        }
    }

    /// Open or replace `sub_id` on `conn` in backfilling mode.
    ///
    /// Returns the subscription's generation, or `None` if the connection is
    /// gone.
    pub fn register(&self, conn: ConnectionId, sub_id: &str, filters: Vec<Filter>) -> Option<u64> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.conns.write();
        let c = conns.get_mut(&conn)?;
        c.dropped.retain(|s| s != sub_id);
        c.subs.insert(
            sub_id.to_string(),
            Subscription {
                filters,
                generation,
                parked: Some(Vec::new()),
            },
        );
        Some(generation)
    }

    /// End the backfill: queue `EOSE`, then the events parked meanwhile that
    /// were not already part of the backfill.
    ///
    /// Returns `false` if the subscription was closed or replaced.
    pub async fn finish_backfill(
        &self,
        conn: ConnectionId,
        sub_id: &str,
        generation: u64,
        sent: &HashSet<String>,
    ) -> bool {
        let Some(tx) = self.conns.read().get(&conn).map(|c| c.tx.clone()) else {
            return false;
        };
        let mut want = 1;
        loop {
            let Ok(mut permits) = tx.reserve_many(want).await else {
                return false;
            };
            let mut conns = self.conns.write();
            let Some(sub) = conns
                .get_mut(&conn)
                .and_then(|c| c.subs.get_mut(sub_id))
                .filter(|s| s.generation == generation)
            else {
                return false;
            };
            let needed = 1 + sub.parked.as_ref().map_or(0, Vec::len);
            if needed > want {
                want = needed;
                continue;
            }
            let parked = sub.parked.take().unwrap_or_default();
            let eose = Outbound::Eose {
                sub_id: sub_id.to_string(),
                generation,
            };
            let live = parked
                .into_iter()
                .filter(|ev| !sent.contains(&ev.id))
                .map(|event| Outbound::Event {
                    sub_id: sub_id.to_string(),
                    generation,
                    event,
                });
            for (permit, msg) in permits.by_ref().zip(std::iter::once(eose).chain(live)) {
                permit.send(msg);
            }
            return true;
        }
    }

    pub fn unregister(&self, conn: ConnectionId, sub_id: &str) -> bool {
        self.conns
            .write()
            .get_mut(&conn)
            .and_then(|c| c.subs.remove(sub_id))
            .is_some()
    }

    /// Whether a queued delivery still belongs to an open subscription.
    pub fn is_current(&self, conn: ConnectionId, sub_id: &str, generation: u64) -> bool {
        self.conns
            .read()
            .get(&conn)
            .and_then(|c| c.subs.get(sub_id))
            .is_some_and(|s| s.generation == generation)
    }

    /// Subscriptions closed for falling behind since the last call.
    pub fn take_dropped(&self, conn: ConnectionId) -> Vec<String> {
        self.conns
            .write()
            .get_mut(&conn)
            .map(|c| std::mem::take(&mut c.dropped))
            .unwrap_or_default()
    }

    /// Deliver `event` to every matching subscription without blocking.
    ///
    /// Returns the number of subscriptions it was queued or parked for.
    pub fn broadcast(&self, event: &Arc<Event>) -> usize {
        let mut delivered = 0;
        let mut conns = self.conns.write();
        for (conn_id, conn) in conns.iter_mut() {
            let mut overflowed = Vec::new();
            for (sub_id, sub) in conn.subs.iter_mut() {
                if !matches_any(&sub.filters, event) {
                    continue;
                }
                if let Some(parked) = sub.parked.as_mut() {
                    if parked.len() + 1 >= self.buffer {
                        overflowed.push(sub_id.clone());
                    } else {
                        parked.push(event.clone());
                        delivered += 1;
                    }
                    continue;
                }
                let msg = Outbound::Event {
                    sub_id: sub_id.clone(),
                    generation: sub.generation,
                    event: event.clone(),
                };
                match conn.tx.try_send(msg) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => overflowed.push(sub_id.clone()),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            for sub_id in overflowed {
                warn!(conn = conn_id, sub = %sub_id, "subscriber queue full, closing subscription");
                conn.subs.remove(&sub_id);
                conn.dropped.push(sub_id);
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.conns.read().values().map(|c| c.subs.len()).sum()
    }
}

//! Connection selection strategies.
//!
//! A strategy is called once per outgoing request with the pool's current
//! membership. It must tolerate concurrent calls and never hand out a closed
//! connection while an open one exists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::Connection;

pub trait SelectionStrategy: Send + Sync {
    /// Picks a connection, or `None` if every candidate is closed.
    fn select(&self, connections: &[Arc<Connection>]) -> Option<Arc<Connection>>;
}

/// Built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    RoundRobin,
    #[default]
    ParallelRoundRobin,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
            StrategyKind::ParallelRoundRobin => Arc::new(ParallelRoundRobin::new()),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "round_robin" => Ok(StrategyKind::RoundRobin),
            "parallel-round-robin" | "parallel_round_robin" => Ok(StrategyKind::ParallelRoundRobin),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Walks `connections` from `start`, returning the first open one.
fn first_open(connections: &[Arc<Connection>], start: usize) -> Option<Arc<Connection>> {
    let len = connections.len();
    (0..len)
        .map(|offset| &connections[(start + offset) % len])
        .find(|c| !c.is_closed())
        .cloned()
}

/// One shared cursor over all connections.
///
/// With a stable membership, `n` consecutive selections visit each of the
/// `n` connections exactly once.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, connections: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if connections.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        first_open(connections, start)
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// Round-robin with one cursor per worker thread.
///
/// Threads are spread over a fixed set of cursors (one per available CPU), so
/// concurrent callers rarely touch the same cache line. A single caller sees
/// plain round-robin.
#[derive(Debug)]
pub struct ParallelRoundRobin {
    cursors: Vec<AtomicUsize>,
}

impl ParallelRoundRobin {
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_shards(shards)
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            cursors: (0..shards.max(1)).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn shards(&self) -> usize {
        self.cursors.len()
    }

    fn cursor(&self) -> &AtomicUsize {
        let shard = SHARD.with(|s| *s) % self.cursors.len();
        &self.cursors[shard]
    }
}

impl Default for ParallelRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for ParallelRoundRobin {
    fn select(&self, connections: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if connections.is_empty() {
            return None;
        }
        let start = self.cursor().fetch_add(1, Ordering::Relaxed) % connections.len();
        first_open(connections, start)
    }
}

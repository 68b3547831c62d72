use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::buffer::atomic_buffer::{AtomicBuffer, EvictionPass};
use crate::buffer::index_tree::CleanStats;

/// Result of one evictor cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCycle {
    pub chain: EvictionPass,
    pub index: CleanStats,
}

impl EvictionCycle {
    pub fn is_productive(&self) -> bool {
        self.chain.elements > 0
            || self.index.entries_removed > 0
            || self.index.leaves_pruned > 0
            || self.index.branches_pruned > 0
    }
}

/// Recurring background task reclaiming memory: trims the chain front while it is over
/// budget, then sweeps dead handles out of the index and prunes empty nodes. Pure
/// in-memory bookkeeping, it never touches storage.
pub struct Evictor {
    buffer: Arc<AtomicBuffer>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Evictor {
    pub fn new(buffer: Arc<AtomicBuffer>, interval: Duration) -> Self {
        Self {
            buffer,
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn run_once(&self) -> EvictionCycle {
        let mut cycle = EvictionCycle::default();
        while self.buffer.should_evict() {
            let pass = self.buffer.evict();
            if pass.elements == 0 {
                break;
            }
            cycle.chain.elements += pass.elements;
            cycle.chain.bytes += pass.bytes;
        }
        cycle.index = self.buffer.index_tree().clean();
        cycle
    }

    /// Spawns the periodic task on the current tokio runtime. Calling it twice keeps the
    /// first task.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let evictor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(evictor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cycle = evictor.run_once();
                if cycle.is_productive() {
                    debug!(
                        "Eviction cycle: {} elements ({} bytes) evicted, {} index entries swept, {} leaves and {} branches pruned",
                        cycle.chain.elements,
                        cycle.chain.bytes,
                        cycle.index.entries_removed,
                        cycle.index.leaves_pruned,
                        cycle.index.branches_pruned
                    );
                }
            }
        }));
        info!("Evictor started with interval {:?}", self.interval);
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Evictor stopped");
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

use std::sync::Mutex;
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;

use crate::domain::config::MemoryConfig;
use crate::domain::limiter::semaphore::FifoSemaphore;

/// Process-wide memory budget, shared by every model on this instance.
///
/// Capacity is `floor(usable_free_kb * free_memory_ratio)` and is
/// recomputed from OS statistics on a fixed interval, clamped to the
/// configured bounds. Jobs acquire their `estimated_used_memory_kb`
/// against the shared semaphore.
#[derive(Debug)]
pub struct MemoryManager {
    config: MemoryConfig,
    semaphore: FifoSemaphore,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> MemoryManager {
        let capacity = probe_capacity_kb(&config);
        log::info!("Memory manager initialized with {} KB usable.", capacity);
        MemoryManager { config, semaphore: FifoSemaphore::new(capacity), task: Mutex::new(None) }
    }

    /// Shared handle to the underlying semaphore; clones observe the same
    /// state.
    pub fn semaphore(&self) -> FifoSemaphore {
        self.semaphore.clone()
    }

    pub fn capacity_kb(&self) -> i64 {
        self.semaphore.capacity()
    }

    pub fn available_kb(&self) -> i64 {
        self.semaphore.available()
    }

    pub fn recalculation_interval_ms(&self) -> u64 {
        self.config.recalculation_interval_ms
    }

    /// Spawns the periodic recalculation task. Idempotent.
    pub fn start(&self) {
        let mut guard = self.task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let semaphore = self.semaphore.clone();
        let config = self.config.clone();
        let interval = Duration::from_millis(config.recalculation_interval_ms.max(100));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let capacity = probe_capacity_kb(&config);
                if capacity != semaphore.capacity() as u64 {
                    log::debug!("Memory capacity recomputed to {} KB.", capacity);
                    semaphore.resize(capacity);
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.semaphore.close();
    }
}

fn probe_capacity_kb(config: &MemoryConfig) -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();

    let mut usable_kb = sys.available_memory() / 1024;
    if let Some(cap) = config.max_memory_kb {
        usable_kb = usable_kb.min(cap);
    }

    let mut capacity = (usable_kb as f64 * config.free_memory_ratio).floor() as u64;
    if let Some(min) = config.min_capacity_kb {
        capacity = capacity.max(min);
    }
    if let Some(max) = config.max_capacity_kb {
        capacity = capacity.min(max);
    }
    capacity
}

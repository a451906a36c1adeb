use std::sync::{Arc, RwLock};

/// Source of the epoch-millisecond timestamps all window arithmetic is
/// based on. Production code injects [`SystemClock`]; tests drive a
/// [`ManualClock`] by hand so minute/day boundaries are deterministic.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock, shared between the test body and the code
/// under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<RwLock<i64>>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> ManualClock {
        ManualClock { time: Arc::new(RwLock::new(start_ms)) }
    }

    pub fn advance(&self, delta_ms: i64) {
        let mut guard = self.time.write().unwrap();
        *guard += delta_ms;
    }

    pub fn set(&self, now_ms: i64) {
        let mut guard = self.time.write().unwrap();
        *guard = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.time.read().unwrap()
    }
}

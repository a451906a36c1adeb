use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::domain::util::id::ModelId;

/// Why a parked job was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Capacity on the model may have come back.
    Capacity,
    /// The limiter is shutting down.
    Stopped,
}

#[derive(Debug)]
struct WaitEntry {
    id: u64,
    tx: oneshot::Sender<WakeReason>,
}

/// Single-shot ticket returned by [`ModelWaitList::register`]. Await the
/// receiver; drop the ticket (or let the timeout win) and the entry is
/// removed from the list on the next sweep.
#[derive(Debug)]
pub struct WaitTicket {
    pub id: u64,
    pub rx: oneshot::Receiver<WakeReason>,
}

/// Per-model FIFO of jobs parked in `waiting-on-model`.
///
/// Availability changes, distributed reallocations and local
/// commits/refunds all funnel through [`wake`](ModelWaitList::wake);
/// each waiter is woken at most once and re-registers if it has to keep
/// waiting.
#[derive(Debug, Default)]
pub struct ModelWaitList {
    state: Mutex<WaitState>,
}

#[derive(Debug, Default)]
struct WaitState {
    next_id: u64,
    queues: HashMap<ModelId, VecDeque<WaitEntry>>,
    closed: bool,
}

impl ModelWaitList {
    pub fn new() -> ModelWaitList {
        ModelWaitList::default()
    }

    pub fn register(&self, model_id: &ModelId) -> WaitTicket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        if state.closed {
            // tx dropped: the ticket resolves to a closed channel and the
            // caller maps that to shutdown.
            drop(tx);
        } else {
            state.queues.entry(model_id.clone()).or_default().push_back(WaitEntry { id, tx });
        }
        WaitTicket { id, rx }
    }

    /// Removes a ticket that timed out, so no stale waker reference
    /// lingers on the model.
    pub fn remove(&self, model_id: &ModelId, ticket_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(model_id) {
            queue.retain(|entry| entry.id != ticket_id);
        }
    }

    /// Wakes up to `limit` waiters on the model, oldest first. Returns how
    /// many were actually woken.
    pub fn wake(&self, model_id: &ModelId, limit: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(model_id) else {
            return 0;
        };

        let mut woken = 0;
        while woken < limit {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            // A send failure means the waiter already gave up; skip it
            // without counting.
            if entry.tx.send(WakeReason::Capacity).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    pub fn wake_all(&self, model_id: &ModelId) -> usize {
        self.wake(model_id, usize::MAX)
    }

    pub fn waiting(&self, model_id: &ModelId) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(model_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Rejects every parked job and refuses new registrations.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for (_, queue) in state.queues.drain() {
            for entry in queue {
                let _ = entry.tx.send(WakeReason::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_serves_oldest_first() {
        let list = ModelWaitList::new();
        let model = ModelId::new("gpt");

        let first = list.register(&model);
        let second = list.register(&model);
        assert_eq!(list.waiting(&model), 2);

        assert_eq!(list.wake(&model, 1), 1);
        assert_eq!(first.rx.await.unwrap(), WakeReason::Capacity);
        assert_eq!(list.waiting(&model), 1);

        assert_eq!(list.wake_all(&model), 1);
        assert_eq!(second.rx.await.unwrap(), WakeReason::Capacity);
    }

    #[tokio::test]
    async fn removed_tickets_are_not_woken() {
        let list = ModelWaitList::new();
        let model = ModelId::new("gpt");

        let ticket = list.register(&model);
        list.remove(&model, ticket.id);
        assert_eq!(list.wake_all(&model), 0);
    }

    #[tokio::test]
    async fn close_signals_shutdown() {
        let list = ModelWaitList::new();
        let model = ModelId::new("gpt");
        let ticket = list.register(&model);
        list.close();
        assert_eq!(ticket.rx.await.unwrap(), WakeReason::Stopped);

        // New registrations resolve as closed channels.
        let late = list.register(&model);
        assert!(late.rx.await.is_err());
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_count_as_woken() {
        let list = ModelWaitList::new();
        let model = ModelId::new("gpt");

        let gone = list.register(&model);
        drop(gone.rx);
        let alive = list.register(&model);

        assert_eq!(list.wake(&model, 1), 1);
        assert_eq!(alive.rx.await.unwrap(), WakeReason::Capacity);
    }
}

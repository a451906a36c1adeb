use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Counted semaphore with variable-sized acquisitions and a strict-FIFO
/// wait queue.
///
/// "Strict" means the head waiter blocks everyone behind it: a later,
/// smaller waiter never skips ahead even when it would fit. Used both
/// for per-model concurrency (size 1) and for the shared memory budget
/// (size = a job's estimated memory footprint in KB).
#[derive(Debug, Clone)]
pub struct FifoSemaphore {
    shared: Arc<SemShared>,
}

#[derive(Debug)]
struct SemShared {
    state: Mutex<SemState>,
}

#[derive(Debug)]
struct SemState {
    capacity: i64,
    /// May go negative after a shrink below the in-flight size.
    available: i64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    size: u64,
    tx: oneshot::Sender<Permit>,
}

/// An outstanding acquisition. Re-credits the semaphore on drop, so every
/// exit path of a job releases concurrency and memory.
#[derive(Debug)]
pub struct Permit {
    size: u64,
    shared: Arc<SemShared>,
    released: bool,
}

impl Permit {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let shared = self.shared.clone();
        let mut state = shared.state.lock().unwrap();
        state.available += self.size as i64;
        shared.drain(&mut state);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// A queued acquisition. Await it with [`PendingAcquire::wait`]; dropping
/// it before completion removes the waiter from the queue.
#[derive(Debug)]
pub struct PendingAcquire {
    id: u64,
    rx: Option<oneshot::Receiver<Permit>>,
    shared: Arc<SemShared>,
    done: bool,
}

impl PendingAcquire {
    pub async fn wait(mut self) -> Result<Permit> {
        let rx = self.rx.take().expect("PendingAcquire polled twice");
        let result = rx.await;
        self.done = true;
        match result {
            Ok(permit) => Ok(permit),
            // Sender dropped without a permit: the semaphore was closed.
            Err(_) => Err(Error::Stopped),
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if !self.done {
            self.shared.cancel(self.id);
        }
    }
}

impl SemShared {
    /// Satisfies head waiters as long as they fit. A waiter whose receiver
    /// was dropped re-credits its size (the unsendable Permit drops and
    /// releases itself) and is skipped.
    fn drain(self: &Arc<Self>, state: &mut SemState) {
        while let Some(head) = state.waiters.front() {
            if state.available < head.size as i64 {
                break;
            }
            let waiter = state.waiters.pop_front().unwrap();
            state.available -= waiter.size as i64;
            let permit = Permit { size: waiter.size, shared: self.clone(), released: false };
            if let Err(mut unsent) = waiter.tx.send(permit) {
                // Receiver is gone. Re-credit here instead of letting the
                // permit drop, which would re-enter the held lock.
                unsent.released = true;
                state.available += unsent.size as i64;
            }
        }
    }

    fn cancel(self: &Arc<Self>, waiter_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            // Removing a blocking head may unblock the rest of the queue.
            self.drain(&mut state);
        }
    }
}

impl FifoSemaphore {
    pub fn new(capacity: u64) -> FifoSemaphore {
        FifoSemaphore {
            shared: Arc::new(SemShared {
                state: Mutex::new(SemState {
                    capacity: capacity as i64,
                    available: capacity as i64,
                    next_waiter_id: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Non-blocking acquire. Returns `None` when the call would have to
    /// queue, either because `available < size` or because earlier
    /// waiters are queued (FIFO: new arrivals never overtake them).
    pub fn try_acquire(&self, size: u64) -> Option<Permit> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return None;
        }
        if state.waiters.is_empty() && state.available >= size as i64 {
            state.available -= size as i64;
            Some(Permit { size, shared: self.shared.clone(), released: false })
        } else {
            None
        }
    }

    /// Queued acquire. Resolves immediately when capacity is free and no
    /// one is waiting, otherwise joins the tail of the FIFO.
    pub fn acquire(&self, size: u64) -> PendingAcquire {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state.lock().unwrap();

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;

        if state.closed {
            // tx dropped here; wait() surfaces Error::Stopped.
            drop(tx);
        } else {
            state.waiters.push_back(Waiter { id, size, tx });
            self.shared.drain(&mut state);
        }

        PendingAcquire { id, rx: Some(rx), shared: self.shared.clone(), done: false }
    }

    /// Removes a queued waiter by identity. A waiter that was already
    /// satisfied is unaffected; its permit must be released by the holder.
    pub fn cancel(&self, pending: &PendingAcquire) {
        self.shared.cancel(pending.id);
    }

    /// Adjusts capacity; `available` absorbs the difference and may go
    /// negative when capacity shrinks below the in-flight size.
    pub fn resize(&self, new_capacity: u64) {
        let mut state = self.shared.state.lock().unwrap();
        state.available += new_capacity as i64 - state.capacity;
        state.capacity = new_capacity as i64;
        self.shared.drain(&mut state);
    }

    /// Rejects all queued waiters and refuses new acquisitions. Held
    /// permits stay valid until dropped.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        state.waiters.clear();
    }

    pub fn capacity(&self) -> i64 {
        self.shared.state.lock().unwrap().capacity
    }

    pub fn available(&self) -> i64 {
        self.shared.state.lock().unwrap().available
    }

    pub fn waiting(&self) -> usize {
        self.shared.state.lock().unwrap().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_acquire_and_release() {
        let sem = FifoSemaphore::new(10);
        let permit = sem.try_acquire(4).unwrap();
        assert_eq!(sem.available(), 6);
        permit.release();
        assert_eq!(sem.available(), 10);
    }

    #[tokio::test]
    async fn drop_releases_permit() {
        let sem = FifoSemaphore::new(10);
        {
            let _permit = sem.try_acquire(10).unwrap();
            assert_eq!(sem.available(), 0);
        }
        assert_eq!(sem.available(), 10);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let sem = FifoSemaphore::new(10);
        let held = sem.try_acquire(10).unwrap();

        let first = sem.acquire(6);
        let second = sem.acquire(2);
        assert_eq!(sem.waiting(), 2);

        held.release();

        // Both fit after the release, head first.
        let p1 = first.wait().await.unwrap();
        let p2 = second.wait().await.unwrap();
        assert_eq!(p1.size(), 6);
        assert_eq!(p2.size(), 2);
        assert_eq!(sem.available(), 2);
    }

    #[tokio::test]
    async fn head_waiter_blocks_smaller_later_waiters() {
        let sem = FifoSemaphore::new(10);
        let held = sem.try_acquire(8).unwrap();

        let big = sem.acquire(6);
        let small = sem.acquire(1);

        // 2 free: the small waiter would fit, but the head does not.
        assert_eq!(sem.waiting(), 2);
        assert!(sem.try_acquire(1).is_none());

        held.release();
        let p_big = big.wait().await.unwrap();
        let p_small = small.wait().await.unwrap();
        drop(p_big);
        drop(p_small);
    }

    #[tokio::test]
    async fn cancel_removes_a_queued_waiter_and_unblocks_the_queue() {
        let sem = FifoSemaphore::new(4);
        let held = sem.try_acquire(3).unwrap();

        let blocked_head = sem.acquire(4);
        let tail = sem.acquire(1);
        assert_eq!(sem.waiting(), 2);

        sem.cancel(&blocked_head);
        // The tail fits into the single free unit once the head is gone.
        let permit = tail.wait().await.unwrap();
        assert_eq!(permit.size(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn resize_can_go_negative_and_recovers() {
        let sem = FifoSemaphore::new(10);
        let held = sem.try_acquire(8).unwrap();

        sem.resize(4);
        assert_eq!(sem.available(), -4);

        held.release();
        assert_eq!(sem.available(), 4);
        assert_eq!(sem.capacity(), 4);
    }

    #[tokio::test]
    async fn close_rejects_queued_waiters() {
        let sem = FifoSemaphore::new(1);
        let _held = sem.try_acquire(1).unwrap();
        let pending = sem.acquire(1);
        sem.close();
        assert!(matches!(pending.wait().await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn available_plus_outstanding_equals_capacity() {
        let sem = FifoSemaphore::new(12);
        let a = sem.try_acquire(5).unwrap();
        let b = sem.try_acquire(3).unwrap();
        assert_eq!(sem.available() + (a.size() + b.size()) as i64, sem.capacity());
    }
}

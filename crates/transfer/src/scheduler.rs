//! Admission control for in-flight chunk requests.
//!
//! [`ChunkScheduler`] is a counting semaphore with strict FIFO wake order and
//! a cooperative pause switch. Admission is represented by a [`ChunkPermit`]
//! which gives its slot back when dropped, so every acquire is paired with
//! exactly one release whether the chunk succeeds, fails or is aborted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Bounds the number of chunk requests in flight.
pub struct ChunkScheduler {
    capacity: usize,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    in_flight: usize,
    paused: bool,
    waiters: VecDeque<oneshot::Sender<ChunkPermit>>,
}

impl ChunkScheduler {
    /// Creates a scheduler admitting up to `capacity` holders (minimum 1).
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(SchedulerState {
                in_flight: 0,
                paused: false,
                waiters: VecDeque::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a slot.
    ///
    /// Returns immediately when a slot is free, nobody is queued and the
    /// scheduler is not paused. Otherwise the caller joins the back of the
    /// wait queue and is admitted in arrival order. Dropping the returned
    /// future while queued gives up the place in line.
    pub async fn acquire(self: &Arc<Self>) -> ChunkPermit {
        loop {
            let rx = {
                let mut state = self.lock();
                if !state.paused && state.waiters.is_empty() && state.in_flight < self.capacity {
                    state.in_flight += 1;
                    return ChunkPermit::new(Arc::clone(self));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Takes a slot only if one is available right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ChunkPermit> {
        let mut state = self.lock();
        if !state.paused && state.waiters.is_empty() && state.in_flight < self.capacity {
            state.in_flight += 1;
            Some(ChunkPermit::new(Arc::clone(self)))
        } else {
            None
        }
    }

    /// Stops admitting queued waiters. Current holders keep running.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Clears the pause flag and admits as many waiters as capacity allows.
    pub fn resume(self: &Arc<Self>) {
        let mut state = self.lock();
        state.paused = false;
        self.wake_waiters(&mut state);
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Number of callers waiting for a slot.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release_slot(self: &Arc<Self>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.wake_waiters(&mut state);
    }

    /// Hands slots directly to queued waiters, oldest first. The slot count
    /// stays incremented on behalf of the new holder.
    fn wake_waiters(self: &Arc<Self>, state: &mut SchedulerState) {
        while !state.paused && state.in_flight < self.capacity {
            let Some(tx) = state.waiters.pop_front() else {
                break;
            };
            state.in_flight += 1;
            if let Err(mut permit) = tx.send(ChunkPermit::new(Arc::clone(self))) {
                // Waiter went away; take the slot back and try the next one.
                permit.armed = false;
                state.in_flight -= 1;
            }
        }
    }
}

impl fmt::Debug for ChunkScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ChunkScheduler")
            .field("capacity", &self.capacity)
            .field("in_flight", &state.in_flight)
            .field("paused", &state.paused)
            .field("queued", &state.waiters.len())
            .finish()
    }
}

/// One admitted slot of a [`ChunkScheduler`].
pub struct ChunkPermit {
    scheduler: Arc<ChunkScheduler>,
    armed: bool,
}

impl ChunkPermit {
    fn new(scheduler: Arc<ChunkScheduler>) -> Self {
        Self {
            scheduler,
            armed: true,
        }
    }

    /// Gives the slot back. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for ChunkPermit {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.scheduler.release_slot();
        }
    }
}

impl fmt::Debug for ChunkPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPermit")
            .field("armed", &self.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_until;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn immediate_admission_below_capacity() {
        let s = ChunkScheduler::new(2);
        let a = s.acquire().await;
        let b = s.acquire().await;
        assert_eq!(s.in_flight(), 2);
        assert!(s.try_acquire().is_none());
        drop(a);
        assert_eq!(s.in_flight(), 1);
        b.release();
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn zero_capacity_clamped() {
        let s = ChunkScheduler::new(0);
        assert_eq!(s.capacity(), 1);
        assert!(s.try_acquire().is_some());
    }

    #[tokio::test]
    async fn two_admitted_third_queued() {
        let s = ChunkScheduler::new(2);
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let s = Arc::clone(&s);
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let _permit = s.acquire().await;
                started.fetch_add(1, Ordering::SeqCst);
                gate.acquire().await.unwrap().forget();
            }));
        }

        wait_until(|| started.load(Ordering::SeqCst) == 2 && s.queued() == 1).await;
        assert_eq!(s.in_flight(), 2);

        // Releasing one holder admits the third.
        gate.add_permits(1);
        wait_until(|| started.load(Ordering::SeqCst) == 3).await;
        assert_eq!(s.in_flight(), 2);
        assert_eq!(s.queued(), 0);

        gate.add_permits(2);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_released_in_fifo_order() {
        let s = ChunkScheduler::new(1);
        let holder = s.acquire().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..5 {
            let s2 = Arc::clone(&s);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = s2.acquire().await;
                order.lock().unwrap().push(id);
                tokio::task::yield_now().await;
                drop(permit);
            }));
            wait_until(|| s.queued() == id + 1).await;
        }

        drop(holder);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn acquire_queues_behind_existing_waiters() {
        let s = ChunkScheduler::new(1);
        let holder = s.acquire().await;

        let s2 = Arc::clone(&s);
        let waiter = tokio::spawn(async move { s2.acquire().await });
        wait_until(|| s.queued() == 1).await;

        drop(holder);
        // The slot went straight to the waiter.
        assert!(s.try_acquire().is_none());
        let permit = waiter.await.unwrap();
        assert_eq!(s.in_flight(), 1);
        drop(permit);
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test]
    async fn pause_holds_waiters_until_resume() {
        let s = ChunkScheduler::new(2);
        let a = s.acquire().await;
        let b = s.acquire().await;

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let s2 = Arc::clone(&s);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                let _p = s2.acquire().await;
                admitted.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wait_until(|| s.queued() == 2).await;

        s.pause();
        assert!(s.is_paused());
        drop(a);
        drop(b);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 0);
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.queued(), 2);

        // New callers do not jump the queue while paused.
        assert!(s.try_acquire().is_none());

        s.resume();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        assert_eq!(s.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_is_skipped() {
        let s = ChunkScheduler::new(1);
        let holder = s.acquire().await;

        let s2 = Arc::clone(&s);
        let abandoned = tokio::spawn(async move {
            let _p = s2.acquire().await;
        });
        wait_until(|| s.queued() == 1).await;

        let s3 = Arc::clone(&s);
        let patient = tokio::spawn(async move { s3.acquire().await });
        wait_until(|| s.queued() == 2).await;

        abandoned.abort();
        let _ = abandoned.await;

        drop(holder);
        let permit = patient.await.unwrap();
        assert_eq!(s.in_flight(), 1);
        drop(permit);
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.queued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn randomized_stress_never_exceeds_capacity() {
        for _ in 0..5 {
            let capacity = rand::thread_rng().gen_range(1..=4);
            let s = ChunkScheduler::new(capacity);
            let current = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..64 {
                let s = Arc::clone(&s);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                handles.push(tokio::spawn(async move {
                    for _ in 0..5 {
                        let permit = s.acquire().await;
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(s.in_flight() <= s.capacity());

                        let hold = rand::thread_rng().gen_range(0..300);
                        tokio::time::sleep(Duration::from_micros(hold)).await;

                        current.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    }
                }));
            }
            for h in handles {
                h.await.unwrap();
            }

            assert!(peak.load(Ordering::SeqCst) <= capacity);
            assert_eq!(s.in_flight(), 0);
            assert_eq!(s.queued(), 0);
        }
    }

    #[tokio::test]
    async fn randomized_hold_times_preserve_fifo() {
        let s = ChunkScheduler::new(1);
        let holder = s.acquire().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..20 {
            let s2 = Arc::clone(&s);
            let order = Arc::clone(&order);
            let yields = rand::thread_rng().gen_range(0..10);
            handles.push(tokio::spawn(async move {
                let permit = s2.acquire().await;
                order.lock().unwrap().push(id);
                for _ in 0..yields {
                    tokio::task::yield_now().await;
                }
                drop(permit);
            }));
            wait_until(|| s.queued() == id + 1).await;
        }

        drop(holder);
        for h in handles {
            h.await.unwrap();
        }
        let expected: Vec<usize> = (0..20).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }
}

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kwatch_core::ChangeEvent;
use tokio::sync::Notify;

struct State {
    items: VecDeque<ChangeEvent>,
    dropped: u64,
}

/// Bounded FIFO between a cache producer and its dispatch task.
///
/// Overflow policy is drop-oldest: a push into a full queue evicts the head
/// and hands it back to the caller for logging.
pub struct EventQueue {
    state: Mutex<State>,
    notify: Notify,
    cap: usize,
}

impl EventQueue {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            state: Mutex::new(State { items: VecDeque::with_capacity(cap), dropped: 0 }),
            notify: Notify::new(),
            cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Enqueue `ev`; returns the evicted event when the queue was full.
    pub fn push(&self, ev: ChangeEvent) -> Option<ChangeEvent> {
        let evicted = {
            let mut st = self.lock();
            let evicted = if st.items.len() >= self.cap {
                st.dropped += 1;
                st.items.pop_front()
            } else {
                None
            };
            st.items.push_back(ev);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<ChangeEvent> {
        self.lock().items.pop_front()
    }

    /// Wait for the next event.
    pub async fn next(&self) -> ChangeEvent {
        loop {
            if let Some(ev) = self.pop() {
                return ev;
            }
            self.notify.notified().await;
        }
    }
}

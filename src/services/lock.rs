use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;

#[derive(Default)]
struct LockState {
    locked: bool,
    waiting: VecDeque<oneshot::Sender<()>>,
}

/// Single-process async mutual exclusion with FIFO hand-off
///
/// Not re-entrant: acquiring twice from the same task without releasing
/// deadlocks that task. Prefer [`InMemoryLock::lock`], whose guard releases on
/// every exit path.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    state: Arc<StdMutex<LockState>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the locked flag
    pub fn try_is_locked(&self) -> bool {
        self.with_state(|state| state.locked)
    }

    /// Wait until ownership is granted
    pub async fn acquire(&self) {
        let waiter = self.with_state(|state| {
            if state.locked {
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                Some(rx)
            } else {
                state.locked = true;
                None
            }
        });

        if let Some(rx) = waiter {
            // The sender is only dropped after ownership was handed to us
            let _ = rx.await;
        }
    }

    /// Hand ownership to the next waiter, or clear the flag
    pub fn release(&self) {
        self.with_state(|state| {
            while let Some(next) = state.waiting.pop_front() {
                // A waiter whose future was dropped cannot take ownership
                if next.send(()).is_ok() {
                    return;
                }
            }
            state.locked = false;
        });
    }

    /// Acquire and return a guard that releases on drop
    pub async fn lock(&self) -> LockGuard {
        self.acquire().await;
        LockGuard { lock: self.clone() }
    }

    /// Take the lock only if it is free right now
    pub fn try_lock(&self) -> Option<LockGuard> {
        let acquired = self.with_state(|state| {
            if state.locked {
                false
            } else {
                state.locked = true;
                true
            }
        });
        acquired.then(|| LockGuard { lock: self.clone() })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LockState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

/// Releases the owning [`InMemoryLock`] when dropped
pub struct LockGuard {
    lock: InMemoryLock,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

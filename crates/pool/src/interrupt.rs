//! Interrupt delivery for running handler calls.
//!
//! Every assignment of a request to a worker carries its own [`InterruptToken`].
//! The timeout path trips the token from outside the worker thread; the handler
//! sees it at its next checkpoint, sleep, or lock wait. Tripping also revokes
//! every [`ContextLock`] the assignment holds, so a handler stuck while holding
//! one can never starve callers on other workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;

static TOKEN_IDS: AtomicU64 = AtomicU64::new(1);

pub struct InterruptToken {
    id: u64,
    state: Mutex<TokenState>,
    wake: Condvar,
}

#[derive(Default)]
struct TokenState {
    interrupted: bool,
    held: Vec<Arc<LockInner>>,
    waiting_on: Option<Arc<LockInner>>,
}

impl InterruptToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TOKEN_IDS.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TokenState::default()),
            wake: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Trip the token. Returns how many held locks were force-released.
    /// Only the first call has any effect.
    pub fn interrupt(&self) -> usize {
        let (held, waiting_on) = {
            let mut state = self.state.lock();
            if state.interrupted {
                return 0;
            }
            state.interrupted = true;
            (std::mem::take(&mut state.held), state.waiting_on.take())
        };
        self.wake.notify_all();

        let mut released = 0;
        for lock in held {
            if lock.revoke(self.id) {
                released += 1;
            }
        }
        if let Some(lock) = waiting_on {
            lock.wake_all();
        }
        released
    }

    /// Sleep for `duration` unless interrupted first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                return Err(Interrupted);
            }
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return if state.interrupted {
                    Err(Interrupted)
                } else {
                    Ok(())
                };
            }
        }
    }

    fn forget(&self, lock: &Arc<LockInner>) {
        let mut state = self.state.lock();
        state.held.retain(|held| !Arc::ptr_eq(held, lock));
    }
}

/// A mutual-exclusion resource shared across workers.
///
/// Ownership is fenced: each acquisition gets its own epoch, and a guard only
/// releases the lock if it still owns that epoch. When the owning assignment is
/// interrupted the lock is released on its behalf and the stale guard's drop
/// becomes a no-op.
#[derive(Clone)]
pub struct ContextLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    name: String,
    state: Mutex<LockState>,
    freed: Condvar,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    next_epoch: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Holder {
    token: u64,
    epoch: u64,
}

impl LockInner {
    fn revoke(&self, token: u64) -> bool {
        let mut state = self.state.lock();
        match state.holder {
            Some(holder) if holder.token == token => {
                state.holder = None;
                drop(state);
                tracing::warn!("lock '{}' force-released from interrupted call", self.name);
                self.freed.notify_all();
                true
            }
            _ => false,
        }
    }

    fn wake_all(&self) {
        let _state = self.state.lock();
        self.freed.notify_all();
    }
}

impl ContextLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                name: name.into(),
                state: Mutex::new(LockState::default()),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_held(&self) -> bool {
        self.inner.state.lock().holder.is_some()
    }

    /// Block until the lock is free or `token` is interrupted.
    pub fn acquire(&self, token: &Arc<InterruptToken>) -> Result<ContextLockGuard, Interrupted> {
        let mut state = self.inner.state.lock();
        loop {
            {
                let mut token_state = token.state.lock();
                if token_state.interrupted {
                    token_state.waiting_on = None;
                    return Err(Interrupted);
                }
                if state.holder.is_none() {
                    state.next_epoch += 1;
                    let holder = Holder {
                        token: token.id,
                        epoch: state.next_epoch,
                    };
                    state.holder = Some(holder);
                    token_state.waiting_on = None;
                    token_state.held.push(Arc::clone(&self.inner));
                    return Ok(ContextLockGuard {
                        lock: Arc::clone(&self.inner),
                        token: Arc::clone(token),
                        holder,
                    });
                }
                token_state.waiting_on = Some(Arc::clone(&self.inner));
            }
            self.inner.freed.wait(&mut state);
        }
    }
}

pub struct ContextLockGuard {
    lock: Arc<LockInner>,
    token: Arc<InterruptToken>,
    holder: Holder,
}

impl ContextLockGuard {
    /// False once the lock was revoked by an interrupt.
    pub fn is_valid(&self) -> bool {
        self.lock.state.lock().holder == Some(self.holder)
    }
}

impl Drop for ContextLockGuard {
    fn drop(&mut self) {
        let released = {
            let mut state = self.lock.state.lock();
            if state.holder == Some(self.holder) {
                state.holder = None;
                true
            } else {
                false
            }
        };
        if released {
            self.lock.freed.notify_one();
        }
        self.token.forget(&self.lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_returns_early_when_interrupted() {
        let token = InterruptToken::new();
        let sleeper = Arc::clone(&token);
        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        token.interrupt();
        assert_eq!(handle.join().expect("join"), Err(Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_completes_without_interrupt() {
        let token = InterruptToken::new();
        assert_eq!(token.sleep(Duration::from_millis(10)), Ok(()));
        assert!(token.check().is_ok());
    }

    #[test]
    fn interrupt_releases_held_lock_for_other_callers() {
        let lock = ContextLock::new("log");
        let stuck = InterruptToken::new();
        let guard = lock.acquire(&stuck).expect("first acquire");
        assert!(lock.is_held());

        let waiter_lock = lock.clone();
        let handle = thread::spawn(move || {
            let other = InterruptToken::new();
            waiter_lock.acquire(&other).map(|guard| guard.is_valid())
        });
        thread::sleep(Duration::from_millis(50));

        assert_eq!(stuck.interrupt(), 1);
        assert_eq!(handle.join().expect("join"), Ok(true));
        assert!(!guard.is_valid());
        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn stale_guard_does_not_release_new_owner() {
        let lock = ContextLock::new("shared");
        let first = InterruptToken::new();
        let stale = lock.acquire(&first).expect("acquire");
        first.interrupt();

        let second = InterruptToken::new();
        let current = lock.acquire(&second).expect("reacquire after revoke");
        drop(stale);
        assert!(lock.is_held());
        assert!(current.is_valid());
        drop(current);
        assert!(!lock.is_held());
    }

    #[test]
    fn waiting_acquire_is_interruptible() {
        let lock = ContextLock::new("busy");
        let owner = InterruptToken::new();
        let _guard = lock.acquire(&owner).expect("acquire");

        let waiter = InterruptToken::new();
        let waiter_token = Arc::clone(&waiter);
        let waiter_lock = lock.clone();
        let handle = thread::spawn(move || waiter_lock.acquire(&waiter_token).is_err());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(waiter.interrupt(), 0);
        assert!(handle.join().expect("join"));
        assert!(lock.is_held());
    }

    #[test]
    fn interrupted_token_cannot_acquire() {
        let lock = ContextLock::new("x");
        let token = InterruptToken::new();
        token.interrupt();
        assert!(lock.acquire(&token).is_err());
        assert!(!lock.is_held());
    }
}

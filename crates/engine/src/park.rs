//! Parked requests waiting on out-of-band notification.
//!
//! One entry may be registered under several tokens. Whoever takes the entry's
//! sender first (a notify on any of its tokens, or its own fallback timer)
//! resolves it; everyone else finds the sender gone and does nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use pool::{NotifyOutcome, ParkSpec, split_tokens};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkResolution {
    Notified(NotifyOutcome),
    /// The fallback timeout fired first; carries the fallback status.
    TimedOut(u16),
}

struct ParkEntry {
    id: u64,
    tokens: Vec<String>,
    resolve: Mutex<Option<oneshot::Sender<NotifyOutcome>>>,
    created_at: Instant,
}

impl ParkEntry {
    fn take(&self) -> Option<oneshot::Sender<NotifyOutcome>> {
        self.resolve.lock().take()
    }
}

#[derive(Default)]
pub struct ParkingTable {
    entries: DashMap<String, Arc<ParkEntry>>,
    next_id: AtomicU64,
}

impl ParkingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a park. The returned handle resolves on the first notify of any
    /// of its tokens or when the fallback timeout passes.
    ///
    /// A token that is already claimed moves to the new park.
    pub fn park(self: &Arc<Self>, spec: &ParkSpec) -> Parked {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(ParkEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tokens: spec.tokens.clone(),
            resolve: Mutex::new(Some(tx)),
            created_at: Instant::now(),
        });

        for token in &entry.tokens {
            if let Some(previous) = self.entries.insert(token.clone(), Arc::clone(&entry)) {
                tracing::warn!(
                    "park token '{}' was claimed by park {}; reassigned to park {}",
                    token,
                    previous.id,
                    entry.id
                );
            }
        }
        tracing::debug!(
            "parked {} under {:?} for {}s",
            entry.id,
            entry.tokens,
            spec.timeout.as_secs_f64()
        );

        Parked {
            table: Arc::clone(self),
            entry,
            rx,
            timeout: spec.timeout,
            fallback_status: spec.fallback_status,
        }
    }

    /// Resolve the parks claiming any token in the comma-separated `tokens`.
    /// Unknown tokens are ignored. Returns how many parks were resolved.
    pub fn notify(&self, tokens: &str, outcome: NotifyOutcome) -> usize {
        let mut resolved = 0;
        for token in split_tokens(tokens) {
            if self.notify_one(&token, outcome.clone()) {
                resolved += 1;
            }
        }
        resolved
    }

    fn notify_one(&self, token: &str, outcome: NotifyOutcome) -> bool {
        let Some((_, entry)) = self.entries.remove(token) else {
            tracing::debug!("notify for '{}' matched no parked request", token);
            return false;
        };
        let Some(tx) = entry.take() else {
            return false;
        };
        self.forget(&entry);
        tracing::debug!(
            "park {} notified via '{}' after {}ms",
            entry.id,
            token,
            entry.created_at.elapsed().as_millis()
        );
        tx.send(outcome).is_ok()
    }

    /// Remove every token still pointing at `entry`.
    fn forget(&self, entry: &Arc<ParkEntry>) {
        for token in &entry.tokens {
            self.entries
                .remove_if(token, |_, current| Arc::ptr_eq(current, entry));
        }
    }

    pub fn is_parked(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    /// Number of tokens with a live claimant.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A registered park. Dropping it without waiting releases its tokens.
pub struct Parked {
    table: Arc<ParkingTable>,
    entry: Arc<ParkEntry>,
    rx: oneshot::Receiver<NotifyOutcome>,
    timeout: Duration,
    fallback_status: u16,
}

impl Parked {
    pub async fn wait(mut self) -> ParkResolution {
        if let Ok(Ok(outcome)) = tokio::time::timeout(self.timeout, &mut self.rx).await {
            return ParkResolution::Notified(outcome);
        }

        // A notify that already took the sender is about to send; its outcome wins.
        if self.entry.take().is_none() {
            if let Ok(outcome) = (&mut self.rx).await {
                return ParkResolution::Notified(outcome);
            }
        }
        self.table.forget(&self.entry);
        tracing::debug!("park {} fell back to {}", self.entry.id, self.fallback_status);
        ParkResolution::TimedOut(self.fallback_status)
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        self.entry.take();
        self.table.forget(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(tokens: &str, secs: u64) -> ParkSpec {
        ParkSpec::new([tokens], Duration::from_secs(secs), 504)
    }

    #[tokio::test(start_paused = true)]
    async fn first_notify_wins_and_invalidates_other_tokens() {
        let table = Arc::new(ParkingTable::new());
        let parked = table.park(&spec("12345, 12346", 60));
        assert!(table.is_parked("12346"));

        assert_eq!(table.notify("99999", NotifyOutcome::status(204)), 0);
        assert_eq!(table.notify("12345", NotifyOutcome::status(204)), 1);
        assert_eq!(table.notify("12346", NotifyOutcome::status(200)), 0);
        assert!(table.is_empty());

        assert_eq!(
            parked.wait().await,
            ParkResolution::Notified(NotifyOutcome::status(204))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_fires_after_timeout() {
        let table = Arc::new(ParkingTable::new());
        let parked = table.park(&spec("abc", 6));
        let started = Instant::now();
        assert_eq!(parked.wait().await, ParkResolution::TimedOut(504));
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(table.is_empty());
        assert_eq!(table.notify("abc", NotifyOutcome::status(204)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_outcome_carries_argument() {
        let table = Arc::new(ParkingTable::new());
        let parked = table.park(&spec("t", 60));
        let notifier = Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            notifier.notify("t", NotifyOutcome::retry("retry_arg"));
        });
        assert_eq!(
            parked.wait().await,
            ParkResolution::Notified(NotifyOutcome::retry("retry_arg"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn notify_racing_the_fallback_is_never_lost() {
        let table = Arc::new(ParkingTable::new());
        for round in 0..20_000 {
            let token = format!("race-{round}");
            let parked = table.park(&ParkSpec::new(
                [token.as_str()],
                Duration::from_millis(1),
                504,
            ));
            let notifier = Arc::clone(&table);
            let notify = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(1));
                notifier.notify(&token, NotifyOutcome::status(204))
            });

            let resolution = parked.wait().await;
            let resolved = notify.join().expect("notifier thread");
            if resolved == 1 {
                assert_eq!(
                    resolution,
                    ParkResolution::Notified(NotifyOutcome::status(204)),
                    "round {round}"
                );
            } else {
                assert_eq!(resolution, ParkResolution::TimedOut(504), "round {round}");
            }
        }
        assert!(table.is_empty());
    }

    #[test]
    fn comma_separated_notify_resolves_each_park() {
        let table = Arc::new(ParkingTable::new());
        let _first = table.park(&spec("a", 60));
        let _second = table.park(&spec("b", 60));
        assert_eq!(table.notify("a, b, c", NotifyOutcome::status(204)), 2);
    }

    #[test]
    fn reclaimed_token_belongs_to_newest_park() {
        let table = Arc::new(ParkingTable::new());
        let first = table.park(&spec("shared, own", 60));
        let _second = table.park(&spec("shared", 60));
        drop(first);
        assert!(table.is_parked("shared"));
        assert!(!table.is_parked("own"));
    }

    #[test]
    fn dropping_a_park_releases_its_tokens() {
        let table = Arc::new(ParkingTable::new());
        let parked = table.park(&spec("x, y", 60));
        drop(parked);
        assert!(table.is_empty());
    }
}

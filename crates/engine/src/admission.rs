//! Per-identity admission blocks.
//!
//! A blocked identity's requests are held until the block lifts and then
//! rejected, without ever reaching a worker. Each identity is its own map entry,
//! so holding one identity never delays another.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use pool::Request;

/// Identity used when the identity header is absent.
pub const ANONYMOUS: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Hold(Instant),
    Reject(u16),
}

struct BlockEntry {
    until: Instant,
    rejected: u64,
}

pub struct AdmissionGate {
    blocks: DashMap<String, BlockEntry>,
    hold_slots: Semaphore,
    reject_status: u16,
}

impl AdmissionGate {
    pub fn new(reject_status: u16, hold_slots: usize) -> Self {
        Self {
            blocks: DashMap::new(),
            hold_slots: Semaphore::new(hold_slots),
            reject_status,
        }
    }

    pub fn reject_status(&self) -> u16 {
        self.reject_status
    }

    /// Current decision for `identity`, without waiting.
    pub fn check_admission(&self, identity: &str) -> Admission {
        match self.blocks.get(identity) {
            Some(entry) if entry.until > Instant::now() => Admission::Hold(entry.until),
            _ => Admission::Admit,
        }
    }

    /// Admit, or hold until the block lifts and reject.
    ///
    /// A hold that finds its block extended keeps waiting. When every hold slot
    /// is taken the request is rejected right away.
    pub async fn admit(&self, identity: &str) -> Admission {
        let Admission::Hold(mut until) = self.check_admission(identity) else {
            return Admission::Admit;
        };

        match self.hold_slots.try_acquire() {
            Ok(_slot) => loop {
                tokio::time::sleep_until(until).await;
                match self.check_admission(identity) {
                    Admission::Hold(later) => until = later,
                    _ => break,
                }
            },
            Err(_) => tracing::debug!("no hold slot free for {}; rejecting immediately", identity),
        }

        if let Some(mut entry) = self.blocks.get_mut(identity) {
            entry.rejected += 1;
        }
        Admission::Reject(self.reject_status)
    }

    /// Block `identity` for `duration` from now, replacing any earlier block.
    /// Anonymous, loopback and private identities are never blocked.
    pub fn register_block(&self, identity: &str, duration: Duration) {
        if duration.is_zero() || is_exempt(identity) {
            return;
        }
        let until = Instant::now() + duration;
        tracing::info!("blocking {} for {}s", identity, duration.as_secs_f64());
        self.blocks
            .entry(identity.to_string())
            .and_modify(|entry| entry.until = until)
            .or_insert(BlockEntry { until, rejected: 0 });
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        matches!(self.check_admission(identity), Admission::Hold(_))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop expired blocks. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.blocks.retain(|identity, entry| {
            if entry.until > now {
                return true;
            }
            tracing::info!("unblocked {} after {} blocked requests", identity, entry.rejected);
            removed += 1;
            false
        });
        removed
    }

    /// Sweep every `interval` until the gate is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gate) = gate.upgrade() else {
                    return;
                };
                gate.sweep();
            }
        })
    }
}

/// Identities a block directive must not shut out: the anonymous bucket and
/// internal addresses, which usually stand for a proxy or a health checker.
fn is_exempt(identity: &str) -> bool {
    if identity == ANONYMOUS {
        return true;
    }
    match identity.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        // fc00::/7 is the IPv6 unique-local (private) range.
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

/// First element of the identity header, trimmed; `-` when absent or blank.
pub fn identity_of(request: &Request, header: &str) -> String {
    request
        .header(header)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_uses_first_forwarded_address() {
        let request = Request::new("GET", "/").with_header("X-Forwarded-For", " 1.2.3.4, 10.0.0.1");
        assert_eq!(identity_of(&request, "x-forwarded-for"), "1.2.3.4");
        assert_eq!(identity_of(&Request::new("GET", "/"), "x-forwarded-for"), ANONYMOUS);
    }

    #[tokio::test(start_paused = true)]
    async fn internal_addresses_are_never_blocked() {
        let gate = AdmissionGate::new(429, 10);
        let internal_addresses = [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.0.1",
            "::1",
            "fd00::1",
        ];
        for internal in internal_addresses {
            gate.register_block(internal, Duration::from_secs(60));
            assert!(!gate.is_blocked(internal), "{internal}");
            assert_eq!(gate.admit(internal).await, Admission::Admit);
        }
        assert!(gate.is_empty());

        gate.register_block("203.0.113.7", Duration::from_secs(60));
        gate.register_block("2001:db8::1", Duration::from_secs(60));
        assert!(gate.is_blocked("203.0.113.7"));
        assert!(gate.is_blocked("2001:db8::1"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_identity_is_held_then_rejected() {
        let gate = AdmissionGate::new(429, 10);
        gate.register_block("1.2.3.4", Duration::from_secs(2));

        let started = Instant::now();
        assert_eq!(gate.admit("1.2.3.4").await, Admission::Reject(429));
        assert!(started.elapsed() >= Duration::from_secs(2));

        assert_eq!(gate.admit("1.2.3.4").await, Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn other_identities_are_not_delayed() {
        let gate = Arc::new(AdmissionGate::new(429, 10));
        gate.register_block("1.2.3.4", Duration::from_secs(60));

        let held = Arc::clone(&gate);
        let blocked = tokio::spawn(async move { held.admit("1.2.3.4").await });
        tokio::task::yield_now().await;

        let started = Instant::now();
        assert_eq!(gate.admit("2.3.4.5").await, Admission::Admit);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!blocked.is_finished());
        blocked.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn extended_block_keeps_holding() {
        let gate = Arc::new(AdmissionGate::new(429, 10));
        gate.register_block("1.2.3.4", Duration::from_secs(1));

        let held = Arc::clone(&gate);
        let started = Instant::now();
        let blocked = tokio::spawn(async move { held.admit("1.2.3.4").await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        gate.register_block("1.2.3.4", Duration::from_secs(2));

        assert_eq!(blocked.await.expect("join"), Admission::Reject(429));
        assert!(started.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_immediately_without_hold_slots() {
        let gate = AdmissionGate::new(429, 0);
        gate.register_block("1.2.3.4", Duration::from_secs(30));
        let started = Instant::now();
        assert_eq!(gate.admit("1.2.3.4").await, Admission::Reject(429));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_blocks() {
        let gate = AdmissionGate::new(429, 10);
        gate.register_block("a", Duration::from_secs(1));
        gate.register_block("b", Duration::from_secs(10));
        gate.register_block(ANONYMOUS, Duration::from_secs(10));
        assert_eq!(gate.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(gate.sweep(), 1);
        assert!(!gate.is_blocked("a"));
        assert!(gate.is_blocked("b"));
    }
}

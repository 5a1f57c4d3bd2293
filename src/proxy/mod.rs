//! Outbound proxy pool.
//!
//! A pool of tested HTTP/SOCKS5 proxies leased to pollers for outbound
//! requests, with per-proxy health scoring and exponential cooldown
//! escalation on repeated failures. `provider.rs` carries the
//! refresh-from-source logic; this module carries lease/release state.

pub mod provider;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::{Proxy, ProxyProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure,
    Banned,
}

struct PoolEntry {
    proxy: Proxy,
    cooldown_until: Option<Instant>,
    leased: bool,
}

/// RAII guard returned by `lease`; releases the proxy back to the pool as a
/// `Success` if the caller never calls `release` explicitly.
pub struct LeasedProxy<'a> {
    pool: &'a ProxyPool,
    id: i64,
    released: bool,
    pub url: String,
    pub protocol: ProxyProtocol,
}

impl<'a> LeasedProxy<'a> {
    pub fn release(mut self, outcome: ProxyOutcome) {
        self.pool.release(self.id, outcome);
        self.released = true;
    }
}

impl<'a> Drop for LeasedProxy<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(self.id, ProxyOutcome::Success);
        }
    }
}

pub struct ProxyPool {
    entries: Mutex<HashMap<i64, PoolEntry>>,
    next_id: Mutex<i64>,
    min_active: usize,
}

impl ProxyPool {
    pub fn new(min_active: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            min_active,
        }
    }

    pub fn add(&self, url: String, protocol: ProxyProtocol) -> i64 {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        let proxy = Proxy {
            id,
            url,
            protocol,
            is_active: true,
            health_score: 100,
            consecutive_failures: 0,
            cooldown_until: None,
            last_used_at: None,
            last_tested_at: None,
        };
        self.entries.lock().insert(
            id,
            PoolEntry {
                proxy,
                cooldown_until: None,
                leased: false,
            },
        );
        id
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.proxy.is_active && !e.leased && e.cooldown_until.is_none())
            .count()
    }

    pub fn needs_refresh(&self) -> bool {
        self.active_count() < self.min_active
    }

    /// Lease the healthiest free, non-cooldown proxy, highest
    /// `health_score` first.
    pub fn lease(&self) -> Option<LeasedProxy<'_>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let candidate_id = entries
            .values()
            .filter(|e| {
                e.proxy.is_active
                    && !e.leased
                    && e.cooldown_until.map(|t| now >= t).unwrap_or(true)
            })
            .max_by_key(|e| e.proxy.health_score)
            .map(|e| e.proxy.id)?;

        let entry = entries.get_mut(&candidate_id)?;
        entry.leased = true;
        entry.proxy.last_used_at = Some(chrono::Utc::now());
        let url = entry.proxy.url.clone();
        let protocol = entry.proxy.protocol;
        drop(entries);

        Some(LeasedProxy {
            pool: self,
            id: candidate_id,
            released: false,
            url,
            protocol,
        })
    }

    fn release(&self, id: i64, outcome: ProxyOutcome) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        entry.leased = false;
        match outcome {
            ProxyOutcome::Success => {
                entry.proxy.consecutive_failures = 0;
                entry.proxy.health_score = (entry.proxy.health_score + 5).min(100);
                entry.cooldown_until = None;
            }
            ProxyOutcome::Failure => {
                entry.proxy.consecutive_failures += 1;
                entry.proxy.health_score = (entry.proxy.health_score - 20).max(0);
                // Exponential cooldown escalation: 30s * 2^(failures-1), cap 1h.
                let seconds = 30u64.saturating_mul(1u64 << entry.proxy.consecutive_failures.min(6));
                entry.cooldown_until = Some(Instant::now() + Duration::from_secs(seconds.min(3600)));
            }
            ProxyOutcome::Banned => {
                entry.proxy.is_active = false;
                entry.proxy.health_score = 0;
            }
        }
    }

    /// Remove proxies unused for longer than `stale_after`, run before
    /// each re-fetch so dead entries don't accumulate forever.
    pub fn evict_stale(&self, stale_after: Duration) {
        let now = chrono::Utc::now();
        let threshold = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        self.entries.lock().retain(|_, e| {
            !e.leased
                && e.proxy
                    .last_used_at
                    .map(|t| now - t < threshold)
                    .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_then_release_success_restores_availability() {
        let pool = ProxyPool::new(1);
        pool.add("http://1.2.3.4:8080".into(), ProxyProtocol::Http);
        assert_eq!(pool.active_count(), 1);

        let leased = pool.lease().expect("should lease");
        assert_eq!(pool.active_count(), 0);
        leased.release(ProxyOutcome::Success);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn repeated_failures_escalate_cooldown_and_drop_availability() {
        let pool = ProxyPool::new(1);
        let id = pool.add("http://1.2.3.4:8080".into(), ProxyProtocol::Http);
        let leased = pool.lease().unwrap();
        leased.release(ProxyOutcome::Failure);
        assert_eq!(pool.active_count(), 0);
        let _ = id;
    }

    #[test]
    fn banned_proxy_never_becomes_available_again() {
        let pool = ProxyPool::new(1);
        pool.add("http://1.2.3.4:8080".into(), ProxyProtocol::Http);
        let leased = pool.lease().unwrap();
        leased.release(ProxyOutcome::Banned);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn needs_refresh_reflects_min_active_threshold() {
        let pool = ProxyPool::new(2);
        pool.add("http://1.2.3.4:8080".into(), ProxyProtocol::Http);
        assert!(pool.needs_refresh());
    }
}

//! Per-user priority signal queue.
//!
//! A max-heap of scored signal records per user, plus a per-user
//! processing lock with a TTL so a batch drain and a manual "copy now"
//! for the same user never execute concurrently. Everything lives in an
//! in-process `BinaryHeap` and a `parking_lot`-guarded lock map, since this
//! runs as a single process rather than against a shared store.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::models::{Signal, Whale};

/// Point breakdown from `calculate_signal_priority`. Higher is more
/// urgent; internally negated so a max-heap pops the highest priority.
pub fn calculate_signal_priority(signal: &Signal, whale: &Whale) -> i32 {
    let confidence_weight = signal.confidence.weight();
    let whale_roi_score = ((whale.priority_score as f64) * 0.35).min(35.0) as i32;
    let size_score = size_score(signal.amount_usd);
    confidence_weight + whale_roi_score + size_score
}

fn size_score(amount_usd: Decimal) -> i32 {
    let amount: f64 = amount_usd.try_into().unwrap_or(0.0);
    if amount >= 100_000.0 {
        25
    } else if amount >= 50_000.0 {
        15 + ((amount - 50_000.0) / 5_000.0) as i32
    } else if amount >= 10_000.0 {
        5 + ((amount - 10_000.0) / 4_000.0) as i32
    } else {
        (amount / 2_000.0).max(0.0) as i32
    }
}

#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub signal_id: i64,
    pub whale_id: i64,
    pub user_id: i64,
    pub priority: i32,
    pub symbol: String,
    pub queued_at: Instant,
}

impl PartialEq for QueuedSignal {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.queued_at == other.queued_at
    }
}
impl Eq for QueuedSignal {}

impl PartialOrd for QueuedSignal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSignal {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; for ties, earlier-queued first (FIFO
        // fairness within the same priority band).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
    }
}

struct UserQueue {
    heap: BinaryHeap<QueuedSignal>,
}

pub struct SignalQueue {
    per_user: Mutex<HashMap<i64, UserQueue>>,
    /// One lock per `user_id`: execution is single-threaded per user, so a
    /// batch drain and a manual "copy now" for the same user must never
    /// run concurrently, regardless of which signal each is processing.
    processing_locks: Mutex<HashMap<i64, Instant>>,
    lock_ttl: Duration,
    queue_ttl: Duration,
}

impl SignalQueue {
    pub fn new(processing_lock_ttl_seconds: i64, queue_ttl_seconds: i64) -> Self {
        Self {
            per_user: Mutex::new(HashMap::new()),
            processing_locks: Mutex::new(HashMap::new()),
            lock_ttl: Duration::from_secs(processing_lock_ttl_seconds.max(0) as u64),
            queue_ttl: Duration::from_secs(queue_ttl_seconds.max(0) as u64),
        }
    }

    pub fn enqueue(&self, user_id: i64, signal: &Signal, whale: &Whale) {
        let priority = calculate_signal_priority(signal, whale);
        let mut per_user = self.per_user.lock();
        per_user
            .entry(user_id)
            .or_insert_with(|| UserQueue { heap: BinaryHeap::new() })
            .heap
            .push(QueuedSignal {
                signal_id: signal.id,
                whale_id: whale.id,
                user_id,
                priority,
                symbol: signal.symbol.clone(),
                queued_at: Instant::now(),
            });
    }

    /// Pop the highest-priority signal still within TTL for this user,
    /// dropping any stale (TTL-expired) entries encountered along the way.
    pub fn pop_next(&self, user_id: i64) -> Option<QueuedSignal> {
        let mut per_user = self.per_user.lock();
        let queue = per_user.get_mut(&user_id)?;
        while let Some(top) = queue.heap.pop() {
            if top.queued_at.elapsed() <= self.queue_ttl {
                return Some(top);
            }
        }
        None
    }

    /// Inspection only: the top `n` entries still within TTL, without
    /// removing them or touching the heap order other members rely on.
    pub fn peek(&self, user_id: i64, n: usize) -> Vec<QueuedSignal> {
        let per_user = self.per_user.lock();
        let Some(queue) = per_user.get(&user_id) else {
            return Vec::new();
        };
        let mut entries: Vec<QueuedSignal> = queue
            .heap
            .iter()
            .filter(|q| q.queued_at.elapsed() <= self.queue_ttl)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.truncate(n);
        entries
    }

    pub fn pending_count(&self, user_id: i64) -> usize {
        self.per_user
            .lock()
            .get(&user_id)
            .map(|q| q.heap.len())
            .unwrap_or(0)
    }

    /// SETNX-style processing lock: succeeds only if no other worker
    /// currently holds (an unexpired) lock on this user.
    pub fn acquire_processing_lock(&self, user_id: i64) -> bool {
        let mut locks = self.processing_locks.lock();
        let now = Instant::now();
        match locks.get(&user_id) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                locks.insert(user_id, now + self.lock_ttl);
                true
            }
        }
    }

    pub fn release_processing_lock(&self, user_id: i64) {
        self.processing_locks.lock().remove(&user_id);
    }

    pub fn extend_processing_lock(&self, user_id: i64) {
        let mut locks = self.processing_locks.lock();
        if let Some(expires_at) = locks.get_mut(&user_id) {
            *expires_at = Instant::now() + self.lock_ttl;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, SignalAction, SignalConfidence, SignalStatus};
    use chrono::Utc;

    fn whale(priority_score: i32) -> Whale {
        let mut w = Whale::new_cex(1, Exchange::Binance, "uid".into());
        w.priority_score = priority_score;
        w
    }

    fn signal(id: i64, confidence: SignalConfidence, amount_usd: i64) -> Signal {
        Signal {
            id,
            whale_id: 1,
            dedup_key: format!("k{id}"),
            symbol: "BTCUSDT".into(),
            action: SignalAction::Buy,
            amount_usd: Decimal::from(amount_usd),
            entry_price_hint: Some(Decimal::from(50_000)),
            confidence,
            leverage: None,
            is_close: false,
            status: SignalStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            processed_at: None,
            version: 0,
        }
    }

    #[test]
    fn higher_confidence_and_size_wins_priority_ordering() {
        // A = very-high confidence large trade from a high-scoring whale
        // should outrank B = low confidence small trade from a low-scoring
        // whale, which should in turn outrank C (an even smaller,
        // lower-confidence trade). No breakpoint is close here; every term
        // moves in the same direction for A over B over C.
        let whale_a = whale(90);
        let whale_b = whale(20);
        let sig_a = signal(1, SignalConfidence::VeryHigh, 150_000);
        let sig_b = signal(2, SignalConfidence::Low, 5_000);
        let sig_c = signal(3, SignalConfidence::Low, 1_000);

        let queue = SignalQueue::new(60, 300);
        queue.enqueue(1, &sig_b, &whale_b);
        queue.enqueue(1, &sig_a, &whale_a);
        queue.enqueue(1, &sig_c, &whale_b);

        let first = queue.pop_next(1).unwrap();
        assert_eq!(first.signal_id, 1);
        let second = queue.pop_next(1).unwrap();
        assert_eq!(second.signal_id, 2);
        let third = queue.pop_next(1).unwrap();
        assert_eq!(third.signal_id, 3);
    }

    #[test]
    fn size_weight_can_outrank_a_higher_confidence_band() {
        // Same whale (priority 50 -> whale_roi_score 17) for all three, so
        // only confidence and size move. A HIGH-confidence signal with a
        // negligible size (30 + 17 + 0 = 47) should lose to a MEDIUM one at
        // the $100k size cap (20 + 17 + 25 = 62): the formula is additive,
        // so a large enough size gap overturns a one-band confidence edge.
        // A LOW-confidence, negligible-size signal (10 + 17 + 0 = 27) stays
        // last either way.
        let w = whale(50);
        let high_small = signal(1, SignalConfidence::High, 1_000);
        let medium_huge = signal(2, SignalConfidence::Medium, 100_000);
        let low_small = signal(3, SignalConfidence::Low, 1_000);

        let queue = SignalQueue::new(60, 300);
        queue.enqueue(1, &high_small, &w);
        queue.enqueue(1, &medium_huge, &w);
        queue.enqueue(1, &low_small, &w);

        assert_eq!(queue.pop_next(1).unwrap().signal_id, 2);
        assert_eq!(queue.pop_next(1).unwrap().signal_id, 1);
        assert_eq!(queue.pop_next(1).unwrap().signal_id, 3);
    }

    #[test]
    fn processing_lock_prevents_double_acquire_for_the_same_user() {
        let queue = SignalQueue::new(60, 300);
        let user_id = 1;
        assert!(queue.acquire_processing_lock(user_id));
        assert!(!queue.acquire_processing_lock(user_id));
        queue.release_processing_lock(user_id);
        assert!(queue.acquire_processing_lock(user_id));
    }

    #[test]
    fn size_score_matches_the_piecewise_breakpoints() {
        assert_eq!(size_score(Decimal::from(100_000)), 25);
        assert_eq!(size_score(Decimal::from(60_000)), 17);
        assert_eq!(size_score(Decimal::from(12_000)), 5);
        assert_eq!(size_score(Decimal::from(1_000)), 0);
    }
}

//! Sharing-availability state machine for whales.
//!
//! Bitget leaderboards are always public; other exchanges flip to
//! SHARING_DISABLED once a whale's empty-check streak crosses a threshold,
//! and are revalidated on a fixed schedule. The threshold is expressed as
//! elapsed wall-clock time rather than a raw check count, so whales polled
//! at different intervals are compared fairly.

use chrono::{DateTime, Duration, Utc};

use crate::models::{Exchange, Whale, WhaleDataStatus};

pub struct SharingValidator {
    pub empty_checks_duration_threshold: Duration,
    pub recheck_interval: Duration,
}

impl SharingValidator {
    pub fn new(empty_checks_duration_threshold_seconds: i64, recheck_interval_hours: i64) -> Self {
        Self {
            empty_checks_duration_threshold: Duration::seconds(empty_checks_duration_threshold_seconds),
            recheck_interval: Duration::hours(recheck_interval_hours),
        }
    }

    /// Whether this whale is exempt from ever entering SHARING_DISABLED.
    pub fn is_always_public(&self, whale: &Whale) -> bool {
        whale.exchange.map(Exchange::always_public).unwrap_or(false)
    }

    /// Called after every poll with whether positions were found. Mutates
    /// `whale` in place and returns whether the status changed.
    pub fn check_and_update_status(&self, whale: &mut Whale, found_positions: bool, now: DateTime<Utc>) -> bool {
        let previous = whale.data_status;
        whale.last_position_check_at = Some(now);

        if found_positions {
            whale.consecutive_empty_checks = 0;
            whale.last_position_found_at = Some(now);
            if whale.data_status == WhaleDataStatus::SharingDisabled
                || whale.data_status == WhaleDataStatus::RateLimited
            {
                whale.data_status = WhaleDataStatus::Active;
                whale.sharing_disabled_at = None;
                whale.sharing_recheck_at = None;
            }
            return previous != whale.data_status;
        }

        whale.consecutive_empty_checks += 1;

        if self.is_always_public(whale) {
            // Bitget whales never flip to SHARING_DISABLED, per spec.
            return false;
        }

        if whale.data_status == WhaleDataStatus::Active
            && whale.empty_checks_duration() >= self.empty_checks_duration_threshold
        {
            whale.data_status = WhaleDataStatus::SharingDisabled;
            whale.sharing_disabled_at = Some(now);
            whale.sharing_recheck_at = Some(now + self.recheck_interval);
            return true;
        }

        false
    }

    pub fn mark_rate_limited(&self, whale: &mut Whale, until: DateTime<Utc>) {
        whale.data_status = WhaleDataStatus::RateLimited;
        whale.rate_limited_until = Some(until);
    }

    pub fn clear_rate_limit(&self, whale: &mut Whale, now: DateTime<Utc>) {
        if whale.data_status == WhaleDataStatus::RateLimited
            && whale.rate_limited_until.map(|t| now >= t).unwrap_or(true)
        {
            whale.data_status = WhaleDataStatus::Active;
            whale.rate_limited_until = None;
        }
    }

    /// Whales due for a revalidation poll despite being SHARING_DISABLED.
    pub fn needs_revalidation(&self, whale: &Whale, now: DateTime<Utc>) -> bool {
        whale.data_status == WhaleDataStatus::SharingDisabled
            && whale.sharing_recheck_at.map(|t| now >= t).unwrap_or(true)
    }

    pub fn reset_for_revalidation(&self, whale: &mut Whale) {
        whale.consecutive_empty_checks = 0;
    }

    /// The scheduler's poll-eligibility predicate.
    pub fn is_eligible_for_polling(&self, whale: &Whale, now: DateTime<Utc>) -> bool {
        if !whale.is_active {
            return false;
        }
        match whale.data_status {
            WhaleDataStatus::Active => true,
            WhaleDataStatus::SharingDisabled => self.needs_revalidation(whale, now),
            WhaleDataStatus::RateLimited => {
                whale.rate_limited_until.map(|t| now >= t).unwrap_or(true)
            }
            WhaleDataStatus::Inactive => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;

    fn validator() -> SharingValidator {
        SharingValidator::new(17 * 60, 24)
    }

    #[test]
    fn bitget_whale_never_enters_sharing_disabled() {
        let v = validator();
        let mut whale = Whale::new_cex(1, Exchange::Bitget, "uid".into());
        whale.polling_interval_seconds = 60;
        let now = Utc::now();
        for _ in 0..100 {
            v.check_and_update_status(&mut whale, false, now);
        }
        assert_eq!(whale.data_status, WhaleDataStatus::Active);
    }

    #[test]
    fn binance_whale_disables_after_duration_threshold() {
        let v = validator();
        let mut whale = Whale::new_cex(1, Exchange::Binance, "uid".into());
        whale.polling_interval_seconds = 60;
        let now = Utc::now();
        // 17 checks * 60s = 17 minutes, right at threshold.
        for _ in 0..17 {
            v.check_and_update_status(&mut whale, false, now);
        }
        assert_eq!(whale.data_status, WhaleDataStatus::SharingDisabled);
        assert!(whale.sharing_recheck_at.is_some());
    }

    #[test]
    fn finding_positions_clears_sharing_disabled() {
        let v = validator();
        let mut whale = Whale::new_cex(1, Exchange::Binance, "uid".into());
        whale.data_status = WhaleDataStatus::SharingDisabled;
        whale.consecutive_empty_checks = 20;
        let now = Utc::now();
        let changed = v.check_and_update_status(&mut whale, true, now);
        assert!(changed);
        assert_eq!(whale.data_status, WhaleDataStatus::Active);
        assert_eq!(whale.consecutive_empty_checks, 0);
    }

    #[test]
    fn inactive_whale_is_never_eligible_for_polling() {
        let v = validator();
        let mut whale = Whale::new_cex(1, Exchange::Okx, "uid".into());
        whale.is_active = false;
        assert!(!v.is_eligible_for_polling(&whale, Utc::now()));
    }
}

//! Per-identifier request and gas accounting.
//!
//! Two fixed windows are tracked for every identifier: a request counter that
//! resets one minute after it was opened, and a cumulative gas counter that
//! resets after one hour. Windows roll over lazily when the identifier is
//! next seen; [`RateLimiter::sweep`] only reclaims memory.
//!
//! Admission goes through [`RateLimiter::try_reserve`], which checks the
//! budget and takes a slot under a single lock. The returned
//! [`RateLimitPermit`] is committed once the request clears its remaining
//! gates, or releases the slot when dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub max_requests_per_minute: u32,
    pub max_gas_per_hour: u64,
    pub window_ms: i64,
    pub gas_window_ms: i64,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 10,
            max_gas_per_hour: 1_000_000,
            window_ms: 60 * 1000,
            gas_window_ms: 60 * 60 * 1000,
        }
    }
}

impl RateLimiterOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_requests_per_minute: cfg.max_requests_per_minute,
            max_gas_per_hour: cfg.max_gas_per_hour,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    // Admitted but not yet committed requests.
    reserved: u32,
    reset_time: i64,
    gas_used: u64,
    last_reset: i64,
}

impl RateLimitEntry {
    fn new(now: i64, window_ms: i64) -> Self {
        Self {
            count: 0,
            reserved: 0,
            reset_time: now + window_ms,
            gas_used: 0,
            last_reset: now,
        }
    }

    fn roll_windows(&mut self, now: i64, opts: &RateLimiterOptions) {
        if now >= self.reset_time {
            self.count = 0;
            self.reset_time = now + opts.window_ms;
        }
        if now >= self.last_reset + opts.gas_window_ms {
            self.gas_used = 0;
            self.last_reset = now;
        }
    }

    fn expired(&self, now: i64, opts: &RateLimiterOptions) -> bool {
        self.reserved == 0
            && now >= self.reset_time
            && now >= self.last_reset + opts.gas_window_ms
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the caller may retry, when not allowed.
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(wait_ms: i64) -> Self {
        Self {
            allowed: false,
            retry_after: Some(ceil_secs(wait_ms)),
        }
    }
}

fn ceil_secs(ms: i64) -> u64 {
    (ms.max(0) as u64).div_ceil(1000)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub request_count: u32,
    pub gas_used: u64,
    pub reset_time: i64,
    pub gas_reset_time: i64,
}

#[derive(Default)]
struct LimiterState {
    entries: HashMap<String, RateLimitEntry>,
    // identifier -> unban timestamp (ms)
    bans: HashMap<String, i64>,
}

pub struct RateLimiter {
    options: RateLimiterOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_ascii_lowercase()
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: RateLimiterOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Consult the ban list, then the request window. Creates the entry on
    /// first sight and rolls expired windows.
    pub fn check_limit(&self, identifier: &str) -> RateLimitDecision {
        let key = normalize(identifier);
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        Self::decide(&mut state, &key, now, &self.options)
    }

    fn decide(
        state: &mut LimiterState,
        key: &str,
        now: i64,
        opts: &RateLimiterOptions,
    ) -> RateLimitDecision {
        if let Some(&ban_until) = state.bans.get(key) {
            if now < ban_until {
                return RateLimitDecision::deny(ban_until - now);
            }
            state.bans.remove(key);
        }

        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now, opts.window_ms));
        entry.roll_windows(now, opts);

        if entry.count + entry.reserved >= opts.max_requests_per_minute {
            return RateLimitDecision::deny(entry.reset_time - now);
        }
        RateLimitDecision::allow()
    }

    /// Atomically check the budget and hold a slot for `identifier`.
    pub fn try_reserve(&self, identifier: &str) -> Result<RateLimitPermit<'_>, RateLimitDecision> {
        let key = normalize(identifier);
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let decision = Self::decide(&mut state, &key, now, &self.options);
        if !decision.allowed {
            return Err(decision);
        }
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.reserved += 1;
        }
        drop(state);

        Ok(RateLimitPermit {
            limiter: self,
            identifier: key,
            committed: false,
        })
    }

    /// Count one request against the current window. No-op for unknown
    /// identifiers.
    pub fn increment_count(&self, identifier: &str) {
        let key = normalize(identifier);
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.count += 1;
        }
    }

    fn commit_reservation(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.reserved = entry.reserved.saturating_sub(1);
            entry.count += 1;
        }
    }

    fn release_reservation(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.reserved = entry.reserved.saturating_sub(1);
        }
    }

    /// Add gas to the hourly budget. Returns false, and bans the identifier
    /// for one gas window, when the budget would be exceeded. Unknown
    /// identifiers return false without side effects.
    pub fn add_gas_usage(&self, identifier: &str, gas: u64) -> bool {
        let key = normalize(identifier);
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };

        let new_gas = entry.gas_used.saturating_add(gas);
        if new_gas > self.options.max_gas_per_hour {
            state.bans.insert(key, now.saturating_add(self.options.gas_window_ms));
            return false;
        }
        entry.gas_used = new_gas;
        true
    }

    pub fn ban_wallet(&self, identifier: &str, duration: Duration) {
        let key = normalize(identifier);
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let until = self.clock.now_millis().saturating_add(millis);
        self.state.lock().bans.insert(key, until);
    }

    pub fn is_banned(&self, identifier: &str) -> bool {
        let key = normalize(identifier);
        let now = self.clock.now_millis();
        self.state
            .lock()
            .bans
            .get(&key)
            .is_some_and(|&until| now < until)
    }

    pub fn get_usage_stats(&self, identifier: &str) -> Option<UsageStats> {
        let key = normalize(identifier);
        let state = self.state.lock();
        state.entries.get(&key).map(|entry| UsageStats {
            request_count: entry.count,
            gas_used: entry.gas_used,
            reset_time: entry.reset_time,
            gas_reset_time: entry.last_reset + self.options.gas_window_ms,
        })
    }

    /// Drop entries whose windows have both expired and bans that have run
    /// out. Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let opts = &self.options;
        let mut state = self.state.lock();

        let before = state.entries.len() + state.bans.len();
        state.entries.retain(|_, entry| !entry.expired(now, opts));
        state.bans.retain(|_, &mut until| now < until);
        before - (state.entries.len() + state.bans.len())
    }

    /// Number of identifiers with a live entry.
    pub fn tracked_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn banned_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .bans
            .values()
            .filter(|&&until| now < until)
            .count()
    }
}

/// A reserved request slot. Dropping it without calling
/// [`RateLimitPermit::commit`] gives the slot back.
#[must_use = "dropping a permit releases the reserved slot"]
pub struct RateLimitPermit<'a> {
    limiter: &'a RateLimiter,
    identifier: String,
    committed: bool,
}

impl RateLimitPermit<'_> {
    /// Count the reserved request against the window.
    pub fn commit(mut self) {
        self.limiter.commit_reservation(&self.identifier);
        self.committed = true;
    }
}

impl Drop for RateLimitPermit<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.release_reservation(&self.identifier);
        }
    }
}

/// Run [`RateLimiter::sweep`] every `interval` until `cancel` fires.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Rate limiter sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = limiter.sweep();
                    tracing::debug!(
                        removed,
                        tracked = limiter.tracked_count(),
                        "Rate limiter sweep finished"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const OWNER: &str = "0x742d35Cc6634C0532925a3b8D4C9db96C4b4d8b6";

    fn limiter(max: u32, max_gas: u64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let opts = RateLimiterOptions {
            max_requests_per_minute: max,
            max_gas_per_hour: max_gas,
            ..RateLimiterOptions::default()
        };
        (clock.clone(), RateLimiter::with_clock(opts, clock))
    }

    #[test]
    fn test_nth_request_allowed_up_to_cap() {
        let (_clock, rl) = limiter(10, 1_000_000);
        for n in 1..=10 {
            let d = rl.check_limit(OWNER);
            assert!(d.allowed, "request {} should be allowed", n);
            rl.increment_count(OWNER);
        }
        let d = rl.check_limit(OWNER);
        assert!(!d.allowed);
        let retry = d.retry_after.unwrap();
        assert!(retry > 0 && retry <= 60);
    }

    #[test]
    fn test_window_resets_lazily() {
        let (clock, rl) = limiter(2, 1_000_000);
        for _ in 0..2 {
            assert!(rl.check_limit(OWNER).allowed);
            rl.increment_count(OWNER);
        }
        assert!(!rl.check_limit(OWNER).allowed);

        clock.advance_secs(59);
        assert_eq!(rl.check_limit(OWNER).retry_after, Some(1));

        clock.advance_secs(1);
        assert!(rl.check_limit(OWNER).allowed);
        assert_eq!(rl.get_usage_stats(OWNER).unwrap().request_count, 0);
    }

    #[test]
    fn test_identifiers_are_case_insensitive() {
        let (_clock, rl) = limiter(1, 1_000_000);
        assert!(rl.check_limit(OWNER).allowed);
        rl.increment_count(OWNER);
        assert!(!rl.check_limit(&OWNER.to_lowercase()).allowed);
    }

    #[test]
    fn test_increment_and_gas_noop_for_unknown() {
        let (_clock, rl) = limiter(10, 1_000_000);
        rl.increment_count("0xunknown");
        assert!(!rl.add_gas_usage("0xunknown", 10));
        assert!(rl.get_usage_stats("0xunknown").is_none());
        assert!(!rl.is_banned("0xunknown"));
    }

    #[test]
    fn test_ban_lasts_exactly_duration() {
        let (clock, rl) = limiter(10, 1_000_000);
        rl.ban_wallet(OWNER, Duration::from_secs(30));
        assert!(rl.is_banned(OWNER));

        let d = rl.check_limit(OWNER);
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Some(30));

        clock.advance_millis(29_999);
        assert!(rl.is_banned(OWNER));
        clock.advance_millis(1);
        assert!(!rl.is_banned(OWNER));
        assert!(rl.check_limit(OWNER).allowed);
    }

    #[test]
    fn test_unbounded_ban_saturates() {
        let (clock, rl) = limiter(10, 1_000_000);
        rl.ban_wallet(OWNER, Duration::MAX);
        assert!(rl.is_banned(OWNER));

        clock.advance_secs(10 * 365 * 24 * 3600);
        assert!(rl.is_banned(OWNER));
        let d = rl.check_limit(OWNER);
        assert!(!d.allowed);
        assert!(d.retry_after.unwrap() > 0);
    }

    #[test]
    fn test_gas_overrun_bans_for_gas_window() {
        let (clock, rl) = limiter(10, 100_000);
        rl.check_limit(OWNER);
        assert!(rl.add_gas_usage(OWNER, 60_000));
        assert!(rl.add_gas_usage(OWNER, 40_000));
        assert!(!rl.add_gas_usage(OWNER, 1));
        assert!(rl.is_banned(OWNER));
        assert_eq!(rl.get_usage_stats(OWNER).unwrap().gas_used, 100_000);

        let d = rl.check_limit(OWNER);
        assert_eq!(d.retry_after, Some(3600));

        clock.advance_secs(3600);
        assert!(!rl.is_banned(OWNER));
        assert!(rl.check_limit(OWNER).allowed);
        assert_eq!(rl.get_usage_stats(OWNER).unwrap().gas_used, 0);
    }

    #[test]
    fn test_reservations_count_toward_cap() {
        let (_clock, rl) = limiter(2, 1_000_000);
        let p1 = rl.try_reserve(OWNER).unwrap();
        let p2 = rl.try_reserve(OWNER).unwrap();
        let denied = rl.try_reserve(OWNER).err().unwrap();
        assert!(!denied.allowed);

        p1.commit();
        drop(p2);
        assert_eq!(rl.get_usage_stats(OWNER).unwrap().request_count, 1);

        let p3 = rl.try_reserve(OWNER).unwrap();
        p3.commit();
        assert!(rl.try_reserve(OWNER).is_err());
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_cap() {
        let (_clock, rl) = limiter(5, 1_000_000);
        let rl = Arc::new(rl);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || match rl.try_reserve(OWNER) {
                    Ok(permit) => {
                        permit.commit();
                        1u32
                    }
                    Err(_) => 0,
                })
            })
            .collect();
        let admitted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_sweep_removes_expired_entries_and_bans() {
        let (clock, rl) = limiter(10, 1_000_000);
        rl.check_limit(OWNER);
        rl.check_limit("0xother");
        rl.ban_wallet("0xbanned", Duration::from_secs(60));
        assert_eq!(rl.sweep(), 0);

        clock.advance_secs(61);
        // Request window expired, gas window still open.
        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.tracked_count(), 2);

        clock.advance_secs(3600);
        assert_eq!(rl.sweep(), 2);
        assert_eq!(rl.tracked_count(), 0);
        assert_eq!(rl.banned_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let (clock, rl) = limiter(10, 1_000_000);
        let rl = Arc::new(rl);
        rl.check_limit(OWNER);
        clock.advance_secs(7200);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&rl), Duration::from_secs(300), cancel.clone());
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(rl.tracked_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}

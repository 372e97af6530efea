//! Progress of pulling sporks, node lists and payment winners from peers after start-up.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use crown_shared_types::{Hash, SyncItem};
use log::{debug, info, warn};

/// Seconds a fulfilled request is remembered.
pub const FULFILLED_REQUEST_EXPIRE_SECONDS: i64 = 60 * 60;

/// Times an item may be reported before it stops counting as fresh sync progress.
pub const SYNC_THRESHOLD: u32 = 2;

/// Base sync interval in seconds.
pub const SYNC_TIMEOUT_SECONDS: i64 = 5;

/// A failed sync is retried after this long.
pub const SYNC_RETRY_SECONDS: i64 = 60;

/// Requests a peer has already had answered, keyed by address and command.
#[derive(Debug, Default)]
pub struct FulfilledRequests {
    requests: HashMap<(IpAddr, String), i64>,
}

impl FulfilledRequests {
    pub fn has_fulfilled(&self, addr: &IpAddr, request: &str, now: i64) -> bool {
        self.requests
            .get(&(*addr, request.to_string()))
            .map_or(false, |until| *until > now)
    }

    pub fn add_fulfilled(&mut self, addr: IpAddr, request: &str, now: i64) {
        self.requests.insert((addr, request.to_string()), now + FULFILLED_REQUEST_EXPIRE_SECONDS);
    }

    pub fn check_and_remove(&mut self, now: i64) {
        self.requests.retain(|_, until| *until > now);
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Initial,
    Sporks,
    List,
    Winners,
    Finished,
    Failed,
}

/// Sync state for one node class.
#[derive(Debug)]
pub struct SyncTracker {
    stage: SyncStage,
    stage_started: i64,
    last_list: i64,
    last_winner: i64,
    last_failure: i64,
    failures: u32,
    seen_list: HashMap<Hash, u32>,
    seen_winners: HashMap<Hash, u32>,
    list_sum: u32,
    list_reports: u32,
    winner_sum: u32,
    winner_reports: u32,
}

impl SyncTracker {
    pub fn new(now: i64) -> Self {
        SyncTracker {
            stage: SyncStage::Initial,
            stage_started: now,
            last_list: 0,
            last_winner: 0,
            last_failure: 0,
            failures: 0,
            seen_list: HashMap::new(),
            seen_winners: HashMap::new(),
            list_sum: 0,
            list_reports: 0,
            winner_sum: 0,
            winner_reports: 0,
        }
    }

    pub fn reset(&mut self, now: i64) {
        *self = SyncTracker::new(now);
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn is_synced(&self) -> bool {
        self.stage == SyncStage::Finished
    }

    /// Moves to the next stage. A failed sync restarts from sporks.
    pub fn advance(&mut self, now: i64) {
        self.stage = match self.stage {
            SyncStage::Initial | SyncStage::Failed => SyncStage::Sporks,
            SyncStage::Sporks => SyncStage::List,
            SyncStage::List => SyncStage::Winners,
            SyncStage::Winners | SyncStage::Finished => {
                if self.stage != SyncStage::Finished {
                    info!("sync finished");
                }
                SyncStage::Finished
            }
        };
        self.stage_started = now;
    }

    pub fn fail(&mut self, now: i64) {
        self.stage = SyncStage::Failed;
        self.last_failure = now;
        self.failures += 1;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure(&self) -> i64 {
        self.last_failure
    }

    pub fn stage_started(&self) -> i64 {
        self.stage_started
    }

    /// Moves the sync along based on elapsed time.
    ///
    /// A stage ends once its items stop arriving for two intervals. A stage that never receives
    /// anything times out after five intervals and fails when `enforcement` is on.
    pub fn tick(&mut self, now: i64, chain_synced: bool, enforcement: bool) -> SyncStage {
        if self.is_synced() {
            return self.stage;
        }
        if self.stage == SyncStage::Failed {
            if self.last_failure + SYNC_RETRY_SECONDS >= now {
                return self.stage;
            }
            let (failures, last_failure) = (self.failures, self.last_failure);
            self.reset(now);
            self.failures = failures;
            self.last_failure = last_failure;
        }
        if self.stage == SyncStage::Initial {
            self.advance(now);
        }
        if !chain_synced {
            return self.stage;
        }

        let last_item = match self.stage {
            SyncStage::Sporks => {
                if now - self.stage_started >= SYNC_TIMEOUT_SECONDS * 2 {
                    self.advance(now);
                }
                return self.stage;
            }
            SyncStage::List => self.last_list,
            SyncStage::Winners => self.last_winner,
            _ => return self.stage,
        };
        if last_item > 0 && last_item < now - SYNC_TIMEOUT_SECONDS * 2 {
            self.advance(now);
        } else if last_item == 0 && now - self.stage_started > SYNC_TIMEOUT_SECONDS * 5 {
            if enforcement {
                warn!("sync failed in {:?}, retrying later", self.stage);
                self.fail(now);
            } else {
                self.advance(now);
            }
        }
        self.stage
    }

    /// Notes a node announcement seen during sync; `known` is whether it was already stored.
    pub fn added_list_item(&mut self, hash: Hash, known: bool, now: i64) {
        if note_seen(&mut self.seen_list, hash, known) {
            self.last_list = now;
        }
    }

    pub fn added_winner(&mut self, hash: Hash, known: bool, now: i64) {
        if note_seen(&mut self.seen_winners, hash, known) {
            self.last_winner = now;
        }
    }

    pub fn last_list(&self) -> i64 {
        self.last_list
    }

    pub fn last_winner(&self) -> i64 {
        self.last_winner
    }

    /// Records a peer's item count (`ssc`); ignored once synced or when not in that stage.
    pub fn process_status_count(&mut self, item: SyncItem, count: u32) -> bool {
        if self.is_synced() {
            return false;
        }
        match (item, self.stage) {
            (SyncItem::List, SyncStage::List) => {
                self.list_sum += count;
                self.list_reports += 1;
            }
            (SyncItem::Winners, SyncStage::Winners) => {
                self.winner_sum += count;
                self.winner_reports += 1;
            }
            _ => return false,
        }
        debug!("sync status count {:?} {}", item, count);
        true
    }

    /// Average count reported by peers for `item`.
    pub fn reported_average(&self, item: SyncItem) -> Option<u32> {
        let (sum, reports) = match item {
            SyncItem::List => (self.list_sum, self.list_reports),
            SyncItem::Winners => (self.winner_sum, self.winner_reports),
        };
        sum.checked_div(reports)
    }

    pub fn status(&self) -> &'static str {
        match self.stage {
            SyncStage::Initial => "Synchronization pending...",
            SyncStage::Sporks => "Synchronizing sporks...",
            SyncStage::List => "Synchronizing node list...",
            SyncStage::Winners => "Synchronizing payment winners...",
            SyncStage::Finished => "Synchronization finished",
            SyncStage::Failed => "Synchronization failed",
        }
    }
}

impl fmt::Display for SyncTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status())
    }
}

/// Returns whether the sighting counts as progress.
fn note_seen(seen: &mut HashMap<Hash, u32>, hash: Hash, known: bool) -> bool {
    match seen.get_mut(&hash) {
        Some(count) if known => {
            if *count < SYNC_THRESHOLD {
                *count += 1;
                true
            } else {
                false
            }
        }
        _ => {
            seen.insert(hash, 1);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_advance_in_order() {
        let mut tracker = SyncTracker::new(0);
        let expected = [SyncStage::Sporks, SyncStage::List, SyncStage::Winners, SyncStage::Finished];
        for (step, stage) in expected.iter().enumerate() {
            tracker.advance(step as i64);
            assert_eq!(tracker.stage(), *stage);
        }
        assert!(tracker.is_synced());
        tracker.fail(10);
        assert!(!tracker.is_synced());
        tracker.advance(11);
        assert_eq!(tracker.stage(), SyncStage::Sporks);
        assert_eq!(tracker.failures(), 1);
    }

    #[test]
    fn test_tick_walks_stages_on_a_quiet_network() {
        let mut tracker = SyncTracker::new(0);
        assert_eq!(tracker.tick(0, true, false), SyncStage::Sporks);
        assert_eq!(tracker.tick(SYNC_TIMEOUT_SECONDS * 2, true, false), SyncStage::List);
        assert_eq!(tracker.tick(SYNC_TIMEOUT_SECONDS * 3, true, false), SyncStage::List);
        assert_eq!(tracker.tick(SYNC_TIMEOUT_SECONDS * 8, true, false), SyncStage::Winners);
        assert_eq!(tracker.tick(SYNC_TIMEOUT_SECONDS * 14, true, false), SyncStage::Finished);
    }

    #[test]
    fn test_tick_fails_without_items_under_enforcement() {
        let mut tracker = SyncTracker::new(0);
        tracker.tick(0, true, true);
        tracker.tick(SYNC_TIMEOUT_SECONDS * 2, true, true);
        assert_eq!(tracker.tick(SYNC_TIMEOUT_SECONDS * 8, true, true), SyncStage::Failed);
        let failed_at = SYNC_TIMEOUT_SECONDS * 8;
        assert_eq!(tracker.tick(failed_at + SYNC_RETRY_SECONDS, true, true), SyncStage::Failed);
        assert_eq!(tracker.tick(failed_at + SYNC_RETRY_SECONDS + 1, true, true), SyncStage::Sporks);
        assert_eq!(tracker.failures(), 1);
    }

    #[test]
    fn test_tick_waits_for_items_to_stop() {
        let mut tracker = SyncTracker::new(0);
        tracker.tick(0, true, false);
        tracker.tick(10, true, false);
        tracker.added_list_item([1u8; 32], false, 12);
        assert_eq!(tracker.tick(20, true, false), SyncStage::List);
        assert_eq!(tracker.tick(23, true, false), SyncStage::Winners);
    }

    #[test]
    fn test_repeated_items_stop_counting_after_threshold() {
        let mut tracker = SyncTracker::new(0);
        tracker.added_winner([1u8; 32], false, 5);
        tracker.added_winner([1u8; 32], true, 6);
        assert_eq!(tracker.last_winner(), 6);
        tracker.added_winner([1u8; 32], true, 7);
        assert_eq!(tracker.last_winner(), 6);
    }

    #[test]
    fn test_status_counts_only_for_current_stage() {
        let mut tracker = SyncTracker::new(0);
        tracker.advance(0);
        tracker.advance(0);
        assert!(tracker.process_status_count(SyncItem::List, 10));
        assert!(tracker.process_status_count(SyncItem::List, 20));
        assert!(!tracker.process_status_count(SyncItem::Winners, 5));
        assert_eq!(tracker.reported_average(SyncItem::List), Some(15));
        assert_eq!(tracker.reported_average(SyncItem::Winners), None);
        assert_eq!(tracker.to_string(), "Synchronizing node list...");
    }

    #[test]
    fn test_fulfilled_requests_expire() {
        let mut requests = FulfilledRequests::default();
        let addr: IpAddr = "203.0.113.4".parse().unwrap();
        requests.add_fulfilled(addr, "mnget", 100);
        assert!(requests.has_fulfilled(&addr, "mnget", 100 + FULFILLED_REQUEST_EXPIRE_SECONDS - 1));
        assert!(!requests.has_fulfilled(&addr, "snget", 100));
        requests.check_and_remove(100 + FULFILLED_REQUEST_EXPIRE_SECONDS);
        assert!(requests.is_empty());
    }
}

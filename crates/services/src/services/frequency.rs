//! Per-survey, per-segment display frequency accounting. Records live in the
//! key-value store under `survey_frequency_{surveyId}_{segment}` and carry a
//! rolling 30-day history that is pruned on every read and write.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use utils::clock::Clock;
use utils::storage::{KvStorage, StorageError};

const STORAGE_KEY_PREFIX: &str = "survey_frequency_";
const HISTORY_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy)]
pub struct FrequencyCaps {
    pub cooldown_hours: u64,
    pub max_per_day: usize,
    pub max_per_week: usize,
    pub max_per_month: usize,
}

impl Default for FrequencyCaps {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            max_per_day: 2,
            max_per_week: 1,
            max_per_month: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyRecord {
    /// Display timestamps (ms since epoch), oldest first.
    pub show_history: Vec<u64>,
    pub last_shown: Option<u64>,
}

impl FrequencyRecord {
    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(HISTORY_WINDOW_MS);
        self.show_history.retain(|&at| at >= cutoff);
    }

    fn shows_within(&self, now_ms: u64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.show_history.iter().filter(|&&at| at >= cutoff).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrequencyVerdict {
    Allowed,
    Blocked { reason: String },
}

impl FrequencyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Blocked { reason } => Some(reason),
        }
    }
}

pub struct FrequencyTracker {
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    caps: FrequencyCaps,
    /// Serializes the load-modify-store cycle; the storage trait itself
    /// only guarantees atomic single operations.
    lock: Mutex<()>,
}

impl FrequencyTracker {
    pub fn new(storage: Arc<dyn KvStorage>, clock: Arc<dyn Clock>, caps: FrequencyCaps) -> Self {
        Self {
            storage,
            clock,
            caps,
            lock: Mutex::new(()),
        }
    }

    fn storage_key(survey_id: &str, segment: &str) -> String {
        format!("{STORAGE_KEY_PREFIX}{survey_id}_{segment}")
    }

    fn load(&self, survey_id: &str, segment: &str) -> FrequencyRecord {
        let key = Self::storage_key(survey_id, segment);
        let Some(raw) = self.storage.get(&key) else {
            return FrequencyRecord::default();
        };
        match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %key, error = %err, "discarding unreadable frequency record");
                FrequencyRecord::default()
            }
        }
    }

    fn store(
        &self,
        survey_id: &str,
        segment: &str,
        record: &FrequencyRecord,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(record).map_err(StorageError::Serde)?;
        self.storage
            .set(&Self::storage_key(survey_id, segment), &raw)
    }

    /// Check every cap in order of immediacy: cooldown, then daily, weekly
    /// and monthly windows. The first violated cap names the reason.
    pub fn can_show(&self, survey_id: &str, segment: &str) -> FrequencyVerdict {
        let _guard = self.lock.lock().unwrap();
        let now = self.clock.now_ms();
        let mut record = self.load(survey_id, segment);
        record.prune(now);

        if let Some(last) = record.last_shown {
            let cooldown_ms = self.caps.cooldown_hours * HOUR_MS;
            if now.saturating_sub(last) < cooldown_ms {
                return FrequencyVerdict::Blocked {
                    reason: format!(
                        "shown within the last {}h cooldown window",
                        self.caps.cooldown_hours
                    ),
                };
            }
        }
        if record.shows_within(now, DAY_MS) >= self.caps.max_per_day {
            return FrequencyVerdict::Blocked {
                reason: format!("daily cap of {} reached", self.caps.max_per_day),
            };
        }
        if record.shows_within(now, WEEK_MS) >= self.caps.max_per_week {
            return FrequencyVerdict::Blocked {
                reason: format!("weekly cap of {} reached", self.caps.max_per_week),
            };
        }
        if record.shows_within(now, HISTORY_WINDOW_MS) >= self.caps.max_per_month {
            return FrequencyVerdict::Blocked {
                reason: format!("monthly cap of {} reached", self.caps.max_per_month),
            };
        }
        FrequencyVerdict::Allowed
    }

    /// Append a display to the record. Callers record every display, even
    /// ones forced past the caps, so later checks see the true history.
    pub fn record_display(&self, survey_id: &str, segment: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap();
        let now = self.clock.now_ms();
        let mut record = self.load(survey_id, segment);
        record.prune(now);
        record.show_history.push(now);
        record.last_shown = Some(now);
        self.store(survey_id, segment, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::clock::MockClock;
    use utils::storage::MemoryStorage;

    fn tracker(clock: Arc<MockClock>) -> FrequencyTracker {
        FrequencyTracker::new(
            Arc::new(MemoryStorage::default()),
            clock,
            FrequencyCaps::default(),
        )
    }

    #[test]
    fn fresh_survey_is_allowed() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let tracker = tracker(clock);
        assert!(tracker.can_show("s1", "new_user").is_allowed());
    }

    #[test]
    fn third_display_within_a_day_is_blocked_by_cooldown() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let tracker = tracker(clock.clone());

        tracker.record_display("s1", "active_user").unwrap();
        clock.advance(HOUR_MS);
        tracker.record_display("s1", "active_user").unwrap();
        clock.advance(HOUR_MS);

        let verdict = tracker.can_show("s1", "active_user");
        assert!(!verdict.is_allowed());
        assert!(verdict.reason().unwrap().contains("cooldown"));
    }

    #[test]
    fn weekly_cap_blocks_after_cooldown_expires() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let tracker = tracker(clock.clone());

        tracker.record_display("s1", "power_user").unwrap();
        clock.advance(2 * DAY_MS);

        let verdict = tracker.can_show("s1", "power_user");
        assert!(!verdict.is_allowed());
        assert!(verdict.reason().unwrap().contains("weekly"));
    }

    #[test]
    fn allowed_again_outside_all_windows() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let tracker = tracker(clock.clone());

        tracker.record_display("s1", "new_user").unwrap();
        clock.advance(8 * DAY_MS);
        assert!(tracker.can_show("s1", "new_user").is_allowed());
    }

    #[test]
    fn records_are_isolated_per_survey_and_segment() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let tracker = tracker(clock.clone());

        tracker.record_display("s1", "new_user").unwrap();
        assert!(tracker.can_show("s1", "active_user").is_allowed());
        assert!(tracker.can_show("s2", "new_user").is_allowed());
    }

    #[test]
    fn history_outside_thirty_days_is_pruned() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let storage = Arc::new(MemoryStorage::default());
        let tracker = FrequencyTracker::new(storage.clone(), clock.clone(), FrequencyCaps::default());

        for _ in 0..3 {
            tracker.record_display("s1", "new_user").unwrap();
            clock.advance(10 * DAY_MS);
        }
        // 31 more days pushes everything out of the window.
        clock.advance(31 * DAY_MS);
        tracker.record_display("s1", "new_user").unwrap();

        let raw = storage.get("survey_frequency_s1_new_user").unwrap();
        let record: FrequencyRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.show_history.len(), 1);
    }

    #[test]
    fn concurrent_displays_all_land_in_history() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let storage = Arc::new(MemoryStorage::default());
        let tracker =
            FrequencyTracker::new(storage.clone(), clock, FrequencyCaps::default());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| tracker.record_display("s1", "new_user").unwrap());
            }
        });

        let raw = storage.get("survey_frequency_s1_new_user").unwrap();
        let record: FrequencyRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.show_history.len(), 8);
    }

    #[test]
    fn corrupt_record_resets_instead_of_failing() {
        let clock = Arc::new(MockClock::new(1_000_000));
        let storage = Arc::new(MemoryStorage::default());
        storage
            .set("survey_frequency_s1_new_user", "not json")
            .unwrap();
        let tracker = FrequencyTracker::new(storage, clock, FrequencyCaps::default());
        assert!(tracker.can_show("s1", "new_user").is_allowed());
    }
}

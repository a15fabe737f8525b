//! Per-field validation timing: immediate, debounced or throttled

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// When a value change turns into a validation call
///
/// Serialized as `"immediate"`, `{"debounce": 300}` or `{"throttle": 500}`
/// with delays in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Immediate,
    /// Validate once the field has been quiet for this many milliseconds
    Debounce(u64),
    /// Validate at most once per this many milliseconds
    Throttle(u64),
}

impl Strategy {
    pub fn debounce(delay: Duration) -> Self {
        Strategy::Debounce(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn throttle(window: Duration) -> Self {
        Strategy::Throttle(u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
    }

    /// Delay or window of the strategy, `None` for immediate
    pub fn window(&self) -> Option<Duration> {
        match self {
            Strategy::Immediate => None,
            Strategy::Debounce(ms) | Strategy::Throttle(ms) => Some(Duration::from_millis(*ms)),
        }
    }
}

/// What the scheduler decided for a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Validate right away
    RunNow,
    /// A timer is (still) pending and fires at this instant
    Deferred(Instant),
}

#[derive(Debug, Default)]
struct Slot {
    due: Option<Instant>,
    last_fire: Option<Instant>,
}

/// Pending validation timers, one slot per field
///
/// Holds no callbacks: firing a slot only tells the engine to validate the
/// field's value as it is at that moment, which is what makes debounce use
/// the last value and throttle's trailing call pick up the newest edit.
#[derive(Debug, Default)]
pub struct Scheduler {
    slots: HashMap<String, Slot>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change to `field` under `strategy`
    pub fn schedule(&mut self, field: &str, strategy: Strategy, now: Instant) -> Decision {
        let slot = self.slots.entry(field.to_string()).or_default();
        match strategy {
            Strategy::Immediate => {
                slot.due = None;
                slot.last_fire = Some(now);
                Decision::RunNow
            }
            Strategy::Debounce(ms) => {
                let due = after(now, ms);
                slot.due = Some(due);
                Decision::Deferred(due)
            }
            Strategy::Throttle(ms) => {
                if let Some(due) = slot.due {
                    return Decision::Deferred(due);
                }
                match slot.last_fire {
                    Some(last) if now < after(last, ms) => {
                        let due = after(last, ms);
                        slot.due = Some(due);
                        Decision::Deferred(due)
                    }
                    _ => {
                        slot.last_fire = Some(now);
                        Decision::RunNow
                    }
                }
            }
        }
    }

    /// Drain every field whose timer is due, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot.due {
                Some(at) if at <= now => Some((at, name.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (_, name) in &due {
            if let Some(slot) = self.slots.get_mut(name) {
                slot.due = None;
                slot.last_fire = Some(now);
            }
        }
        due.into_iter().map(|(_, name)| name).collect()
    }

    /// Drop the pending timer of `field`, keeping its throttle history
    pub fn cancel(&mut self, field: &str) -> bool {
        self.slots
            .get_mut(field)
            .and_then(|slot| slot.due.take())
            .is_some()
    }

    /// Forget every timer and every throttle window
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn is_pending(&self, field: &str) -> bool {
        self.slots.get(field).is_some_and(|slot| slot.due.is_some())
    }

    /// Earliest pending deadline over all fields
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().filter_map(|slot| slot.due).min()
    }
}

/// `at` plus `ms` milliseconds, saturating at a far-future instant
fn after(at: Instant, ms: u64) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
    at.checked_add(Duration::from_millis(ms))
        .or_else(|| at.checked_add(FAR_FUTURE))
        .unwrap_or(at)
}

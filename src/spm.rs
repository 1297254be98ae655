//! SPM heartbeat scheduler and SPMR throttling (spec.md §4.5).
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::Tsi;

/// Heartbeat schedule state (spec.md §3 "SPM Schedule").
///
/// The configured `heartbeat_intervals` are the finite sequence `ihb_1..ihb_n`
/// from spec.md §6; the leading ambient marker and trailing sentinel from the
/// data model are implicit here (index `None` *is* ambient mode; running off
/// the end of the vec transitions to it), rather than literal sentinel
/// entries in the stored vector.
struct Schedule {
    heartbeat_intervals: Vec<Duration>,
    ambient_interval: Duration,
    /// `Some(i)` walks the configured heartbeat sequence; `None` means ambient cadence.
    index: Option<usize>,
    next_deadline: Instant,
    spm_sqn: u32,
}

/// Drives SPM cadence: immediate reset after a data burst, then a decaying
/// sequence of heartbeat intervals, falling back to an ambient period.
pub struct SpmSchedule {
    state: Mutex<Schedule>,
}

impl SpmSchedule {
    /// Builds a schedule starting in ambient mode.
    pub fn new(heartbeat_intervals: Vec<Duration>, ambient_interval: Duration) -> Self {
        Self {
            state: Mutex::new(Schedule {
                heartbeat_intervals,
                ambient_interval,
                index: None,
                next_deadline: Instant::now() + ambient_interval,
                spm_sqn: 0,
            }),
        }
    }

    /// Resets the schedule to index 1 after an original data emission,
    /// returning the new deadline and whether it precedes the deadline that
    /// was scheduled before this call. A caller on an application thread
    /// should prod the sleeping timer thread when the latter is `true`,
    /// since the timer thread's sleep was computed from the stale deadline.
    pub fn reset_after_burst(&self, now: Instant) -> (Instant, bool) {
        let mut s = self.state.lock().unwrap();
        let previous = s.next_deadline;
        s.index = if s.heartbeat_intervals.is_empty() { None } else { Some(0) };
        let interval = s.index.map(|i| s.heartbeat_intervals[i]).unwrap_or(s.ambient_interval);
        s.next_deadline = now + interval;
        (s.next_deadline, s.next_deadline < previous)
    }

    /// The currently scheduled deadline.
    pub fn current_deadline(&self) -> Instant {
        self.state.lock().unwrap().next_deadline
    }

    /// Called by the timer thread when `current_deadline()` has passed.
    /// Advances to the next step of the schedule (or to ambient cadence
    /// after the sentinel) and returns the new deadline.
    pub fn on_deadline_fired(&self, now: Instant) -> Instant {
        let mut s = self.state.lock().unwrap();
        let interval = match s.index {
            Some(i) if i + 1 < s.heartbeat_intervals.len() => {
                s.index = Some(i + 1);
                s.heartbeat_intervals[i + 1]
            }
            Some(_) => {
                s.index = None;
                s.ambient_interval
            }
            None => s.ambient_interval,
        };
        s.next_deadline = now + interval;
        s.next_deadline
    }

    /// Allocates the next monotonically increasing SPM sequence number.
    pub fn next_spm_sqn(&self) -> u32 {
        let mut s = self.state.lock().unwrap();
        let sqn = s.spm_sqn;
        s.spm_sqn = s.spm_sqn.wrapping_add(1);
        sqn
    }
}

/// Per-TSI SPMR response throttle: at most one SPM sent in response to a
/// peer's SPMR per `IHB_MIN` interval (spec.md §4.5).
pub struct SpmrThrottle {
    ihb_min: Duration,
    last_response: Mutex<HashMap<Tsi, Instant>>,
}

impl SpmrThrottle {
    /// Builds a throttle gating responses to at most one per `ihb_min`.
    pub fn new(ihb_min: Duration) -> Self {
        Self {
            ihb_min,
            last_response: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if an SPM should be sent now in response to an SPMR
    /// from `peer`, recording the response time if so.
    pub fn allow(&self, peer: Tsi, now: Instant) -> bool {
        let mut last = self.last_response.lock().unwrap();
        match last.get(&peer) {
            Some(prev) if now.duration_since(*prev) < self.ihb_min => false,
            _ => {
                last.insert(peer, now);
                true
            }
        }
    }
}

//! Forecast-bundle completeness tracking
//!
//! Lead arrivals are grouped by generation time. Each generation moves
//! through `Collecting -> Fired` or `Collecting -> Expired`; both end states
//! remove the bundle.
//!
//! A generation fires when its seen leads cover the expected set, or, when a
//! quiet period is configured, once no new lead has arrived for that long.
//! At most `max_pending` generations collect at once: a new generation beyond
//! the cap first expires the collecting one with the earliest generation
//! time, which then never fires. At the cap, a first arrival for a generation
//! older than every collecting one is dropped instead.
//! Firing a generation also expires every older collecting generation, so
//! fired generation times are strictly increasing.

use crate::types::Candidate;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Retired generation times remembered to ignore late arrivals.
const RETIRED_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Collecting,
    Fired,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PendingBundle {
    pub gen_time: DateTime<Utc>,
    pub expected_leads: BTreeSet<i32>,
    pub seen_leads: BTreeMap<i32, PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_arrival_at: DateTime<Utc>,
    pub state: BundleState,
}

impl PendingBundle {
    pub fn is_complete(&self) -> bool {
        self.expected_leads
            .iter()
            .all(|lead| self.seen_leads.contains_key(lead))
    }

    pub fn missing_leads(&self) -> Vec<i32> {
        self.expected_leads
            .iter()
            .filter(|lead| !self.seen_leads.contains_key(lead))
            .copied()
            .collect()
    }
}

/// A generation that has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredBundle {
    pub gen_time: DateTime<Utc>,
    pub leads: BTreeMap<i32, PathBuf>,
    /// Path of the arrival that completed the bundle
    pub completed_by: PathBuf,
    /// False when fired by the quiet period with leads missing
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleStats {
    pub created: u64,
    pub fired: u64,
    pub expired: u64,
}

pub struct BundleTracker {
    expected: BTreeSet<i32>,
    max_pending: usize,
    quiet_period: Option<Duration>,
    pending: BTreeMap<DateTime<Utc>, PendingBundle>,
    ready: VecDeque<FiredBundle>,
    retired: VecDeque<DateTime<Utc>>,
    expired: Vec<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
    stats: BundleStats,
}

impl BundleTracker {
    pub fn new(expected: BTreeSet<i32>, max_pending: usize) -> Self {
        Self {
            expected,
            max_pending: max_pending.max(1),
            quiet_period: None,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            retired: VecDeque::new(),
            expired: Vec::new(),
            last_fired: None,
            stats: BundleStats::default(),
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Option<Duration>) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn expected_leads(&self) -> &BTreeSet<i32> {
        &self.expected
    }

    pub fn pending(&self, gen_time: DateTime<Utc>) -> Option<&PendingBundle> {
        self.pending.get(&gen_time)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> BundleStats {
        self.stats
    }

    /// Generation times expired without firing, oldest first.
    pub fn expired_generations(&self) -> &[DateTime<Utc>] {
        &self.expired
    }

    pub fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.last_fired
    }

    /// Treat `gen_time` and everything before it as already fired.
    pub fn resume_after(&mut self, gen_time: DateTime<Utc>) {
        self.last_fired = Some(self.last_fired.map_or(gen_time, |last| last.max(gen_time)));
    }

    /// Earliest generation whose arrivals still matter for deduplication:
    /// the oldest collecting generation or the newest retired one.
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        let oldest_pending = self.pending.keys().next().copied();
        let newest_retired = self.retired.iter().max().copied();
        match (oldest_pending, newest_retired) {
            (Some(p), Some(r)) => Some(p.min(r)),
            (p, r) => p.or(r),
        }
    }

    /// Feed one lead arrival.
    pub fn on_arrival(&mut self, candidate: &Candidate, now: DateTime<Utc>) {
        let Some(lead) = candidate.lead_secs else {
            warn!(path = %candidate.path.display(), "Bundle tracker ignoring arrival without lead time");
            return;
        };
        let gen_time = candidate.time;

        if self.last_fired.map_or(false, |last| gen_time <= last) || self.retired.contains(&gen_time)
        {
            debug!(gen_time = %gen_time, lead, "Arrival for retired generation ignored");
            return;
        }
        if !self.expected.contains(&lead) {
            debug!(gen_time = %gen_time, lead, "Lead not in expected set, ignored");
            return;
        }

        if !self.pending.contains_key(&gen_time) {
            if self.pending.len() >= self.max_pending {
                if self.pending.keys().next().map_or(false, |oldest| gen_time < *oldest) {
                    debug!(gen_time = %gen_time, lead, "Pending cap reached, older generation dropped");
                    return;
                }
                self.evict_oldest();
            }
            self.pending.insert(
                gen_time,
                PendingBundle {
                    gen_time,
                    expected_leads: self.expected.clone(),
                    seen_leads: BTreeMap::new(),
                    created_at: now,
                    last_arrival_at: now,
                    state: BundleState::Collecting,
                },
            );
            self.stats.created += 1;
            debug!(gen_time = %gen_time, "Collecting new generation");
        }

        let complete = match self.pending.get_mut(&gen_time) {
            Some(bundle) => {
                bundle.seen_leads.insert(lead, candidate.path.clone());
                bundle.last_arrival_at = now;
                bundle.is_complete()
            }
            None => false,
        };

        if complete {
            self.fire(gen_time, candidate.path.clone());
        }
    }

    /// Fire generations that have been quiet for the configured period.
    pub fn check_quiet(&mut self, now: DateTime<Utc>) {
        let Some(quiet) = self.quiet_period else {
            return;
        };
        let due: Vec<DateTime<Utc>> = self
            .pending
            .values()
            .filter(|b| now - b.last_arrival_at >= quiet)
            .map(|b| b.gen_time)
            .collect();
        for gen_time in due {
            // An earlier fire in this loop may have expired it
            let last_path = match self.pending.get(&gen_time) {
                Some(bundle) => bundle.seen_leads.values().last().cloned(),
                None => continue,
            };
            if let Some(path) = last_path {
                self.fire(gen_time, path);
            }
        }
    }

    pub fn pop_ready(&mut self) -> Option<FiredBundle> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn fire(&mut self, gen_time: DateTime<Utc>, completed_by: PathBuf) {
        let Some(mut bundle) = self.pending.remove(&gen_time) else {
            return;
        };
        bundle.state = BundleState::Fired;
        let complete = bundle.is_complete();
        if complete {
            info!(gen_time = %gen_time, leads = bundle.seen_leads.len(), "Bundle complete");
        } else {
            info!(
                gen_time = %gen_time,
                missing = ?bundle.missing_leads(),
                "Bundle fired after quiet period"
            );
        }

        self.last_fired = Some(gen_time);
        self.retire(gen_time);
        self.stats.fired += 1;

        let older: Vec<DateTime<Utc>> = self.pending.range(..gen_time).map(|(g, _)| *g).collect();
        for old in older {
            self.expire(old, "superseded by a newer fired generation");
        }

        self.ready.push_back(FiredBundle {
            gen_time,
            leads: bundle.seen_leads,
            completed_by,
            complete,
        });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .values()
            .find(|b| b.state == BundleState::Collecting)
            .map(|b| b.gen_time);
        if let Some(gen_time) = oldest {
            self.expire(gen_time, "pending bundle cap reached");
        }
    }

    fn expire(&mut self, gen_time: DateTime<Utc>, reason: &str) {
        if let Some(mut bundle) = self.pending.remove(&gen_time) {
            bundle.state = BundleState::Expired;
            warn!(
                gen_time = %gen_time,
                missing = ?bundle.missing_leads(),
                "Bundle expired without firing: {}", reason
            );
            self.retire(gen_time);
            self.expired.push(gen_time);
            self.stats.expired += 1;
        }
    }

    fn retire(&mut self, gen_time: DateTime<Utc>) {
        self.retired.push_back(gen_time);
        while self.retired.len() > RETIRED_MEMORY {
            self.retired.pop_front();
        }
    }
}

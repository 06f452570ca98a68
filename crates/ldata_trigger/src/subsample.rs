//! Cadence and lead filtering of candidates
//!
//! Applied after the watcher (and bundle tracker) but before a candidate is
//! surfaced. Rejected candidates are still consumed: the watcher's position
//! has already moved past them.

use crate::config::SubsampleConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct SubsampleFilter {
    cadence: SubsampleConfig,
    accepted_leads: Option<BTreeSet<i32>>,
    last_accepted: Option<DateTime<Utc>>,
}

impl Default for SubsampleFilter {
    fn default() -> Self {
        Self::pass_all()
    }
}

impl SubsampleFilter {
    pub fn new(cadence: SubsampleConfig, accepted_leads: Option<BTreeSet<i32>>) -> Self {
        Self {
            cadence,
            accepted_leads,
            last_accepted: None,
        }
    }

    pub fn pass_all() -> Self {
        Self::new(SubsampleConfig::All, None)
    }

    /// Whether the candidate would be accepted now. Does not change state.
    pub fn admits(&self, time: DateTime<Utc>, lead_secs: Option<i32>) -> bool {
        if let (Some(accepted), Some(lead)) = (&self.accepted_leads, lead_secs) {
            if !accepted.contains(&lead) {
                return false;
            }
        }
        match &self.cadence {
            SubsampleConfig::All => true,
            SubsampleConfig::Grid {
                interval_secs,
                offset_secs,
            } => {
                let interval = (*interval_secs).max(1) as i64;
                (time.timestamp() - *offset_secs as i64).rem_euclid(interval) == 0
            }
            SubsampleConfig::MinSpacing { secs } => match self.last_accepted {
                Some(last) => (time - last).num_seconds() >= *secs as i64,
                None => true,
            },
        }
    }

    /// Record a surfaced candidate (spacing is measured from it).
    pub fn commit(&mut self, time: DateTime<Utc>) {
        self.last_accepted = Some(time);
    }

    /// `admits` followed by `commit` on success.
    pub fn accept(&mut self, time: DateTime<Utc>, lead_secs: Option<i32>) -> bool {
        if self.admits(time, lead_secs) {
            self.commit(time);
            true
        } else {
            false
        }
    }

    /// Forget the spacing history; used on archive rewind.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

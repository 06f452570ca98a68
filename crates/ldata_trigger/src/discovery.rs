//! Forecast-directory discovery strategies
//!
//! A [`ForecastTree`] lists lead files of chosen generation directories. Which
//! generations it lists is delegated to a [`DiscoveryStrategy`]:
//!
//! - [`Reactive`] asks the tree for the newest generation present and accepts
//!   it. Robust to irregular schedules.
//! - [`Proactive`] predicts the next generation from the production interval
//!   and polls that directory directly. Lower latency, but relies on the
//!   configured schedule being right.

use crate::config::DiscoveryConfig;
use crate::error::SourceError;
use crate::naming;
use crate::pointer::{list_entries, LatestPointerSource};
use crate::types::Candidate;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How far ahead of the expected generation a proactive watcher looks for a
/// newer run, in generation intervals.
const MAX_PROACTIVE_SKIP: i64 = 48;

pub trait DiscoveryStrategy: Send {
    fn name(&self) -> &'static str;

    /// Generation times whose directories should be listed on this poll.
    fn select(&mut self, location: &Path, now: DateTime<Utc>) -> io::Result<Vec<DateTime<Utc>>>;
}

fn gen_dir_path(location: &Path, gen_time: DateTime<Utc>) -> PathBuf {
    location
        .join(naming::day_dir_name(gen_time))
        .join(naming::gen_dir_name(gen_time))
}

/// Newest generation directory in the tree, if any.
pub fn newest_generation(location: &Path) -> io::Result<Option<DateTime<Utc>>> {
    let mut days: Vec<_> = list_entries(location)?
        .into_iter()
        .filter_map(|(name, path)| Some((naming::parse_day_dir(&name)?, path)))
        .collect();
    days.sort();

    for (day, path) in days.into_iter().rev() {
        let entries = match list_entries(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let newest = entries
            .iter()
            .filter(|(_, p)| p.is_dir())
            .filter_map(|(name, _)| naming::parse_gen_dir(name))
            .max();
        if let Some(gen) = newest {
            return Ok(Some(Utc.from_utc_datetime(&NaiveDateTime::new(day, gen))));
        }
    }
    Ok(None)
}

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Default)]
pub struct Reactive;

impl DiscoveryStrategy for Reactive {
    fn name(&self) -> &'static str {
        "reactive"
    }

    fn select(&mut self, location: &Path, _now: DateTime<Utc>) -> io::Result<Vec<DateTime<Utc>>> {
        Ok(newest_generation(location)?.into_iter().collect())
    }
}

#[derive(Debug)]
pub struct Proactive {
    interval: Duration,
    offset: Duration,
    expected: Option<DateTime<Utc>>,
}

impl Proactive {
    pub fn new(gen_interval_secs: u64, gen_offset_secs: u64) -> Self {
        Self {
            interval: Duration::seconds(gen_interval_secs.max(1) as i64),
            offset: Duration::seconds(gen_offset_secs as i64),
            expected: None,
        }
    }

    /// Latest scheduled generation at or before `now`.
    pub fn scheduled_at_or_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval.num_seconds();
        let shifted = now.timestamp() - self.offset.num_seconds();
        let floor = shifted.div_euclid(interval) * interval + self.offset.num_seconds();
        Utc.timestamp_opt(floor, 0).single().unwrap_or(now)
    }

    pub fn expected(&self) -> Option<DateTime<Utc>> {
        self.expected
    }
}

impl DiscoveryStrategy for Proactive {
    fn name(&self) -> &'static str {
        "proactive"
    }

    fn select(&mut self, location: &Path, now: DateTime<Utc>) -> io::Result<Vec<DateTime<Utc>>> {
        let current = match self.expected {
            Some(expected) => expected,
            None => {
                let first = self.scheduled_at_or_before(now);
                self.expected = Some(first);
                first
            }
        };

        // Move on once a later scheduled run has shown up; skipped runs are
        // stepped over.
        let mut newest_present = None;
        for step in 1..=MAX_PROACTIVE_SKIP {
            let gen = current + self.interval * step as i32;
            if gen > now {
                break;
            }
            if gen_dir_path(location, gen).is_dir() {
                newest_present = Some(gen);
            }
        }

        // Outage longer than the lookahead: pick up whatever the producer
        // wrote last, if it is newer.
        if newest_present.is_none() && current + self.interval * (MAX_PROACTIVE_SKIP as i32) < now {
            newest_present = newest_generation(location)?.filter(|gen| *gen > current);
        }

        match newest_present {
            Some(next) => {
                debug!(from = %current, to = %next, "Proactive discovery advancing");
                self.expected = Some(next);
                // Last look at the old run for late leads
                Ok(vec![current, next])
            }
            None => Ok(vec![current]),
        }
    }
}

// ============================================================================
// Forecast tree source
// ============================================================================

/// Implicit latest-data source over `yyyymmdd/g_hhmmss/f_llllllll` trees.
pub struct ForecastTree {
    location: PathBuf,
    search_ext: Option<String>,
    strategy: Box<dyn DiscoveryStrategy>,
    label: String,
}

impl ForecastTree {
    pub fn new(
        location: PathBuf,
        search_ext: Option<String>,
        strategy: Box<dyn DiscoveryStrategy>,
    ) -> Self {
        let label = format!("ForecastTree({})", strategy.name());
        Self {
            location,
            search_ext,
            strategy,
            label,
        }
    }

    pub fn from_config(
        location: PathBuf,
        search_ext: Option<String>,
        discovery: &DiscoveryConfig,
    ) -> Self {
        let strategy: Box<dyn DiscoveryStrategy> = match discovery {
            DiscoveryConfig::Proactive {
                gen_interval_secs,
                gen_offset_secs,
            } => Box::new(Proactive::new(*gen_interval_secs, *gen_offset_secs)),
            DiscoveryConfig::Reactive { .. } => Box::new(Reactive),
        };
        Self::new(location, search_ext, strategy)
    }

    fn list_generation(&self, gen_time: DateTime<Utc>, out: &mut Vec<Candidate>) -> io::Result<()> {
        let dir = gen_dir_path(&self.location, gen_time);
        let entries = match list_entries(&dir) {
            Ok(entries) => entries,
            // Expected generation not written yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for (name, path) in entries {
            if !path.is_file() || !naming::has_ext(&path, self.search_ext.as_deref()) {
                continue;
            }
            if let Some(lead) = naming::parse_lead_file(&name) {
                out.push(Candidate::forecast(gen_time, lead, path));
            }
        }
        Ok(())
    }
}

impl LatestPointerSource for ForecastTree {
    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Candidate>, SourceError> {
        if !self.location.is_dir() {
            return Err(SourceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", self.location.display()),
            )));
        }
        let gens = self.strategy.select(&self.location, now)?;
        let mut found = Vec::new();
        for gen in gens {
            self.list_generation(gen, &mut found)?;
        }
        found.sort_by(|a, b| a.key().cmp(&b.key()).then_with(|| a.path.cmp(&b.path)));
        found.dedup_by_key(|c| c.key());
        Ok(found)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

//! Trigger engine
//!
//! The public scheduler. One engine watches one location; it owns either a
//! realtime watcher (plus a bundle tracker in forecast-bundle mode) or an
//! archive cursor, and turns candidates into [`TriggerEvent`]s.
//!
//! # Latest-only mode
//!
//! With `latest_only` set, each call drains every candidate currently
//! available and returns only the newest one that passes the subsample and
//! lead filters. The older ones are dropped without notice. This trades
//! completeness for freshness for consumers that fall behind; it never
//! reports an error for what it drops. Realtime sessions only: an archive
//! replay always hands out every instant.
//!
//! # Read state
//!
//! With `save_read_state` set, the last trigger handed out is saved to a
//! [`ReadStateFile`] and restored by the next session with the same label
//! and location. Bundle sessions save the fired generation time.

use crate::bundle::{BundleStats, BundleTracker, FiredBundle};
use crate::clock::{Clock, SystemClock};
use crate::config::{DiscoveryConfig, TriggerConfig};
use crate::error::{Result, TriggerError};
use crate::indexer::ArchiveIndexer;
use crate::pointer::{build_source, LatestPointerSource, ReadStateFile};
use crate::subsample::SubsampleFilter;
use crate::types::{ArrivalKey, Candidate, OperatingMode, TriggerEvent, TriggerMode};
use crate::watcher::{CancelToken, DedupPolicy, Watcher};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Liveness callback invoked once per empty blocking poll, before the sleep.
pub type Heartbeat = Box<dyn FnMut(&str) + Send>;

/// Per-mode state, fixed at construction.
enum ModeState {
    Observation,
    ForecastLead,
    /// Realtime sessions track completeness; archive sessions group the
    /// precomputed list by generation instead.
    ForecastBundle(Option<BundleTracker>),
}

pub struct TriggerEngine {
    config: TriggerConfig,
    watcher: Watcher,
    mode: ModeState,
    filter: SubsampleFilter,
    latest_only: bool,
    nowait: bool,
    heartbeat: Option<Heartbeat>,
    last_event: Option<TriggerEvent>,
}

impl TriggerEngine {
    /// Create an engine on the system clock.
    pub fn new(config: TriggerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TriggerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, None, clock)
    }

    /// Realtime engine reading a caller-supplied latest-data source.
    pub fn with_source(
        config: TriggerConfig,
        source: Box<dyn LatestPointerSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.operating_mode == OperatingMode::Archive {
            return Err(TriggerError::Config(
                "a custom latest-data source requires realtime mode".into(),
            ));
        }
        Self::build(config, Some(source), clock)
    }

    fn build(
        config: TriggerConfig,
        source: Option<Box<dyn LatestPointerSource>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let location = Path::new(&config.location);
        if !location.is_dir() {
            return Err(TriggerError::LocationNotFound(config.location.clone()));
        }

        let mut watcher = match config.archive_interval() {
            Some((start, end)) => {
                let cursor = ArchiveIndexer::new(location, config.trigger_mode)
                    .with_search_ext(config.search_ext.clone())
                    .index(start, end)?;
                Watcher::archive(cursor, clock)
            }
            None => {
                let source = source.unwrap_or_else(|| build_source(&config));
                let dedup = match config.trigger_mode {
                    TriggerMode::ForecastBundle => DedupPolicy::SeenSet,
                    _ => DedupPolicy::HighWater,
                };
                let mut watcher = Watcher::realtime(
                    location,
                    source,
                    std::time::Duration::from_millis(config.poll_delay_ms),
                    dedup,
                    clock,
                );
                if let Some(age) = config.max_valid_age_secs {
                    watcher.set_max_valid_age(age)?;
                }
                watcher
            }
        };
        watcher.set_debug(config.debug);

        let restored = match &config.save_read_state {
            Some(label) => {
                let dir = config
                    .read_state_dir
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir);
                watcher.attach_read_state(ReadStateFile::new(dir, label, &config.location))?
            }
            None => None,
        };

        let mode = match config.trigger_mode {
            TriggerMode::Observation => ModeState::Observation,
            TriggerMode::ForecastLead => ModeState::ForecastLead,
            TriggerMode::ForecastBundle if watcher.is_archive() => ModeState::ForecastBundle(None),
            TriggerMode::ForecastBundle => {
                let expected = config
                    .expected_leads
                    .as_ref()
                    .map(|leads| leads.resolve())
                    .unwrap_or_default();
                let quiet = match config.discovery {
                    DiscoveryConfig::Reactive {
                        quiet_period_secs: Some(secs),
                    } => Some(Duration::seconds(secs as i64)),
                    _ => None,
                };
                let mut tracker =
                    BundleTracker::new(expected, config.max_pending_bundles).with_quiet_period(quiet);
                if let Some(key) = restored {
                    tracker.resume_after(key.time);
                }
                ModeState::ForecastBundle(Some(tracker))
            }
        };

        let filter = SubsampleFilter::new(config.subsample.clone(), config.accepted_leads.clone());

        info!(
            location = %config.location,
            trigger_mode = %config.trigger_mode,
            operating_mode = %config.operating_mode,
            "Trigger session started"
        );

        Ok(Self {
            latest_only: config.latest_only,
            config,
            watcher,
            mode,
            filter,
            nowait: false,
            heartbeat: None,
            last_event: None,
        })
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn set_heartbeat<F>(&mut self, heartbeat: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.heartbeat = Some(Box::new(heartbeat));
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.watcher.set_cancel_token(token);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.watcher.cancel_token().clone()
    }

    /// Never block: an empty poll returns "no data" immediately.
    pub fn set_nowait(&mut self) -> Result<()> {
        if self.config.trigger_mode == TriggerMode::ForecastBundle {
            return Err(TriggerError::not_applicable(
                "set_nowait",
                "forecast_bundle mode waits for bundle completeness",
            ));
        }
        if self.watcher.is_archive() {
            return Err(TriggerError::not_applicable(
                "set_nowait",
                "archive mode never blocks",
            ));
        }
        self.nowait = true;
        Ok(())
    }

    pub fn set_max_valid_age(&mut self, seconds: u64) -> Result<()> {
        self.watcher.set_max_valid_age(seconds)
    }

    pub fn set_latest_only(&mut self, latest_only: bool) -> Result<()> {
        if latest_only && self.config.trigger_mode == TriggerMode::ForecastBundle {
            return Err(TriggerError::not_applicable(
                "set_latest_only",
                "forecast_bundle mode emits every complete generation",
            ));
        }
        if latest_only && self.watcher.is_archive() {
            return Err(TriggerError::not_applicable(
                "set_latest_only",
                "archive mode replays every instant",
            ));
        }
        self.latest_only = latest_only;
        Ok(())
    }

    /// Restart an archive session from its first instant.
    pub fn rewind(&mut self) -> Result<()> {
        self.watcher.rewind()?;
        self.filter.reset();
        self.last_event = None;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Triggering
    // ------------------------------------------------------------------------

    /// Next trigger, or `None` when no more data will come from this call:
    /// archive exhausted, nowait poll empty, or session cancelled.
    pub fn next_event(&mut self) -> Option<TriggerEvent> {
        let event = match self.mode {
            ModeState::ForecastBundle(Some(_)) => self.next_bundle_realtime(),
            ModeState::ForecastBundle(None) => self.next_bundle_archive(),
            ModeState::Observation | ModeState::ForecastLead if self.latest_only => {
                self.next_latest()
            }
            ModeState::Observation | ModeState::ForecastLead => self.next_single(),
        }?;
        if self.config.debug {
            info!(
                instant = %event.instant_time(),
                lead = ?event.lead_time_seconds(),
                path = %event.source_location(),
                "Trigger"
            );
        }
        self.last_event = Some(event.clone());
        Some(event)
    }

    /// Instant time of the next trigger.
    pub fn next_time(&mut self) -> Option<DateTime<Utc>> {
        self.next_event().map(|e| e.instant_time())
    }

    /// Generation and lead of the next trigger; forecast_lead mode only.
    pub fn next_lead_time(&mut self) -> Result<Option<(DateTime<Utc>, i32)>> {
        if self.config.trigger_mode != TriggerMode::ForecastLead {
            return Err(TriggerError::not_applicable(
                "next_lead_time",
                format!("trigger mode is {}", self.config.trigger_mode),
            ));
        }
        Ok(self
            .next_event()
            .and_then(|e| Some((e.instant_time(), e.lead_time_seconds()?))))
    }

    /// Instant time and resolved location of the next trigger.
    pub fn next_data(&mut self) -> Option<(DateTime<Utc>, String)> {
        self.next_event()
            .map(|e| (e.instant_time(), e.source_location().to_string()))
    }

    fn blocking(&self) -> bool {
        !self.nowait && !self.watcher.is_archive()
    }

    fn next_single(&mut self) -> Option<TriggerEvent> {
        let blocking = self.blocking();
        let Self {
            watcher,
            filter,
            heartbeat,
            ..
        } = self;
        let mut beat = |label: &str| {
            if let Some(hb) = heartbeat.as_mut() {
                hb(label);
            }
        };

        loop {
            let candidate = if blocking {
                watcher.next_blocking(&mut beat).ok().flatten()
            } else {
                watcher.poll_once()
            }?;
            if filter.accept(candidate.time, candidate.lead_secs) {
                return Some(TriggerEvent::from_candidate(&candidate));
            }
            debug!(key = %candidate.key(), "Candidate rejected by subsample filter");
        }
    }

    fn next_latest(&mut self) -> Option<TriggerEvent> {
        let blocking = self.blocking();
        let Self {
            watcher,
            filter,
            heartbeat,
            ..
        } = self;
        let mut beat = |label: &str| {
            if let Some(hb) = heartbeat.as_mut() {
                hb(label);
            }
        };

        loop {
            let mut newest: Option<Candidate> = None;
            while let Some(candidate) = watcher.poll_once() {
                if !filter.admits(candidate.time, candidate.lead_secs) {
                    continue;
                }
                if let Some(dropped) = newest.replace(candidate) {
                    debug!(key = %dropped.key(), "Latest-only dropping older candidate");
                }
            }
            if let Some(candidate) = newest {
                filter.commit(candidate.time);
                return Some(TriggerEvent::from_candidate(&candidate));
            }
            if !blocking || !watcher.wait_cycle(&mut beat) {
                return None;
            }
        }
    }

    fn next_bundle_realtime(&mut self) -> Option<TriggerEvent> {
        let Self {
            watcher,
            mode,
            filter,
            heartbeat,
            ..
        } = self;
        let ModeState::ForecastBundle(Some(tracker)) = mode else {
            return None;
        };
        let mut beat = |label: &str| {
            if let Some(hb) = heartbeat.as_mut() {
                hb(label);
            }
        };

        loop {
            if let Some(fired) = tracker.pop_ready() {
                watcher.forget_before(fired.gen_time);
                watcher.mark_read(
                    ArrivalKey {
                        time: fired.gen_time,
                        lead_secs: None,
                    },
                    &fired.completed_by,
                );
                if filter.accept(fired.gen_time, None) {
                    return Some(bundle_event(fired));
                }
                debug!(gen_time = %fired.gen_time, "Bundle rejected by subsample filter");
                continue;
            }

            if let Some(candidate) = watcher.poll_once() {
                let expired = tracker.stats().expired;
                tracker.on_arrival(&candidate, watcher.now());
                // Keys of runs that expired unfired are no longer needed
                if tracker.stats().expired != expired {
                    if let Some(horizon) = tracker.horizon() {
                        watcher.forget_before(horizon);
                    }
                }
                continue;
            }

            tracker.check_quiet(watcher.now());
            if tracker.has_ready() {
                continue;
            }
            if !watcher.wait_cycle(&mut beat) {
                return None;
            }
        }
    }

    fn next_bundle_archive(&mut self) -> Option<TriggerEvent> {
        let expected = self.config.expected_leads.as_ref().map(|l| l.resolve());
        loop {
            let group = self.watcher.next_archive_group()?;
            let last = group.last()?.clone();
            if !self.filter.accept(last.time, None) {
                continue;
            }
            let leads: std::collections::BTreeMap<i32, std::path::PathBuf> = group
                .into_iter()
                .filter_map(|c| Some((c.lead_secs?, c.path)))
                .collect();
            let missing: Vec<i32> = expected
                .iter()
                .flatten()
                .filter(|l| !leads.contains_key(l))
                .copied()
                .collect();
            if !missing.is_empty() {
                debug!(gen_time = %last.time, missing = ?missing, "Archive generation incomplete");
            }
            return Some(bundle_event(FiredBundle {
                gen_time: last.time,
                leads,
                completed_by: last.path,
                complete: missing.is_empty(),
            }));
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.config.trigger_mode
    }

    pub fn operating_mode(&self) -> OperatingMode {
        self.config.operating_mode
    }

    pub fn location(&self) -> &str {
        &self.config.location
    }

    pub fn last_event(&self) -> Option<&TriggerEvent> {
        self.last_event.as_ref()
    }

    pub fn is_latest_only(&self) -> bool {
        self.latest_only
    }

    pub fn is_nowait(&self) -> bool {
        self.nowait
    }

    /// True once an archive session has handed out its last instant.
    pub fn is_exhausted(&self) -> bool {
        self.watcher.is_exhausted()
    }

    pub fn bundle_stats(&self) -> Option<BundleStats> {
        match &self.mode {
            ModeState::ForecastBundle(Some(tracker)) => Some(tracker.stats()),
            _ => None,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.watcher.now()
    }
}

fn bundle_event(fired: FiredBundle) -> TriggerEvent {
    let paths = fired
        .leads
        .into_iter()
        .map(|(lead, path)| (lead, path.to_string_lossy().to_string()))
        .collect();
    TriggerEvent::bundle(
        fired.gen_time,
        fired.completed_by.to_string_lossy().to_string(),
        paths,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ExpectedLeads;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, 12, 0, 0).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(t0()))
    }

    #[test]
    fn test_missing_location_fails_construction() {
        let dir = TempDir::new().unwrap();
        let config = TriggerConfig::new(
            dir.path().join("absent").to_string_lossy(),
            TriggerMode::Observation,
            OperatingMode::Realtime,
        );
        let err = TriggerEngine::with_clock(config, clock()).err().unwrap();
        assert!(matches!(err, TriggerError::LocationNotFound(_)));
        assert!(err.is_construction());
    }

    #[test]
    fn test_archive_without_interval_fails_construction() {
        let dir = TempDir::new().unwrap();
        let config = TriggerConfig::new(
            dir.path().to_string_lossy(),
            TriggerMode::Observation,
            OperatingMode::Archive,
        );
        assert!(TriggerEngine::with_clock(config, clock()).is_err());
    }

    #[test]
    fn test_set_nowait_rules() {
        let dir = TempDir::new().unwrap();
        let loc = dir.path().to_string_lossy().to_string();

        let mut bundle = TriggerConfig::new(&loc, TriggerMode::ForecastBundle, OperatingMode::Realtime);
        bundle.expected_leads = Some(ExpectedLeads::Exact([0].into_iter().collect()));
        let mut engine = TriggerEngine::with_clock(bundle, clock()).unwrap();
        assert!(engine.set_nowait().is_err());
        assert!(!engine.is_nowait());

        let archive = TriggerConfig::archive(&loc, TriggerMode::Observation, t0(), t0());
        let mut engine = TriggerEngine::with_clock(archive, clock()).unwrap();
        assert!(engine.set_nowait().is_err());
        assert!(engine.set_max_valid_age(60).is_err());

        let realtime = TriggerConfig::new(&loc, TriggerMode::Observation, OperatingMode::Realtime);
        let mut engine = TriggerEngine::with_clock(realtime, clock()).unwrap();
        engine.set_nowait().unwrap();
        assert!(engine.rewind().is_err());
        // Nothing published yet: returns at once
        assert!(engine.next_time().is_none());
    }

    #[test]
    fn test_next_lead_time_requires_lead_mode() {
        let dir = TempDir::new().unwrap();
        let config = TriggerConfig::new(
            dir.path().to_string_lossy(),
            TriggerMode::Observation,
            OperatingMode::Realtime,
        );
        let mut engine = TriggerEngine::with_clock(config, clock()).unwrap();
        assert!(matches!(
            engine.next_lead_time(),
            Err(TriggerError::NotApplicable { .. })
        ));
    }

    #[test]
    fn test_latest_only_rejected_in_archive() {
        let dir = TempDir::new().unwrap();
        let loc = dir.path().to_string_lossy().to_string();

        let mut config = TriggerConfig::archive(&loc, TriggerMode::Observation, t0(), t0());
        config.latest_only = true;
        let err = TriggerEngine::with_clock(config, clock()).err().unwrap();
        assert!(err.is_construction());

        let config = TriggerConfig::archive(&loc, TriggerMode::ForecastLead, t0(), t0());
        let mut engine = TriggerEngine::with_clock(config, clock()).unwrap();
        assert!(matches!(
            engine.set_latest_only(true),
            Err(TriggerError::NotApplicable { .. })
        ));
        assert!(!engine.is_latest_only());
    }

    /// Producer that starts a new run on every poll and never finishes one.
    struct AbandonedRuns {
        polls: u32,
        limit: u32,
    }

    impl LatestPointerSource for AbandonedRuns {
        fn poll(
            &mut self,
            _now: DateTime<Utc>,
        ) -> std::result::Result<Vec<Candidate>, crate::error::SourceError> {
            if self.polls == self.limit {
                return Ok(Vec::new());
            }
            self.polls += 1;
            let gen_time = t0() - Duration::days(30) + Duration::hours(self.polls as i64);
            Ok(vec![Candidate::forecast(gen_time, 0, format!("/fc/{}", self.polls))])
        }

        fn label(&self) -> &str {
            "AbandonedRuns"
        }
    }

    #[test]
    fn test_expired_runs_release_seen_keys() {
        let dir = TempDir::new().unwrap();
        let mut config = TriggerConfig::new(
            dir.path().to_string_lossy(),
            TriggerMode::ForecastBundle,
            OperatingMode::Realtime,
        );
        config.expected_leads = Some(ExpectedLeads::Exact([0, 600].into_iter().collect()));
        config.max_pending_bundles = 2;
        config.poll_delay_ms = 1000;
        let source = Box::new(AbandonedRuns {
            polls: 0,
            limit: 500,
        });
        let mut engine = TriggerEngine::with_source(config, source, clock()).unwrap();
        let token = engine.cancel_token();
        engine.set_heartbeat(move |_: &str| token.cancel());

        assert!(engine.next_event().is_none());
        let stats = engine.bundle_stats().unwrap();
        assert_eq!(stats.created, 500);
        assert_eq!(stats.expired, 498);
        // Two collecting runs plus the newest expired one
        assert_eq!(engine.watcher.seen_count(), 3);
    }

    #[test]
    fn test_latest_only_rejected_for_bundles() {
        let dir = TempDir::new().unwrap();
        let mut config = TriggerConfig::new(
            dir.path().to_string_lossy(),
            TriggerMode::ForecastBundle,
            OperatingMode::Realtime,
        );
        config.expected_leads = Some(ExpectedLeads::Exact([0, 600].into_iter().collect()));
        let mut engine = TriggerEngine::with_clock(config, clock()).unwrap();
        assert!(engine.set_latest_only(true).is_err());
        assert!(engine.set_latest_only(false).is_ok());
        assert_eq!(engine.bundle_stats(), Some(BundleStats::default()));
    }
}

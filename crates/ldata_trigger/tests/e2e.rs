//! End-to-end tests for the trigger engine
//!
//! Every test builds a throwaway data tree and drives a full engine over it.
//! Realtime tests run on a ManualClock: producer arrivals are scripted from
//! inside the heartbeat, which fires once per empty poll before the sleep.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ldata_trigger::config::{DiscoveryConfig, SubsampleConfig};
use ldata_trigger::naming::{forecast_path, observation_path};
use ldata_trigger::{
    CancelToken, Clock, ExpectedLeads, LdataFile, ManualClock, OperatingMode, PointerRecord,
    PointerSourceKind, TriggerConfig, TriggerEngine, TriggerError, TriggerMode,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Temp data tree, removed on drop
struct TestEnv {
    _temp: TempDir,
    pub location: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let location = temp.path().join("data");
        fs::create_dir_all(&location).expect("Failed to create data dir");
        Self {
            _temp: temp,
            location,
        }
    }

    fn loc(&self) -> String {
        self.location.to_string_lossy().to_string()
    }

    fn write_obs(&self, time: DateTime<Utc>) -> PathBuf {
        let path = observation_path(&self.location, time, Some("nc"));
        write_file(&path);
        path
    }

    fn write_lead(&self, gen_time: DateTime<Utc>, lead: i32) -> PathBuf {
        let path = forecast_path(&self.location, gen_time, lead, None);
        write_file(&path);
        path
    }

    fn publish(&self, time: DateTime<Utc>) {
        LdataFile::write(
            &self.location,
            "_latest_data_info.json",
            &PointerRecord::new(time, None),
        )
        .expect("Failed to write pointer");
    }
}

fn write_file(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(path, b"payload").expect("Failed to write file");
}

fn t(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, d, h, m, s).unwrap()
}

fn drain_times(engine: &mut TriggerEngine) -> Vec<DateTime<Utc>> {
    std::iter::from_fn(|| engine.next_time()).collect()
}

// ============================================================================
// Archive
// ============================================================================

#[test]
fn test_archive_emits_every_instant_once_in_order() {
    let env = TestEnv::new();
    let inside = [t(4, 23, 55, 0), t(5, 0, 0, 0), t(5, 0, 5, 30), t(5, 6, 0, 0)];
    for time in [t(4, 23, 0, 0), t(5, 6, 0, 1), t(6, 0, 0, 0)].iter().chain(inside.iter()) {
        env.write_obs(*time);
    }

    let config = TriggerConfig::archive(
        env.loc(),
        TriggerMode::Observation,
        t(4, 23, 55, 0),
        t(5, 6, 0, 0),
    );
    let mut engine = TriggerEngine::new(config).unwrap();
    let first_pass = drain_times(&mut engine);
    assert_eq!(first_pass, inside.to_vec());
    assert!(engine.is_exhausted());
    assert!(engine.next_event().is_none());

    engine.rewind().unwrap();
    assert_eq!(drain_times(&mut engine), first_pass);
}

#[test]
fn test_archive_forecast_lead_pairs() {
    let env = TestEnv::new();
    let gen_a = t(5, 0, 0, 0);
    let gen_b = t(5, 6, 0, 0);
    for gen in [gen_a, gen_b] {
        for lead in [3600, 0, 1800] {
            env.write_lead(gen, lead);
        }
    }

    let config = TriggerConfig::archive(env.loc(), TriggerMode::ForecastLead, gen_a, gen_b);
    let mut engine = TriggerEngine::new(config).unwrap();
    let mut pairs = Vec::new();
    while let Some(pair) = engine.next_lead_time().unwrap() {
        pairs.push(pair);
    }
    assert_eq!(
        pairs,
        vec![
            (gen_a, 0),
            (gen_a, 1800),
            (gen_a, 3600),
            (gen_b, 0),
            (gen_b, 1800),
            (gen_b, 3600)
        ]
    );
}

#[test]
fn test_archive_bundle_per_generation() {
    let env = TestEnv::new();
    let gen_a = t(5, 0, 0, 0);
    let gen_b = t(5, 12, 0, 0);
    env.write_lead(gen_a, 0);
    env.write_lead(gen_a, 600);
    env.write_lead(gen_b, 0);

    let mut config = TriggerConfig::archive(env.loc(), TriggerMode::ForecastBundle, gen_a, gen_b);
    config.expected_leads = Some(ExpectedLeads::Series {
        min_lead: 0,
        count: 2,
        interval: 600,
    });
    let mut engine = TriggerEngine::new(config).unwrap();

    let first = engine.next_event().unwrap();
    assert_eq!(first.instant_time(), gen_a);
    assert_eq!(first.bundle_paths().keys().copied().collect::<Vec<_>>(), vec![0, 600]);

    let second = engine.next_event().unwrap();
    assert_eq!(second.instant_time(), gen_b);
    assert_eq!(second.bundle_paths().len(), 1);
    assert!(engine.next_event().is_none());
}

#[test]
fn test_archive_subsample_grid() {
    let env = TestEnv::new();
    for minute in 0..=10 {
        env.write_obs(t(5, 12, minute, 0));
    }
    let mut config = TriggerConfig::archive(
        env.loc(),
        TriggerMode::Observation,
        t(5, 12, 0, 0),
        t(5, 12, 10, 0),
    );
    config.subsample = SubsampleConfig::Grid {
        interval_secs: 300,
        offset_secs: 0,
    };
    let mut engine = TriggerEngine::new(config).unwrap();
    assert_eq!(
        drain_times(&mut engine),
        vec![t(5, 12, 0, 0), t(5, 12, 5, 0), t(5, 12, 10, 0)]
    );
}

// ============================================================================
// Realtime
// ============================================================================

#[test]
fn test_realtime_times_strictly_increase() {
    let env = TestEnv::new();
    env.publish(t(5, 12, 0, 0));

    let clock = Arc::new(ManualClock::new(t(5, 12, 30, 0)));
    let mut config = TriggerConfig::new(env.loc(), TriggerMode::Observation, OperatingMode::Realtime);
    config.poll_delay_ms = 1000;
    let mut engine = TriggerEngine::with_clock(config, clock).unwrap();
    let token = CancelToken::new();
    engine.set_cancel_token(token.clone());

    // Producer republishes an older time and a repeat along the way
    let mut script = vec![
        t(5, 12, 2, 0),
        t(5, 12, 1, 0),
        t(5, 12, 2, 0),
        t(5, 12, 3, 0),
    ]
    .into_iter();
    let producer = env.location.clone();
    engine.set_heartbeat(move |_label: &str| match script.next() {
        Some(time) => LdataFile::write(
            &producer,
            "_latest_data_info.json",
            &PointerRecord::new(time, None),
        )
        .unwrap(),
        None => token.cancel(),
    });

    assert_eq!(
        drain_times(&mut engine),
        vec![t(5, 12, 0, 0), t(5, 12, 2, 0), t(5, 12, 3, 0)]
    );
}

#[test]
fn test_max_valid_age_boundary() {
    let now = t(5, 12, 0, 0);

    for (age_secs, expected) in [(300, true), (299, false)] {
        let env = TestEnv::new();
        env.publish(now - Duration::seconds(300));

        let mut config =
            TriggerConfig::new(env.loc(), TriggerMode::Observation, OperatingMode::Realtime);
        config.max_valid_age_secs = Some(age_secs);
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(now))).unwrap();
        engine.set_nowait().unwrap();
        assert_eq!(engine.next_time().is_some(), expected, "age {}", age_secs);
    }
}

#[test]
fn test_latest_only_skips_to_newest() {
    let times = [t(5, 12, 0, 0), t(5, 12, 1, 0), t(5, 12, 2, 0)];

    for latest_only in [true, false] {
        let env = TestEnv::new();
        for time in times {
            env.write_obs(time);
        }
        let mut config =
            TriggerConfig::new(env.loc(), TriggerMode::Observation, OperatingMode::Realtime);
        config.pointer_source = PointerSourceKind::DirectoryScan;
        config.latest_only = latest_only;
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(5, 12, 5, 0)))).unwrap();
        engine.set_nowait().unwrap();

        let seen = drain_times(&mut engine);
        if latest_only {
            assert_eq!(seen, vec![times[2]]);
        } else {
            assert_eq!(seen, times.to_vec());
        }
    }
}

fn drain_leads(engine: &mut TriggerEngine) -> Vec<(DateTime<Utc>, i32)> {
    std::iter::from_fn(|| engine.next_lead_time().unwrap()).collect()
}

#[test]
fn test_latest_only_forecast_leads() {
    let gen_time = t(5, 12, 0, 0);
    let leads = [0, 600, 1200];

    for latest_only in [true, false] {
        let env = TestEnv::new();
        for lead in leads {
            env.write_lead(gen_time, lead);
        }
        let mut config =
            TriggerConfig::new(env.loc(), TriggerMode::ForecastLead, OperatingMode::Realtime);
        config.pointer_source = PointerSourceKind::DirectoryScan;
        config.latest_only = latest_only;
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(5, 13, 0, 0)))).unwrap();
        engine.set_nowait().unwrap();

        let seen = drain_leads(&mut engine);
        if latest_only {
            assert_eq!(seen, vec![(gen_time, 1200)]);
        } else {
            assert_eq!(seen, leads.iter().map(|l| (gen_time, *l)).collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_latest_only_respects_accepted_leads() {
    let env = TestEnv::new();
    let gen_time = t(5, 12, 0, 0);
    for lead in [0, 600, 1200] {
        env.write_lead(gen_time, lead);
    }
    let mut config =
        TriggerConfig::new(env.loc(), TriggerMode::ForecastLead, OperatingMode::Realtime);
    config.pointer_source = PointerSourceKind::DirectoryScan;
    config.latest_only = true;
    config.accepted_leads = Some([0, 600].into_iter().collect());
    let mut engine =
        TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(5, 13, 0, 0)))).unwrap();
    engine.set_nowait().unwrap();

    // Newest lead is not accepted: the newest accepted one is handed out
    assert_eq!(drain_leads(&mut engine), vec![(gen_time, 600)]);
}

#[test]
fn test_restarted_session_resumes_after_saved_state() {
    let env = TestEnv::new();
    let state_dir = env.location.parent().unwrap().join("state");
    let make_engine = || {
        let mut config =
            TriggerConfig::new(env.loc(), TriggerMode::Observation, OperatingMode::Realtime);
        config.save_read_state = Some("ingest".into());
        config.read_state_dir = Some(state_dir.to_string_lossy().to_string());
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(5, 13, 0, 0)))).unwrap();
        engine.set_nowait().unwrap();
        engine
    };

    env.publish(t(5, 12, 0, 0));
    let mut first = make_engine();
    assert_eq!(first.next_time(), Some(t(5, 12, 0, 0)));
    drop(first);

    // Same pointer after a restart: nothing is replayed
    let mut second = make_engine();
    assert_eq!(second.next_time(), None);
    env.publish(t(5, 12, 5, 0));
    assert_eq!(second.next_time(), Some(t(5, 12, 5, 0)));
}

#[test]
fn test_bundle_waits_for_last_lead() {
    let env = TestEnv::new();
    let gen_time = Utc.timestamp_opt(1000, 0).unwrap();
    let start = gen_time + Duration::seconds(60);
    let lead_0 = env.write_lead(gen_time, 0);

    let clock = Arc::new(ManualClock::new(start));
    let mut config =
        TriggerConfig::new(env.loc(), TriggerMode::ForecastBundle, OperatingMode::Realtime);
    config.pointer_source = PointerSourceKind::DirectoryScan;
    config.discovery = DiscoveryConfig::Reactive {
        quiet_period_secs: None,
    };
    config.expected_leads = Some(ExpectedLeads::Exact([0, 600].into_iter().collect()));
    config.poll_delay_ms = 1000;
    let mut engine = TriggerEngine::with_clock(config, clock.clone()).unwrap();

    // Lead 600 lands while the watcher sleeps from T+4s to T+5s
    let producer_clock = clock.clone();
    let lead_600 = forecast_path(&env.location, gen_time, 600, None);
    let pending = lead_600.clone();
    engine.set_heartbeat(move |_label: &str| {
        if producer_clock.now() >= start + Duration::seconds(4) && !pending.exists() {
            write_file(&pending);
        }
    });

    let event = engine.next_event().unwrap();
    assert_eq!(event.instant_time(), gen_time);
    assert_eq!(clock.now(), start + Duration::seconds(5));
    let paths: Vec<_> = event.bundle_paths().values().cloned().collect();
    assert_eq!(
        paths,
        vec![
            lead_0.to_string_lossy().to_string(),
            lead_600.to_string_lossy().to_string()
        ]
    );
    assert_eq!(engine.bundle_stats().unwrap().fired, 1);
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_construction_errors() {
    let env = TestEnv::new();

    let archive = TriggerConfig::new(env.loc(), TriggerMode::Observation, OperatingMode::Archive);
    let err = TriggerEngine::new(archive).err().unwrap();
    assert!(err.is_construction());

    let backwards =
        TriggerConfig::archive(env.loc(), TriggerMode::Observation, t(6, 0, 0, 0), t(5, 0, 0, 0));
    assert!(matches!(
        TriggerEngine::new(backwards).err().unwrap(),
        TriggerError::InvalidInterval { .. }
    ));

    let mut bundle =
        TriggerConfig::new(env.loc(), TriggerMode::ForecastBundle, OperatingMode::Realtime);
    bundle.expected_leads = Some(ExpectedLeads::Exact([0].into_iter().collect()));
    let mut engine = TriggerEngine::new(bundle).unwrap();
    assert!(matches!(
        engine.set_nowait(),
        Err(TriggerError::NotApplicable { .. })
    ));
}

//! Input reader
//!
//! Turns triggers into fetched data. An [`InputReader`] either follows a
//! [`TriggerEngine`] or walks an explicit list of files, resolves each
//! instant to a concrete path and hands that path to a [`DataReader`].

use crate::engine::TriggerEngine;
use crate::error::{Result, TriggerError};
use crate::indexer::ArchiveIndexer;
use crate::naming;
use crate::types::{Candidate, OperatingMode, TriggerMode};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Seam to external data-format readers.
pub trait DataReader {
    type Output;

    fn read(
        &mut self,
        path: &Path,
        time: DateTime<Utc>,
    ) -> std::result::Result<Self::Output, Box<dyn std::error::Error + Send + Sync>>;
}

/// Returns the raw bytes of the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileReader;

impl DataReader for RawFileReader {
    type Output = Vec<u8>;

    fn read(
        &mut self,
        path: &Path,
        _time: DateTime<Utc>,
    ) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(fs::read(path)?)
    }
}

/// One fetched resource.
#[derive(Debug, Clone)]
pub struct ReadResult<T> {
    pub time: DateTime<Utc>,
    pub lead_secs: Option<i32>,
    pub path: PathBuf,
    pub data: T,
}

enum Feed {
    Triggered(TriggerEngine),
    Paths {
        entries: Vec<Candidate>,
        position: usize,
    },
}

pub struct InputReader<R: DataReader> {
    feed: Feed,
    reader: R,
    search_margin: Duration,
    data_time: Option<DateTime<Utc>>,
    lead_secs: Option<i32>,
    last_path: Option<PathBuf>,
}

impl<R: DataReader> InputReader<R> {
    /// Read whatever `engine` triggers on.
    pub fn new(engine: TriggerEngine, reader: R) -> Result<Self> {
        if engine.trigger_mode() == TriggerMode::ForecastBundle {
            return Err(TriggerError::not_applicable(
                "InputReader::new",
                "an input reader fetches one resource per trigger, not a bundle",
            ));
        }
        let margin = engine.config().search_margin_secs;
        Ok(Self {
            feed: Feed::Triggered(engine),
            reader,
            search_margin: Duration::seconds(margin as i64),
            data_time: None,
            lead_secs: None,
            last_path: None,
        })
    }

    /// Read an explicit, ordered list of files; no triggering at all.
    ///
    /// Data times come from the file names, falling back to the file
    /// modification time. Files with neither are skipped.
    pub fn from_paths<I, P>(paths: I, reader: R) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut entries = Vec::new();
        for path in paths {
            let path = path.into();
            if let Some(parsed) = naming::parse_path(&path) {
                entries.push(Candidate {
                    time: parsed.time,
                    lead_secs: parsed.lead_secs,
                    path,
                });
                continue;
            }
            match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => entries.push(Candidate::observation(modified.into(), path)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping file with no data time");
                }
            }
        }
        Self {
            feed: Feed::Paths {
                entries,
                position: 0,
            },
            reader,
            search_margin: Duration::zero(),
            data_time: None,
            lead_secs: None,
            last_path: None,
        }
    }

    /// Fetch the next triggered resource. `Ok(None)` means no more data.
    pub fn read_next(&mut self) -> Result<Option<ReadResult<R::Output>>> {
        let candidate = match &mut self.feed {
            Feed::Paths { entries, position } => {
                let Some(entry) = entries.get(*position).cloned() else {
                    return Ok(None);
                };
                *position += 1;
                entry
            }
            Feed::Triggered(engine) => {
                let Some(event) = engine.next_event() else {
                    return Ok(None);
                };
                let triggered = Candidate {
                    time: event.instant_time(),
                    lead_secs: event.lead_time_seconds(),
                    path: PathBuf::from(event.source_location()),
                };
                resolve(engine, &triggered, self.search_margin)?
            }
        };
        self.fetch(candidate).map(Some)
    }

    /// Fetch the freshest resource no older than the engine's max valid age,
    /// without waiting for an exact trigger. Realtime sessions only.
    pub fn read_latest(&mut self) -> Result<Option<ReadResult<R::Output>>> {
        let Feed::Triggered(engine) = &self.feed else {
            return Err(TriggerError::not_applicable(
                "read_latest",
                "file-list mode has no realtime source",
            ));
        };
        if engine.operating_mode() == OperatingMode::Archive {
            return Err(TriggerError::not_applicable(
                "read_latest",
                "archive sessions replay exact instants",
            ));
        }
        let Some(age) = engine.config().max_valid_age_secs else {
            return Err(TriggerError::not_applicable(
                "read_latest",
                "max valid age is not set",
            ));
        };

        let now = engine.now();
        let mut cursor = indexer_for(engine).index(now - Duration::seconds(age as i64), now)?;
        let location = engine.location().to_string();
        let mut freshest = None;
        while let Some(candidate) = cursor.next() {
            freshest = Some(candidate);
        }
        match freshest {
            Some(candidate) => self.fetch(candidate).map(Some),
            None => {
                debug!(location = %location, "Nothing within max valid age");
                Ok(None)
            }
        }
    }

    fn fetch(&mut self, candidate: Candidate) -> Result<ReadResult<R::Output>> {
        let data = self
            .reader
            .read(&candidate.path, candidate.time)
            .map_err(|e| TriggerError::Read {
                path: candidate.path.display().to_string(),
                message: e.to_string(),
            })?;
        debug!(path = %candidate.path.display(), time = %candidate.time, "Read input");
        self.data_time = Some(candidate.time);
        self.lead_secs = candidate.lead_secs;
        self.last_path = Some(candidate.path.clone());
        Ok(ReadResult {
            time: candidate.time,
            lead_secs: candidate.lead_secs,
            path: candidate.path,
            data,
        })
    }

    /// Data time of the last resource read (generation time for forecasts).
    pub fn data_time(&self) -> Option<DateTime<Utc>> {
        self.data_time
    }

    /// Generation time and lead of the last forecast read.
    pub fn forecast_time(&self) -> Option<(DateTime<Utc>, i32)> {
        Some((self.data_time?, self.lead_secs?))
    }

    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }

    pub fn engine(&self) -> Option<&TriggerEngine> {
        match &self.feed {
            Feed::Triggered(engine) => Some(engine),
            Feed::Paths { .. } => None,
        }
    }

    pub fn engine_mut(&mut self) -> Option<&mut TriggerEngine> {
        match &mut self.feed {
            Feed::Triggered(engine) => Some(engine),
            Feed::Paths { .. } => None,
        }
    }
}

fn indexer_for(engine: &TriggerEngine) -> ArchiveIndexer {
    ArchiveIndexer::new(engine.location(), engine.trigger_mode())
        .with_search_ext(engine.config().search_ext.clone())
}

/// Concrete path for a triggered instant. The triggering path wins when it
/// exists; otherwise the closest instant within the search margin, ties going
/// to the later one.
fn resolve(engine: &TriggerEngine, triggered: &Candidate, margin: Duration) -> Result<Candidate> {
    if triggered.path.exists() {
        return Ok(triggered.clone());
    }
    let mut cursor = indexer_for(engine).index(triggered.time - margin, triggered.time + margin)?;
    let mut best: Option<(Duration, Candidate)> = None;
    while let Some(candidate) = cursor.next() {
        if candidate.lead_secs != triggered.lead_secs {
            continue;
        }
        let distance = Duration::seconds((candidate.time - triggered.time).num_seconds().abs());
        if best.as_ref().map_or(true, |(d, _)| distance <= *d) {
            best = Some((distance, candidate));
        }
    }
    match best {
        Some((distance, candidate)) => {
            debug!(
                triggered = %triggered.path.display(),
                resolved = %candidate.path.display(),
                skew_secs = distance.num_seconds(),
                "Resolved within search margin"
            );
            Ok(candidate)
        }
        None => Err(TriggerError::Read {
            path: triggered.path.display().to_string(),
            message: format!(
                "no data within {}s of {}",
                margin.num_seconds(),
                triggered.time
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TriggerConfig;
    use crate::pointer::{LdataFile, PointerRecord};
    use chrono::TimeZone;
    use filetime::FileTime;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, h, m, s).unwrap()
    }

    fn write(path: &Path, body: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_from_paths_keeps_order_and_recovers_times() {
        let dir = TempDir::new().unwrap();
        let named = naming::observation_path(dir.path(), t(6, 0, 0), Some("nc"));
        write(&named, b"named");
        let unnamed = dir.path().join("scan.bin");
        write(&unnamed, b"mtime");
        filetime::set_file_mtime(&unnamed, FileTime::from_unix_time(t(5, 0, 0).timestamp(), 0))
            .unwrap();
        let missing = dir.path().join("gone.bin");

        let mut reader = InputReader::from_paths(vec![named.clone(), unnamed.clone(), missing], RawFileReader);

        let first = reader.read_next().unwrap().unwrap();
        assert_eq!(first.time, t(6, 0, 0));
        assert_eq!(first.data, b"named");

        let second = reader.read_next().unwrap().unwrap();
        assert_eq!(second.time, t(5, 0, 0));
        assert_eq!(reader.last_path(), Some(unnamed.as_path()));
        assert_eq!(reader.data_time(), Some(t(5, 0, 0)));
        assert!(reader.forecast_time().is_none());

        assert!(reader.read_next().unwrap().is_none());
        assert!(reader.read_latest().is_err());
    }

    #[test]
    fn test_search_margin_resolves_skewed_file() {
        let dir = TempDir::new().unwrap();
        let loc = dir.path();
        // Pointer says 12:00:00 but the file landed stamped two seconds later
        write(&naming::observation_path(loc, t(12, 0, 2), Some("nc")), b"late");
        write(&naming::observation_path(loc, t(11, 59, 57), Some("nc")), b"early");
        LdataFile::write(loc, "_latest_data_info.json", &PointerRecord::new(t(12, 0, 0), None))
            .unwrap();

        let mut config = TriggerConfig::new(
            loc.to_string_lossy(),
            TriggerMode::Observation,
            OperatingMode::Realtime,
        );
        config.search_ext = Some("nc".into());
        config.search_margin_secs = 5;
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(12, 0, 10)))).unwrap();
        engine.set_nowait().unwrap();

        let mut reader = InputReader::new(engine, RawFileReader).unwrap();
        let result = reader.read_next().unwrap().unwrap();
        assert_eq!(result.data, b"late");
        assert_eq!(reader.data_time(), Some(t(12, 0, 2)));
    }

    #[test]
    fn test_unresolvable_trigger_is_read_error() {
        let dir = TempDir::new().unwrap();
        let loc = dir.path();
        LdataFile::write(loc, "_latest_data_info.json", &PointerRecord::new(t(12, 0, 0), None))
            .unwrap();
        let config = TriggerConfig::new(
            loc.to_string_lossy(),
            TriggerMode::Observation,
            OperatingMode::Realtime,
        );
        let mut engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(12, 0, 10)))).unwrap();
        engine.set_nowait().unwrap();

        let mut reader = InputReader::new(engine, RawFileReader).unwrap();
        assert!(matches!(reader.read_next(), Err(TriggerError::Read { .. })));
    }

    #[test]
    fn test_read_latest_within_max_age() {
        let dir = TempDir::new().unwrap();
        let loc = dir.path();
        write(&naming::forecast_path(loc, t(6, 0, 0), 0, None), b"old");
        write(&naming::forecast_path(loc, t(12, 0, 0), 3600, None), b"new");

        let mut config = TriggerConfig::new(
            loc.to_string_lossy(),
            TriggerMode::ForecastLead,
            OperatingMode::Realtime,
        );
        config.max_valid_age_secs = Some(3 * 3600);
        let engine =
            TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(13, 0, 0)))).unwrap();

        let mut reader = InputReader::new(engine, RawFileReader).unwrap();
        let result = reader.read_latest().unwrap().unwrap();
        assert_eq!(result.data, b"new");
        assert_eq!(reader.forecast_time(), Some((t(12, 0, 0), 3600)));
    }

    #[test]
    fn test_bundle_engine_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = TriggerConfig::new(
            dir.path().to_string_lossy(),
            TriggerMode::ForecastBundle,
            OperatingMode::Realtime,
        );
        config.expected_leads = Some(crate::config::ExpectedLeads::Exact([0].into_iter().collect()));
        let engine = TriggerEngine::with_clock(config, Arc::new(ManualClock::new(t(0, 0, 0)))).unwrap();
        assert!(InputReader::new(engine, RawFileReader).is_err());
    }
}

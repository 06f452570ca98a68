//! Archive indexing
//!
//! Builds the ordered, deduplicated list of instants available at a location
//! inside a closed interval, once, up front. Only day directories whose date
//! intersects the interval are visited.

use crate::error::{Result, TriggerError};
use crate::naming;
use crate::pointer::list_entries;
use crate::types::{ArrivalKey, Candidate, TriggerMode};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Builds [`ArchiveCursor`]s for one location.
#[derive(Debug, Clone)]
pub struct ArchiveIndexer {
    location: PathBuf,
    trigger_mode: TriggerMode,
    search_ext: Option<String>,
}

impl ArchiveIndexer {
    pub fn new(location: impl Into<PathBuf>, trigger_mode: TriggerMode) -> Self {
        Self {
            location: location.into(),
            trigger_mode,
            search_ext: None,
        }
    }

    pub fn with_search_ext(mut self, ext: Option<String>) -> Self {
        self.search_ext = ext;
        self
    }

    /// Every instant in `[start, end]`, ascending, without duplicates.
    pub fn index(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ArchiveCursor> {
        if start > end {
            return Err(TriggerError::InvalidInterval {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        if !self.location.is_dir() {
            return Err(TriggerError::LocationNotFound(
                self.location.display().to_string(),
            ));
        }

        let mut found: BTreeMap<ArrivalKey, PathBuf> = BTreeMap::new();
        let first_day = start.date_naive();
        let last_day = end.date_naive();

        for (name, path) in list_entries(&self.location)? {
            match naming::parse_day_dir(&name) {
                Some(day) if path.is_dir() => {
                    if day >= first_day && day <= last_day {
                        self.index_day(&path, day, start, end, &mut found)?;
                    }
                }
                Some(_) => {}
                None if path.is_file() => self.consider(&path, start, end, &mut found),
                None => {}
            }
        }

        let entries: Vec<Candidate> = found
            .into_iter()
            .map(|(key, path)| Candidate {
                time: key.time,
                lead_secs: key.lead_secs,
                path,
            })
            .collect();

        info!(
            location = %self.location.display(),
            start = %start,
            end = %end,
            count = entries.len(),
            "Archive indexed"
        );
        Ok(ArchiveCursor::new(entries))
    }

    fn index_day(
        &self,
        day_path: &Path,
        day: NaiveDate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        found: &mut BTreeMap<ArrivalKey, PathBuf>,
    ) -> Result<()> {
        let entries = match list_entries(day_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for (name, path) in entries {
            if path.is_dir() {
                if naming::parse_gen_dir(&name).is_some() && self.trigger_mode.is_forecast() {
                    for (_, lead_path) in list_entries(&path)? {
                        if lead_path.is_file() {
                            self.consider(&lead_path, start, end, found);
                        }
                    }
                }
                continue;
            }
            self.consider(&path, start, end, found);
        }
        debug!(day = %day, total = found.len(), "Indexed day directory");
        Ok(())
    }

    fn consider(
        &self,
        path: &Path,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        found: &mut BTreeMap<ArrivalKey, PathBuf>,
    ) {
        if !naming::has_ext(path, self.search_ext.as_deref()) {
            return;
        }
        let Some(parsed) = naming::parse_path(path) else {
            return;
        };
        // Mode decides which layout counts
        if parsed.lead_secs.is_some() != self.trigger_mode.is_forecast() {
            return;
        }
        if parsed.time < start || parsed.time > end {
            return;
        }
        let key = ArrivalKey {
            time: parsed.time,
            lead_secs: parsed.lead_secs,
        };
        // Same instant twice: keep the lexicographically last path
        match found.get(&key) {
            Some(existing) if existing.as_path() >= path => {}
            _ => {
                found.insert(key, path.to_path_buf());
            }
        }
    }
}

/// Position in a precomputed archive list.
#[derive(Debug, Clone)]
pub struct ArchiveCursor {
    entries: Vec<Candidate>,
    position: usize,
}

impl ArchiveCursor {
    pub fn new(entries: Vec<Candidate>) -> Self {
        Self {
            entries,
            position: 0,
        }
    }

    pub fn next(&mut self) -> Option<Candidate> {
        let entry = self.entries.get(self.position)?.clone();
        self.position += 1;
        Some(entry)
    }

    pub fn peek(&self) -> Option<&Candidate> {
        self.entries.get(self.position)
    }

    /// All remaining entries sharing the next entry's instant time.
    pub fn next_group(&mut self) -> Option<Vec<Candidate>> {
        let time = self.peek()?.time;
        let mut group = Vec::new();
        while let Some(entry) = self.peek() {
            if entry.time != time {
                break;
            }
            group.extend(self.next());
        }
        Some(group)
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn t(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, d, h, m, 0).unwrap()
    }

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"data").unwrap();
    }

    #[test]
    fn test_index_observations_in_range() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for time in [t(1, 23, 50), t(2, 0, 10), t(2, 0, 20), t(3, 12, 0)] {
            touch(naming::observation_path(root, time, Some("nc")));
        }
        touch(root.join("20240202").join("README"));

        let cursor = ArchiveIndexer::new(root, TriggerMode::Observation)
            .index(t(2, 0, 0), t(2, 23, 59))
            .unwrap();
        let times: Vec<_> = cursor.entries.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![t(2, 0, 10), t(2, 0, 20)]);
    }

    #[test]
    fn test_index_inclusive_bounds_and_dedup() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(naming::observation_path(root, t(5, 1, 0), Some("mdv")));
        touch(naming::observation_path(root, t(5, 1, 0), Some("nc")));
        touch(naming::observation_path(root, t(5, 2, 0), Some("nc")));

        let mut cursor = ArchiveIndexer::new(root, TriggerMode::Observation)
            .index(t(5, 1, 0), t(5, 2, 0))
            .unwrap();
        assert_eq!(cursor.len(), 2);
        let first = cursor.next().unwrap();
        assert!(first.path.to_string_lossy().ends_with("010000.nc"));
    }

    #[test]
    fn test_index_forecast_pairs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for lead in [600, 0, 300] {
            touch(naming::forecast_path(root, t(7, 6, 0), lead, None));
        }
        touch(naming::forecast_path(root, t(7, 12, 0), 0, None));

        let mut cursor = ArchiveIndexer::new(root, TriggerMode::ForecastLead)
            .index(t(7, 0, 0), t(7, 11, 0))
            .unwrap();
        let keys: Vec<_> = std::iter::from_fn(|| cursor.next())
            .map(|c| c.lead_secs.unwrap())
            .collect();
        assert_eq!(keys, vec![0, 300, 600]);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_cursor_groups_and_rewind() {
        let gen_a = t(1, 0, 0);
        let gen_b = t(1, 6, 0);
        let mut cursor = ArchiveCursor::new(vec![
            Candidate::forecast(gen_a, 0, "/a0"),
            Candidate::forecast(gen_a, 300, "/a300"),
            Candidate::forecast(gen_b, 0, "/b0"),
        ]);
        assert_eq!(cursor.next_group().unwrap().len(), 2);
        assert_eq!(cursor.next_group().unwrap()[0].time, gen_b);
        assert!(cursor.next_group().is_none());

        cursor.rewind();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.next().unwrap().path, PathBuf::from("/a0"));
    }

    #[test]
    fn test_index_missing_location() {
        let dir = TempDir::new().unwrap();
        let err = ArchiveIndexer::new(dir.path().join("nope"), TriggerMode::Observation)
            .index(t(1, 0, 0), t(2, 0, 0))
            .unwrap_err();
        assert!(matches!(err, TriggerError::LocationNotFound(_)));
    }
}

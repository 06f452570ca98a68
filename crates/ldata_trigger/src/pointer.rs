//! Latest-data sources
//!
//! A realtime watcher never looks at producers directly: it polls a
//! [`LatestPointerSource`], which reports the arrivals currently visible at
//! the location. Three sources exist:
//!
//! - [`LdataFile`]: a producer-maintained pointer record in the location
//! - [`ObservationScan`]: the newest day directories of an observation tree
//! - [`ForecastTree`](crate::discovery::ForecastTree): generation directories
//!   of a forecast tree, chosen by a discovery strategy

use crate::config::{PointerSourceKind, TriggerConfig};
use crate::discovery::ForecastTree;
use crate::error::SourceError;
use crate::naming;
use crate::types::{ArrivalKey, Candidate, TriggerMode};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Number of newest day directories an observation scan lists.
const SCAN_DAYS: usize = 2;

pub trait LatestPointerSource: Send {
    /// Arrivals currently visible, in ascending key order. Never sleeps.
    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Candidate>, SourceError>;

    /// Short name used in logs and heartbeat labels.
    fn label(&self) -> &str;
}

/// Build the realtime source a config asks for.
pub fn build_source(config: &TriggerConfig) -> Box<dyn LatestPointerSource> {
    let location = PathBuf::from(&config.location);
    let ext = config.search_ext.clone();
    match (config.pointer_source, config.trigger_mode) {
        (PointerSourceKind::LdataFile, mode) => Box::new(LdataFile::new(
            location,
            config.ldata_file_name.clone(),
            mode,
            ext,
        )),
        (PointerSourceKind::DirectoryScan, TriggerMode::Observation) => {
            Box::new(ObservationScan::new(location, ext))
        }
        (PointerSourceKind::DirectoryScan, _) => {
            Box::new(ForecastTree::from_config(location, ext, &config.discovery))
        }
    }
}

/// Non-hidden entries of a directory.
pub(crate) fn list_entries(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if naming::is_hidden(&name) {
            continue;
        }
        entries.push((name, entry.path()));
    }
    Ok(entries)
}

// ============================================================================
// Pointer file
// ============================================================================

/// On-disk latest-data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerRecord {
    /// Epoch seconds of the newest data (generation time for forecasts)
    pub latest_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_time_seconds: Option<i32>,
    /// Data path relative to the location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
}

impl PointerRecord {
    pub fn new(latest_time: DateTime<Utc>, lead_time_seconds: Option<i32>) -> Self {
        Self {
            latest_time: latest_time.timestamp(),
            lead_time_seconds,
            rel_data_path: None,
            data_type: None,
            writer: None,
        }
    }

    pub fn with_rel_data_path(mut self, rel: impl Into<String>) -> Self {
        self.rel_data_path = Some(rel.into());
        self
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.latest_time, 0).single()
    }
}

/// Reads the pointer record a producer keeps in the watched location.
pub struct LdataFile {
    location: PathBuf,
    file_name: String,
    trigger_mode: TriggerMode,
    search_ext: Option<String>,
}

impl LdataFile {
    pub fn new(
        location: PathBuf,
        file_name: String,
        trigger_mode: TriggerMode,
        search_ext: Option<String>,
    ) -> Self {
        Self {
            location,
            file_name,
            trigger_mode,
            search_ext,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.location.join(&self.file_name)
    }

    /// Publish a pointer record: write a temp file, then rename over the
    /// old record so readers never see a partial write.
    pub fn write(location: &Path, file_name: &str, record: &PointerRecord) -> io::Result<()> {
        let tmp = location.join(format!(".{}.tmp", file_name));
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, location.join(file_name))
    }

    fn resolve(&self, record: &PointerRecord) -> Result<Candidate, SourceError> {
        let time = record.latest().ok_or_else(|| {
            SourceError::Malformed(format!("latestTime {} out of range", record.latest_time))
        })?;

        let lead = if self.trigger_mode.is_forecast() {
            Some(record.lead_time_seconds.ok_or_else(|| {
                SourceError::Malformed("forecast pointer has no leadTimeSeconds".into())
            })?)
        } else {
            None
        };

        let path = match (&record.rel_data_path, lead) {
            (Some(rel), _) => self.location.join(rel),
            (None, Some(lead)) => {
                naming::forecast_path(&self.location, time, lead, self.search_ext.as_deref())
            }
            (None, None) => naming::observation_path(&self.location, time, self.search_ext.as_deref()),
        };

        Ok(Candidate {
            time,
            lead_secs: lead,
            path,
        })
    }
}

impl LatestPointerSource for LdataFile {
    fn poll(&mut self, _now: DateTime<Utc>) -> Result<Vec<Candidate>, SourceError> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SourceError::Io(e)),
        };
        let record: PointerRecord = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Malformed(format!("{}: {}", self.path().display(), e)))?;
        Ok(vec![self.resolve(&record)?])
    }

    fn label(&self) -> &str {
        "LdataFile"
    }
}

// ============================================================================
// Read state
// ============================================================================

/// Last key a session handed out, kept on disk so that a restarted process
/// resumes after it instead of replaying the source.
///
/// Stored as a [`PointerRecord`] named `latest_read_info.<label>.<location>.json`.
#[derive(Debug, Clone)]
pub struct ReadStateFile {
    dir: PathBuf,
    file_name: String,
}

impl ReadStateFile {
    pub fn new(dir: impl Into<PathBuf>, label: &str, location: &str) -> Self {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect()
        };
        Self {
            dir: dir.into(),
            file_name: format!(
                "latest_read_info.{}.{}.json",
                sanitize(label),
                sanitize(location.trim_matches('/'))
            ),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Saved key, `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<ArrivalKey>, SourceError> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SourceError::Io(e)),
        };
        let record: PointerRecord = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Malformed(format!("{}: {}", self.path().display(), e)))?;
        let time = record.latest().ok_or_else(|| {
            SourceError::Malformed(format!("latestTime {} out of range", record.latest_time))
        })?;
        Ok(Some(ArrivalKey {
            time,
            lead_secs: record.lead_time_seconds,
        }))
    }

    pub fn save(&self, key: ArrivalKey, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let record = PointerRecord::new(key.time, key.lead_secs)
            .with_rel_data_path(path.to_string_lossy());
        LdataFile::write(&self.dir, &self.file_name, &record)
    }
}

// ============================================================================
// Observation directory scan
// ============================================================================

/// Lists observation files in the newest day directories (and the location
/// root) when no pointer file is maintained.
pub struct ObservationScan {
    location: PathBuf,
    search_ext: Option<String>,
}

impl ObservationScan {
    pub fn new(location: PathBuf, search_ext: Option<String>) -> Self {
        Self {
            location,
            search_ext,
        }
    }

    fn collect(&self, dir: &Path, out: &mut Vec<Candidate>) -> io::Result<()> {
        for (_, path) in list_entries(dir)? {
            if !path.is_file() || !naming::has_ext(&path, self.search_ext.as_deref()) {
                continue;
            }
            if let Some(parsed) = naming::parse_path(&path) {
                if parsed.lead_secs.is_none() {
                    out.push(Candidate::observation(parsed.time, path));
                }
            }
        }
        Ok(())
    }
}

impl LatestPointerSource for ObservationScan {
    fn poll(&mut self, _now: DateTime<Utc>) -> Result<Vec<Candidate>, SourceError> {
        let entries = list_entries(&self.location)?;
        let mut day_dirs: Vec<_> = entries
            .iter()
            .filter(|(name, path)| naming::parse_day_dir(name).is_some() && path.is_dir())
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        day_dirs.sort();

        let mut found = Vec::new();
        self.collect(&self.location, &mut found)?;
        for (_, dir) in day_dirs.iter().rev().take(SCAN_DAYS) {
            // A day dir vanishing between listing and reading is not an error
            match self.collect(dir, &mut found) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }

        found.sort_by(|a, b| a.key().cmp(&b.key()).then_with(|| a.path.cmp(&b.path)));
        found.dedup_by(|later, earlier| {
            if later.key() == earlier.key() {
                earlier.path = later.path.clone();
                true
            } else {
                false
            }
        });
        Ok(found)
    }

    fn label(&self) -> &str {
        "ObservationScan"
    }
}

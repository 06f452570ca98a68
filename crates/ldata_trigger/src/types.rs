//! Core types shared across the scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Modes
// ============================================================================

/// How arrivals are turned into triggers. Fixed at engine construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// One arrival, one trigger
    #[default]
    Observation,
    /// One trigger per generation time, once its lead set is complete
    ForecastBundle,
    /// One trigger per (gen, lead) arrival
    ForecastLead,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::ForecastBundle => "forecast_bundle",
            Self::ForecastLead => "forecast_lead",
        }
    }

    pub fn is_forecast(&self) -> bool {
        !matches!(self, Self::Observation)
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Live polling of the latest-data source
    #[default]
    Realtime,
    /// Bounded replay of a closed time interval
    Archive,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// Ordering key of an arrival: instant time, then lead seconds.
///
/// Observations carry no lead and sort before any lead of the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrivalKey {
    pub time: DateTime<Utc>,
    pub lead_secs: Option<i32>,
}

impl fmt::Display for ArrivalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lead_secs {
            Some(lead) => write!(f, "{}+{}s", self.time.format("%Y-%m-%dT%H:%M:%SZ"), lead),
            None => write!(f, "{}", self.time.format("%Y-%m-%dT%H:%M:%SZ")),
        }
    }
}

/// A located arrival that may become a trigger.
///
/// `time` is the generation time for forecast data, the observation time
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub time: DateTime<Utc>,
    pub lead_secs: Option<i32>,
    pub path: PathBuf,
}

impl Candidate {
    pub fn observation(time: DateTime<Utc>, path: impl Into<PathBuf>) -> Self {
        Self {
            time,
            lead_secs: None,
            path: path.into(),
        }
    }

    pub fn forecast(gen_time: DateTime<Utc>, lead_secs: i32, path: impl Into<PathBuf>) -> Self {
        Self {
            time: gen_time,
            lead_secs: Some(lead_secs),
            path: path.into(),
        }
    }

    pub fn key(&self) -> ArrivalKey {
        ArrivalKey {
            time: self.time,
            lead_secs: self.lead_secs,
        }
    }

    /// Valid time: instant plus lead, when there is one.
    pub fn valid_time(&self) -> DateTime<Utc> {
        match self.lead_secs {
            Some(lead) => self.time + chrono::Duration::seconds(i64::from(lead)),
            None => self.time,
        }
    }
}

// ============================================================================
// Trigger events
// ============================================================================

/// A scheduler decision that a unit of input is ready. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    instant_time: DateTime<Utc>,
    lead_time_seconds: Option<i32>,
    source_location: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bundle_paths: BTreeMap<i32, String>,
}

impl TriggerEvent {
    pub(crate) fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            instant_time: candidate.time,
            lead_time_seconds: candidate.lead_secs,
            source_location: candidate.path.to_string_lossy().to_string(),
            bundle_paths: BTreeMap::new(),
        }
    }

    pub(crate) fn bundle(
        gen_time: DateTime<Utc>,
        source_location: String,
        bundle_paths: BTreeMap<i32, String>,
    ) -> Self {
        Self {
            instant_time: gen_time,
            lead_time_seconds: None,
            source_location,
            bundle_paths,
        }
    }

    pub fn instant_time(&self) -> DateTime<Utc> {
        self.instant_time
    }

    pub fn lead_time_seconds(&self) -> Option<i32> {
        self.lead_time_seconds
    }

    pub fn source_location(&self) -> &str {
        &self.source_location
    }

    /// Resolved lead paths of a forecast bundle, keyed by lead seconds.
    /// Empty for the other trigger modes.
    pub fn bundle_paths(&self) -> &BTreeMap<i32, String> {
        &self.bundle_paths
    }
}

//! Configuration for a trigger session

use crate::error::{Result, TriggerError};
use crate::types::{OperatingMode, TriggerMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const DEFAULT_POLL_DELAY_MS: u64 = 5000;
pub const DEFAULT_MAX_PENDING_BUNDLES: usize = 8;
pub const DEFAULT_LDATA_FILE_NAME: &str = "_latest_data_info.json";

/// Main configuration for one watch session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Directory being watched
    pub location: String,

    pub trigger_mode: TriggerMode,

    pub operating_mode: OperatingMode,

    /// Inclusive start of the archive interval
    #[serde(default)]
    pub archive_start: Option<DateTime<Utc>>,

    /// Inclusive end of the archive interval
    #[serde(default)]
    pub archive_end: Option<DateTime<Utc>>,

    /// Realtime candidates older than this are discarded (None = unbounded)
    #[serde(default)]
    pub max_valid_age_secs: Option<u64>,

    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    /// Margin used by the input reader when resolving an exact instant
    #[serde(default)]
    pub search_margin_secs: u64,

    /// Drain available candidates and keep only the newest
    #[serde(default)]
    pub latest_only: bool,

    /// Lead set a forecast bundle must cover before it fires
    #[serde(default)]
    pub expected_leads: Option<ExpectedLeads>,

    #[serde(default = "default_max_pending_bundles")]
    pub max_pending_bundles: usize,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub subsample: SubsampleConfig,

    /// Only these lead times are surfaced (None = all)
    #[serde(default)]
    pub accepted_leads: Option<BTreeSet<i32>>,

    /// Only files with this extension are considered
    #[serde(default)]
    pub search_ext: Option<String>,

    #[serde(default)]
    pub pointer_source: PointerSourceKind,

    #[serde(default = "default_ldata_file_name")]
    pub ldata_file_name: String,

    /// Persist the last handed-out key under this label so a restarted
    /// realtime session resumes after it
    #[serde(default)]
    pub save_read_state: Option<String>,

    /// Directory for read-state files (None = system temp dir)
    #[serde(default)]
    pub read_state_dir: Option<String>,

    #[serde(default)]
    pub debug: bool,
}

fn default_poll_delay_ms() -> u64 {
    DEFAULT_POLL_DELAY_MS
}

fn default_max_pending_bundles() -> usize {
    DEFAULT_MAX_PENDING_BUNDLES
}

fn default_ldata_file_name() -> String {
    DEFAULT_LDATA_FILE_NAME.to_string()
}

/// Expected lead set of a forecast bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedLeads {
    /// Exact set of lead seconds
    Exact(BTreeSet<i32>),
    /// `count` leads starting at `min_lead`, spaced by `interval`
    Series {
        min_lead: i32,
        count: u32,
        interval: i32,
    },
}

/// Largest lead series accepted; one per second over a day.
const MAX_SERIES_LEN: u32 = 86_400;

impl ExpectedLeads {
    /// Check that a series fits in `i32` lead seconds.
    pub fn validate(&self) -> Result<()> {
        let Self::Series {
            min_lead,
            count,
            interval,
        } = self
        else {
            return Ok(());
        };
        if *count == 0 || (*count > 1 && *interval <= 0) {
            return Err(TriggerError::Config(
                "expected_leads series needs count > 0 and a positive interval".into(),
            ));
        }
        if *count > MAX_SERIES_LEN {
            return Err(TriggerError::Config(format!(
                "expected_leads series count {} exceeds {}",
                count, MAX_SERIES_LEN
            )));
        }
        let last = interval
            .checked_mul(*count as i32 - 1)
            .and_then(|span| min_lead.checked_add(span));
        if last.is_none() {
            return Err(TriggerError::Config(
                "expected_leads series overflows the lead-time range".into(),
            ));
        }
        Ok(())
    }

    pub fn resolve(&self) -> BTreeSet<i32> {
        match self {
            Self::Exact(leads) => leads.clone(),
            Self::Series {
                min_lead,
                count,
                interval,
            } => (0..*count as i64)
                .map(|i| (*min_lead as i64 + i * *interval as i64) as i32)
                .collect(),
        }
    }
}

/// How a realtime forecast-directory watcher finds new generations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryConfig {
    /// Poll for the generation predicted from the production schedule
    Proactive {
        gen_interval_secs: u64,
        #[serde(default)]
        gen_offset_secs: u64,
    },
    /// Accept whatever generation the source reports as newest
    Reactive {
        /// Fire an incomplete bundle after this long without a new lead
        #[serde(default)]
        quiet_period_secs: Option<u64>,
    },
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::Reactive {
            quiet_period_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsampleConfig {
    #[default]
    All,
    /// Accept instants on a `interval_secs` grid shifted by `offset_secs`
    Grid {
        interval_secs: u64,
        #[serde(default)]
        offset_secs: u64,
    },
    /// Accept instants at least `secs` after the previously accepted one
    MinSpacing { secs: u64 },
}

/// Which latest-data source a realtime session reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerSourceKind {
    /// Producer-maintained pointer file in the location
    #[default]
    LdataFile,
    /// Scan the directory tree itself
    DirectoryScan,
}

impl TriggerConfig {
    /// Minimal config with defaults for everything optional.
    pub fn new(
        location: impl Into<String>,
        trigger_mode: TriggerMode,
        operating_mode: OperatingMode,
    ) -> Self {
        Self {
            location: location.into(),
            trigger_mode,
            operating_mode,
            archive_start: None,
            archive_end: None,
            max_valid_age_secs: None,
            poll_delay_ms: DEFAULT_POLL_DELAY_MS,
            search_margin_secs: 0,
            latest_only: false,
            expected_leads: None,
            max_pending_bundles: DEFAULT_MAX_PENDING_BUNDLES,
            discovery: DiscoveryConfig::default(),
            subsample: SubsampleConfig::default(),
            accepted_leads: None,
            search_ext: None,
            pointer_source: PointerSourceKind::default(),
            ldata_file_name: default_ldata_file_name(),
            save_read_state: None,
            read_state_dir: None,
            debug: false,
        }
    }

    /// Archive config over the closed interval `[start, end]`.
    pub fn archive(
        location: impl Into<String>,
        trigger_mode: TriggerMode,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let mut config = Self::new(location, trigger_mode, OperatingMode::Archive);
        config.archive_start = Some(start);
        config.archive_end = Some(end);
        config
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TriggerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Archive interval, when the session is in archive mode.
    pub fn archive_interval(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.operating_mode, self.archive_start, self.archive_end) {
            (OperatingMode::Archive, Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    /// Check every construction-time rule.
    ///
    /// Does not touch the filesystem; the engine checks the location.
    pub fn validate(&self) -> Result<()> {
        if self.location.trim().is_empty() {
            return Err(TriggerError::Config("location must not be empty".into()));
        }

        match self.operating_mode {
            OperatingMode::Archive => {
                let (start, end) = match (self.archive_start, self.archive_end) {
                    (Some(start), Some(end)) => (start, end),
                    _ => {
                        return Err(TriggerError::Config(
                            "archive mode requires both archive_start and archive_end".into(),
                        ))
                    }
                };
                if start > end {
                    return Err(TriggerError::InvalidInterval {
                        start: start.to_rfc3339(),
                        end: end.to_rfc3339(),
                    });
                }
                if self.max_valid_age_secs.is_some() {
                    return Err(TriggerError::Config(
                        "max_valid_age_secs applies to realtime mode only".into(),
                    ));
                }
                if self.latest_only {
                    return Err(TriggerError::Config(
                        "latest_only applies to realtime mode only".into(),
                    ));
                }
                if self.save_read_state.is_some() {
                    return Err(TriggerError::Config(
                        "save_read_state applies to realtime mode only".into(),
                    ));
                }
            }
            OperatingMode::Realtime => {
                if self.archive_start.is_some() || self.archive_end.is_some() {
                    return Err(TriggerError::Config(
                        "archive_start/archive_end require archive mode".into(),
                    ));
                }
                if self.poll_delay_ms == 0 {
                    return Err(TriggerError::Config("poll_delay_ms must be positive".into()));
                }
            }
        }

        match self.trigger_mode {
            TriggerMode::ForecastBundle => {
                let leads = self.expected_leads.as_ref().ok_or_else(|| {
                    TriggerError::Config("forecast_bundle mode requires expected_leads".into())
                })?;
                leads.validate()?;
                if leads.resolve().is_empty() {
                    return Err(TriggerError::Config("expected_leads must not be empty".into()));
                }
                if self.max_pending_bundles == 0 {
                    return Err(TriggerError::Config(
                        "max_pending_bundles must be positive".into(),
                    ));
                }
                if self.latest_only {
                    return Err(TriggerError::Config(
                        "latest_only is not meaningful in forecast_bundle mode".into(),
                    ));
                }
            }
            TriggerMode::Observation => {
                if self.accepted_leads.is_some() {
                    return Err(TriggerError::Config(
                        "accepted_leads requires a forecast trigger mode".into(),
                    ));
                }
            }
            TriggerMode::ForecastLead => {}
        }

        if let Some(label) = &self.save_read_state {
            if label.trim().is_empty() {
                return Err(TriggerError::Config("save_read_state label must not be empty".into()));
            }
        }

        if let DiscoveryConfig::Proactive {
            gen_interval_secs, ..
        } = self.discovery
        {
            if gen_interval_secs == 0 {
                return Err(TriggerError::Config(
                    "proactive discovery needs a positive gen_interval_secs".into(),
                ));
            }
        }

        match self.subsample {
            SubsampleConfig::Grid { interval_secs, .. } if interval_secs == 0 => Err(
                TriggerError::Config("subsample grid interval must be positive".into()),
            ),
            _ => Ok(()),
        }
    }
}

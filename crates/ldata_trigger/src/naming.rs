//! Time-stamped file naming conventions
//!
//! Producers write data under a location using one of these layouts:
//!
//! ```text
//! <loc>/yyyymmdd/hhmmss[.ext]                  observation, day directories
//! <loc>/[yyyymmdd/]*yyyymmdd_hhmmss*           observation, time in the name
//! <loc>/yyyymmdd/g_hhmmss/f_llllllll[.ext]     forecast, lead in seconds
//! ```
//!
//! Times are UTC. Names beginning with `.` are never data.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static DAY_DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());
static GEN_DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^g_(\d{2})(\d{2})(\d{2})$").unwrap());
static LEAD_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^f_(\d{8})").unwrap());
static HHMMSS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})(\d{2})").unwrap());
static DATETIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})(\d{2})(\d{2})[_T]?(\d{2})(\d{2})(\d{2})").unwrap()
});

/// Times recovered from a data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedName {
    /// Generation time for forecasts, observation time otherwise
    pub time: DateTime<Utc>,
    pub lead_secs: Option<i32>,
}

fn capture_u32(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Parse a `yyyymmdd` day directory name.
pub fn parse_day_dir(name: &str) -> Option<NaiveDate> {
    let caps = DAY_DIR_RE.captures(name)?;
    NaiveDate::from_ymd_opt(
        capture_u32(&caps, 1)? as i32,
        capture_u32(&caps, 2)?,
        capture_u32(&caps, 3)?,
    )
}

/// Parse a `g_hhmmss` generation directory name.
pub fn parse_gen_dir(name: &str) -> Option<NaiveTime> {
    let caps = GEN_DIR_RE.captures(name)?;
    NaiveTime::from_hms_opt(
        capture_u32(&caps, 1)?,
        capture_u32(&caps, 2)?,
        capture_u32(&caps, 3)?,
    )
}

/// Parse the lead seconds of an `f_llllllll` file name.
pub fn parse_lead_file(name: &str) -> Option<i32> {
    let caps = LEAD_FILE_RE.captures(name)?;
    caps.get(1)?.as_str().parse().ok()
}

fn parse_hhmmss_prefix(name: &str) -> Option<NaiveTime> {
    let caps = HHMMSS_RE.captures(name)?;
    NaiveTime::from_hms_opt(
        capture_u32(&caps, 1)?,
        capture_u32(&caps, 2)?,
        capture_u32(&caps, 3)?,
    )
}

fn parse_embedded_datetime(name: &str) -> Option<DateTime<Utc>> {
    let caps = DATETIME_RE.captures(name)?;
    let date = NaiveDate::from_ymd_opt(
        capture_u32(&caps, 1)? as i32,
        capture_u32(&caps, 2)?,
        capture_u32(&caps, 3)?,
    )?;
    let time = NaiveTime::from_hms_opt(
        capture_u32(&caps, 4)?,
        capture_u32(&caps, 5)?,
        capture_u32(&caps, 6)?,
    )?;
    Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

fn component(path: Option<&Path>) -> Option<&str> {
    path?.file_name()?.to_str()
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Recover the data time (and lead, for forecasts) from a path.
pub fn parse_path(path: &Path) -> Option<ParsedName> {
    let name = component(Some(path))?;
    if is_hidden(name) {
        return None;
    }
    let parent = path.parent();
    let parent_name = component(parent);
    let grandparent_name = component(parent.and_then(Path::parent));

    if let (Some(lead), Some(gen_dir), Some(day_dir)) = (
        parse_lead_file(name),
        parent_name.and_then(parse_gen_dir),
        grandparent_name.and_then(parse_day_dir),
    ) {
        return Some(ParsedName {
            time: Utc.from_utc_datetime(&NaiveDateTime::new(day_dir, gen_dir)),
            lead_secs: Some(lead),
        });
    }

    if let Some(time) = parse_embedded_datetime(name) {
        return Some(ParsedName {
            time,
            lead_secs: None,
        });
    }

    let day = parent_name.and_then(parse_day_dir)?;
    let time = parse_hhmmss_prefix(name)?;
    Some(ParsedName {
        time: Utc.from_utc_datetime(&NaiveDateTime::new(day, time)),
        lead_secs: None,
    })
}

/// Whether `path` passes an optional extension filter.
///
/// The filter may be given with or without its leading dot.
pub fn has_ext(path: &Path, ext: Option<&str>) -> bool {
    match ext {
        None => true,
        Some(wanted) => {
            let wanted = wanted.trim_start_matches('.');
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| e == wanted)
                .unwrap_or(false)
        }
    }
}

pub fn day_dir_name(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d").to_string()
}

pub fn gen_dir_name(gen_time: DateTime<Utc>) -> String {
    format!("g_{}", gen_time.format("%H%M%S"))
}

fn with_ext(stem: String, ext: Option<&str>) -> String {
    match ext {
        Some(ext) if !ext.is_empty() => format!("{}.{}", stem, ext.trim_start_matches('.')),
        _ => stem,
    }
}

/// Canonical observation path: `<loc>/yyyymmdd/hhmmss[.ext]`.
pub fn observation_path(location: &Path, time: DateTime<Utc>, ext: Option<&str>) -> PathBuf {
    location
        .join(day_dir_name(time))
        .join(with_ext(time.format("%H%M%S").to_string(), ext))
}

/// Canonical forecast path: `<loc>/yyyymmdd/g_hhmmss/f_llllllll[.ext]`.
pub fn forecast_path(
    location: &Path,
    gen_time: DateTime<Utc>,
    lead_secs: i32,
    ext: Option<&str>,
) -> PathBuf {
    location
        .join(day_dir_name(gen_time))
        .join(gen_dir_name(gen_time))
        .join(with_ext(format!("f_{:08}", lead_secs), ext))
}

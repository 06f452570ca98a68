//! Command-line surface shared by the watch tools
//!
//! Arguments follow the single-dash style of the LROSE tools
//! (`-interval <start> <end>`, `-params file`). Parsing never exits the
//! process; the binary decides what to do with `Help` and errors.

use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::types::{OperatingMode, TriggerMode};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: ldata-watch [options]

Options:
  -h, --, -help             Print this usage and exit
  -d, -debug                Log every candidate at info level
  -v, -verbose              Verbose logging
  -dir <location>           Directory to watch
  -params <config.toml>     Load session settings from a TOML file
  -mode obs|bundle|lead     Trigger mode (default obs)
  -interval <start> <end>   Archive mode over the closed interval
  -start <time>             Archive start (requires -end)
  -end <time>               Archive end (requires -start)
  -nowait                   Realtime: return at once when nothing is new
  -latest_only              Realtime: skip to the newest available data
  -max_age <secs>           Realtime: ignore data older than this

Times: yyyymmddhhmmss, \"yyyy mm dd hh mm ss\" or yyyy-mm-ddThh:mm:ss[Z]
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Help,
    Run(CliArgs),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub debug: bool,
    pub verbose: bool,
    pub dir: Option<String>,
    pub params: Option<PathBuf>,
    pub mode: Option<TriggerMode>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub nowait: bool,
    pub latest_only: bool,
    pub max_age_secs: Option<u64>,
}

pub fn parse_args<I>(args: I) -> Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--" | "-help" => return Ok(CliCommand::Help),
            "-d" | "-debug" => parsed.debug = true,
            "-v" | "-verbose" => parsed.verbose = true,
            "-dir" => parsed.dir = Some(next_arg(&mut args, "-dir")?),
            "-params" => parsed.params = Some(PathBuf::from(next_arg(&mut args, "-params")?)),
            "-mode" => parsed.mode = Some(parse_mode(&next_arg(&mut args, "-mode")?)?),
            "-interval" => {
                parsed.start = Some(parse_time(&next_arg(&mut args, "-interval")?)?);
                parsed.end = Some(parse_time(&next_arg(&mut args, "-interval")?)?);
            }
            "-start" => parsed.start = Some(parse_time(&next_arg(&mut args, "-start")?)?),
            "-end" => parsed.end = Some(parse_time(&next_arg(&mut args, "-end")?)?),
            "-nowait" => parsed.nowait = true,
            "-latest_only" => parsed.latest_only = true,
            "-max_age" => {
                let value = next_arg(&mut args, "-max_age")?;
                let secs = value
                    .parse()
                    .map_err(|_| TriggerError::Config(format!("Invalid -max_age: {}", value)))?;
                parsed.max_age_secs = Some(secs);
            }
            other => return Err(TriggerError::Config(format!("Unknown arg: {}", other))),
        }
    }

    match (parsed.start, parsed.end) {
        (Some(start), Some(end)) if start > end => {
            return Err(TriggerError::InvalidInterval {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            })
        }
        (Some(_), None) => return Err(TriggerError::Config("-start requires -end".into())),
        (None, Some(_)) => return Err(TriggerError::Config("-end requires -start".into())),
        _ => {}
    }

    Ok(CliCommand::Run(parsed))
}

fn next_arg(args: &mut impl Iterator<Item = String>, name: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| TriggerError::Config(format!("Missing value for {}", name)))
}

fn parse_mode(value: &str) -> Result<TriggerMode> {
    match value {
        "obs" | "observation" => Ok(TriggerMode::Observation),
        "bundle" | "forecast_bundle" => Ok(TriggerMode::ForecastBundle),
        "lead" | "forecast_lead" => Ok(TriggerMode::ForecastLead),
        _ => Err(TriggerError::Config(format!("Invalid -mode: {}", value))),
    }
}

/// Parse a command-line time. All times are UTC.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    let squeezed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    for format in ["%Y%m%d%H%M%S", "%Y %m %d %H %M %S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&squeezed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(TriggerError::Config(format!("Invalid time: {}", value)))
}

impl CliArgs {
    pub fn is_archive(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Session config: `-params` file (if any) overridden by the flags.
    pub fn to_config(&self) -> Result<TriggerConfig> {
        let mut config = match (&self.params, &self.dir) {
            (Some(path), _) => TriggerConfig::load(path)?,
            (None, Some(dir)) => TriggerConfig::new(
                dir.clone(),
                TriggerMode::Observation,
                OperatingMode::Realtime,
            ),
            (None, None) => {
                return Err(TriggerError::Config(
                    "No location: give -dir or -params".into(),
                ))
            }
        };

        if let Some(dir) = &self.dir {
            config.location = dir.clone();
        }
        if let Some(mode) = self.mode {
            config.trigger_mode = mode;
        }
        if self.debug {
            config.debug = true;
        }
        if self.latest_only {
            config.latest_only = true;
        }

        if let (Some(start), Some(end)) = (self.start, self.end) {
            config.operating_mode = OperatingMode::Archive;
            config.archive_start = Some(start);
            config.archive_end = Some(end);
            config.max_valid_age_secs = None;
        } else if let Some(age) = self.max_age_secs {
            config.max_valid_age_secs = Some(age);
        }

        Ok(config)
    }
}

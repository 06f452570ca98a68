//! LDATA Trigger - Data-Availability Scheduler
//!
//! Decides when a unit of input data (a timestamped observation file, or a
//! forecast product identified by generation time and lead time) is ready to
//! be processed, and hands the consumer a trigger. Works against a live
//! location (realtime) or a historical time interval (archive).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────┐     ┌───────────────┐     ┌─────────────┐
//! │ Watcher          │     │ BundleTracker │     │ Subsample     │     │ Trigger     │
//! │ (pointer source  │────▶│ (bundle mode  │────▶│ Filter        │────▶│ Engine      │──▶ InputReader
//! │  or archive)     │     │  only)        │     │               │     │             │
//! └──────────────────┘     └───────────────┘     └───────────────┘     └─────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Trigger mode**: observation, forecast bundle (all leads of a
//!   generation) or forecast lead (every generation/lead pair)
//! - **Operating mode**: realtime polling or archive replay
//! - **Latest pointer**: producer-maintained record of the newest data
//! - **Heartbeat**: callback invoked once per empty blocking poll

pub mod bundle;
pub mod cli;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod naming;
pub mod pointer;
pub mod reader;
pub mod subsample;
pub mod types;
pub mod watcher;

// Re-exports for convenience
pub use bundle::{BundleStats, BundleTracker, FiredBundle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DiscoveryConfig, ExpectedLeads, PointerSourceKind, SubsampleConfig, TriggerConfig,
};
pub use engine::{Heartbeat, TriggerEngine};
pub use error::{Result, TriggerError};
pub use indexer::{ArchiveCursor, ArchiveIndexer};
pub use pointer::{LatestPointerSource, LdataFile, PointerRecord, ReadStateFile};
pub use reader::{DataReader, InputReader, RawFileReader, ReadResult};
pub use subsample::SubsampleFilter;
pub use types::{ArrivalKey, Candidate, OperatingMode, TriggerEvent, TriggerMode};
pub use watcher::{CancelToken, Watcher};

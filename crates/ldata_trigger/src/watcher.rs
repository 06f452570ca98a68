//! Low-level polling primitive
//!
//! A [`Watcher`] wraps either a realtime [`LatestPointerSource`] or an
//! [`ArchiveCursor`] and hands out one candidate at a time.
//!
//! # Realtime semantics
//!
//! - `poll_once` never sleeps. Source I/O errors and malformed records are
//!   logged and count as "no candidate".
//! - `next_blocking` is the only place in the crate that suspends: one
//!   heartbeat, then one sleep of `poll_delay`, per empty poll.
//! - Candidates older than `now - max_valid_age` are dropped silently. A
//!   candidate exactly at the boundary is still valid.
//! - Successive candidates have strictly increasing keys (high-water mark),
//!   except for bundle sessions, which deduplicate by seen key so that
//!   out-of-order leads of one generation all get through.
//! - With a [`ReadStateFile`] attached, the high-water mark is restored at
//!   startup and saved after every emit.

use crate::clock::Clock;
use crate::error::{Result, SourceError, TriggerError};
use crate::indexer::ArchiveCursor;
use crate::pointer::{LatestPointerSource, ReadStateFile};
use crate::types::{ArrivalKey, Candidate};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked once per blocking poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a realtime watcher decides a candidate has not been handed out yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Only keys above the last emitted key are new
    HighWater,
    /// Any key not emitted before is new
    SeenSet,
}

/// Realtime watch state, owned by exactly one watcher.
#[derive(Debug, Clone)]
pub struct WatchState {
    pub location: PathBuf,
    pub last_emitted: Option<ArrivalKey>,
    pub max_valid_age: Option<Duration>,
    pub poll_delay: std::time::Duration,
}

struct RealtimeBackend {
    source: Box<dyn LatestPointerSource>,
    state: WatchState,
    dedup: DedupPolicy,
    seen: BTreeSet<ArrivalKey>,
    queue: VecDeque<Candidate>,
    read_state: Option<ReadStateFile>,
}

impl RealtimeBackend {
    fn is_new(&self, key: &ArrivalKey) -> bool {
        match self.dedup {
            DedupPolicy::HighWater => self.state.last_emitted.map_or(true, |last| *key > last),
            DedupPolicy::SeenSet => !self.seen.contains(key),
        }
    }

    fn is_stale(&self, candidate: &Candidate, now: DateTime<Utc>) -> bool {
        match self.state.max_valid_age {
            Some(age) => candidate.time < now - age,
            None => false,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        match self.source.poll(now) {
            Ok(found) => {
                for candidate in found {
                    if self.is_new(&candidate.key()) {
                        self.queue.push_back(candidate);
                    }
                }
            }
            Err(SourceError::Io(e)) => {
                debug!(
                    location = %self.state.location.display(),
                    source = self.source.label(),
                    error = %e,
                    "Transient error reading latest-data source"
                );
            }
            Err(SourceError::Malformed(msg)) => {
                warn!(
                    location = %self.state.location.display(),
                    source = self.source.label(),
                    "Malformed latest-data record: {}", msg
                );
            }
        }
    }

    fn record(&mut self, candidate: &Candidate) {
        let key = candidate.key();
        if self.state.last_emitted.map_or(true, |last| key > last) {
            self.state.last_emitted = Some(key);
        }
        match self.dedup {
            DedupPolicy::SeenSet => {
                self.seen.insert(key);
            }
            DedupPolicy::HighWater => self.persist(key, &candidate.path),
        }
    }

    fn persist(&self, key: ArrivalKey, path: &Path) {
        if let Some(read_state) = &self.read_state {
            if let Err(e) = read_state.save(key, path) {
                warn!(
                    file = %read_state.path().display(),
                    error = %e,
                    "Cannot save read state"
                );
            }
        }
    }
}

enum Backend {
    Realtime(RealtimeBackend),
    Archive(ArchiveCursor),
}

pub struct Watcher {
    backend: Backend,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    debug: bool,
}

impl Watcher {
    pub fn realtime(
        location: impl Into<PathBuf>,
        source: Box<dyn LatestPointerSource>,
        poll_delay: std::time::Duration,
        dedup: DedupPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend: Backend::Realtime(RealtimeBackend {
                source,
                state: WatchState {
                    location: location.into(),
                    last_emitted: None,
                    max_valid_age: None,
                    poll_delay,
                },
                dedup,
                seen: BTreeSet::new(),
                queue: VecDeque::new(),
                read_state: None,
            }),
            clock,
            cancel: CancelToken::new(),
            debug: false,
        }
    }

    /// Attach a read-state file and resume after the key it holds.
    ///
    /// Returns the restored key. High-water sessions skip everything at or
    /// below it; bundle sessions get it back to seed their tracker.
    pub fn attach_read_state(&mut self, read_state: ReadStateFile) -> Result<Option<ArrivalKey>> {
        let Backend::Realtime(rt) = &mut self.backend else {
            return Err(TriggerError::not_applicable(
                "attach_read_state",
                "archive mode replays a fixed interval",
            ));
        };
        let restored = match read_state.load() {
            Ok(key) => key,
            Err(e) => {
                warn!(file = %read_state.path().display(), error = %e, "Ignoring unreadable read state");
                None
            }
        };
        if let Some(key) = restored {
            info!(key = %key, "Resuming after saved read state");
            rt.state.last_emitted = Some(key);
        }
        rt.read_state = Some(read_state);
        Ok(restored)
    }

    /// Save `key` to the attached read-state file, if any.
    pub fn mark_read(&mut self, key: ArrivalKey, path: &Path) {
        if let Backend::Realtime(rt) = &self.backend {
            rt.persist(key, path);
        }
    }

    pub fn archive(cursor: ArchiveCursor, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Backend::Archive(cursor),
            clock,
            cancel: CancelToken::new(),
            debug: false,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.backend, Backend::Archive(_))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Realtime watch state; `None` for archive watchers.
    pub fn state(&self) -> Option<&WatchState> {
        match &self.backend {
            Backend::Realtime(rt) => Some(&rt.state),
            Backend::Archive(_) => None,
        }
    }

    pub fn location(&self) -> Option<&Path> {
        self.state().map(|s| s.location.as_path())
    }

    /// Read the source once (realtime) or advance the cursor (archive).
    pub fn poll_once(&mut self) -> Option<Candidate> {
        let now = self.clock.now();
        let candidate = match &mut self.backend {
            Backend::Archive(cursor) => cursor.next(),
            Backend::Realtime(rt) => {
                if rt.queue.is_empty() {
                    rt.refill(now);
                }
                let mut picked = None;
                while let Some(candidate) = rt.queue.pop_front() {
                    if rt.is_stale(&candidate, now) {
                        debug!(key = %candidate.key(), "Discarding candidate older than max valid age");
                        continue;
                    }
                    // A restarted source may repeat what is already queued
                    if !rt.is_new(&candidate.key()) {
                        continue;
                    }
                    rt.record(&candidate);
                    picked = Some(candidate);
                    break;
                }
                picked
            }
        };

        if let Some(candidate) = &candidate {
            if self.debug {
                info!(key = %candidate.key(), path = %candidate.path.display(), "Candidate");
            } else {
                debug!(key = %candidate.key(), path = %candidate.path.display(), "Candidate");
            }
        }
        candidate
    }

    /// Block until a new candidate appears.
    ///
    /// Returns `Ok(None)` only when the cancel token fires.
    pub fn next_blocking(&mut self, heartbeat: &mut dyn FnMut(&str)) -> Result<Option<Candidate>> {
        if self.is_archive() {
            return Err(TriggerError::not_applicable(
                "next_blocking",
                "archive mode never blocks",
            ));
        }
        loop {
            if let Some(candidate) = self.poll_once() {
                return Ok(Some(candidate));
            }
            if !self.wait_cycle(heartbeat) {
                return Ok(None);
            }
        }
    }

    /// One poll, no sleep; the caller owns the retry policy.
    pub fn next_non_blocking(&mut self) -> Result<Option<Candidate>> {
        if self.is_archive() {
            return Err(TriggerError::not_applicable(
                "next_non_blocking",
                "archive mode has no realtime source",
            ));
        }
        Ok(self.poll_once())
    }

    /// Heartbeat, then sleep one poll delay. Returns false, without
    /// heartbeat or sleep, once cancelled.
    pub fn wait_cycle(&self, heartbeat: &mut dyn FnMut(&str)) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if let Backend::Realtime(rt) = &self.backend {
            heartbeat(&format!("Watcher::next_blocking {}", rt.source.label()));
            self.clock.sleep(rt.state.poll_delay);
        }
        true
    }

    pub fn set_max_valid_age(&mut self, seconds: u64) -> Result<()> {
        match &mut self.backend {
            Backend::Realtime(rt) => {
                rt.state.max_valid_age = Some(Duration::seconds(seconds as i64));
                Ok(())
            }
            Backend::Archive(_) => Err(TriggerError::not_applicable(
                "set_max_valid_age",
                "archive mode replays a fixed interval",
            )),
        }
    }

    pub fn set_poll_delay(&mut self, delay: std::time::Duration) {
        if let Backend::Realtime(rt) = &mut self.backend {
            rt.state.poll_delay = delay;
        }
    }

    /// Keys held for seen-set deduplication.
    pub fn seen_count(&self) -> usize {
        match &self.backend {
            Backend::Realtime(rt) => rt.seen.len(),
            Backend::Archive(_) => 0,
        }
    }

    /// Drop seen-set entries for instants before `time`.
    pub fn forget_before(&mut self, time: DateTime<Utc>) {
        if let Backend::Realtime(rt) = &mut self.backend {
            rt.seen = rt.seen.split_off(&ArrivalKey {
                time,
                lead_secs: None,
            });
        }
    }

    /// Next group of archive entries sharing one instant time.
    pub fn next_archive_group(&mut self) -> Option<Vec<Candidate>> {
        match &mut self.backend {
            Backend::Archive(cursor) => cursor.next_group(),
            Backend::Realtime(_) => None,
        }
    }

    pub fn rewind(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Archive(cursor) => {
                cursor.rewind();
                info!("Archive cursor rewound");
                Ok(())
            }
            Backend::Realtime(_) => Err(TriggerError::not_applicable(
                "rewind",
                "only archive sessions can be rewound",
            )),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match &self.backend {
            Backend::Archive(cursor) => cursor.is_exhausted(),
            Backend::Realtime(_) => false,
        }
    }
}

//! Process registry: live PIDs, PID to UID resolution and per-PID CPU ticks.
//!
//! The engines only see the read-only [`ProcessRegistry`] trait. The
//! production implementation, [`CachedRegistry`], serves lookups from two
//! snapshots (pid→uid and pid→times) that background refreshers rebuild on
//! independent timers. A refresh builds the complete new map outside the
//! lock and swaps it in under a short write lock, so readers always see a
//! whole snapshot.

pub mod procfs;
pub mod shell;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::{PowerError, Result};
use crate::sample::Uid;

pub use procfs::ProcfsReader;
pub use shell::ShellReader;

/// Cumulative user and system CPU ticks of one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidTimes {
    pub usr: u64,
    pub sys: u64,
}

/// Read-only view of the running processes.
pub trait ProcessRegistry: Send + Sync {
    /// Live PIDs in ascending order.
    fn live_pids(&self) -> Vec<u32>;

    /// UID owning `pid`, `None` when unknown or exited.
    fn uid_for_pid(&self, pid: u32) -> Option<Uid>;

    /// Cumulative CPU ticks of `pid`, `None` when unreadable.
    fn pid_times(&self, pid: u32) -> Option<PidTimes>;
}

/// Which of the two caches a refresher maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Uids,
    Times,
}

impl RefreshKind {
    pub fn name(self) -> &'static str {
        match self {
            RefreshKind::Uids => "uids",
            RefreshKind::Times => "times",
        }
    }
}

#[derive(Debug, Default)]
struct UidSnapshot {
    uids: HashMap<u32, Uid>,
}

#[derive(Debug, Default)]
struct TimesSnapshot {
    pids: Vec<u32>,
    times: HashMap<u32, PidTimes>,
}

/// Bookkeeping about the last refresh of each cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub uid_entries: usize,
    pub times_entries: usize,
    pub uid_refresh_duration: Duration,
    pub times_refresh_duration: Duration,
    pub last_uid_refresh: Option<Instant>,
    pub last_times_refresh: Option<Instant>,
}

/// Snapshot backed [`ProcessRegistry`].
#[derive(Debug)]
pub struct CachedRegistry {
    uids: RwLock<Arc<UidSnapshot>>,
    times: RwLock<Arc<TimesSnapshot>>,
    stats: RwLock<RegistryStats>,
    max_processes: usize,
}

impl CachedRegistry {
    pub fn new(max_processes: usize) -> Self {
        Self {
            uids: RwLock::new(Arc::new(UidSnapshot::default())),
            times: RwLock::new(Arc::new(TimesSnapshot::default())),
            stats: RwLock::new(RegistryStats::default()),
            max_processes,
        }
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    /// Replaces the pid→uid snapshot. Entries beyond `max_processes`
    /// (highest PIDs first) are dropped.
    pub fn replace_uids(&self, mut uids: HashMap<u32, Uid>) {
        if uids.len() > self.max_processes {
            let mut pids: Vec<u32> = uids.keys().copied().collect();
            pids.sort_unstable();
            for pid in &pids[self.max_processes..] {
                uids.remove(pid);
            }
        }
        let snapshot = Arc::new(UidSnapshot { uids });
        let entries = snapshot.uids.len();
        if let Ok(mut guard) = self.uids.write() {
            *guard = snapshot;
        }
        if let Ok(mut stats) = self.stats.write() {
            stats.uid_entries = entries;
        }
    }

    /// Replaces the pid→times snapshot; the live PID list is derived from it.
    pub fn replace_times(&self, times: HashMap<u32, PidTimes>) {
        let mut pids: Vec<u32> = times.keys().copied().collect();
        pids.sort_unstable();
        pids.truncate(self.max_processes);

        let mut times = times;
        if times.len() > pids.len() {
            times.retain(|pid, _| pids.binary_search(pid).is_ok());
        }

        let snapshot = Arc::new(TimesSnapshot { pids, times });
        let entries = snapshot.pids.len();
        if let Ok(mut guard) = self.times.write() {
            *guard = snapshot;
        }
        if let Ok(mut stats) = self.stats.write() {
            stats.times_entries = entries;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.read().map(|s| *s).unwrap_or_default()
    }

    fn record_refresh(&self, kind: RefreshKind, duration: Duration) {
        if let Ok(mut stats) = self.stats.write() {
            let now = Some(Instant::now());
            match kind {
                RefreshKind::Uids => {
                    stats.uid_refresh_duration = duration;
                    stats.last_uid_refresh = now;
                }
                RefreshKind::Times => {
                    stats.times_refresh_duration = duration;
                    stats.last_times_refresh = now;
                }
            }
        }
    }

    fn uid_snapshot(&self) -> Arc<UidSnapshot> {
        self.uids
            .read()
            .map(|guard| Arc::clone(&*guard))
            .unwrap_or_default()
    }

    fn times_snapshot(&self) -> Arc<TimesSnapshot> {
        self.times
            .read()
            .map(|guard| Arc::clone(&*guard))
            .unwrap_or_default()
    }
}

impl ProcessRegistry for CachedRegistry {
    fn live_pids(&self) -> Vec<u32> {
        self.times_snapshot().pids.clone()
    }

    fn uid_for_pid(&self, pid: u32) -> Option<Uid> {
        self.uid_snapshot().uids.get(&pid).copied()
    }

    fn pid_times(&self, pid: u32) -> Option<PidTimes> {
        self.times_snapshot().times.get(&pid).copied()
    }
}

/// Backend used by a refresher to read one of the caches.
pub enum RegistryReader {
    Procfs(ProcfsReader),
    Shell(ShellReader),
}

impl RegistryReader {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryReader::Procfs(_) => "procfs",
            RegistryReader::Shell(_) => "shell",
        }
    }

    pub async fn read_uids(&mut self, max: usize) -> Result<HashMap<u32, Uid>> {
        match self {
            RegistryReader::Procfs(reader) => reader.read_uids(max).await,
            RegistryReader::Shell(reader) => reader.read_uids(max).await,
        }
    }

    pub async fn read_times(&mut self, max: usize) -> Result<HashMap<u32, PidTimes>> {
        match self {
            RegistryReader::Procfs(reader) => reader.read_times(max).await,
            RegistryReader::Shell(reader) => reader.read_times(max).await,
        }
    }

    /// Releases the backend. Shell readers are told to exit and awaited.
    pub async fn shutdown(self) {
        match self {
            RegistryReader::Procfs(_) => {}
            RegistryReader::Shell(reader) => {
                if let Err(e) = reader.shutdown().await {
                    warn!("Shell reader did not shut down cleanly: {}", e);
                }
            }
        }
    }
}

/// Runs one refresh of `kind` and swaps the result into `registry`.
#[instrument(skip(registry, reader, kind), fields(kind = kind.name(), backend = reader.name()))]
pub async fn refresh_once(
    registry: &CachedRegistry,
    reader: &mut RegistryReader,
    kind: RefreshKind,
) -> Result<usize> {
    let start = Instant::now();
    let max = registry.max_processes();

    let entries = match kind {
        RefreshKind::Uids => {
            let uids = reader.read_uids(max).await?;
            let n = uids.len();
            registry.replace_uids(uids);
            n
        }
        RefreshKind::Times => {
            let times = reader.read_times(max).await?;
            let n = times.len();
            registry.replace_times(times);
            n
        }
    };

    let elapsed = start.elapsed();
    registry.record_refresh(kind, elapsed);
    debug!(
        "Registry {} refresh: {} entries in {:.2}ms",
        kind.name(),
        entries,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(entries)
}

/// Background task keeping one cache of `registry` fresh until `shutdown`
/// flips to `true`. The reader is shut down before the task returns.
pub async fn run_refresher(
    registry: Arc<CachedRegistry>,
    mut reader: RegistryReader,
    kind: RefreshKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Registry {} refresher started ({} backend, {}ms interval)",
        kind.name(),
        reader.name(),
        period.as_millis()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = refresh_once(&registry, &mut reader, kind).await {
                    warn!("Registry {} refresh failed: {}", kind.name(), e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    reader.shutdown().await;
    info!("Registry {} refresher stopped", kind.name());
}

/// Parses one `/proc/<pid>/stat` line into the PID and its user/system ticks.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_pid_stat(line: &str) -> Result<(u32, PidTimes)> {
    let malformed = || PowerError::Parse(format!("malformed stat record: {:?}", line));

    let open = line.find('(').ok_or_else(malformed)?;
    let close = line.rfind(')').ok_or_else(malformed)?;
    let pid: u32 = line[..open].trim().parse().map_err(|_| malformed())?;

    // after ")": state ppid pgrp session tty_nr tpgid flags minflt cminflt
    // majflt cmajflt utime stime
    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
    if fields.len() < 13 {
        return Err(malformed());
    }
    let usr = fields[11].parse().map_err(|_| malformed())?;
    let sys = fields[12].parse().map_err(|_| malformed())?;
    Ok((pid, PidTimes { usr, sys }))
}

/// Extracts the real UID from the content of `/proc/<pid>/status`.
pub fn parse_status_uid(content: &str) -> Option<Uid> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
        .map(Uid)
}

//! Direct `/proc` reader for the registry caches.

use ahash::AHashMap as HashMap;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use super::{parse_pid_stat, parse_status_uid, PidTimes};
use crate::counters::{CounterPaths, CounterSource};
use crate::error::{PowerError, Result};
use crate::sample::Uid;

/// Reads `/proc/<pid>/status` and `/proc/<pid>/stat` through a
/// [`CounterSource`], fanning out over the rayon pool on a blocking thread.
#[derive(Clone)]
pub struct ProcfsReader {
    source: Arc<dyn CounterSource>,
    paths: CounterPaths,
}

impl ProcfsReader {
    pub fn new(source: Arc<dyn CounterSource>, paths: CounterPaths) -> Self {
        Self { source, paths }
    }

    pub async fn read_uids(&mut self, max: usize) -> Result<HashMap<u32, Uid>> {
        let reader = self.clone();
        tokio::task::spawn_blocking(move || reader.collect_uids(max))
            .await
            .map_err(|e| PowerError::Reader(format!("uid scan task failed: {}", e)))?
    }

    pub async fn read_times(&mut self, max: usize) -> Result<HashMap<u32, PidTimes>> {
        let reader = self.clone();
        tokio::task::spawn_blocking(move || reader.collect_times(max))
            .await
            .map_err(|e| PowerError::Reader(format!("times scan task failed: {}", e)))?
    }

    fn pids(&self, max: usize) -> Result<Vec<u32>> {
        let mut pids = self.source.list_ids(&self.paths.proc_dir)?;
        pids.truncate(max);
        Ok(pids)
    }

    /// Blocking scan of every process' owner.
    pub fn collect_uids(&self, max: usize) -> Result<HashMap<u32, Uid>> {
        let pids = self.pids(max)?;
        Ok(pids
            .par_iter()
            .filter_map(|&pid| {
                // exited between listing and reading
                let content = self
                    .source
                    .read_text(&self.paths.pid_file(pid, "status"))
                    .ok()?;
                match parse_status_uid(&content) {
                    Some(uid) => Some((pid, uid)),
                    None => {
                        debug!("Dropping pid {}: no Uid line in status", pid);
                        None
                    }
                }
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect())
    }

    /// Blocking scan of every process' CPU ticks.
    pub fn collect_times(&self, max: usize) -> Result<HashMap<u32, PidTimes>> {
        let pids = self.pids(max)?;
        Ok(pids
            .par_iter()
            .filter_map(|&pid| {
                let content = self
                    .source
                    .read_text(&self.paths.pid_file(pid, "stat"))
                    .ok()?;
                match parse_pid_stat(content.trim_end()) {
                    Ok((_, times)) => Some((pid, times)),
                    Err(e) => {
                        debug!("Dropping pid {}: {}", pid, e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect())
    }
}

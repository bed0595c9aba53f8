//! CPU attribution engine.
//!
//! Every tick the engine reads per-core frequencies and the aggregate
//! `/proc/stat` counters, walks the live processes, and turns per-process
//! tick deltas into per-UID utilization percentages.
//!
//! Reading every process on every tick is wasteful on a phone, so each
//! process carries an inactivity counter. A process is stale, meaning due
//! for a real read, when `2^(ticks since last read) > inactive²`; otherwise
//! the read is skipped and the process counts as idle for the tick. Busy
//! processes are read every tick; a process idle for 20 reads is read again
//! roughly every 9 ticks.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::counters::{list_cores, read_cpu_times, CounterPaths, CounterSource};
use crate::power::PowerModel;
use crate::registry::{PidTimes, ProcessRegistry};
use crate::sample::{Iteration, Uid};

/// Utilization (usr + sys, percent) below which a read counts as inactive.
const ACTIVE_THRESHOLD_PERCENT: f64 = 0.1;

/// One CPU measurement for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub usr_perc: f64,
    pub sys_perc: f64,
    /// Per-core frequency in MHz, 0 for offline cores.
    pub freqs: Arc<[f64]>,
    /// Lowest table frequency keeping this load under 70 % if run alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solo_freq: Option<f64>,
}

/// `(usr%, sys%)` for the given deltas. The denominator is never smaller
/// than `du + ds`, so the sum stays within `[0, 100]`.
pub fn percentages(delta_usr: u64, delta_sys: u64, delta_total: u64) -> (f64, f64) {
    let busy = delta_usr.saturating_add(delta_sys);
    let denom = busy.max(delta_total).max(1) as f64;
    (
        100.0 * delta_usr as f64 / denom,
        100.0 * delta_sys as f64 / denom,
    )
}

/// Delta bookkeeping for one process, or for the whole system.
#[derive(Debug, Clone)]
pub struct ProcessState {
    uid: Uid,
    /// Last real reading.
    last: Option<PidTimes>,
    /// System total at the last read or skip, so `delta_total` spans one tick.
    last_total: u64,
    last_update_tick: u64,
    inactive: u32,
    delta_usr: u64,
    delta_sys: u64,
    delta_total: u64,
    alive_tick: Option<u64>,
}

impl ProcessState {
    pub fn new(uid: Uid, tick: u64) -> Self {
        Self {
            uid,
            last: None,
            last_total: 0,
            last_update_tick: tick,
            inactive: 0,
            delta_usr: 0,
            delta_sys: 0,
            delta_total: 1,
            alive_tick: None,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn has_reading(&self) -> bool {
        self.last.is_some()
    }

    pub fn inactive(&self) -> u32 {
        self.inactive
    }

    pub fn delta_usr(&self) -> u64 {
        self.delta_usr
    }

    pub fn delta_sys(&self) -> u64 {
        self.delta_sys
    }

    pub fn delta_total(&self) -> u64 {
        self.delta_total
    }

    /// Due for a real read: `2^(tick - last_update_tick) > inactive²`,
    /// saturating. A fresh (not stale) process is skipped this tick.
    pub fn is_stale(&self, tick: u64) -> bool {
        let gap = tick.saturating_sub(self.last_update_tick);
        let elapsed = 1u64.checked_shl(gap.min(64) as u32).unwrap_or(u64::MAX);
        let inactive = u64::from(self.inactive);
        elapsed > inactive * inactive
    }

    /// Whether the counters must really be read this tick.
    pub fn needs_read(&self, tick: u64) -> bool {
        !self.has_reading() || self.is_stale(tick)
    }

    /// Applies a real reading. The first reading is a baseline with zero
    /// deltas.
    pub fn update_state(&mut self, times: PidTimes, total: u64, tick: u64) {
        match self.last {
            Some(prev) => {
                self.delta_usr = times.usr.saturating_sub(prev.usr);
                self.delta_sys = times.sys.saturating_sub(prev.sys);
                self.delta_total = total.saturating_sub(self.last_total).max(1);
            }
            None => {
                self.delta_usr = 0;
                self.delta_sys = 0;
                self.delta_total = 1;
            }
        }
        self.last = Some(times);
        self.last_total = total;
        self.last_update_tick = tick;

        if self.usr_perc() + self.sys_perc() >= ACTIVE_THRESHOLD_PERCENT {
            self.inactive = 0;
        } else {
            self.inactive = self.inactive.saturating_add(1);
        }
        self.alive_tick = Some(tick);
    }

    /// Marks the process alive without reading it: no usage is attributed
    /// and `delta_total` spans the time since the previous tick.
    pub fn skip_read(&mut self, total: u64, tick: u64) {
        self.delta_usr = 0;
        self.delta_sys = 0;
        self.delta_total = total.saturating_sub(self.last_total).max(1);
        self.last_total = total;
        self.alive_tick = Some(tick);
    }

    pub fn is_alive(&self, tick: u64) -> bool {
        self.alive_tick == Some(tick)
    }

    pub fn usr_perc(&self) -> f64 {
        percentages(self.delta_usr, self.delta_sys, self.delta_total).0
    }

    pub fn sys_perc(&self) -> f64 {
        percentages(self.delta_usr, self.delta_sys, self.delta_total).1
    }
}

/// Sum of the live members of one UID for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UidAggregate {
    pub delta_usr: u64,
    pub delta_sys: u64,
    pub delta_total: u64,
    pub members: usize,
}

impl UidAggregate {
    /// Adds a member. The first member supplies `delta_total`.
    pub fn absorb(&mut self, state: &ProcessState) {
        if self.members == 0 {
            self.delta_total = state.delta_total;
        }
        self.delta_usr = self.delta_usr.saturating_add(state.delta_usr);
        self.delta_sys = self.delta_sys.saturating_add(state.delta_sys);
        self.members += 1;
    }

    pub fn percentages(&self) -> (f64, f64) {
        percentages(self.delta_usr, self.delta_sys, self.delta_total)
    }
}

/// Produces global and per-UID CPU samples.
pub struct CpuAttributionEngine {
    source: Arc<dyn CounterSource>,
    registry: Arc<dyn ProcessRegistry>,
    paths: CounterPaths,
    cores: Option<Vec<usize>>,
    global: ProcessState,
    /// Tracked processes in ascending PID order.
    tracked: Vec<(u32, ProcessState)>,
    solo_model: Option<PowerModel>,
}

impl CpuAttributionEngine {
    pub fn new(
        source: Arc<dyn CounterSource>,
        registry: Arc<dyn ProcessRegistry>,
        paths: CounterPaths,
    ) -> Self {
        Self {
            source,
            registry,
            paths,
            cores: None,
            global: ProcessState::new(Uid::ALL, 0),
            tracked: Vec::new(),
            solo_model: None,
        }
    }

    /// Adds a `solo_freq` prediction to every per-UID sample.
    pub fn with_solo_prediction(mut self, model: PowerModel) -> Self {
        self.solo_model = Some(model);
        self
    }

    pub fn tracked_processes(&self) -> usize {
        self.tracked.len()
    }

    pub fn process_state(&self, pid: u32) -> Option<&ProcessState> {
        self.tracked
            .binary_search_by_key(&pid, |(p, _)| *p)
            .ok()
            .map(|idx| &self.tracked[idx].1)
    }

    /// Per-core frequencies in MHz; `None` if no core is readable at all.
    fn read_freqs(&mut self) -> Option<Arc<[f64]>> {
        if self.cores.is_none() {
            match list_cores(self.source.as_ref(), &self.paths) {
                Ok(cores) if !cores.is_empty() => self.cores = Some(cores),
                Ok(_) => {
                    warn!("No CPU cores found under {}", self.paths.cpu_dir.display());
                    return None;
                }
                Err(e) => {
                    warn!("Failed to list CPU cores: {}", e);
                    return None;
                }
            }
        }
        let cores = self.cores.as_deref()?;

        let mut readable = false;
        let freqs: Vec<f64> = cores
            .iter()
            .map(|&core| match self.source.read_counter(&self.paths.cpu_freq(core)) {
                Ok(khz) => {
                    readable = true;
                    khz as f64 / 1000.0
                }
                Err(_) => 0.0,
            })
            .collect();

        if readable {
            Some(Arc::from(freqs))
        } else {
            None
        }
    }

    /// Joins the ascending live-PID list against the tracked list. Exited
    /// processes are dropped; new ones get state only if their UID resolves.
    fn merge_live_pids(&mut self, tick: u64) {
        let live = self.registry.live_pids();
        let mut old = std::mem::take(&mut self.tracked).into_iter().peekable();
        let mut merged = Vec::with_capacity(live.len());

        for pid in live {
            while let Some((gone, _)) = old.next_if(|(p, _)| *p < pid) {
                debug!("Purging state of exited pid {}", gone);
            }
            if let Some(entry) = old.next_if(|(p, _)| *p == pid) {
                merged.push(entry);
                continue;
            }
            if let Some(uid) = self.registry.uid_for_pid(pid) {
                merged.push((pid, ProcessState::new(uid, tick)));
            }
        }
        for (gone, _) in old {
            debug!("Purging state of exited pid {}", gone);
        }

        self.tracked = merged;
    }

    /// Runs one tick. Soft failures produce an empty iteration and leave all
    /// state untouched.
    pub fn sample(&mut self, tick: u64) -> Iteration<CpuSample> {
        let freqs = match self.read_freqs() {
            Some(freqs) => freqs,
            None => {
                warn!("No readable CPU frequency, skipping CPU tick {}", tick);
                return Iteration::empty();
            }
        };
        let times = match read_cpu_times(self.source.as_ref(), &self.paths) {
            Ok(times) => times,
            Err(e) => {
                warn!("Failed to read global CPU times: {}", e);
                return Iteration::empty();
            }
        };

        let warmed_up = self.global.has_reading();
        self.global.update_state(
            PidTimes {
                usr: times.usr,
                sys: times.sys,
            },
            times.total,
            tick,
        );

        self.merge_live_pids(tick);

        let registry = Arc::clone(&self.registry);
        for (pid, state) in self.tracked.iter_mut() {
            if state.needs_read(tick) {
                match registry.pid_times(*pid) {
                    Some(pid_times) => state.update_state(pid_times, times.total, tick),
                    None => debug!("Counters of pid {} unreadable this tick", pid),
                }
            } else {
                state.skip_read(times.total, tick);
            }
        }

        let before = self.tracked.len();
        self.tracked.retain(|(_, state)| state.is_alive(tick));
        if self.tracked.len() != before {
            debug!("Purged {} non-alive process states", before - self.tracked.len());
        }

        if !warmed_up {
            debug!("CPU baseline recorded at tick {}", tick);
            return Iteration::empty();
        }

        let mut aggregates: HashMap<Uid, UidAggregate> = HashMap::new();
        for (_, state) in &self.tracked {
            aggregates.entry(state.uid).or_default().absorb(state);
        }

        let mut per_uid = BTreeMap::new();
        for (uid, agg) in aggregates {
            let (usr_perc, sys_perc) = agg.percentages();
            let solo_freq = self.predict_solo_freq(usr_perc, sys_perc, &freqs);
            per_uid.insert(
                uid,
                CpuSample {
                    usr_perc,
                    sys_perc,
                    freqs: Arc::clone(&freqs),
                    solo_freq,
                },
            );
        }

        Iteration {
            global: Some(CpuSample {
                usr_perc: self.global.usr_perc(),
                sys_perc: self.global.sys_perc(),
                freqs,
                solo_freq: None,
            }),
            per_uid,
        }
    }

    fn predict_solo_freq(&self, usr_perc: f64, sys_perc: f64, freqs: &[f64]) -> Option<f64> {
        let model = self.solo_model.as_ref()?;
        let current = freqs.iter().copied().fold(0.0, f64::max);
        if current <= 0.0 {
            return None;
        }
        Some(model.predict_solo_state(usr_perc, sys_perc, current).2)
    }
}

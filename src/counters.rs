//! Kernel counter sources.
//!
//! Engines never touch the filesystem directly. They go through the narrow
//! [`CounterSource`] interface, which can read text, read a single integer
//! counter and list a directory. [`FsCounterSource`] is the Linux/Android
//! implementation; it resolves every absolute path below a configurable root
//! so that tests can point it at a fixture tree.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{PowerError, Result};

/// Read-only access to kernel counters identified by path.
pub trait CounterSource: Send + Sync {
    /// Reads a whole counter file as text.
    fn read_text(&self, path: &Path) -> Result<String>;

    /// Lists the entry names of a directory.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Reads a file holding a single non-negative integer.
    fn read_counter(&self, path: &Path) -> Result<u64> {
        let text = self.read_text(path)?;
        parse_counter(&text).ok_or_else(|| {
            PowerError::read_failure(path, format!("not an integer counter: {:?}", text.trim()))
        })
    }

    /// Lists the numeric entries of a directory in ascending order.
    fn list_ids(&self, path: &Path) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .list_dir(path)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

/// Parses the first whitespace-separated token of a counter file.
pub fn parse_counter(text: &str) -> Option<u64> {
    text.split_whitespace().next()?.parse().ok()
}

/// Filesystem backed counter source.
#[derive(Debug, Clone)]
pub struct FsCounterSource {
    root: PathBuf,
}

impl FsCounterSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Counter source for the running host.
    pub fn host() -> Self {
        Self::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a counter path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(path),
        }
    }
}

impl CounterSource for FsCounterSource {
    fn read_text(&self, path: &Path) -> Result<String> {
        let full = self.resolve(path);
        fs::read_to_string(&full).map_err(|e| PowerError::read_failure(full, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let entries = fs::read_dir(&full).map_err(|e| PowerError::read_failure(&full, e))?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect())
    }
}

/// In-memory counter source. Values can be changed between ticks, which
/// makes it the source of choice for dry runs and engine tests.
#[derive(Debug, Default)]
pub struct MemoryCounterSource {
    files: RwLock<HashMap<PathBuf, String>>,
}

impl MemoryCounterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, content: impl ToString) {
        if let Ok(mut files) = self.files.write() {
            files.insert(path.into(), content.to_string());
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut files) = self.files.write() {
            files.remove(path);
        }
    }
}

impl CounterSource for MemoryCounterSource {
    fn read_text(&self, path: &Path) -> Result<String> {
        self.files
            .read()
            .ok()
            .and_then(|files| files.get(path).cloned())
            .ok_or_else(|| PowerError::read_failure(path, "no such counter"))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let files = self
            .files
            .read()
            .map_err(|_| PowerError::read_failure(path, "counter map poisoned"))?;
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|p| p.strip_prefix(path).ok())
            .filter_map(|rest| rest.components().next())
            .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
            .collect();
        if names.is_empty() {
            return Err(PowerError::read_failure(path, "no such directory"));
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Locations of every counter the engines read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CounterPaths {
    pub proc_dir: PathBuf,
    pub stat: PathBuf,
    pub cpu_dir: PathBuf,
    pub net_dir: PathBuf,
    pub uid_stat_dir: PathBuf,
    pub wifi_interface: String,
    /// File holding the Wifi link speed in Mbit/s. Defaults to the
    /// interface's `speed` attribute.
    pub link_speed: Option<PathBuf>,
}

impl Default for CounterPaths {
    fn default() -> Self {
        Self {
            proc_dir: PathBuf::from("/proc"),
            stat: PathBuf::from("/proc/stat"),
            cpu_dir: PathBuf::from("/sys/devices/system/cpu"),
            net_dir: PathBuf::from("/sys/class/net"),
            uid_stat_dir: PathBuf::from("/proc/uid_stat"),
            wifi_interface: "wlan0".to_string(),
            link_speed: None,
        }
    }
}

impl CounterPaths {
    pub fn cpu_freq(&self, core: usize) -> PathBuf {
        self.cpu_dir
            .join(format!("cpu{}", core))
            .join("cpufreq/scaling_cur_freq")
    }

    pub fn interface_stat(&self, counter: &str) -> PathBuf {
        self.net_dir
            .join(&self.wifi_interface)
            .join("statistics")
            .join(counter)
    }

    pub fn operstate(&self) -> PathBuf {
        self.net_dir.join(&self.wifi_interface).join("operstate")
    }

    pub fn link_speed(&self) -> PathBuf {
        self.link_speed
            .clone()
            .unwrap_or_else(|| self.net_dir.join(&self.wifi_interface).join("speed"))
    }

    pub fn uid_stat(&self, uid: u32, counter: &str) -> PathBuf {
        self.uid_stat_dir.join(uid.to_string()).join(counter)
    }

    pub fn pid_file(&self, pid: u32, file: &str) -> PathBuf {
        self.proc_dir.join(pid.to_string()).join(file)
    }
}

/// Enumerates the CPU cores present under `cpu_dir` (`cpu0`, `cpu1`, ...).
pub fn list_cores(source: &dyn CounterSource, paths: &CounterPaths) -> Result<Vec<usize>> {
    let mut cores: Vec<usize> = source
        .list_dir(&paths.cpu_dir)?
        .iter()
        .filter_map(|name| name.strip_prefix("cpu")?.parse().ok())
        .collect();
    cores.sort_unstable();
    Ok(cores)
}

/// CPU time fields of one `cpu` line in /proc/stat, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

/// Aggregated user, system and total ticks used for utilization deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub usr: u64,
    pub sys: u64,
    pub total: u64,
}

impl CpuStat {
    /// User time includes nice, system time includes irq and softirq; the
    /// total adds idle and iowait on top. Steal is not part of the total.
    pub fn times(&self) -> CpuTimes {
        let usr = self.user + self.nice;
        let sys = self.system + self.irq + self.softirq;
        CpuTimes {
            usr,
            sys,
            total: usr + sys + self.idle + self.iowait,
        }
    }
}

/// Parses a single `cpu`/`cpuN` line of /proc/stat.
pub fn parse_cpu_stat_line(line: &str) -> Result<CpuStat> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 || !parts[0].starts_with("cpu") {
        return Err(PowerError::Parse(format!(
            "invalid /proc/stat cpu line: {:?}",
            line
        )));
    }

    let field = |idx: usize| -> Result<u64> {
        parts[idx]
            .parse::<u64>()
            .map_err(|e| PowerError::Parse(format!("cpu field {}: {}", idx, e)))
    };

    Ok(CpuStat {
        user: field(1)?,
        nice: field(2)?,
        system: field(3)?,
        idle: field(4)?,
        iowait: field(5)?,
        irq: field(6)?,
        softirq: field(7)?,
        steal: if parts.len() > 8 { field(8)? } else { 0 },
    })
}

/// Extracts the aggregate `cpu ` line from the content of /proc/stat.
pub fn parse_aggregate_cpu_stat(content: &str) -> Result<CpuStat> {
    content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| PowerError::Parse("no aggregate cpu line in /proc/stat".to_string()))
        .and_then(parse_cpu_stat_line)
}

/// Reads the system-wide CPU times.
pub fn read_cpu_times(source: &dyn CounterSource, paths: &CounterPaths) -> Result<CpuTimes> {
    let content = source.read_text(&paths.stat)?;
    Ok(parse_aggregate_cpu_stat(&content)?.times())
}

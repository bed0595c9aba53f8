//! Device calibration tables.
//!
//! A [`CoefficientTable`] is loaded once per process and never mutated. The
//! built-in profiles come from `data/profiles.toml`; additional profiles are
//! picked up from `/etc/herakles/power-profiles.toml` and
//! `./power-profiles.toml` when those files exist.

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{PowerError, Result};

/// Bytes of protocol header assumed per packet when deriving payload bytes.
pub const DEFAULT_HEADER_OVERHEAD_BYTES: u64 = 52;

/// Calibration data for one device model.
///
/// CPU ratios are expressed in mW per percent of utilization. Row `n` of
/// `cpu_power_ratios` holds the ratios for `n + 1` active cores at each of
/// the frequencies in `cpu_freqs`; a table with a single row uses it for any
/// core count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientTable {
    pub name: String,

    /// Sorted CPU frequencies in MHz.
    pub cpu_freqs: Vec<f64>,
    pub cpu_power_ratios: Vec<Vec<f64>>,
    /// Idle baseline contained in every ratio, same unit as the ratios.
    #[serde(default)]
    pub cpu_base_power: f64,
    /// Extra power in mW added to the system-wide scope when more than one
    /// core is active, per frequency in `cpu_freqs`. Empty disables it.
    #[serde(default)]
    pub cpu_multicore_base: Vec<f64>,

    /// Sorted Wifi link speeds in Mbit/s.
    pub wifi_link_speeds: Vec<f64>,
    pub wifi_link_ratios: Vec<f64>,
    pub wifi_low_power: f64,
    pub wifi_high_power: f64,
    #[serde(default)]
    pub wifi_radio_on_power: f64,
    /// Packets per tick at or above which the radio enters the high state.
    pub wifi_low_high_transition: f64,
    /// Packets per tick at or below which the radio drops to the low state.
    pub wifi_high_low_transition: f64,
    #[serde(default = "default_header_overhead")]
    pub header_overhead_bytes: u64,
}

fn default_header_overhead() -> u64 {
    DEFAULT_HEADER_OVERHEAD_BYTES
}

impl CoefficientTable {
    /// Checks the structural invariants the power model relies on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PowerError::InvalidTable(format!("{}: {}", self.name, msg)));

        if self.cpu_freqs.is_empty() {
            return invalid("cpu_freqs is empty".into());
        }
        if !is_sorted(&self.cpu_freqs) {
            return invalid("cpu_freqs must be strictly ascending".into());
        }
        if self.cpu_power_ratios.is_empty() {
            return invalid("cpu_power_ratios has no rows".into());
        }
        for (row, ratios) in self.cpu_power_ratios.iter().enumerate() {
            if ratios.len() != self.cpu_freqs.len() {
                return invalid(format!(
                    "cpu_power_ratios row {} has {} entries, expected {}",
                    row,
                    ratios.len(),
                    self.cpu_freqs.len()
                ));
            }
        }
        if !self.cpu_multicore_base.is_empty()
            && self.cpu_multicore_base.len() != self.cpu_freqs.len()
        {
            return invalid("cpu_multicore_base must be empty or match cpu_freqs".into());
        }
        if self.wifi_link_speeds.is_empty() {
            return invalid("wifi_link_speeds is empty".into());
        }
        if !is_sorted(&self.wifi_link_speeds) {
            return invalid("wifi_link_speeds must be strictly ascending".into());
        }
        if self.wifi_link_speeds.len() != self.wifi_link_ratios.len() {
            return invalid("wifi_link_speeds and wifi_link_ratios differ in length".into());
        }
        if self.wifi_low_high_transition <= self.wifi_high_low_transition {
            return invalid(format!(
                "wifi_low_high_transition ({}) must exceed wifi_high_low_transition ({})",
                self.wifi_low_high_transition, self.wifi_high_low_transition
            ));
        }
        Ok(())
    }

    /// Ratio row for the given number of simultaneously active cores.
    pub fn cpu_ratio_row(&self, active_cores: usize) -> &[f64] {
        let rows = self.cpu_power_ratios.len();
        let index = active_cores.max(1) - 1;
        if rows > 1 {
            debug_assert!(
                index < rows,
                "no cpu ratio row for {} active cores in table {}",
                active_cores,
                self.name
            );
        }
        &self.cpu_power_ratios[index.min(rows - 1)]
    }
}

fn is_sorted(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

#[derive(Deserialize)]
struct ProfilesFile {
    profiles: Vec<CoefficientTable>,
}

/// Parses a TOML document holding `[[profiles]]` entries into `map`.
/// Invalid profiles are dropped with a warning; valid ones in the same
/// document are kept.
fn load_profiles_from_str(content: &str, origin: &str, map: &mut HashMap<String, CoefficientTable>) {
    let parsed: ProfilesFile = match toml::from_str(content) {
        Ok(p) => p,
        Err(e) => {
            warn!("Failed to parse profiles from {}: {}", origin, e);
            return;
        }
    };

    for table in parsed.profiles {
        if let Err(e) = table.validate() {
            warn!("Skipping profile from {}: {}", origin, e);
            continue;
        }
        debug!("Loaded profile {} from {}", table.name, origin);
        map.insert(table.name.clone(), table);
    }
}

fn load_profiles_from_file(path: &str, map: &mut HashMap<String, CoefficientTable>) {
    let p = Path::new(path);
    if !p.exists() {
        return;
    }
    match fs::read_to_string(p) {
        Ok(content) => {
            load_profiles_from_str(&content, path, map);
            info!("Loaded additional power profiles from {}", path);
        }
        Err(e) => warn!("Failed to read profiles file {}: {}", path, e),
    }
}

/// Calibration profiles known to this build, by name.
pub static PROFILES: Lazy<HashMap<String, CoefficientTable>> = Lazy::new(|| {
    let mut map = HashMap::new();

    // 1) built-in profiles
    load_profiles_from_str(include_str!("../data/profiles.toml"), "built-in", &mut map);

    // 2) optional system-wide profiles
    load_profiles_from_file("/etc/herakles/power-profiles.toml", &mut map);

    // 3) optional profiles in current working directory
    load_profiles_from_file("./power-profiles.toml", &mut map);

    map
});

/// Looks up a named profile.
pub fn profile(name: &str) -> Result<CoefficientTable> {
    PROFILES
        .get(name)
        .cloned()
        .ok_or_else(|| PowerError::UnknownProfile(name.to_string()))
}

/// Names of all loaded profiles, sorted.
pub fn profile_names() -> Vec<String> {
    let mut names: Vec<String> = PROFILES.keys().cloned().collect();
    names.sort();
    names
}

/// Loads a single table from a TOML, YAML or JSON file (by extension).
pub fn load_table_from_file(path: &Path) -> Result<CoefficientTable> {
    let content = fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table: CoefficientTable = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| PowerError::InvalidTable(format!("{}: {}", path.display(), e)))?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| PowerError::InvalidTable(format!("{}: {}", path.display(), e)))?,
        _ => toml::from_str(&content)
            .map_err(|e| PowerError::InvalidTable(format!("{}: {}", path.display(), e)))?,
    };
    table.validate()?;
    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Small two-frequency table used throughout the crate's tests.
    pub(crate) fn test_table() -> CoefficientTable {
        CoefficientTable {
            name: "test".into(),
            cpu_freqs: vec![300.0, 960.0],
            cpu_power_ratios: vec![vec![100.0, 400.0]],
            cpu_base_power: 0.0,
            cpu_multicore_base: Vec::new(),
            wifi_link_speeds: vec![1.0, 54.0],
            wifi_link_ratios: vec![47.0, 6.0],
            wifi_low_power: 38.5,
            wifi_high_power: 720.0,
            wifi_radio_on_power: 0.0,
            wifi_low_high_transition: 15.0,
            wifi_high_low_transition: 8.0,
            header_overhead_bytes: DEFAULT_HEADER_OVERHEAD_BYTES,
        }
    }

    #[test]
    fn test_builtin_profiles_are_valid() {
        let names = profile_names();
        assert!(names.contains(&"hammerhead".to_string()));
        assert!(names.contains(&"royss".to_string()));

        let hammerhead = profile("hammerhead").unwrap();
        assert_eq!(hammerhead.cpu_freqs.len(), 14);
        assert_eq!(hammerhead.wifi_low_high_transition, 15.0);
        assert_eq!(hammerhead.header_overhead_bytes, 52);
    }

    #[test]
    fn test_unknown_profile() {
        assert!(matches!(
            profile("nokia3310"),
            Err(PowerError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unsorted_freqs() {
        let mut table = test_table();
        table.cpu_freqs = vec![960.0, 300.0];
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_hysteresis() {
        let mut table = test_table();
        table.wifi_low_high_transition = 5.0;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ragged_ratio_rows() {
        let mut table = test_table();
        table.cpu_power_ratios.push(vec![1.0]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_single_row_serves_every_core_count() {
        let table = test_table();
        assert_eq!(table.cpu_ratio_row(1), &[100.0, 400.0]);
        assert_eq!(table.cpu_ratio_row(4), &[100.0, 400.0]);
    }

    #[test]
    fn test_load_table_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.yaml");
        fs::write(&path, serde_yaml::to_string(&test_table()).unwrap()).unwrap();
        let loaded = load_table_from_file(&path).unwrap();
        assert_eq!(loaded, test_table());
    }

    #[test]
    fn test_malformed_profile_is_dropped_not_fatal() {
        let mut map = HashMap::new();
        let doc = format!(
            "{}\n[[profiles]]\nname = \"broken\"\ncpu_freqs = []\ncpu_power_ratios = [[]]\n\
             wifi_link_speeds = [1.0]\nwifi_link_ratios = [1.0]\nwifi_low_power = 1.0\n\
             wifi_high_power = 2.0\nwifi_low_high_transition = 15.0\nwifi_high_low_transition = 8.0\n",
            include_str!("../data/profiles.toml")
        );
        load_profiles_from_str(&doc, "test", &mut map);
        assert!(map.contains_key("hammerhead"));
        assert!(!map.contains_key("broken"));
    }
}

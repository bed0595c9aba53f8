//! Sample types shared by the engines, the power model and the sinks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cpu::CpuSample;
use crate::wifi::WifiSample;

/// Operating-system user identity owning processes and traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    /// Reserved scope for system-wide totals.
    pub const ALL: Uid = Uid(u32::MAX);

    pub fn is_all(self) -> bool {
        self == Uid::ALL
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("ALL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Power components with an attribution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    Cpu,
    Wifi,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Component::Cpu => "CPU",
            Component::Wifi => "Wifi",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single component measurement for one scope and one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "component", rename_all = "lowercase")]
pub enum Sample {
    Cpu(CpuSample),
    Wifi(WifiSample),
}

impl Sample {
    pub fn component(&self) -> Component {
        match self {
            Sample::Cpu(_) => Component::Cpu,
            Sample::Wifi(_) => Component::Wifi,
        }
    }

    /// Flattens the sample into `component + metric + value` records.
    pub fn records(&self) -> Vec<Record> {
        let component = self.component();
        let record = |metric: &'static str, value: f64| Record {
            component,
            metric,
            value,
        };

        match self {
            Sample::Cpu(cpu) => {
                let mut out = vec![record("sys", cpu.sys_perc), record("usr", cpu.usr_perc)];
                out.extend(cpu.freqs.iter().map(|f| record("freq", *f)));
                if let Some(solo) = cpu.solo_freq {
                    out.push(record("solo-freq", solo));
                }
                out
            }
            Sample::Wifi(wifi) if !wifi.on => vec![record("on", 0.0)],
            Sample::Wifi(wifi) => vec![
                record("on", 1.0),
                record("packets", wifi.packets),
                record("uplinkBytes", wifi.uplink_bytes as f64),
                record("downlinkBytes", wifi.downlink_bytes as f64),
                record("uplink", wifi.uplink_rate),
                record("speed", wifi.link_speed),
                record("state", wifi.power_state.level()),
                record("upload", wifi.upload_percent),
                record("download", wifi.download_percent),
            ],
        }
    }
}

/// Flat output record handed to logging sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub component: Component,
    pub metric: &'static str,
    pub value: f64,
}

/// Output of one engine for one tick: an optional global sample plus zero or
/// more per-UID samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration<S> {
    pub global: Option<S>,
    pub per_uid: BTreeMap<Uid, S>,
}

impl<S> Default for Iteration<S> {
    fn default() -> Self {
        Self {
            global: None,
            per_uid: BTreeMap::new(),
        }
    }
}

impl<S> Iteration<S> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.per_uid.is_empty()
    }

    /// Converts the typed samples into the closed [`Sample`] enum.
    pub fn into_samples(self) -> Iteration<Sample>
    where
        S: Into<Sample>,
    {
        Iteration {
            global: self.global.map(Into::into),
            per_uid: self
                .per_uid
                .into_iter()
                .map(|(uid, s)| (uid, s.into()))
                .collect(),
        }
    }
}

impl From<CpuSample> for Sample {
    fn from(sample: CpuSample) -> Self {
        Sample::Cpu(sample)
    }
}

impl From<WifiSample> for Sample {
    fn from(sample: WifiSample) -> Self {
        Sample::Wifi(sample)
    }
}

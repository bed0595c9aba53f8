//! Wifi attribution engine.
//!
//! The interface counters give exact byte and packet totals for the radio.
//! Per-UID traffic is only known in bytes (`/proc/uid_stat`), so per-UID
//! packet counts are estimated from the average packet size learned on the
//! interface. Each scope runs the same low/high power-state machine on its
//! packet rate.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::coefficients::CoefficientTable;
use crate::counters::{CounterPaths, CounterSource};
use crate::error::Result;
use crate::sample::{Iteration, Uid};

/// Converts KiB per second into Mibit per second.
pub const UPLINK_RATE_UNIT: f64 = 7.8125e-3;

/// Link speed is re-read every this many ticks.
pub const DEFAULT_LINK_SPEED_REFRESH_TICKS: u64 = 30;

/// Seed of the learned average packet size, in bytes.
const INITIAL_PACKET_SIZE: f64 = 1000.0;

/// Weight of the previous average in the packet size EMA.
const PACKET_SIZE_DECAY: f64 = 0.9;

/// Upper bound on how long an idle UID goes without being re-read.
const MAX_UID_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Radio power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    Low,
    High,
}

impl PowerState {
    /// Numeric level used in flat records: 0 for Low, 1 for High.
    pub fn level(self) -> f64 {
        match self {
            PowerState::Low => 0.0,
            PowerState::High => 1.0,
        }
    }
}

/// Hysteresis between the two power states. Both thresholds are
/// inclusive; between them the current state is kept.
pub fn next_power_state(
    current: PowerState,
    packets: f64,
    low_high: f64,
    high_low: f64,
) -> PowerState {
    if packets >= low_high {
        PowerState::High
    } else if packets <= high_low {
        PowerState::Low
    } else {
        current
    }
}

/// `round(bytes / avg_size)`, at least 1 when any byte moved.
pub fn estimate_packets(bytes: u64, avg_size: f64) -> u64 {
    if bytes == 0 {
        return 0;
    }
    if avg_size <= 0.0 {
        return 1;
    }
    ((bytes as f64 / avg_size).round() as u64).max(1)
}

/// One Wifi measurement for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiSample {
    pub on: bool,
    pub packets: f64,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    /// Mibit/s.
    pub uplink_rate: f64,
    /// Mbit/s.
    pub link_speed: f64,
    pub power_state: PowerState,
    pub upload_percent: f64,
    pub download_percent: f64,
}

impl WifiSample {
    /// Sample reported while the radio is off.
    pub fn off() -> Self {
        Self {
            on: false,
            packets: 0.0,
            uplink_bytes: 0,
            downlink_bytes: 0,
            uplink_rate: 0.0,
            link_speed: 0.0,
            power_state: PowerState::Low,
            upload_percent: 0.0,
            download_percent: 0.0,
        }
    }
}

/// Cumulative counters of one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

/// Movement of one scope since its previous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkDelta {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

impl LinkDelta {
    pub fn packets(&self) -> u64 {
        self.tx_packets + self.rx_packets
    }

    pub fn bytes(&self) -> u64 {
        self.tx_bytes + self.rx_bytes
    }

    /// Removes `overhead` bytes of header per packet, flooring at 0.
    pub fn without_headers(self, overhead: u64) -> Self {
        Self {
            tx_bytes: self
                .tx_bytes
                .saturating_sub(self.tx_packets.saturating_mul(overhead)),
            rx_bytes: self
                .rx_bytes
                .saturating_sub(self.rx_packets.saturating_mul(overhead)),
            ..self
        }
    }
}

/// Link bookkeeping for the interface or for one UID.
#[derive(Debug, Clone)]
pub struct WifiLinkState {
    last: Option<LinkCounters>,
    last_update: Option<Instant>,
    power_state: PowerState,
    avg_tx_packet_size: f64,
    avg_rx_packet_size: f64,
    inactive: Duration,
    delta: LinkDelta,
    uplink_rate: f64,
}

impl Default for WifiLinkState {
    fn default() -> Self {
        Self {
            last: None,
            last_update: None,
            power_state: PowerState::Low,
            avg_tx_packet_size: INITIAL_PACKET_SIZE,
            avg_rx_packet_size: INITIAL_PACKET_SIZE,
            inactive: Duration::ZERO,
            delta: LinkDelta::default(),
            uplink_rate: 0.0,
        }
    }
}

impl WifiLinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    pub fn avg_tx_packet_size(&self) -> f64 {
        self.avg_tx_packet_size
    }

    pub fn avg_rx_packet_size(&self) -> f64 {
        self.avg_rx_packet_size
    }

    pub fn inactive(&self) -> Duration {
        self.inactive
    }

    pub fn uplink_rate(&self) -> f64 {
        self.uplink_rate
    }

    pub fn delta(&self) -> LinkDelta {
        self.delta
    }

    pub fn has_reading(&self) -> bool {
        self.last.is_some()
    }

    /// Time since the last reading, `None` before the first one.
    pub fn since_update(&self, now: Instant) -> Option<Duration> {
        self.last_update
            .map(|last| now.saturating_duration_since(last))
    }

    /// Records `counters` and returns the raw movement since the previous
    /// reading with the elapsed time. The first reading is a baseline and
    /// returns `None`.
    pub fn observe(&mut self, counters: LinkCounters, now: Instant) -> Option<(LinkDelta, Duration)> {
        let previous = self.last.replace(counters);
        let elapsed = self.since_update(now);
        self.last_update = Some(now);

        let prev = previous?;
        Some((
            LinkDelta {
                tx_bytes: counters.tx_bytes.saturating_sub(prev.tx_bytes),
                rx_bytes: counters.rx_bytes.saturating_sub(prev.rx_bytes),
                tx_packets: counters.tx_packets.saturating_sub(prev.tx_packets),
                rx_packets: counters.rx_packets.saturating_sub(prev.rx_packets),
            },
            elapsed.unwrap_or_default(),
        ))
    }

    /// Updates rate, packet-size averages, power state and inactivity from
    /// one delta.
    pub fn apply(&mut self, delta: LinkDelta, elapsed: Duration, table: &CoefficientTable) {
        let secs = elapsed.as_secs_f64();
        self.uplink_rate = if secs > 0.0 {
            (delta.tx_bytes as f64 / 1024.0) * UPLINK_RATE_UNIT / secs
        } else {
            0.0
        };

        if delta.tx_packets != 0 {
            self.avg_tx_packet_size = PACKET_SIZE_DECAY * self.avg_tx_packet_size
                + (1.0 - PACKET_SIZE_DECAY) * delta.tx_bytes as f64 / delta.tx_packets as f64;
        }
        if delta.rx_packets != 0 {
            self.avg_rx_packet_size = PACKET_SIZE_DECAY * self.avg_rx_packet_size
                + (1.0 - PACKET_SIZE_DECAY) * delta.rx_bytes as f64 / delta.rx_packets as f64;
        }

        self.power_state = next_power_state(
            self.power_state,
            delta.packets() as f64,
            table.wifi_low_high_transition,
            table.wifi_high_low_transition,
        );

        if delta.bytes() > 0 {
            self.inactive = Duration::ZERO;
        } else {
            self.inactive += elapsed;
        }
        self.delta = delta;
    }

    /// Radio switched off: forget the counters and restart the timer. The
    /// learned packet sizes are kept.
    pub fn reset_off(&mut self, now: Instant) {
        self.last = None;
        self.last_update = Some(now);
        self.power_state = PowerState::Low;
        self.inactive = Duration::ZERO;
        self.delta = LinkDelta::default();
        self.uplink_rate = 0.0;
    }
}

/// Produces global and per-UID Wifi samples.
pub struct WifiAttributionEngine {
    source: Arc<dyn CounterSource>,
    paths: CounterPaths,
    table: Arc<CoefficientTable>,
    global: WifiLinkState,
    uids: HashMap<Uid, WifiLinkState>,
    radio_on: Option<bool>,
    link_speed: Option<f64>,
    link_speed_read_tick: u64,
    link_speed_refresh_ticks: u64,
}

impl WifiAttributionEngine {
    pub fn new(source: Arc<dyn CounterSource>, paths: CounterPaths, table: Arc<CoefficientTable>) -> Self {
        Self {
            source,
            paths,
            table,
            global: WifiLinkState::new(),
            uids: HashMap::new(),
            radio_on: None,
            link_speed: None,
            link_speed_read_tick: 0,
            link_speed_refresh_ticks: DEFAULT_LINK_SPEED_REFRESH_TICKS,
        }
    }

    pub fn with_link_speed_refresh(mut self, ticks: u64) -> Self {
        self.link_speed_refresh_ticks = ticks.max(1);
        self
    }

    pub fn global_state(&self) -> &WifiLinkState {
        &self.global
    }

    pub fn uid_state(&self, uid: Uid) -> Option<&WifiLinkState> {
        self.uids.get(&uid)
    }

    pub fn tracked_uids(&self) -> usize {
        self.uids.len()
    }

    pub fn sample(&mut self, tick: u64) -> Iteration<WifiSample> {
        self.sample_at(tick, Instant::now())
    }

    /// Runs one tick with an explicit clock.
    pub fn sample_at(&mut self, tick: u64, now: Instant) -> Iteration<WifiSample> {
        if !self.is_radio_on() {
            if self.radio_on != Some(false) {
                info!("Wifi interface {} is off", self.paths.wifi_interface);
            }
            self.radio_on = Some(false);
            self.uids.clear();
            self.global.reset_off(now);
            return Iteration {
                global: Some(WifiSample::off()),
                per_uid: BTreeMap::new(),
            };
        }
        if self.radio_on != Some(true) {
            info!("Wifi interface {} is on", self.paths.wifi_interface);
            self.radio_on = Some(true);
        }

        let counters = match self.read_interface() {
            Ok(counters) => counters,
            Err(e) => {
                warn!("Failed to read Wifi interface counters: {}", e);
                return Iteration::empty();
            }
        };
        self.refresh_link_speed(tick);
        let link_speed = self.link_speed.unwrap_or(0.0);

        let interface = self
            .global
            .observe(counters, now)
            .map(|(delta, elapsed)| {
                let delta = delta.without_headers(self.table.header_overhead_bytes);
                self.global.apply(delta, elapsed, &self.table);
                delta
            });

        let per_uid = self.sample_uids(now, interface, link_speed);

        let Some(delta) = interface else {
            debug!("Wifi baseline recorded at tick {}", tick);
            return Iteration::empty();
        };

        Iteration {
            global: Some(WifiSample {
                on: true,
                packets: delta.packets() as f64,
                uplink_bytes: delta.tx_bytes,
                downlink_bytes: delta.rx_bytes,
                uplink_rate: self.global.uplink_rate(),
                link_speed,
                power_state: self.global.power_state(),
                upload_percent: 1.0,
                download_percent: 1.0,
            }),
            per_uid,
        }
    }

    fn sample_uids(
        &mut self,
        now: Instant,
        interface: Option<LinkDelta>,
        link_speed: f64,
    ) -> BTreeMap<Uid, WifiSample> {
        let mut out = BTreeMap::new();

        let listed = match self.source.list_ids(&self.paths.uid_stat_dir) {
            Ok(ids) => ids,
            Err(e) => {
                debug!("No per-UID network stats: {}", e);
                return out;
            }
        };
        self.uids.retain(|uid, _| listed.binary_search(&uid.0).is_ok());

        let avg_tx = self.global.avg_tx_packet_size();
        let avg_rx = self.global.avg_rx_packet_size();

        for raw in listed {
            let uid = Uid(raw);
            let state = self.uids.entry(uid).or_default();

            let due = match state.since_update(now) {
                None => true,
                Some(elapsed) => elapsed > MAX_UID_REFRESH_INTERVAL.min(state.inactive()),
            };
            if !due {
                continue;
            }

            let counters = match read_uid_counters(self.source.as_ref(), &self.paths, raw) {
                Ok(counters) => counters,
                Err(e) => {
                    debug!("Skipping uid {}: {}", uid, e);
                    continue;
                }
            };
            let Some((mut delta, elapsed)) = state.observe(counters, now) else {
                continue;
            };
            delta.tx_packets = estimate_packets(delta.tx_bytes, avg_tx);
            delta.rx_packets = estimate_packets(delta.rx_bytes, avg_rx);
            state.apply(delta, elapsed, &self.table);

            let Some(iface) = interface else {
                continue;
            };
            if delta.bytes() == 0 {
                continue;
            }

            out.insert(
                uid,
                WifiSample {
                    on: true,
                    packets: delta.packets() as f64,
                    uplink_bytes: delta.tx_bytes,
                    downlink_bytes: delta.rx_bytes,
                    uplink_rate: state.uplink_rate(),
                    link_speed,
                    power_state: state.power_state(),
                    upload_percent: share(delta.tx_bytes, iface.tx_bytes),
                    download_percent: share(delta.rx_bytes, iface.rx_bytes),
                },
            );
        }
        out
    }

    fn is_radio_on(&self) -> bool {
        match self.source.read_text(&self.paths.operstate()) {
            Ok(state) => state.trim() != "down",
            Err(_) => false,
        }
    }

    fn read_interface(&self) -> Result<LinkCounters> {
        let read = |counter: &str| self.source.read_counter(&self.paths.interface_stat(counter));
        Ok(LinkCounters {
            tx_bytes: read("tx_bytes")?,
            rx_bytes: read("rx_bytes")?,
            tx_packets: read("tx_packets")?,
            rx_packets: read("rx_packets")?,
        })
    }

    fn refresh_link_speed(&mut self, tick: u64) {
        let due = self.link_speed.is_none()
            || tick.saturating_sub(self.link_speed_read_tick) >= self.link_speed_refresh_ticks;
        if !due {
            return;
        }
        match self.source.read_counter(&self.paths.link_speed()) {
            Ok(speed) => {
                if self.link_speed != Some(speed as f64) {
                    debug!("Wifi link speed now {} Mbit/s", speed);
                }
                self.link_speed = Some(speed as f64);
                self.link_speed_read_tick = tick;
            }
            Err(e) => debug!("Wifi link speed unavailable: {}", e),
        }
    }
}

fn read_uid_counters(source: &dyn CounterSource, paths: &CounterPaths, uid: u32) -> Result<LinkCounters> {
    Ok(LinkCounters {
        tx_bytes: source.read_counter(&paths.uid_stat(uid, "tcp_snd"))?,
        rx_bytes: source.read_counter(&paths.uid_stat(uid, "tcp_rcv"))?,
        tx_packets: 0,
        rx_packets: 0,
    })
}

/// `part / whole` capped at 1, 0 when nothing moved on the interface.
fn share(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::tests::test_table;
    use crate::counters::MemoryCounterSource;
    use std::path::Path;

    const IFACE: &str = "/sys/class/net/wlan0";

    fn set_interface(source: &MemoryCounterSource, tx: u64, rx: u64, txp: u64, rxp: u64) {
        source.set(format!("{}/statistics/tx_bytes", IFACE), tx);
        source.set(format!("{}/statistics/rx_bytes", IFACE), rx);
        source.set(format!("{}/statistics/tx_packets", IFACE), txp);
        source.set(format!("{}/statistics/rx_packets", IFACE), rxp);
    }

    fn set_uid(source: &MemoryCounterSource, uid: u32, snd: u64, rcv: u64) {
        source.set(format!("/proc/uid_stat/{}/tcp_snd", uid), snd);
        source.set(format!("/proc/uid_stat/{}/tcp_rcv", uid), rcv);
    }

    fn engine() -> (Arc<MemoryCounterSource>, WifiAttributionEngine) {
        let source = Arc::new(MemoryCounterSource::new());
        source.set(format!("{}/operstate", IFACE), "up\n");
        source.set(format!("{}/speed", IFACE), "54\n");
        let engine = WifiAttributionEngine::new(
            source.clone(),
            CounterPaths::default(),
            Arc::new(test_table()),
        );
        (source, engine)
    }

    #[test]
    fn test_hysteresis_sequence() {
        let mut state = PowerState::Low;
        let mut seen = Vec::new();
        for packets in [20.0, 20.0, 3.0] {
            state = next_power_state(state, packets, 15.0, 8.0);
            seen.push(state);
        }
        assert_eq!(seen, vec![PowerState::High, PowerState::High, PowerState::Low]);
    }

    #[test]
    fn test_hysteresis_holds_between_thresholds() {
        assert_eq!(next_power_state(PowerState::High, 10.0, 15.0, 8.0), PowerState::High);
        assert_eq!(next_power_state(PowerState::Low, 10.0, 15.0, 8.0), PowerState::Low);
        assert_eq!(next_power_state(PowerState::Low, 15.0, 15.0, 8.0), PowerState::High);
        assert_eq!(next_power_state(PowerState::High, 8.0, 15.0, 8.0), PowerState::Low);
    }

    #[test]
    fn test_estimate_packets() {
        assert_eq!(estimate_packets(0, 1000.0), 0);
        assert_eq!(estimate_packets(100, 1000.0), 1);
        assert_eq!(estimate_packets(2600, 1000.0), 3);
        assert_eq!(estimate_packets(2400, 1000.0), 2);
    }

    #[test]
    fn test_header_overhead_floors_at_zero() {
        let delta = LinkDelta {
            tx_bytes: 100,
            rx_bytes: 1000,
            tx_packets: 5,
            rx_packets: 5,
        }
        .without_headers(52);
        assert_eq!(delta.tx_bytes, 0);
        assert_eq!(delta.rx_bytes, 740);
    }

    #[test]
    fn test_packet_size_ema_converges_without_overshoot() {
        let table = test_table();
        let mut state = WifiLinkState::new();
        let mut previous = state.avg_tx_packet_size();
        assert_eq!(previous, 1000.0);

        for _ in 0..100 {
            let delta = LinkDelta {
                tx_bytes: 20_000,
                rx_bytes: 0,
                tx_packets: 10,
                rx_packets: 0,
            };
            state.apply(delta, Duration::from_secs(1), &table);
            let avg = state.avg_tx_packet_size();
            assert!(avg > previous);
            assert!(avg <= 2000.0);
            previous = avg;
        }
        assert!((2000.0 - previous).abs() < 1.0);
        // no rx packets, rx average untouched
        assert_eq!(state.avg_rx_packet_size(), 1000.0);
    }

    #[test]
    fn test_link_state_inactivity() {
        let table = test_table();
        let mut state = WifiLinkState::new();
        state.apply(LinkDelta::default(), Duration::from_secs(2), &table);
        state.apply(LinkDelta::default(), Duration::from_secs(3), &table);
        assert_eq!(state.inactive(), Duration::from_secs(5));

        let moving = LinkDelta {
            tx_bytes: 1,
            ..LinkDelta::default()
        };
        state.apply(moving, Duration::from_secs(1), &table);
        assert_eq!(state.inactive(), Duration::ZERO);
    }

    #[test]
    fn test_engine_global_and_uid_samples() {
        let (source, mut engine) = engine();
        let t0 = Instant::now();

        set_interface(&source, 100_000, 200_000, 1000, 2000);
        set_uid(&source, 10061, 5000, 10_000);
        set_uid(&source, 1000, 0, 0);
        assert!(engine.sample_at(1, t0).is_empty());

        set_interface(&source, 100_000 + 520 + 5120, 200_000 + 520 + 10_240, 1010, 2010);
        set_uid(&source, 10061, 5000 + 2560, 10_000 + 10_240);
        let out = engine.sample_at(2, t0 + Duration::from_secs(1));

        let global = out.global.unwrap();
        assert!(global.on);
        assert_eq!(global.packets, 20.0);
        assert_eq!(global.uplink_bytes, 5120);
        assert_eq!(global.downlink_bytes, 10_240);
        assert!((global.uplink_rate - 5.0 * UPLINK_RATE_UNIT).abs() < 1e-12);
        assert_eq!(global.link_speed, 54.0);
        assert_eq!(global.power_state, PowerState::High);
        assert_eq!(global.upload_percent, 1.0);

        // avg tx 951.2, avg rx 1002.4 -> 3 + 10 estimated packets
        let app = &out.per_uid[&Uid(10061)];
        assert_eq!(app.packets, 13.0);
        assert_eq!(app.power_state, PowerState::Low);
        assert!((app.upload_percent - 0.5).abs() < 1e-12);
        assert!((app.download_percent - 1.0).abs() < 1e-12);
        assert!(!out.per_uid.contains_key(&Uid(1000)));
    }

    #[test]
    fn test_interface_read_failure_is_soft() {
        let (source, mut engine) = engine();
        let t0 = Instant::now();
        set_interface(&source, 0, 0, 0, 0);
        engine.sample_at(1, t0);

        source.remove(Path::new("/sys/class/net/wlan0/statistics/rx_packets"));
        assert!(engine.sample_at(2, t0 + Duration::from_secs(1)).is_empty());
        assert!(engine.global_state().has_reading());
    }

    #[test]
    fn test_radio_off_resets_state() {
        let (source, mut engine) = engine();
        let t0 = Instant::now();
        set_interface(&source, 0, 0, 0, 0);
        set_uid(&source, 10061, 0, 0);
        engine.sample_at(1, t0);
        assert_eq!(engine.tracked_uids(), 1);

        source.set(format!("{}/operstate", IFACE), "down\n");
        let out = engine.sample_at(2, t0 + Duration::from_secs(1));
        assert_eq!(out.global, Some(WifiSample::off()));
        assert!(out.per_uid.is_empty());
        assert_eq!(engine.tracked_uids(), 0);
        assert!(!engine.global_state().has_reading());

        // back on: first reading is a fresh baseline
        source.set(format!("{}/operstate", IFACE), "up\n");
        assert!(engine.sample_at(3, t0 + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_missing_operstate_means_off() {
        let (source, mut engine) = engine();
        source.remove(Path::new("/sys/class/net/wlan0/operstate"));
        let out = engine.sample_at(1, Instant::now());
        assert_eq!(out.global, Some(WifiSample::off()));
    }

    #[test]
    fn test_idle_uid_is_not_reread_every_tick() {
        let (source, mut engine) = engine();
        let t0 = Instant::now();
        let at = |secs: u64| t0 + Duration::from_secs(secs);

        set_interface(&source, 0, 0, 0, 0);
        set_uid(&source, 10061, 0, 0);
        engine.sample_at(1, at(0));
        // idle for one second
        engine.sample_at(2, at(1));
        assert_eq!(
            engine.uid_state(Uid(10061)).unwrap().inactive(),
            Duration::from_secs(1)
        );

        // 1s since refresh is not more than 1s inactive: not re-read
        set_interface(&source, 1000, 0, 1, 0);
        set_uid(&source, 10061, 500, 0);
        let out = engine.sample_at(3, at(2));
        assert!(out.per_uid.is_empty());

        // 2s since refresh: re-read and attributed
        let out = engine.sample_at(4, at(3));
        assert_eq!(out.per_uid[&Uid(10061)].uplink_bytes, 500);
    }

    #[test]
    fn test_link_speed_refreshed_periodically() {
        let (source, engine) = engine();
        let mut engine = engine.with_link_speed_refresh(3);
        let t0 = Instant::now();
        set_interface(&source, 0, 0, 0, 0);
        engine.sample_at(1, t0);

        source.set(format!("{}/speed", IFACE), "11\n");
        let out = engine.sample_at(2, t0 + Duration::from_secs(1));
        assert_eq!(out.global.unwrap().link_speed, 54.0);

        let out = engine.sample_at(4, t0 + Duration::from_secs(2));
        assert_eq!(out.global.unwrap().link_speed, 11.0);
    }
}

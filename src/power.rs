//! Power model: converts utilization samples into milliwatts.
//!
//! Every function here is pure. The model reads the immutable
//! [`CoefficientTable`] and the sample and never touches engine state.

use std::sync::Arc;

use crate::coefficients::CoefficientTable;
use crate::cpu::CpuSample;
use crate::sample::{Sample, Uid};
use crate::wifi::{PowerState, WifiSample};

/// Utilization threshold used when predicting the frequency a UID would run
/// at on its own.
const SOLO_TARGET_UTILIZATION: f64 = 70.0;

/// Returns the first index whose value strictly exceeds `x`; `len` if none
/// does and `0` if all do.
pub fn upper_bound(sorted: &[f64], x: f64) -> usize {
    let mut lo = 0;
    let mut hi = sorted.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if sorted[mid] <= x {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Looks up `x` in the parallel tables `xs`/`ys`.
///
/// Exact matches return the tabulated value. Otherwise `x` is clamped into
/// `[xs[0], xs[last]]`, the bounding pair is found with [`upper_bound`]
/// (index clamped into `[1, len - 1]`) and the value is linearly
/// interpolated. Single-entry tables return their only value.
pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    debug_assert!(!xs.is_empty());

    if let Some(idx) = xs.iter().position(|v| *v == x) {
        return ys[idx];
    }
    if xs.len() == 1 {
        return ys[0];
    }

    let last = xs.len() - 1;
    let clamped = x.clamp(xs[0], xs[last]);
    let idx = upper_bound(xs, clamped).clamp(1, last);

    let (x0, x1) = (xs[idx - 1], xs[idx]);
    let (y0, y1) = (ys[idx - 1], ys[idx]);
    y0 + (y1 - y0) / (x1 - x0) * (clamped - x0)
}

/// Stateless power model bound to one calibration table.
#[derive(Debug, Clone)]
pub struct PowerModel {
    table: Arc<CoefficientTable>,
}

impl PowerModel {
    pub fn new(table: Arc<CoefficientTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CoefficientTable {
        &self.table
    }

    /// Power in mW for one sample of the given scope.
    pub fn compute(&self, uid: Uid, sample: &Sample) -> f64 {
        match sample {
            Sample::Cpu(cpu) => self.cpu_power(uid, cpu),
            Sample::Wifi(wifi) => self.wifi_power(wifi),
        }
    }

    /// Power ratio for `active_cores` cores running at `freq` MHz.
    pub fn cpu_ratio(&self, active_cores: usize, freq: f64) -> f64 {
        interpolate(
            &self.table.cpu_freqs,
            self.table.cpu_ratio_row(active_cores),
            freq,
        )
    }

    pub fn cpu_power(&self, uid: Uid, sample: &CpuSample) -> f64 {
        let buckets = frequency_buckets(&sample.freqs);
        if buckets.is_empty() {
            return 0.0;
        }

        let ratio_sum: f64 = buckets
            .iter()
            .map(|(freq, cores)| self.cpu_ratio(*cores, *freq))
            .sum();
        let net_ratio = ratio_sum - (buckets.len() - 1) as f64 * self.table.cpu_base_power;

        let mut power = (net_ratio * (sample.usr_perc + sample.sys_perc)).max(0.0);

        let active_cores: usize = buckets.iter().map(|(_, cores)| cores).sum();
        if uid.is_all() && active_cores > 1 && !self.table.cpu_multicore_base.is_empty() {
            let highest = buckets
                .iter()
                .map(|(freq, _)| *freq)
                .fold(f64::MIN, f64::max);
            power += interpolate(
                &self.table.cpu_freqs,
                &self.table.cpu_multicore_base,
                highest,
            );
        }
        power
    }

    pub fn wifi_power(&self, sample: &WifiSample) -> f64 {
        if !sample.on {
            return 0.0;
        }

        let t = &self.table;
        let state_power = match sample.power_state {
            PowerState::Low => t.wifi_low_power * sample.upload_percent,
            PowerState::High => {
                let ratio = interpolate(&t.wifi_link_speeds, &t.wifi_link_ratios, sample.link_speed);
                (t.wifi_high_power + ratio * sample.uplink_rate) * sample.upload_percent
            }
        };
        let radio_on =
            t.wifi_radio_on_power * (sample.upload_percent + sample.download_percent) / 2.0;

        (state_power + radio_on).max(0.0)
    }

    /// Predicts the lowest table frequency that would keep the given load
    /// under 70 % if the UID ran alone, assuming utilization scales linearly
    /// with frequency. Returns the rescaled `(usr, sys, freq)`.
    pub fn predict_solo_state(&self, usr_perc: f64, sys_perc: f64, freq: f64) -> (f64, f64, f64) {
        let freqs = &self.table.cpu_freqs;
        let total = usr_perc + sys_perc;
        if total < 1e-6 || freq <= 0.0 {
            return (usr_perc, sys_perc, freqs[0]);
        }

        let (mut lo, mut hi) = (0, freqs.len() - 1);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if total * freq / freqs[mid] < SOLO_TARGET_UTILIZATION {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let scale = freq / freqs[lo];
        (usr_perc * scale, sys_perc * scale, freqs[lo])
    }
}

/// Groups active cores (frequency > 0) by frequency, ascending, as
/// `(freq, core_count)` pairs.
pub fn frequency_buckets(freqs: &[f64]) -> Vec<(f64, usize)> {
    let mut active: Vec<f64> = freqs.iter().copied().filter(|f| *f > 0.0).collect();
    active.sort_by(|a, b| a.total_cmp(b));

    let mut buckets: Vec<(f64, usize)> = Vec::new();
    for freq in active {
        match buckets.last_mut() {
            Some((f, count)) if *f == freq => *count += 1,
            _ => buckets.push((freq, 1)),
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::tests::test_table;

    fn model() -> PowerModel {
        PowerModel::new(Arc::new(test_table()))
    }

    fn cpu_sample(usr: f64, sys: f64, freqs: Vec<f64>) -> CpuSample {
        CpuSample {
            usr_perc: usr,
            sys_perc: sys,
            freqs: Arc::from(freqs),
            solo_freq: None,
        }
    }

    fn wifi_sample(state: PowerState, up: f64, down: f64) -> WifiSample {
        WifiSample {
            on: true,
            packets: 20.0,
            uplink_bytes: 2048,
            downlink_bytes: 4096,
            uplink_rate: 2.0,
            link_speed: 54.0,
            power_state: state,
            upload_percent: up,
            download_percent: down,
        }
    }

    #[test]
    fn test_upper_bound() {
        let xs = [300.0, 600.0, 960.0];
        assert_eq!(upper_bound(&xs, 100.0), 0);
        assert_eq!(upper_bound(&xs, 300.0), 1);
        assert_eq!(upper_bound(&xs, 450.0), 1);
        assert_eq!(upper_bound(&xs, 960.0), 3);
        assert_eq!(upper_bound(&xs, 5000.0), 3);
        assert_eq!(upper_bound(&[], 1.0), 0);
    }

    #[test]
    fn test_interpolation_midpoint_and_clamping() {
        let freqs = [300.0, 960.0];
        let ratios = [100.0, 400.0];
        assert_eq!(interpolate(&freqs, &ratios, 630.0), 250.0);
        assert_eq!(interpolate(&freqs, &ratios, 50.0), 100.0);
        assert_eq!(interpolate(&freqs, &ratios, 5000.0), 400.0);
        assert_eq!(interpolate(&freqs, &ratios, 960.0), 400.0);
    }

    #[test]
    fn test_interpolation_single_entry() {
        assert_eq!(interpolate(&[54.0], &[6.4], 11.0), 6.4);
    }

    #[test]
    fn test_frequency_buckets() {
        let buckets = frequency_buckets(&[960.0, 0.0, 300.0, 960.0]);
        assert_eq!(buckets, vec![(300.0, 1), (960.0, 2)]);
        assert!(frequency_buckets(&[0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_cpu_power_single_frequency() {
        let power = model().cpu_power(Uid(10061), &cpu_sample(20.0, 5.0, vec![630.0]));
        assert!((power - 250.0 * 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_power_subtracts_base_per_extra_bucket() {
        let mut table = test_table();
        table.cpu_base_power = 50.0;
        let model = PowerModel::new(Arc::new(table));
        let power = model.cpu_power(Uid(1000), &cpu_sample(10.0, 0.0, vec![300.0, 960.0]));
        // (100 + 400 - 50) * 10
        assert!((power - 4500.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_power_floored_at_zero() {
        let mut table = test_table();
        table.cpu_base_power = 1000.0;
        let model = PowerModel::new(Arc::new(table));
        let power = model.cpu_power(Uid(1000), &cpu_sample(10.0, 0.0, vec![300.0, 960.0]));
        assert_eq!(power, 0.0);
    }

    #[test]
    fn test_cpu_multicore_correction_only_for_all_scope() {
        let mut table = test_table();
        table.cpu_multicore_base = vec![10.0, 30.0];
        let model = PowerModel::new(Arc::new(table));
        let sample = cpu_sample(1.0, 0.0, vec![300.0, 300.0]);

        let app = model.cpu_power(Uid(10061), &sample);
        let all = model.cpu_power(Uid::ALL, &sample);
        assert!((app - 100.0).abs() < 1e-9);
        assert!((all - 110.0).abs() < 1e-9);

        let single_core = model.cpu_power(Uid::ALL, &cpu_sample(1.0, 0.0, vec![960.0, 0.0]));
        assert!((single_core - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_power_no_active_core() {
        assert_eq!(model().cpu_power(Uid::ALL, &cpu_sample(50.0, 0.0, vec![0.0])), 0.0);
    }

    #[test]
    fn test_wifi_power_low_state() {
        let power = model().wifi_power(&wifi_sample(PowerState::Low, 0.5, 0.2));
        assert!((power - 38.5 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_wifi_power_high_state_uses_link_ratio() {
        let mut table = test_table();
        table.wifi_radio_on_power = 10.0;
        let model = PowerModel::new(Arc::new(table));
        let power = model.wifi_power(&wifi_sample(PowerState::High, 1.0, 0.5));
        // link speed 54 -> ratio 6.0; (720 + 6 * 2) * 1.0 + 10 * 0.75
        assert!((power - (732.0 + 7.5)).abs() < 1e-9);
    }

    #[test]
    fn test_wifi_power_off_is_zero() {
        assert_eq!(model().wifi_power(&WifiSample::off()), 0.0);
    }

    #[test]
    fn test_compute_dispatches() {
        let m = model();
        let sample = Sample::Cpu(cpu_sample(1.0, 1.0, vec![300.0]));
        assert!((m.compute(Uid(1), &sample) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_predict_solo_state() {
        let m = model();
        // 20% at 960 MHz would be 64% at 300 MHz, which stays under 70%.
        let (usr, sys, freq) = m.predict_solo_state(15.0, 5.0, 960.0);
        assert_eq!(freq, 300.0);
        assert!((usr - 48.0).abs() < 1e-9);
        assert!((sys - 16.0).abs() < 1e-9);

        // 40% at 960 MHz would be 128% at 300 MHz, so 960 is kept.
        let (_, _, freq) = m.predict_solo_state(30.0, 10.0, 960.0);
        assert_eq!(freq, 960.0);

        let (_, _, idle) = m.predict_solo_state(0.0, 0.0, 960.0);
        assert_eq!(idle, 300.0);
    }
}

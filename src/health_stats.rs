//! Running statistics shown on the /health endpoint.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Clone, Copy, Default)]
struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            *self = RunningStat {
                count: 1,
                sum: value,
                min: value,
                max: value,
                last: value,
            };
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

#[derive(Default)]
struct Stat {
    inner: Mutex<RunningStat>,
}

impl Stat {
    fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    /// (current, average, max, min, count)
    fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        if let Ok(s) = self.inner.lock() {
            (s.last, s.avg(), s.max, s.min, s.count)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0)
        }
    }
}

pub struct HealthStats {
    tick_duration_ms: Stat,
    uids_per_tick: Stat,
    estimates_per_tick: Stat,
    total_ticks: AtomicU64,
    empty_ticks: AtomicU64,
    http_requests: AtomicU64,
    started: Instant,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            tick_duration_ms: Stat::default(),
            uids_per_tick: Stat::default(),
            estimates_per_tick: Stat::default(),
            total_ticks: AtomicU64::new(0),
            empty_ticks: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl HealthStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_tick(&self, duration_ms: f64, uids: usize, estimates: usize) {
        self.tick_duration_ms.add_sample(duration_ms);
        self.uids_per_tick.add_sample(uids as f64);
        self.estimates_per_tick.add_sample(estimates as f64);
        self.total_ticks.fetch_add(1, Ordering::Relaxed);
        if estimates == 0 {
            self.empty_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.load(Ordering::Relaxed)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn render_table(&self) -> String {
        let left_col = 26usize;
        let col_w = 12usize;

        let mut out = String::new();

        writeln!(
            out,
            "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
            "metric",
            "current",
            "average",
            "max",
            "min",
            left = left_col,
            col = col_w
        )
        .ok();

        writeln!(out, "{}", "-".repeat(left_col + 3 + (col_w + 3) * 4)).ok();

        let rows: [(&str, &Stat, usize); 3] = [
            ("tick duration (ms)", &self.tick_duration_ms, 3),
            ("uids per tick", &self.uids_per_tick, 0),
            ("estimates per tick", &self.estimates_per_tick, 0),
        ];
        for (name, stat, precision) in rows {
            let (cur, avg, max, min, _count) = stat.snapshot();
            writeln!(
                out,
                "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
                name,
                format!("{:.p$}", cur, p = precision),
                format!("{:.p$}", avg, p = precision.max(1)),
                format!("{:.p$}", max, p = precision),
                format!("{:.p$}", min, p = precision),
                left = left_col,
                col = col_w
            )
            .ok();
        }

        writeln!(out).ok();
        writeln!(out, "number of done ticks: {}", self.total_ticks()).ok();
        writeln!(
            out,
            "ticks without estimates: {}",
            self.empty_ticks.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(
            out,
            "http requests: {}",
            self.http_requests.load(Ordering::Relaxed)
        )
        .ok();
        writeln!(out, "uptime (s): {}", self.get_uptime_seconds()).ok();

        out
    }
}

//! Fixed-interval tick loop.
//!
//! The scheduler owns the tick counter and the engines. Each cycle it
//! increments the tick, asks every engine for its samples, prices them with
//! the [`PowerModel`] and hands the resulting [`TickReport`] to a sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::cpu::CpuAttributionEngine;
use crate::power::PowerModel;
use crate::sample::{Component, Iteration, Record, Sample, Uid};
use crate::wifi::WifiAttributionEngine;

/// A component engine driven by the scheduler.
pub trait AttributionEngine: Send {
    fn component(&self) -> Component;

    /// Samples for `tick`; an empty iteration on soft failure.
    fn collect(&mut self, tick: u64) -> Iteration<Sample>;
}

impl AttributionEngine for CpuAttributionEngine {
    fn component(&self) -> Component {
        Component::Cpu
    }

    fn collect(&mut self, tick: u64) -> Iteration<Sample> {
        self.sample(tick).into_samples()
    }
}

impl AttributionEngine for WifiAttributionEngine {
    fn component(&self) -> Component {
        Component::Wifi
    }

    fn collect(&mut self, tick: u64) -> Iteration<Sample> {
        self.sample(tick).into_samples()
    }
}

/// Power attributed to one scope by one component in one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerEstimate {
    pub component: Component,
    pub uid: Uid,
    pub milliwatts: f64,
    pub sample: Sample,
}

impl PowerEstimate {
    pub fn records(&self) -> Vec<Record> {
        self.sample.records()
    }
}

/// Everything produced in one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub duration: Duration,
    pub estimates: Vec<PowerEstimate>,
}

impl TickReport {
    /// Total mW per scope over all components.
    pub fn totals_by_uid(&self) -> BTreeMap<Uid, f64> {
        let mut totals = BTreeMap::new();
        for estimate in &self.estimates {
            *totals.entry(estimate.uid).or_insert(0.0) += estimate.milliwatts;
        }
        totals
    }

    pub fn estimate(&self, component: Component, uid: Uid) -> Option<&PowerEstimate> {
        self.estimates
            .iter()
            .find(|e| e.component == component && e.uid == uid)
    }

    /// Number of distinct non-global scopes in the report.
    pub fn uid_count(&self) -> usize {
        self.totals_by_uid().keys().filter(|uid| !uid.is_all()).count()
    }
}

/// Receives one report per tick.
pub trait SampleSink: Send {
    fn publish(&mut self, report: &TickReport);
}

impl<F> SampleSink for F
where
    F: FnMut(&TickReport) + Send,
{
    fn publish(&mut self, report: &TickReport) {
        self(report)
    }
}

pub struct IterationScheduler {
    engines: Vec<Box<dyn AttributionEngine>>,
    model: PowerModel,
    tick: u64,
}

impl IterationScheduler {
    pub fn new(model: PowerModel) -> Self {
        Self {
            engines: Vec::new(),
            model,
            tick: 0,
        }
    }

    pub fn with_engine(mut self, engine: impl AttributionEngine + 'static) -> Self {
        self.engines.push(Box::new(engine));
        self
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn components(&self) -> Vec<Component> {
        self.engines.iter().map(|e| e.component()).collect()
    }

    /// Runs a single cycle.
    pub fn run_once(&mut self) -> TickReport {
        let start = Instant::now();
        self.tick += 1;
        let tick = self.tick;

        let mut estimates = Vec::new();
        for engine in self.engines.iter_mut() {
            let component = engine.component();
            let iteration = engine.collect(tick);
            if iteration.is_empty() {
                debug!("{} produced no samples at tick {}", component, tick);
                continue;
            }

            let scopes = iteration
                .global
                .map(|sample| (Uid::ALL, sample))
                .into_iter()
                .chain(iteration.per_uid);
            for (uid, sample) in scopes {
                let milliwatts = self.model.compute(uid, &sample);
                estimates.push(PowerEstimate {
                    component,
                    uid,
                    milliwatts,
                    sample,
                });
            }
        }

        let duration = start.elapsed();
        debug!(
            "Tick {} produced {} estimates in {:.2}ms",
            tick,
            estimates.len(),
            duration.as_secs_f64() * 1000.0
        );

        TickReport {
            tick,
            timestamp: Utc::now(),
            duration,
            estimates,
        }
    }

    /// Ticks every `period` until `shutdown` flips to `true`. A slow tick
    /// delays the next one; ticks never overlap.
    pub async fn run(
        mut self,
        period: Duration,
        mut sink: impl SampleSink,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Sampling {:?} every {}ms",
            self.components(),
            period.as_millis()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once();
                    sink.publish(&report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sampling stopped after {} ticks", self.tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::tests::test_table;
    use crate::cpu::CpuSample;
    use std::sync::{Arc, Mutex};

    /// Emits a fixed CPU sample for the system and one app from the second
    /// tick on.
    struct FixedEngine;

    impl AttributionEngine for FixedEngine {
        fn component(&self) -> Component {
            Component::Cpu
        }

        fn collect(&mut self, tick: u64) -> Iteration<Sample> {
            if tick < 2 {
                return Iteration::empty();
            }
            let sample = |usr| {
                Sample::Cpu(CpuSample {
                    usr_perc: usr,
                    sys_perc: 0.0,
                    freqs: Arc::from(vec![300.0]),
                    solo_freq: None,
                })
            };
            let mut per_uid = BTreeMap::new();
            per_uid.insert(Uid(10061), sample(10.0));
            Iteration {
                global: Some(sample(40.0)),
                per_uid,
            }
        }
    }

    fn scheduler() -> IterationScheduler {
        IterationScheduler::new(PowerModel::new(Arc::new(test_table()))).with_engine(FixedEngine)
    }

    #[test]
    fn test_run_once_prices_every_scope() {
        let mut scheduler = scheduler();
        let first = scheduler.run_once();
        assert_eq!(first.tick, 1);
        assert!(first.estimates.is_empty());

        let report = scheduler.run_once();
        assert_eq!(report.tick, 2);
        assert_eq!(report.estimates.len(), 2);
        assert_eq!(report.estimates[0].uid, Uid::ALL);

        let app = report.estimate(Component::Cpu, Uid(10061)).unwrap();
        assert!((app.milliwatts - 1000.0).abs() < 1e-9);
        let totals = report.totals_by_uid();
        assert!((totals[&Uid::ALL] - 4000.0).abs() < 1e-9);
        assert_eq!(report.uid_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let seen = ticks.clone();
        let sink = move |report: &TickReport| seen.lock().unwrap().push(report.tick);

        let handle = tokio::spawn(scheduler().run(Duration::from_millis(100), sink, rx));
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let ticks = ticks.lock().unwrap();
        assert!(ticks.len() >= 2);
        assert!(ticks.windows(2).all(|w| w[1] == w[0] + 1));
    }
}

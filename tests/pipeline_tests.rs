//! End-to-end tick tests: counters -> registry -> engines -> power model.

use herakles_proc_power_exporter::coefficients;
use herakles_proc_power_exporter::counters::{CounterPaths, FsCounterSource, MemoryCounterSource};
use herakles_proc_power_exporter::registry::{
    refresh_once, CachedRegistry, PidTimes, ProcfsReader, RefreshKind, RegistryReader,
};
use herakles_proc_power_exporter::{
    Component, CounterSource, CpuAttributionEngine, IterationScheduler, PowerModel, Sample, Uid,
    WifiAttributionEngine,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const IFACE: &str = "/sys/class/net/wlan0";
const APP: Uid = Uid(10061);

struct Device {
    source: Arc<MemoryCounterSource>,
    registry: Arc<CachedRegistry>,
}

impl Device {
    fn new() -> Self {
        let source = Arc::new(MemoryCounterSource::new());
        source.set("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq", 960000);
        source.set(format!("{}/operstate", IFACE), "up\n");
        source.set(format!("{}/speed", IFACE), "54\n");
        Self {
            source,
            registry: Arc::new(CachedRegistry::new(1024)),
        }
    }

    fn set_stat(&self, user: u64, system: u64, idle: u64) {
        self.source.set(
            "/proc/stat",
            format!("cpu  {} 0 {} {} 0 0 0 0 0 0\n", user, system, idle),
        );
    }

    fn set_processes(&self, procs: &[(u32, u32, u64, u64)]) {
        self.registry.replace_uids(
            procs
                .iter()
                .map(|&(pid, uid, _, _)| (pid, Uid(uid)))
                .collect(),
        );
        self.registry.replace_times(
            procs
                .iter()
                .map(|&(pid, _, usr, sys)| (pid, PidTimes { usr, sys }))
                .collect(),
        );
    }

    fn set_interface(&self, tx: u64, rx: u64, tx_packets: u64, rx_packets: u64) {
        self.source.set(format!("{}/statistics/tx_bytes", IFACE), tx);
        self.source.set(format!("{}/statistics/rx_bytes", IFACE), rx);
        self.source.set(format!("{}/statistics/tx_packets", IFACE), tx_packets);
        self.source.set(format!("{}/statistics/rx_packets", IFACE), rx_packets);
    }

    fn set_uid_traffic(&self, uid: Uid, snd: u64, rcv: u64) {
        self.source.set(format!("/proc/uid_stat/{}/tcp_snd", uid.0), snd);
        self.source.set(format!("/proc/uid_stat/{}/tcp_rcv", uid.0), rcv);
    }

    fn scheduler(&self) -> IterationScheduler {
        let table = Arc::new(coefficients::profile("hammerhead").unwrap());
        let source: Arc<dyn CounterSource> = self.source.clone();
        let cpu = CpuAttributionEngine::new(
            source.clone(),
            self.registry.clone(),
            CounterPaths::default(),
        );
        let wifi = WifiAttributionEngine::new(source, CounterPaths::default(), table.clone());
        IterationScheduler::new(PowerModel::new(table))
            .with_engine(cpu)
            .with_engine(wifi)
    }
}

#[test]
fn test_warm_up_tick_then_attribution() {
    let device = Device::new();
    let mut scheduler = device.scheduler();

    device.set_stat(100, 50, 850);
    device.set_processes(&[(10, APP.0, 10, 5), (11, APP.0, 20, 0), (20, 1000, 5, 5)]);
    device.set_interface(1000, 1000, 10, 10);
    device.set_uid_traffic(APP, 0, 0);

    let warm_up = scheduler.run_once();
    assert_eq!(warm_up.tick, 1);
    assert!(warm_up.estimates.is_empty());

    std::thread::sleep(Duration::from_millis(20));

    // 200 ticks elapsed: system 50 usr + 20 sys, app 30 usr + 5 sys
    device.set_stat(150, 70, 980);
    device.set_processes(&[(10, APP.0, 30, 10), (11, APP.0, 30, 0), (20, 1000, 5, 5)]);
    // 2000/1000 bytes in 10/5 packets, i.e. 1480/740 payload bytes
    device.set_interface(3000, 2000, 20, 15);
    device.set_uid_traffic(APP, 740, 370);

    let report = scheduler.run_once();
    assert_eq!(report.tick, 2);

    let cpu_all = report.estimate(Component::Cpu, Uid::ALL).unwrap();
    let Sample::Cpu(sample) = &cpu_all.sample else {
        panic!("expected a CPU sample");
    };
    assert!((sample.usr_perc - 25.0).abs() < 1e-9);
    assert!((sample.sys_perc - 10.0).abs() < 1e-9);
    assert_eq!(&sample.freqs[..], &[960.0]);

    // 960 MHz is a table point of the hammerhead profile
    let cpu_app = report.estimate(Component::Cpu, APP).unwrap();
    assert!((cpu_app.milliwatts - 6.2974 * 17.5).abs() < 1e-6);
    assert!((cpu_all.milliwatts - 6.2974 * 35.0).abs() < 1e-6);

    let idle = report.estimate(Component::Cpu, Uid(1000)).unwrap();
    assert_eq!(idle.milliwatts, 0.0);

    let wifi_app = report.estimate(Component::Wifi, APP).unwrap();
    let Sample::Wifi(sample) = &wifi_app.sample else {
        panic!("expected a Wifi sample");
    };
    assert!((sample.upload_percent - 0.5).abs() < 1e-9);
    assert!((sample.download_percent - 0.5).abs() < 1e-9);
    assert!(wifi_app.milliwatts > 0.0);

    let wifi_all = report.estimate(Component::Wifi, Uid::ALL).unwrap();
    assert!(wifi_app.milliwatts <= wifi_all.milliwatts);

    let totals = report.totals_by_uid();
    assert!((totals[&APP] - (cpu_app.milliwatts + wifi_app.milliwatts)).abs() < 1e-9);
    assert_eq!(report.uid_count(), 2);
}

#[test]
fn test_exited_process_and_radio_off() {
    let device = Device::new();
    let mut scheduler = device.scheduler();

    device.set_stat(100, 50, 850);
    device.set_processes(&[(10, APP.0, 10, 5)]);
    device.set_interface(1000, 1000, 10, 10);
    scheduler.run_once();

    device.set_stat(150, 70, 980);
    device.set_processes(&[]);
    device.source.set(format!("{}/operstate", IFACE), "down\n");
    let report = scheduler.run_once();

    // the app exited before the tick: only the system scope remains for CPU
    assert!(report.estimate(Component::Cpu, Uid::ALL).is_some());
    assert!(report.estimate(Component::Cpu, APP).is_none());

    let wifi = report.estimate(Component::Wifi, Uid::ALL).unwrap();
    assert_eq!(wifi.milliwatts, 0.0);
    assert_eq!(wifi.records().len(), 1);
}

fn write_process(root: &Path, pid: u32, uid: u32, utime: u64, stime: u64) {
    let dir = root.join("proc").join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("status"),
        format!("Name:\tapp\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
    )
    .unwrap();
    fs::write(
        dir.join("stat"),
        format!("{pid} (app {pid}) S 1 1 1 0 -1 4194304 0 0 0 0 {utime} {stime} 0 0 20 0 1 0 100 0 0\n"),
    )
    .unwrap();
}

#[tokio::test]
async fn test_procfs_registry_feeds_cpu_engine() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("sys/devices/system/cpu/cpu0/cpufreq")).unwrap();
    fs::write(
        root.join("sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq"),
        "300000\n",
    )
    .unwrap();
    fs::create_dir_all(root.join("proc")).unwrap();
    fs::write(root.join("proc/stat"), "cpu  100 0 100 800 0 0 0 0 0 0\n").unwrap();
    write_process(root, 42, 10061, 10, 10);

    let source: Arc<dyn CounterSource> = Arc::new(FsCounterSource::new(root));
    let registry = Arc::new(CachedRegistry::new(64));
    let mut reader = RegistryReader::Procfs(ProcfsReader::new(source.clone(), CounterPaths::default()));

    for kind in [RefreshKind::Uids, RefreshKind::Times] {
        assert_eq!(refresh_once(&registry, &mut reader, kind).await.unwrap(), 1);
    }

    let mut engine = CpuAttributionEngine::new(source, registry.clone(), CounterPaths::default());
    assert!(engine.sample(1).is_empty());

    fs::write(root.join("proc/stat"), "cpu  140 0 110 850 0 0 0 0 0 0\n").unwrap();
    write_process(root, 42, 10061, 30, 15);
    refresh_once(&registry, &mut reader, RefreshKind::Times)
        .await
        .unwrap();

    let out = engine.sample(2);
    let app = &out.per_uid[&Uid(10061)];
    // 100 ticks elapsed, 20 usr + 5 sys of them in the app
    assert!((app.usr_perc - 20.0).abs() < 1e-9);
    assert!((app.sys_perc - 5.0).abs() < 1e-9);
    assert_eq!(engine.tracked_processes(), 1);

    let stats = registry.stats();
    assert_eq!(stats.uid_entries, 1);
    assert!(stats.last_times_refresh.is_some());
}

//! `check` subcommand: validates configuration and counter accessibility.

use herakles_proc_power_exporter::counters::{
    list_cores, read_cpu_times, CounterPaths, CounterSource, FsCounterSource,
};
use herakles_proc_power_exporter::registry::{parse_pid_stat, parse_status_uid};

use crate::config::{validate_effective_config, Config};

/// Validates system requirements and configuration
pub fn command_check(
    cpu: bool,
    wifi: bool,
    all: bool,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Herakles Process Power Exporter - System Check");
    println!("==================================================");

    let source = FsCounterSource::new(config.counter_root());
    let paths = config.counter_paths();
    let mut all_ok = true;

    println!("\n📁 Counter root: {}", source.root().display());

    if cpu || all {
        all_ok &= check_cpu(&source, &paths);
        all_ok &= check_processes(&source, &paths, config);
    }

    if wifi || all {
        all_ok &= check_wifi(&source, &paths);
    }

    // Check configuration
    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => println!("   ✅ Configuration is valid"),
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    match config.coefficient_table() {
        Ok(table) => println!(
            "   ✅ Power profile '{}' loaded ({} frequencies, {} core rows)",
            table.name,
            table.cpu_freqs.len(),
            table.cpu_power_ratios.len()
        ),
        Err(e) => {
            println!("   ❌ Power profile unavailable: {}", e);
            all_ok = false;
        }
    }

    if config.registry_backend() == "shell" {
        // SAFETY: geteuid has no preconditions and cannot fail
        let euid = unsafe { libc::geteuid() };
        println!(
            "   ℹ️  Shell backend '{}' (running as euid {})",
            config.shell_command.as_deref().unwrap_or("su"),
            euid
        );
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - system is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}

fn check_cpu(source: &dyn CounterSource, paths: &CounterPaths) -> bool {
    println!("\n🧮 Checking CPU counters...");
    let mut ok = true;

    match read_cpu_times(source, paths) {
        Ok(times) => println!(
            "   ✅ {} readable (usr={}, sys={}, total={} ticks)",
            paths.stat.display(),
            times.usr,
            times.sys,
            times.total
        ),
        Err(e) => {
            println!("   ❌ {}", e);
            ok = false;
        }
    }

    match list_cores(source, paths) {
        Ok(cores) if !cores.is_empty() => {
            let online = cores
                .iter()
                .filter(|&&core| source.read_counter(&paths.cpu_freq(core)).is_ok())
                .count();
            if online == 0 {
                println!("   ❌ {} cores present but no cpufreq readable", cores.len());
                ok = false;
            } else {
                println!("   ✅ {} cores, {} with readable frequency", cores.len(), online);
            }
        }
        Ok(_) => {
            println!("   ❌ No cores under {}", paths.cpu_dir.display());
            ok = false;
        }
        Err(e) => {
            println!("   ❌ {}", e);
            ok = false;
        }
    }

    // SAFETY: sysconf only queries a constant
    let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if clk_tck > 0 {
        println!("   ℹ️  Clock ticks per second: {}", clk_tck);
    }

    ok
}

fn check_processes(source: &dyn CounterSource, paths: &CounterPaths, config: &Config) -> bool {
    println!("\n👥 Checking process counters...");

    let pids = match source.list_ids(&paths.proc_dir) {
        Ok(pids) => pids,
        Err(e) => {
            println!("   ❌ {}", e);
            return false;
        }
    };
    if pids.is_empty() {
        println!("   ❌ No process entries under {}", paths.proc_dir.display());
        return false;
    }
    println!(
        "   ✅ {} processes visible (cap {})",
        pids.len(),
        config.max_processes()
    );

    let mut readable = 0usize;
    for &pid in pids.iter().take(20) {
        let stat = source
            .read_text(&paths.pid_file(pid, "stat"))
            .ok()
            .and_then(|line| parse_pid_stat(&line).ok());
        let uid = source
            .read_text(&paths.pid_file(pid, "status"))
            .ok()
            .and_then(|status| parse_status_uid(&status));
        if stat.is_some() && uid.is_some() {
            readable += 1;
        }
    }

    if readable == 0 {
        println!("   ❌ Cannot read stat/status of any sampled process");
        false
    } else {
        println!(
            "   ✅ stat and status readable for {}/{} sampled processes",
            readable,
            pids.len().min(20)
        );
        true
    }
}

fn check_wifi(source: &dyn CounterSource, paths: &CounterPaths) -> bool {
    println!("\n📶 Checking Wifi counters ({})...", paths.wifi_interface);
    let mut ok = true;

    match source.read_text(&paths.operstate()) {
        Ok(state) => println!("   ✅ Interface state: {}", state.trim()),
        Err(e) => {
            println!("   ❌ Interface not found: {}", e);
            return false;
        }
    }

    for counter in ["tx_bytes", "rx_bytes", "tx_packets", "rx_packets"] {
        if let Err(e) = source.read_counter(&paths.interface_stat(counter)) {
            println!("   ❌ {}", e);
            ok = false;
        }
    }
    if ok {
        println!("   ✅ Interface statistics readable");
    }

    match source.read_counter(&paths.link_speed()) {
        Ok(speed) => println!("   ✅ Link speed: {} Mbit/s", speed),
        Err(_) => println!("   ⚠️  Link speed unreadable, link-rate power will be 0"),
    }

    match source.list_ids(&paths.uid_stat_dir) {
        Ok(uids) => println!("   ✅ {} UIDs with network statistics", uids.len()),
        Err(_) => println!(
            "   ⚠️  {} missing, Wifi power stays unattributed",
            paths.uid_stat_dir.display()
        ),
    }

    ok
}

//! `profiles` subcommand: lists the loaded device power profiles.

use herakles_proc_power_exporter::coefficients::{self, CoefficientTable};

/// Lists available power profiles
pub fn command_profiles(
    verbose: bool,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("📊 Herakles Process Power Exporter - Available Profiles");
    println!("========================================================");

    let names: Vec<String> = coefficients::profile_names()
        .into_iter()
        .filter(|n| name.as_ref().map_or(true, |filter| n.contains(filter.as_str())))
        .collect();

    for profile_name in &names {
        let table = coefficients::profile(profile_name)?;
        println!("\n🏷️  Profile: {}", table.name);
        println!("{}", "─".repeat(50));
        print_summary(&table);
        if verbose {
            print_tables(&table);
        }
    }

    println!("\n📋 Total: {} profiles", names.len());
    Ok(())
}

fn print_summary(table: &CoefficientTable) {
    let (min_f, max_f) = (
        table.cpu_freqs.first().copied().unwrap_or(0.0),
        table.cpu_freqs.last().copied().unwrap_or(0.0),
    );
    println!(
        "   ├─ CPU: {} frequencies ({:.1}-{:.1} MHz), {} core rows, base {:.4} mW",
        table.cpu_freqs.len(),
        min_f,
        max_f,
        table.cpu_power_ratios.len(),
        table.cpu_base_power
    );
    println!(
        "   └─ Wifi: low {:.3} mW, high {:.3} mW, {} link speeds, transitions {}/{} pkt/s",
        table.wifi_low_power,
        table.wifi_high_power,
        table.wifi_link_speeds.len(),
        table.wifi_low_high_transition,
        table.wifi_high_low_transition
    );
}

fn print_tables(table: &CoefficientTable) {
    for (cores, row) in table.cpu_power_ratios.iter().enumerate() {
        println!("   │  cpu ratios ({} active):", cores + 1);
        for (freq, ratio) in table.cpu_freqs.iter().zip(row) {
            println!("   │    {:>8.1} MHz -> {:>8.4} mW/%", freq, ratio);
        }
    }
    if !table.cpu_multicore_base.is_empty() {
        println!("   │  multicore base: {:?}", table.cpu_multicore_base);
    }
    println!("   │  wifi link ratios:");
    for (speed, ratio) in table.wifi_link_speeds.iter().zip(&table.wifi_link_ratios) {
        println!("   │    {:>6.1} Mbit/s -> {:>10.6}", speed, ratio);
    }
    println!("   │  header overhead: {} bytes", table.header_overhead_bytes);
}

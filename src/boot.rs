use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{
    apply::{apply_config, ApplyReport, Step},
    device::Device,
    shell::getprop,
    thermal,
    tweaks::{apply_additional, AdditionalConfig},
    user_config::UserConfig,
};

/// Blocks until `sys.boot_completed` is 1 or `timeout` runs out. Returns
/// whether boot completed.
pub fn wait_for_boot(dev: &Device, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if getprop(dev.shell.as_ref(), "sys.boot_completed") == "1" {
            return true;
        }
        if start.elapsed() >= timeout {
            tracing::warn!("BOOT: sys.boot_completed not set after {:?}", timeout);
            return false;
        }
        thread::sleep(Duration::from_secs(2));
    }
}

/// With `set_on_boot` the whole stored tuning goes back on. Otherwise only
/// the thermal preset (when it asks for it) and the stored I/O scheduler and
/// TCP congestion control are restored.
pub fn apply_on_boot(dev: &Device, cfg: &UserConfig) -> ApplyReport {
    let Some(tuning) = &cfg.tuning else {
        tracing::info!("BOOT: nothing stored");
        return ApplyReport::default();
    };

    if cfg.set_on_boot {
        tracing::info!("BOOT: restoring full tuning");
        return apply_config(dev, tuning);
    }

    let mut report = ApplyReport::default();
    if tuning.thermal.set_on_boot && tuning.thermal.preset.is_set() {
        report.steps.push(Step::from_result(
            "thermal",
            thermal::apply_thermal_preset(dev, tuning.thermal.preset),
        ));
    }
    let additional = AdditionalConfig {
        perf_mode: None,
        ..tuning.additional.clone()
    };
    report.steps.extend(apply_additional(dev, &additional));
    tracing::info!("BOOT: {}", report.summary());
    report
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        apply::StepStatus,
        testutil::{fake_cpu, fake_device, node},
        thermal::ThermalPreset,
        tuning::{ClusterConfig, ThermalConfig, TuningConfig},
    };

    fn tuning() -> TuningConfig {
        TuningConfig {
            cpu_clusters: vec![ClusterConfig {
                min_freq: 300,
                max_freq: 1000,
                governor: "powersave".to_string(),
                disabled_cores: vec![],
            }],
            thermal: ThermalConfig { preset: ThermalPreset::Extreme, set_on_boot: true },
            additional: AdditionalConfig {
                io_scheduler: String::new(),
                tcp_congestion: "bbr".to_string(),
                perf_mode: None,
            },
            ..TuningConfig::default()
        }
    }

    fn tree(root: &std::path::Path) {
        fake_cpu(root, 0, &[300000, 1000000, 1800000], "schedutil");
        node(root, thermal::SCONFIG, "0");
        node(root, "/proc/sys/net/ipv4/tcp_available_congestion_control", "cubic bbr");
        node(root, "/proc/sys/net/ipv4/tcp_congestion_control", "cubic");
    }

    #[test]
    fn partial_restore_without_set_on_boot() {
        let dir = tempdir().unwrap();
        tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());
        let cfg = UserConfig { tuning: Some(tuning()), ..UserConfig::default() };

        let report = apply_on_boot(&dev, &cfg);
        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["thermal", "additional.io_scheduler", "additional.tcp_congestion"]);
        assert_eq!(report.steps[1].status, StepStatus::Skipped("not set".to_string()));
        assert_eq!(dev.sysfs.read_u64(thermal::SCONFIG), Some(2));
        assert_eq!(
            dev.sysfs.read_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor").as_deref(),
            Some("schedutil")
        );
    }

    #[test]
    fn full_restore_with_set_on_boot() {
        let dir = tempdir().unwrap();
        tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());
        let cfg = UserConfig { tuning: Some(tuning()), set_on_boot: true, ..UserConfig::default() };

        apply_on_boot(&dev, &cfg);
        assert_eq!(
            dev.sysfs.read_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor").as_deref(),
            Some("powersave")
        );
        assert_eq!(dev.sysfs.read_u64("/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq"), Some(1000000));
    }

    #[test]
    fn nothing_stored_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (dev, sh) = fake_device(dir.path());
        assert!(apply_on_boot(&dev, &UserConfig::default()).steps.is_empty());
        assert!(sh.commands().is_empty());
    }

    #[test]
    fn boot_wait_sees_property() {
        let dir = tempdir().unwrap();
        let (dev, sh) = fake_device(dir.path());
        sh.respond("getprop sys.boot_completed", "1\n");
        assert!(wait_for_boot(&dev, Duration::from_secs(0)));
    }
}

use std::{fs, path::Path, sync::Arc};

use chrono::{Local, TimeZone};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use kern_tuner::{
    apply::apply_config,
    profile_io::{export_profile, import_profile},
    shell::RecordingShell,
    soc::SocInfo,
    sysfs::Sysfs,
    thermal::{ThermalPreset, SCONFIG},
    tuning::TuningConfig,
    Device,
};

fn write(root: &Path, node: &str, content: &str) {
    let p = root.join(node.trim_start_matches('/'));
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, content).unwrap();
}

fn cpu(root: &Path, core: usize, freqs: &[u64], cur: (u64, u64), governor: &str) {
    let base = format!("/sys/devices/system/cpu/cpu{}/cpufreq", core);
    let table: Vec<String> = freqs.iter().map(|f| f.to_string()).collect();
    write(root, &format!("{}/cpuinfo_min_freq", base), &freqs[0].to_string());
    write(root, &format!("{}/cpuinfo_max_freq", base), &freqs[freqs.len() - 1].to_string());
    write(root, &format!("{}/scaling_min_freq", base), &cur.0.to_string());
    write(root, &format!("{}/scaling_max_freq", base), &cur.1.to_string());
    write(root, &format!("{}/scaling_cur_freq", base), &cur.0.to_string());
    write(root, &format!("{}/scaling_governor", base), governor);
    write(root, &format!("{}/scaling_available_governors", base), "schedutil performance powersave");
    write(root, &format!("{}/scaling_available_frequencies", base), &table.join(" "));
    if core > 0 {
        write(root, &format!("/sys/devices/system/cpu/cpu{}/online", core), "1");
    }
}

const LITTLE: &[u64] = &[300000, 1017600, 1804800];
const BIG: &[u64] = &[710400, 1862400, 2419200];

fn phone(root: &Path, little: (u64, u64), big: (u64, u64), governor: &str, preset: u32) {
    for core in 0..4 {
        cpu(root, core, LITTLE, little, governor);
    }
    for core in 4..8 {
        cpu(root, core, BIG, big, governor);
    }
    write(root, SCONFIG, &preset.to_string());
    write(root, "/proc/sys/vm/swappiness", "100");
    write(root, "/proc/sys/vm/dirty_ratio", "20");
    write(root, "/proc/sys/vm/min_free_kbytes", "8192");
}

fn device(root: &Path) -> (Device, Arc<RecordingShell>) {
    let sh = Arc::new(RecordingShell::new());
    let dev = Device::new(Sysfs::new(root), sh.clone()).with_swap_file("/data/swap/swapfile");
    (dev, sh)
}

fn kona() -> SocInfo {
    SocInfo {
        hardware: "qcom".to_string(),
        platform: "kona".to_string(),
        soc: "SM8250".to_string(),
        device: "alioth".to_string(),
        model: "POCO F3".to_string(),
    }
}

#[test]
fn export_import_apply_between_devices() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    phone(src.path(), (300000, 1017600), (710400, 1862400), "powersave", 2);
    phone(dst.path(), (300000, 1804800), (710400, 2419200), "schedutil", 0);
    let (src_dev, _) = device(src.path());
    let (dst_dev, _) = device(dst.path());

    let captured = TuningConfig::capture(&src_dev);
    assert_eq!(captured.cpu_clusters.len(), 2);
    assert_eq!(captured.cpu_clusters[1].max_freq, 1862);
    assert_eq!(captured.thermal.preset, ThermalPreset::Extreme);

    let at = Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
    let text = export_profile(&captured, &kona(), at).unwrap();

    let report = import_profile(&text, &kona()).unwrap();
    assert!(report.compatible);
    assert_eq!(report.config.cpu_clusters, captured.cpu_clusters);

    let applied = apply_config(&dst_dev, &report.config);
    let sys = &dst_dev.sysfs;
    for core in [0, 3] {
        assert_eq!(
            sys.read_u64(format!("/sys/devices/system/cpu/cpu{}/cpufreq/scaling_max_freq", core)),
            Some(1017600)
        );
    }
    assert_eq!(sys.read_u64("/sys/devices/system/cpu/cpu7/cpufreq/scaling_max_freq"), Some(1862400));
    assert_eq!(
        sys.read_string("/sys/devices/system/cpu/cpu5/cpufreq/scaling_governor").as_deref(),
        Some("powersave")
    );
    assert_eq!(sys.read_u64(SCONFIG), Some(2));
    assert_eq!(sys.read_u64("/proc/sys/vm/swappiness"), Some(100));
    assert!(!applied.reboot_required);
    assert!(applied.steps.iter().any(|s| s.name == "thermal"));
}

#[test]
fn foreign_profile_is_flagged() {
    let src = tempdir().unwrap();
    phone(src.path(), (300000, 1804800), (710400, 2419200), "schedutil", 0);
    let (dev, _) = device(src.path());

    let other = SocInfo {
        hardware: "mt6893".to_string(),
        platform: "mt6893".to_string(),
        soc: "MT6893".to_string(),
        ..kona()
    };
    let text = export_profile(&TuningConfig::capture(&dev), &other, Local::now()).unwrap();
    let report = import_profile(&text, &kona()).unwrap();
    assert!(!report.compatible);
    assert!(report.warning.unwrap().contains("MT6893"));
}

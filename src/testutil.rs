use std::{fs, path::Path, sync::Arc};

use crate::{device::Device, shell::RecordingShell, sysfs::Sysfs};

pub fn node(root: &Path, path: &str, content: &str) {
    let p = root.join(path.trim_start_matches('/'));
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(p, content).unwrap();
}

/// Replaces `path` with a link to /dev/null: writes succeed and nothing reads
/// back, like a node the kernel silently refuses to change.
pub fn dropping_node(root: &Path, path: &str) {
    let p = root.join(path.trim_start_matches('/'));
    let _ = fs::remove_file(&p);
    std::os::unix::fs::symlink("/dev/null", p).unwrap();
}

/// cpufreq tree for one core; `freqs_khz` sorted ascending.
pub fn fake_cpu(root: &Path, core: usize, freqs_khz: &[u64], governor: &str) {
    let base = format!("/sys/devices/system/cpu/cpu{}", core);
    let min = freqs_khz[0].to_string();
    let max = freqs_khz[freqs_khz.len() - 1].to_string();
    let table: Vec<String> = freqs_khz.iter().map(|f| f.to_string()).collect();

    node(root, &format!("{}/cpufreq/cpuinfo_min_freq", base), &min);
    node(root, &format!("{}/cpufreq/cpuinfo_max_freq", base), &max);
    node(root, &format!("{}/cpufreq/scaling_min_freq", base), &min);
    node(root, &format!("{}/cpufreq/scaling_max_freq", base), &max);
    node(root, &format!("{}/cpufreq/scaling_cur_freq", base), &min);
    node(root, &format!("{}/cpufreq/scaling_governor", base), governor);
    node(
        root,
        &format!("{}/cpufreq/scaling_available_governors", base),
        "schedutil performance powersave",
    );
    node(root, &format!("{}/cpufreq/scaling_available_frequencies", base), &table.join(" "));
    if core > 0 {
        node(root, &format!("{}/online", base), "1");
    }
}

/// Adreno style kgsl tree with frequencies in Hz.
pub fn fake_gpu(root: &Path, freqs_hz: &[u64]) {
    let base = "/sys/class/kgsl/kgsl-3d0";
    let mut desc = freqs_hz.to_vec();
    desc.sort_unstable_by(|a, b| b.cmp(a));
    let table: Vec<String> = desc.iter().map(|f| f.to_string()).collect();
    let min = freqs_hz[0].to_string();
    let max = freqs_hz[freqs_hz.len() - 1].to_string();

    node(root, &format!("{}/gpu_available_frequencies", base), &table.join(" "));
    node(root, &format!("{}/gpuclk", base), &min);
    node(root, &format!("{}/devfreq/min_freq", base), &min);
    node(root, &format!("{}/devfreq/max_freq", base), &max);
    node(root, &format!("{}/default_pwrlevel", base), &(freqs_hz.len() - 1).to_string());
    node(root, &format!("{}/num_pwrlevels", base), &freqs_hz.len().to_string());
    node(root, &format!("{}/gpu_busy_percentage", base), "12 %");
}

pub fn fake_device(root: &Path) -> (Device, Arc<RecordingShell>) {
    let sh = Arc::new(RecordingShell::new());
    let dev = Device::new(Sysfs::new(root), sh.clone());
    (dev, sh)
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    apply::Step,
    cpu,
    device::Device,
    error::{Error, Result},
    sysfs::{parse_choices, Sysfs},
    thermal::{self, ThermalPreset},
};

const BLOCK: &str = "/sys/block";
const TCP_CC: &str = "/proc/sys/net/ipv4/tcp_congestion_control";
const TCP_CC_AVAIL: &str = "/proc/sys/net/ipv4/tcp_available_congestion_control";
const VIRTUAL_BLOCK_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfMode {
    Performance,
    #[serde(alias = "balanced")]
    Balance,
    Battery,
}

impl PerfMode {
    pub fn governor(self) -> &'static str {
        match self {
            PerfMode::Performance => "performance",
            PerfMode::Balance => "schedutil",
            PerfMode::Battery => "powersave",
        }
    }

    pub fn thermal_preset(self) -> ThermalPreset {
        match self {
            PerfMode::Performance => ThermalPreset::Dynamic,
            PerfMode::Balance => ThermalPreset::Thermal20,
            PerfMode::Battery => ThermalPreset::Incalls,
        }
    }
}

impl fmt::Display for PerfMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PerfMode::Performance => "performance",
            PerfMode::Balance => "balance",
            PerfMode::Battery => "battery",
        })
    }
}

impl FromStr for PerfMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" | "perf" => Ok(PerfMode::Performance),
            "balance" | "balanced" => Ok(PerfMode::Balance),
            "battery" | "powersave" => Ok(PerfMode::Battery),
            other => Err(Error::Invalid(format!("unknown perf mode {:?}", other))),
        }
    }
}

/// Governor on every cluster plus the matching thermal preset. A device
/// without the vendor thermal node still gets the governor.
pub fn apply_perf_mode(dev: &Device, mode: PerfMode) -> Result<()> {
    cpu::set_governor_all(dev, mode.governor())?;
    match thermal::apply_thermal_preset(dev, mode.thermal_preset()) {
        Ok(_) | Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    tracing::info!("PERF: mode {}", mode);
    Ok(())
}

/// Physical block devices that expose an I/O scheduler.
pub fn block_devices(sys: &Sysfs) -> Vec<String> {
    sys.list_dir(BLOCK)
        .into_iter()
        .filter(|d| !VIRTUAL_BLOCK_PREFIXES.iter().any(|p| d.starts_with(p)))
        .filter(|d| sys.exists(format!("{}/{}/queue/scheduler", BLOCK, d)))
        .collect()
}

/// Options and current selection of the first block device.
pub fn io_schedulers(sys: &Sysfs) -> (Vec<String>, Option<String>) {
    block_devices(sys)
        .first()
        .and_then(|d| sys.read_string(format!("{}/{}/queue/scheduler", BLOCK, d)))
        .map(|s| parse_choices(&s))
        .unwrap_or_default()
}

/// Sets `scheduler` on every device that offers it; returns how many did.
pub fn set_io_scheduler(dev: &Device, scheduler: &str) -> Result<usize> {
    let mut n = 0;
    for d in block_devices(&dev.sysfs) {
        let node = format!("{}/{}/queue/scheduler", BLOCK, d);
        let (opts, cur) = parse_choices(&dev.sysfs.read_string(&node).unwrap_or_default());
        if !opts.iter().any(|o| o == scheduler) {
            continue;
        }
        if cur.as_deref() != Some(scheduler) {
            dev.sysfs.write(&node, scheduler)?;
        }
        n += 1;
    }
    if n == 0 {
        return Err(Error::Invalid(format!("no block device offers scheduler {:?}", scheduler)));
    }
    tracing::info!("IO: scheduler {} on {} devices", scheduler, n);
    Ok(n)
}

pub fn tcp_congestion(sys: &Sysfs) -> (Vec<String>, Option<String>) {
    (sys.read_list(TCP_CC_AVAIL), sys.read_string(TCP_CC))
}

pub fn set_tcp_congestion(dev: &Device, algorithm: &str) -> Result<bool> {
    let (available, _) = tcp_congestion(&dev.sysfs);
    if !available.is_empty() && !available.iter().any(|a| a == algorithm) {
        return Err(Error::Invalid(format!("tcp congestion {:?} not in {:?}", algorithm, available)));
    }
    let changed = dev.sysfs.write_if_changed(TCP_CC, algorithm)?;
    tracing::info!("NET: tcp congestion {}", algorithm);
    Ok(changed)
}

/// Extra knobs outside CPU, GPU, thermal and RAM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalConfig {
    #[serde(default)]
    pub io_scheduler: String,
    #[serde(default)]
    pub tcp_congestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_mode: Option<PerfMode>,
}

impl AdditionalConfig {
    pub fn read(sys: &Sysfs) -> Self {
        Self {
            io_scheduler: io_schedulers(sys).1.unwrap_or_default(),
            tcp_congestion: tcp_congestion(sys).1.unwrap_or_default(),
            perf_mode: None,
        }
    }
}

/// Empty fields are left untouched.
pub fn apply_additional(dev: &Device, cfg: &AdditionalConfig) -> Vec<Step> {
    let mut steps = Vec::new();
    if let Some(mode) = cfg.perf_mode {
        steps.push(Step::from_result("additional.perf_mode", apply_perf_mode(dev, mode)));
    }
    steps.push(if cfg.io_scheduler.is_empty() {
        Step::skipped("additional.io_scheduler", "not set")
    } else {
        Step::from_result("additional.io_scheduler", set_io_scheduler(dev, &cfg.io_scheduler))
    });
    steps.push(if cfg.tcp_congestion.is_empty() {
        Step::skipped("additional.tcp_congestion", "not set")
    } else {
        Step::from_result("additional.tcp_congestion", set_tcp_congestion(dev, &cfg.tcp_congestion))
    });
    steps
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::testutil::{fake_cpu, fake_device, node};

    fn block_tree(root: &std::path::Path) {
        node(root, "/sys/block/sda/queue/scheduler", "none [mq-deadline] kyber bfq\n");
        node(root, "/sys/block/sdb/queue/scheduler", "none [mq-deadline] kyber\n");
        node(root, "/sys/block/zram0/queue/scheduler", "[none]\n");
        node(root, "/sys/block/loop0/queue/scheduler", "[none] mq-deadline\n");
    }

    #[test]
    fn virtual_block_devices_are_skipped() {
        let dir = tempdir().unwrap();
        block_tree(dir.path());
        let sys = Sysfs::new(dir.path());
        assert_eq!(block_devices(&sys), vec!["sda", "sdb"]);
        let (opts, cur) = io_schedulers(&sys);
        assert_eq!(opts, vec!["none", "mq-deadline", "kyber", "bfq"]);
        assert_eq!(cur.as_deref(), Some("mq-deadline"));
    }

    #[test]
    fn scheduler_written_where_offered() {
        let dir = tempdir().unwrap();
        block_tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());

        assert!(set_io_scheduler(&dev, "cfq").is_err());
        assert_eq!(set_io_scheduler(&dev, "kyber").unwrap(), 2);
        assert_eq!(dev.sysfs.read_string("/sys/block/sda/queue/scheduler").as_deref(), Some("kyber"));
        assert_eq!(dev.sysfs.read_string("/sys/block/loop0/queue/scheduler").as_deref(), Some("[none] mq-deadline"));
    }

    #[test]
    fn tcp_congestion_validated() {
        let dir = tempdir().unwrap();
        node(dir.path(), TCP_CC_AVAIL, "reno cubic bbr\n");
        node(dir.path(), TCP_CC, "cubic\n");
        let (dev, _sh) = fake_device(dir.path());

        assert!(set_tcp_congestion(&dev, "bbr").unwrap());
        assert!(!set_tcp_congestion(&dev, "bbr").unwrap());
        assert!(matches!(set_tcp_congestion(&dev, "westwood"), Err(Error::Invalid(_))));
        assert_eq!(AdditionalConfig::read(&dev.sysfs).tcp_congestion, "bbr");
    }

    #[test]
    fn perf_mode_sets_governor_and_thermal() {
        let dir = tempdir().unwrap();
        fake_cpu(dir.path(), 0, &[300000, 1800000], "schedutil");
        fake_cpu(dir.path(), 1, &[300000, 1800000], "schedutil");
        node(dir.path(), thermal::SCONFIG, "0\n");
        let (dev, _sh) = fake_device(dir.path());

        apply_perf_mode(&dev, PerfMode::Battery).unwrap();
        assert_eq!(
            dev.sysfs.read_string("/sys/devices/system/cpu/cpu1/cpufreq/scaling_governor").as_deref(),
            Some("powersave")
        );
        assert_eq!(dev.sysfs.read_u64(thermal::SCONFIG), Some(8));
        assert_eq!("balanced".parse::<PerfMode>().unwrap(), PerfMode::Balance);
    }

    #[test]
    fn perf_mode_without_thermal_node_still_applies_governor() {
        let dir = tempdir().unwrap();
        fake_cpu(dir.path(), 0, &[300000, 1800000], "schedutil");
        let (dev, _sh) = fake_device(dir.path());
        apply_perf_mode(&dev, PerfMode::Performance).unwrap();
    }
}

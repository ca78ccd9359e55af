use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    apply::Step,
    device::Device,
    error::{Error, Result},
    shell::quote,
    sysfs::{parse_choices, Sysfs},
};

const SWAPPINESS: &str = "/proc/sys/vm/swappiness";
const DIRTY_RATIO: &str = "/proc/sys/vm/dirty_ratio";
const MIN_FREE_KBYTES: &str = "/proc/sys/vm/min_free_kbytes";
const PROC_SWAPS: &str = "/proc/swaps";
const ZRAM_SYS: &str = "/sys/block/zram0";
const ZRAM_DEV: &str = "/dev/block/zram0";

pub const MAX_SWAPPINESS: u32 = 200;
pub const MAX_SWAP_FILE_MB: u64 = 16384;
pub const MAX_ZRAM_MB: u64 = 65536;
const MIB: u64 = 1024 * 1024;

fn default_swappiness() -> u32 { 60 }
fn default_zram_size() -> u64 { 512 }
fn default_zram_algorithm() -> String { "lz4".to_string() }
fn default_dirty_ratio() -> u32 { 20 }
fn default_min_free() -> u64 { 8192 }

/// Sizes are MB except `min_free_mem` which is kB like the kernel node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamConfig {
    #[serde(default = "default_swappiness")]
    pub swappiness: u32,
    #[serde(default = "default_zram_size")]
    pub zram_size: u64,
    #[serde(default = "default_zram_algorithm")]
    pub zram_algorithm: String,
    #[serde(default = "default_dirty_ratio")]
    pub dirty_ratio: u32,
    #[serde(default = "default_min_free")]
    pub min_free_mem: u64,
    #[serde(default)]
    pub swap_size: u64,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self {
            swappiness: default_swappiness(),
            zram_size: default_zram_size(),
            zram_algorithm: default_zram_algorithm(),
            dirty_ratio: default_dirty_ratio(),
            min_free_mem: default_min_free(),
            swap_size: 0,
        }
    }
}

impl RamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.swappiness > MAX_SWAPPINESS {
            return Err(Error::Invalid(format!("swappiness {} > {}", self.swappiness, MAX_SWAPPINESS)));
        }
        if self.dirty_ratio > 100 {
            return Err(Error::Invalid(format!("dirty_ratio {} > 100", self.dirty_ratio)));
        }
        if self.zram_size > MAX_ZRAM_MB {
            return Err(Error::Invalid(format!("zram_size {} MB > {}", self.zram_size, MAX_ZRAM_MB)));
        }
        if self.swap_size > MAX_SWAP_FILE_MB {
            return Err(Error::Invalid(format!("swap_size {} MB > {}", self.swap_size, MAX_SWAP_FILE_MB)));
        }
        Ok(())
    }

    /// Current kernel values; anything unreadable keeps its default.
    pub fn read(dev: &Device) -> Self {
        let sys = &dev.sysfs;
        let def = RamConfig::default();
        let zram = zram_status(sys);
        Self {
            swappiness: sys.read_u64(SWAPPINESS).map(|v| v as u32).unwrap_or(def.swappiness),
            zram_size: zram.as_ref().map(|z| z.size_mb).unwrap_or(0),
            zram_algorithm: zram
                .and_then(|z| z.algorithm)
                .unwrap_or(def.zram_algorithm),
            dirty_ratio: sys.read_u64(DIRTY_RATIO).map(|v| v as u32).unwrap_or(def.dirty_ratio),
            min_free_mem: sys.read_u64(MIN_FREE_KBYTES).unwrap_or(def.min_free_mem),
            swap_size: swap_file_size_mb(dev).unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ZramInfo {
    pub size_mb: u64,
    pub algorithm: Option<String>,
    pub algorithms: Vec<String>,
    pub active: bool,
}

fn swap_active(sys: &Sysfs, dev_path: &str) -> bool {
    sys.read_string(PROC_SWAPS)
        .map(|s| s.lines().skip(1).any(|l| l.split_whitespace().next() == Some(dev_path)))
        .unwrap_or(false)
}

pub fn zram_status(sys: &Sysfs) -> Option<ZramInfo> {
    if !sys.exists(ZRAM_SYS) {
        return None;
    }
    let (algorithms, algorithm) = parse_choices(
        &sys.read_string(format!("{}/comp_algorithm", ZRAM_SYS)).unwrap_or_default(),
    );
    Some(ZramInfo {
        size_mb: sys.read_u64(format!("{}/disksize", ZRAM_SYS)).unwrap_or(0) / MIB,
        algorithm,
        algorithms,
        active: swap_active(sys, ZRAM_DEV),
    })
}

/// Rebuilds zram0 with `size_mb` and `algorithm`. Size 0 disables it.
/// Returns `false` when the device already matches.
pub fn set_zram(dev: &Device, size_mb: u64, algorithm: &str) -> Result<bool> {
    let bytes = size_mb
        .checked_mul(MIB)
        .ok_or_else(|| Error::Invalid(format!("zram_size {} MB out of range", size_mb)))?;
    let cur = zram_status(&dev.sysfs).ok_or_else(|| Error::NotFound(ZRAM_SYS.to_string()))?;
    let algo_matches = algorithm.is_empty() || cur.algorithm.as_deref() == Some(algorithm);
    if cur.size_mb == size_mb && algo_matches && (size_mb == 0 || cur.active) {
        return Ok(false);
    }

    if let Err(e) = dev.exec(&format!("swapoff {}", ZRAM_DEV)) {
        tracing::debug!("RAM: swapoff zram0: {}", e);
    }
    dev.sysfs.write(format!("{}/reset", ZRAM_SYS), 1)?;
    if size_mb == 0 {
        tracing::info!("RAM: zram disabled");
        return Ok(true);
    }

    if !algorithm.is_empty() {
        if cur.algorithms.is_empty() || cur.algorithms.iter().any(|a| a == algorithm) {
            dev.sysfs.write(format!("{}/comp_algorithm", ZRAM_SYS), algorithm)?;
        } else {
            tracing::warn!("RAM: zram algorithm {} unsupported ({:?}), keeping current", algorithm, cur.algorithms);
        }
    }
    dev.sysfs.write(format!("{}/disksize", ZRAM_SYS), bytes)?;
    dev.exec(&format!("mkswap {}", ZRAM_DEV))?;
    dev.exec(&format!("swapon {}", ZRAM_DEV))?;
    tracing::info!("RAM: zram {} MB ({})", size_mb, algorithm);
    Ok(true)
}

fn swap_file_size_mb(dev: &Device) -> Option<u64> {
    std::fs::metadata(dev.sysfs.path(&dev.swap_file)).ok().map(|m| m.len() / MIB)
}

fn recreate_swap_file(dev: &Device, size_mb: u64) -> Result<()> {
    let file = dev.swap_file.display().to_string();
    let q = quote(&file);
    if let Some(parent) = Path::new(&file).parent() {
        dev.exec(&format!("mkdir -p {}", quote(&parent.display().to_string())))?;
    }
    let _ = dev.exec(&format!("swapoff {}", q));
    dev.exec(&format!("rm -f {}", q))?;
    dev.exec(&format!("dd if=/dev/zero of={} bs=1M count={}", q, size_mb))?;
    dev.exec(&format!("chmod 600 {}", q))?;
    dev.exec(&format!("mkswap {}", q))?;
    dev.exec(&format!("swapon {}", q))?;
    Ok(())
}

/// Sizes the swap file, clamped to 16 GB. 0 turns it off and deletes it.
/// Returns `false` when nothing had to change.
pub fn set_swap_file(dev: &Device, size_mb: u64) -> Result<bool> {
    let size_mb = size_mb.min(MAX_SWAP_FILE_MB);
    let file = dev.swap_file.display().to_string();
    let q = quote(&file);
    let active = swap_active(&dev.sysfs, &file);
    let cur = swap_file_size_mb(dev);

    if size_mb == 0 {
        if cur.is_none() && !active {
            return Ok(false);
        }
        let _ = dev.exec(&format!("swapoff {}", q));
        dev.exec(&format!("rm -f {}", q))?;
        tracing::info!("RAM: swap file removed");
        return Ok(true);
    }

    if cur == Some(size_mb) {
        if active {
            return Ok(false);
        }
        match dev.exec(&format!("swapon {}", q)) {
            Ok(_) => {
                tracing::info!("RAM: swap file {} MB re-enabled", size_mb);
                return Ok(true);
            }
            Err(e) => tracing::warn!("RAM: swapon {} failed ({}), recreating", file, e),
        }
    }

    recreate_swap_file(dev, size_mb)?;
    tracing::info!("RAM: swap file {} MB", size_mb);
    Ok(true)
}

fn set_swappiness(dev: &Device, value: u32) -> Result<bool> {
    if value > MAX_SWAPPINESS {
        return Err(Error::Invalid(format!("swappiness {} > {}", value, MAX_SWAPPINESS)));
    }
    dev.sysfs.write_if_changed(SWAPPINESS, value)
}

fn set_dirty_ratio(dev: &Device, value: u32) -> Result<bool> {
    if value > 100 {
        return Err(Error::Invalid(format!("dirty_ratio {} > 100", value)));
    }
    dev.sysfs.write_if_changed(DIRTY_RATIO, value)
}

/// Sequential writes; a failing step does not stop the ones after it.
pub fn apply_ram_config(dev: &Device, cfg: &RamConfig) -> Vec<Step> {
    let mut steps = Vec::with_capacity(5);
    steps.push(Step::from_result("ram.swappiness", set_swappiness(dev, cfg.swappiness)));
    steps.push(Step::from_result("ram.zram", set_zram(dev, cfg.zram_size, cfg.zram_algorithm.trim())));
    steps.push(Step::from_result("ram.dirty_ratio", set_dirty_ratio(dev, cfg.dirty_ratio)));
    steps.push(if cfg.min_free_mem == 0 {
        Step::skipped("ram.min_free_kbytes", "0 keeps kernel default")
    } else {
        Step::from_result("ram.min_free_kbytes", dev.sysfs.write_if_changed(MIN_FREE_KBYTES, cfg.min_free_mem))
    });
    steps.push(Step::from_result("ram.swap_file", set_swap_file(dev, cfg.swap_size)));
    steps
}

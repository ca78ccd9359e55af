use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    device::Device,
    error::{Error, Result},
    freq::{clamp_range, within_tolerance},
    sysfs::Sysfs,
};

const MAX_CORES: usize = 16;
const FALLBACK_GOVERNORS: &[&str] = &["schedutil", "performance", "powersave", "ondemand", "conservative"];

fn core_dir(core: usize) -> String {
    format!("/sys/devices/system/cpu/cpu{}", core)
}

fn freq_node(core: usize, name: &str) -> String {
    format!("{}/cpufreq/{}", core_dir(core), name)
}

/// One frequency domain. Frequencies are MHz.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub index: usize,
    pub cores: Vec<usize>,
    pub hw_min: u64,
    pub hw_max: u64,
    pub cur_min: u64,
    pub cur_max: u64,
    pub cur_freq: u64,
    pub governor: String,
    pub governors: Vec<String>,
    pub frequencies: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CoreState {
    pub core: usize,
    pub online: bool,
}

fn read_mhz(sys: &Sysfs, core: usize, name: &str) -> Option<u64> {
    sys.read_u64(freq_node(core, name)).map(|khz| khz / 1000)
}

/// Exact table entry in kHz for `mhz`. Writing the truncated value would make
/// the kernel settle on the step below.
fn table_khz(sys: &Sysfs, core: usize, mhz: u64) -> u64 {
    sys.read_list(freq_node(core, "scaling_available_frequencies"))
        .iter()
        .filter_map(|s| s.parse::<u64>().ok())
        .find(|khz| khz / 1000 == mhz)
        .unwrap_or(mhz * 1000)
}

/// Groups cores by `cpuinfo_max_freq`; clusters come out ordered from the
/// slowest to the fastest domain.
pub fn detect_clusters(sys: &Sysfs) -> Vec<ClusterInfo> {
    let mut groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for core in 0..MAX_CORES {
        if let Some(max) = sys.read_u64(freq_node(core, "cpuinfo_max_freq")) {
            groups.entry(max).or_default().push(core);
        }
    }

    groups
        .into_values()
        .enumerate()
        .map(|(index, cores)| {
            let lead = cores[0];
            let hw_min = read_mhz(sys, lead, "cpuinfo_min_freq").unwrap_or(0);
            let hw_max = read_mhz(sys, lead, "cpuinfo_max_freq").unwrap_or(0);

            let mut governors = sys.read_list(freq_node(lead, "scaling_available_governors"));
            if governors.is_empty() {
                governors = FALLBACK_GOVERNORS.iter().map(|s| s.to_string()).collect();
            }

            let mut frequencies: Vec<u64> = sys
                .read_list(freq_node(lead, "scaling_available_frequencies"))
                .iter()
                .filter_map(|s| s.parse::<u64>().ok())
                .map(|khz| khz / 1000)
                .collect();
            frequencies.sort_unstable();
            frequencies.dedup();

            ClusterInfo {
                index,
                hw_min,
                hw_max,
                cur_min: read_mhz(sys, lead, "scaling_min_freq").unwrap_or(hw_min),
                cur_max: read_mhz(sys, lead, "scaling_max_freq").unwrap_or(hw_max),
                cur_freq: read_mhz(sys, lead, "scaling_cur_freq").unwrap_or(0),
                governor: sys
                    .read_string(freq_node(lead, "scaling_governor"))
                    .unwrap_or_else(|| "unknown".to_string()),
                governors,
                frequencies,
                cores,
            }
        })
        .collect()
}

pub fn find_cluster(sys: &Sysfs, index: usize) -> Result<ClusterInfo> {
    detect_clusters(sys)
        .into_iter()
        .find(|c| c.index == index)
        .ok_or_else(|| Error::NotFound(format!("cpu cluster {}", index)))
}

/// Clamp to the detected hardware range, write to every core in the cluster
/// and read back. Returns the applied `(min, max)` in MHz.
pub fn set_cluster_frequency(dev: &Device, index: usize, min: u64, max: u64) -> Result<(u64, u64)> {
    let cluster = find_cluster(&dev.sysfs, index)?;
    let (min, max) = clamp_range(min, max, cluster.hw_min, cluster.hw_max, &cluster.frequencies);

    let mut written = Vec::new();
    for &core in &cluster.cores {
        let min_node = freq_node(core, "scaling_min_freq");
        let max_node = freq_node(core, "scaling_max_freq");
        if !dev.sysfs.exists(&max_node) {
            continue;
        }
        // The kernel rejects a max below the current min, so order the writes.
        let cur_min = read_mhz(&dev.sysfs, core, "scaling_min_freq").unwrap_or(0);
        let (min_khz, max_khz) = (table_khz(&dev.sysfs, core, min), table_khz(&dev.sysfs, core, max));
        if max >= cur_min {
            dev.sysfs.write(&max_node, max_khz)?;
            dev.sysfs.write(&min_node, min_khz)?;
        } else {
            dev.sysfs.write(&min_node, min_khz)?;
            dev.sysfs.write(&max_node, max_khz)?;
        }
        written.push(core);
    }
    let Some(&lead) = written.first() else {
        return Err(Error::NotFound(format!("cpufreq nodes for cluster {}", index)));
    };

    for (name, wanted) in [("scaling_min_freq", min), ("scaling_max_freq", max)] {
        let got = read_mhz(&dev.sysfs, lead, name).unwrap_or(0);
        if !within_tolerance(wanted, got) {
            return Err(Error::Verify {
                path: dev.sysfs.path(freq_node(lead, name)),
                wanted: format!("{} MHz", wanted),
                got: format!("{} MHz", got),
            });
        }
    }

    tracing::info!("CPU: cluster{} {}-{} MHz (cores {:?})", index, min, max, written);
    Ok((min, max))
}

pub fn set_cluster_governor(dev: &Device, index: usize, governor: &str) -> Result<()> {
    let cluster = find_cluster(&dev.sysfs, index)?;
    if governor.trim().is_empty() {
        return Err(Error::Invalid("empty governor".to_string()));
    }
    if !cluster.governors.iter().any(|g| g == governor) {
        tracing::warn!("CPU: governor {} not advertised for cluster{} ({:?})", governor, index, cluster.governors);
    }

    let mut any = false;
    for &core in &cluster.cores {
        let node = freq_node(core, "scaling_governor");
        if dev.sysfs.exists(&node) {
            dev.sysfs.write_if_changed(&node, governor)?;
            any = true;
        }
    }
    if !any {
        return Err(Error::NotFound(format!("scaling_governor for cluster {}", index)));
    }
    tracing::info!("CPU: cluster{} governor {}", index, governor);
    Ok(())
}

/// Applies `governor` to every detected cluster; returns how many took it.
pub fn set_governor_all(dev: &Device, governor: &str) -> Result<usize> {
    let clusters = detect_clusters(&dev.sysfs);
    if clusters.is_empty() {
        return Err(Error::NotFound("cpu clusters".to_string()));
    }
    let mut ok = 0;
    let mut last_err = None;
    for c in &clusters {
        match set_cluster_governor(dev, c.index, governor) {
            Ok(()) => ok += 1,
            Err(e) => last_err = Some(e),
        }
    }
    match (ok, last_err) {
        (0, Some(e)) => Err(e),
        _ => Ok(ok),
    }
}

/// Core 0 is never taken offline.
pub fn set_core_online(dev: &Device, core: usize, online: bool) -> Result<()> {
    if core == 0 {
        return Err(Error::Invalid("cpu0 cannot be hotplugged".to_string()));
    }
    let node = format!("{}/online", core_dir(core));
    if !dev.sysfs.exists(&node) {
        return Err(Error::NotFound(node));
    }
    dev.sysfs.write_if_changed(&node, if online { 1 } else { 0 })?;
    tracing::info!("CPU: cpu{} {}", core, if online { "online" } else { "offline" });
    Ok(())
}

pub fn core_states(sys: &Sysfs) -> Vec<CoreState> {
    (0..MAX_CORES)
        .filter(|&core| sys.exists(core_dir(core)))
        .map(|core| CoreState {
            core,
            online: core == 0 || sys.read_u64(format!("{}/online", core_dir(core))).map(|v| v == 1).unwrap_or(true),
        })
        .collect()
}

pub fn offline_cores(sys: &Sysfs) -> Vec<usize> {
    core_states(sys).into_iter().filter(|c| !c.online).map(|c| c.core).collect()
}

#[derive(Clone)]
pub struct CpuStatSample {
    per_cpu: Vec<(u64, u64)>, // (idle_all, total)
}

fn parse_proc_stat_percpu(s: &str) -> Option<Vec<(u64, u64)>> {
    let mut out: Vec<(u64, u64)> = Vec::new();

    for line in s.lines() {
        if !line.starts_with("cpu") { continue; }
        if line.starts_with("cpu ") { continue; }

        let mut it = line.split_whitespace();
        let cpu_label = it.next()?;
        let idx: usize = cpu_label.get(3..)?.parse().ok()?;

        let vals: Vec<u64> = it.map_while(|v| v.parse::<u64>().ok()).collect();
        if vals.len() < 4 { continue; }

        let field = |i: usize| vals.get(i).copied().unwrap_or(0);
        let idle_all = field(3) + field(4);
        let total: u64 = (0..8).map(field).sum();

        if out.len() <= idx { out.resize(idx + 1, (0, 0)); }
        out[idx] = (idle_all, total);
    }

    if out.is_empty() { None } else { Some(out) }
}

/// Per-core busy percentage since the previous sample. The first call
/// returns zeros and primes `prev`.
pub fn cpu_utils_by_core(sys: &Sysfs, prev: &mut Option<CpuStatSample>) -> Option<Vec<u8>> {
    let cur = parse_proc_stat_percpu(&sys.read_string("/proc/stat")?)?;

    let util = if let Some(p) = prev {
        cur.iter()
            .enumerate()
            .map(|(i, (idle, total))| {
                let (pidle, ptotal) = p.per_cpu.get(i).copied().unwrap_or((0, 0));
                let didle = idle.saturating_sub(pidle);
                let dtotal = total.saturating_sub(ptotal);
                if dtotal == 0 {
                    0
                } else {
                    let busy = dtotal.saturating_sub(didle);
                    (busy.saturating_mul(100) / dtotal).min(100) as u8
                }
            })
            .collect()
    } else {
        vec![0u8; cur.len()]
    };

    *prev = Some(CpuStatSample { per_cpu: cur });
    Some(util)
}

pub fn avg_util(utils: &[u8], cpus: &[usize]) -> u8 {
    let picked: Vec<u32> = cpus.iter().filter_map(|&c| utils.get(c)).map(|&u| u as u32).collect();
    if picked.is_empty() { 0 } else { (picked.iter().sum::<u32>() / picked.len() as u32) as u8 }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::testutil::{dropping_node, fake_cpu, fake_device, node};

    const LITTLE: &[u64] = &[300000, 576000, 1017600, 1305600, 1804800];
    const BIG: &[u64] = &[710400, 1286400, 1862400, 2419200];

    fn two_cluster_tree(root: &std::path::Path) {
        for core in 0..4 {
            fake_cpu(root, core, LITTLE, "schedutil");
        }
        for core in 4..6 {
            fake_cpu(root, core, BIG, "schedutil");
        }
    }

    #[test]
    fn detects_clusters_sorted_by_max_freq() {
        let dir = tempdir().unwrap();
        // Big cores first on disk to prove ordering comes from frequency.
        fake_cpu(dir.path(), 0, BIG, "performance");
        fake_cpu(dir.path(), 1, LITTLE, "schedutil");
        fake_cpu(dir.path(), 2, LITTLE, "schedutil");

        let clusters = detect_clusters(&Sysfs::new(dir.path()));
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cores, vec![1, 2]);
        assert_eq!((clusters[0].hw_min, clusters[0].hw_max), (300, 1804));
        assert_eq!(clusters[0].frequencies, vec![300, 576, 1017, 1305, 1804]);
        assert_eq!(clusters[1].cores, vec![0]);
        assert_eq!(clusters[1].governor, "performance");
        assert_eq!(clusters[1].index, 1);
    }

    #[test]
    fn frequency_is_clamped_snapped_and_written_to_every_core() {
        let dir = tempdir().unwrap();
        two_cluster_tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());

        let applied = set_cluster_frequency(&dev, 0, 100, 1400).unwrap();
        assert_eq!(applied, (300, 1305));
        for core in 0..4 {
            assert_eq!(dev.sysfs.read_u64(freq_node(core, "scaling_max_freq")), Some(1305600));
            assert_eq!(dev.sysfs.read_u64(freq_node(core, "scaling_min_freq")), Some(300000));
        }
        // Other cluster untouched.
        assert_eq!(dev.sysfs.read_u64(freq_node(4, "scaling_max_freq")), Some(2419200));
    }

    #[test]
    fn frequency_that_does_not_stick_is_a_verify_error() {
        let dir = tempdir().unwrap();
        two_cluster_tree(dir.path());
        dropping_node(dir.path(), "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq");
        let (dev, _sh) = fake_device(dir.path());

        match set_cluster_frequency(&dev, 0, 300, 1305) {
            Err(Error::Verify { path, wanted, got }) => {
                assert!(path.ends_with("cpu0/cpufreq/scaling_max_freq"));
                assert_eq!(wanted, "1305 MHz");
                assert_eq!(got, "0 MHz");
            }
            other => panic!("expected a verify error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_cluster_is_not_found() {
        let dir = tempdir().unwrap();
        two_cluster_tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());
        assert!(matches!(set_cluster_frequency(&dev, 7, 300, 900), Err(Error::NotFound(_))));
    }

    #[test]
    fn governor_applies_to_all_clusters() {
        let dir = tempdir().unwrap();
        two_cluster_tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());

        assert_eq!(set_governor_all(&dev, "performance").unwrap(), 2);
        for core in 0..6 {
            assert_eq!(
                dev.sysfs.read_string(freq_node(core, "scaling_governor")).as_deref(),
                Some("performance")
            );
        }
    }

    #[test]
    fn core_zero_stays_online() {
        let dir = tempdir().unwrap();
        two_cluster_tree(dir.path());
        let (dev, _sh) = fake_device(dir.path());

        assert!(matches!(set_core_online(&dev, 0, false), Err(Error::Invalid(_))));
        set_core_online(&dev, 5, false).unwrap();
        assert_eq!(offline_cores(&dev.sysfs), vec![5]);
        set_core_online(&dev, 5, true).unwrap();
        assert!(offline_cores(&dev.sysfs).is_empty());
    }

    #[test]
    fn utilisation_from_proc_stat_deltas() {
        let dir = tempdir().unwrap();
        let sys = Sysfs::new(dir.path());
        node(dir.path(), "/proc/stat", "cpu  10 0 10 80 0 0 0 0\ncpu0 10 0 10 80 0 0 0 0\ncpu1 0 0 0 100 0 0 0 0\n");

        let mut prev = None;
        assert_eq!(cpu_utils_by_core(&sys, &mut prev), Some(vec![0, 0]));

        fs::write(
            dir.path().join("proc/stat"),
            "cpu  0 0 0 0\ncpu0 60 0 10 130 0 0 0 0\ncpu1 25 0 25 150 0 0 0 0\n",
        )
        .unwrap();
        let utils = cpu_utils_by_core(&sys, &mut prev).unwrap();
        assert_eq!(utils, vec![50, 50]);
        assert_eq!(avg_util(&[20, 40, 90], &[0, 1]), 30);
        assert_eq!(avg_util(&[20], &[3]), 0);
    }
}

//! The tuning record that is exported, imported, stored and applied.
//! Frequencies are MHz throughout.

use serde::{Deserialize, Serialize};

use crate::{
    cpu::{self, ClusterInfo},
    device::Device,
    gpu::{self, GpuRenderer},
    ram::RamConfig,
    thermal::{self, ThermalPreset},
    tweaks::AdditionalConfig,
};

fn default_governor() -> String {
    "schedutil".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub min_freq: u64,
    pub max_freq: u64,
    #[serde(default = "default_governor")]
    pub governor: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_cores: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuConfig {
    pub min_freq: u64,
    pub max_freq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_level: Option<u32>,
    #[serde(default)]
    pub renderer: GpuRenderer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermalConfig {
    #[serde(default)]
    pub preset: ThermalPreset,
    #[serde(default)]
    pub set_on_boot: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Index is the cluster number, slowest first.
    #[serde(default)]
    pub cpu_clusters: Vec<ClusterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuConfig>,
    #[serde(default)]
    pub thermal: ThermalConfig,
    #[serde(default)]
    pub ram: RamConfig,
    #[serde(default)]
    pub additional: AdditionalConfig,
}

/// Cores a cluster is responsible for, including offline ones that no
/// longer show up in cpufreq. Clusters are contiguous core ranges.
pub fn owned_cores(clusters: &[ClusterInfo], index: usize, all_cores: &[usize]) -> Vec<usize> {
    let Some(first) = clusters.get(index).and_then(|c| c.cores.first().copied()) else {
        return Vec::new();
    };
    let next = clusters
        .iter()
        .filter_map(|c| c.cores.first().copied())
        .filter(|&f| f > first)
        .min()
        .unwrap_or(usize::MAX);
    all_cores.iter().copied().filter(|&c| c >= first && c < next).collect()
}

impl TuningConfig {
    /// Snapshot of what the device is running right now.
    pub fn capture(dev: &Device) -> Self {
        let clusters = cpu::detect_clusters(&dev.sysfs);
        let states = cpu::core_states(&dev.sysfs);
        let all: Vec<usize> = states.iter().map(|s| s.core).collect();
        let offline: Vec<usize> = states.iter().filter(|s| !s.online).map(|s| s.core).collect();

        let cpu_clusters = clusters
            .iter()
            .map(|c| ClusterConfig {
                min_freq: c.cur_min,
                max_freq: c.cur_max,
                governor: c.governor.clone(),
                disabled_cores: owned_cores(&clusters, c.index, &all)
                    .into_iter()
                    .filter(|core| offline.contains(core))
                    .collect(),
            })
            .collect();

        let gpu = gpu::detect_gpu(dev).map(|g| GpuConfig {
            min_freq: g.min_freq,
            max_freq: g.max_freq,
            power_level: g.power_level,
            renderer: g.renderer,
        });

        TuningConfig {
            cpu_clusters,
            gpu,
            thermal: ThermalConfig {
                preset: thermal::current_preset(&dev.sysfs).unwrap_or_default(),
                set_on_boot: false,
            },
            ram: RamConfig::read(dev),
            additional: AdditionalConfig::read(&dev.sysfs),
        }
    }
}

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    device::Device,
    error::{Error, Result},
    sysfs::Sysfs,
};

pub const SCONFIG: &str = "/sys/class/thermal/thermal_message/sconfig";
const THERMAL_CLASS: &str = "/sys/class/thermal";

/// Vendor thermal profiles selected through `thermal_message/sconfig`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermalPreset {
    #[default]
    #[serde(rename = "Not Set")]
    NotSet,
    #[serde(rename = "Class 0")]
    Class0,
    #[serde(rename = "Extreme")]
    Extreme,
    #[serde(rename = "Dynamic")]
    Dynamic,
    #[serde(rename = "Incalls")]
    Incalls,
    #[serde(rename = "Thermal 20")]
    Thermal20,
}

impl ThermalPreset {
    pub const ALL: [ThermalPreset; 6] = [
        ThermalPreset::NotSet,
        ThermalPreset::Class0,
        ThermalPreset::Extreme,
        ThermalPreset::Dynamic,
        ThermalPreset::Incalls,
        ThermalPreset::Thermal20,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ThermalPreset::NotSet => "Not Set",
            ThermalPreset::Class0 => "Class 0",
            ThermalPreset::Extreme => "Extreme",
            ThermalPreset::Dynamic => "Dynamic",
            ThermalPreset::Incalls => "Incalls",
            ThermalPreset::Thermal20 => "Thermal 20",
        }
    }

    /// `sconfig` index. `NotSet` maps to the vendor default (0) but is never
    /// written.
    pub fn index(self) -> u32 {
        match self {
            ThermalPreset::NotSet => 0,
            ThermalPreset::Class0 => 11,
            ThermalPreset::Extreme => 2,
            ThermalPreset::Dynamic => 10,
            ThermalPreset::Incalls => 8,
            ThermalPreset::Thermal20 => 20,
        }
    }

    pub fn from_index(idx: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|p| *p != ThermalPreset::NotSet && p.index() == idx)
            .unwrap_or(ThermalPreset::NotSet)
    }

    pub fn is_set(self) -> bool {
        self != ThermalPreset::NotSet
    }
}

impl fmt::Display for ThermalPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl FromStr for ThermalPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = squash(s);
        Self::ALL
            .into_iter()
            .find(|p| squash(p.name()) == key)
            .ok_or_else(|| Error::Invalid(format!("unknown thermal preset {:?}", s)))
    }
}

/// Writes the preset index. The node is normally read-only, so it is opened
/// up for the write and locked again afterwards. `NotSet` writes nothing and
/// returns `false`.
pub fn apply_thermal_preset(dev: &Device, preset: ThermalPreset) -> Result<bool> {
    if !preset.is_set() {
        return Ok(false);
    }
    if !dev.sysfs.exists(SCONFIG) {
        return Err(Error::NotFound(SCONFIG.to_string()));
    }
    dev.sysfs.set_mode(SCONFIG, 0o666)?;
    let res = dev.sysfs.write(SCONFIG, preset.index());
    if let Err(e) = dev.sysfs.set_mode(SCONFIG, 0o444) {
        tracing::warn!("THERM: could not relock sconfig: {}", e);
    }
    res?;
    tracing::info!("THERM: preset {} ({})", preset, preset.index());
    Ok(true)
}

pub fn current_preset(sys: &Sysfs) -> Option<ThermalPreset> {
    sys.read_u64(SCONFIG).map(|v| ThermalPreset::from_index(v as u32))
}

/// Thermal zones grouped by their `type` name.
#[derive(Clone, Debug, Default)]
pub struct ZoneSet {
    pub cpu: Vec<PathBuf>,
    pub gpu: Vec<PathBuf>,
    pub battery: Option<PathBuf>,
}

impl ZoneSet {
    pub fn detect(sys: &Sysfs) -> Self {
        let mut set = ZoneSet::default();
        for name in sys.list_dir(THERMAL_CLASS) {
            if !name.starts_with("thermal_zone") {
                continue;
            }
            let dir = PathBuf::from(THERMAL_CLASS).join(&name);
            let ty = sys.read_string(dir.join("type")).unwrap_or_default().to_ascii_lowercase();
            let temp = dir.join("temp");
            if !sys.exists(&temp) {
                continue;
            }
            if ty.contains("cpu") {
                set.cpu.push(temp);
            } else if ty.contains("gpu") {
                set.gpu.push(temp);
            } else if (ty.contains("batt") || ty == "battery") && set.battery.is_none() {
                set.battery = Some(temp);
            }
        }
        set
    }
}

pub fn read_avg_temp_mc(sys: &Sysfs, paths: &[PathBuf]) -> Option<i32> {
    let vals: Vec<i64> = paths.iter().filter_map(|p| sys.read_i64(p)).collect();
    if vals.is_empty() { None } else { Some((vals.iter().sum::<i64>() / vals.len() as i64) as i32) }
}

pub fn read_soc_temp_mc(cpu_avg: Option<i32>, gpu_avg: Option<i32>) -> Option<i32> {
    match (cpu_avg, gpu_avg) {
        (Some(c), Some(g)) => Some(c.max(g)),
        (Some(c), None) => Some(c),
        (None, Some(g)) => Some(g),
        (None, None) => None,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Temps {
    pub cpu_mc: Option<i32>,
    pub gpu_mc: Option<i32>,
    pub soc_mc: Option<i32>,
    pub battery_mc: Option<i32>,
}

pub fn read_temps(sys: &Sysfs, zones: &ZoneSet) -> Temps {
    let cpu_mc = read_avg_temp_mc(sys, &zones.cpu);
    let gpu_mc = read_avg_temp_mc(sys, &zones.gpu);
    Temps {
        cpu_mc,
        gpu_mc,
        soc_mc: read_soc_temp_mc(cpu_mc, gpu_mc),
        battery_mc: zones.battery.as_ref().and_then(|p| sys.read_i64(p)).map(|v| v as i32),
    }
}

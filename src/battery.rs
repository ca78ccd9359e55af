use serde::Serialize;

use crate::{
    device::Device,
    error::{Error, Result},
    sysfs::Sysfs,
};

const POWER_SUPPLY: &str = "/sys/class/power_supply";

/// First existing node wins. The flag marks nodes where 0 stops charging.
const BYPASS_NODES: &[(&str, bool)] = &[
    ("/sys/class/power_supply/battery/input_suspend", false),
    ("/sys/class/power_supply/battery/charging_enabled", true),
    ("/sys/class/power_supply/usb/device/razer_charge_limit_enable", false),
];

/// Percent or mA, depending on the node.
const CHARGE_LIMIT_NODES: &[&str] = &[
    "/sys/class/power_supply/battery/charge_control_limit",
    "/sys/class/power_supply/battery/constant_charge_current_max",
    "/sys/class/qcom-battery/restricted_current",
];

/// Where charging state and battery figures are read from.
#[derive(Clone, Debug, Default)]
pub struct ChargeProbe {
    online_nodes: Vec<String>,
    battery_dir: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatteryInfo {
    pub level: Option<u8>,
    pub status: String,
    pub charging: bool,
    /// Degrees C.
    pub temperature: Option<f32>,
}

impl ChargeProbe {
    pub fn detect(sys: &Sysfs) -> Option<Self> {
        let mut online_nodes = Vec::new();
        let mut battery_dir = None;

        for name in sys.list_dir(POWER_SUPPLY) {
            let dir = format!("{}/{}", POWER_SUPPLY, name);
            let ty = sys.read_string(format!("{}/type", dir)).unwrap_or_default();

            if ty.eq_ignore_ascii_case("Battery") {
                if battery_dir.is_none() {
                    battery_dir = Some(dir);
                }
                continue;
            }

            let online = format!("{}/online", dir);
            if sys.exists(&online) {
                online_nodes.push(online);
            }
        }

        if online_nodes.is_empty() && battery_dir.is_none() {
            None
        } else {
            Some(Self { online_nodes, battery_dir })
        }
    }

    fn status(&self, sys: &Sysfs) -> Option<String> {
        sys.read_string(format!("{}/status", self.battery_dir.as_ref()?))
    }

    pub fn is_charging(&self, sys: &Sysfs) -> bool {
        if self.online_nodes.iter().any(|p| sys.read_u64(p) == Some(1)) {
            return true;
        }
        self.status(sys)
            .is_some_and(|s| s.eq_ignore_ascii_case("Charging") || s.eq_ignore_ascii_case("Full"))
    }

    pub fn read(&self, sys: &Sysfs) -> BatteryInfo {
        let node = |leaf: &str| self.battery_dir.as_ref().map(|d| format!("{}/{}", d, leaf));
        BatteryInfo {
            level: node("capacity")
                .and_then(|p| sys.read_u64(p))
                .map(|v| v.min(100) as u8),
            status: self.status(sys).unwrap_or_else(|| "Unknown".to_string()),
            charging: self.is_charging(sys),
            // Tenths of a degree.
            temperature: node("temp")
                .and_then(|p| sys.read_i64(p))
                .map(|t| t as f32 / 10.0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChargingControls {
    pub bypass_node: Option<String>,
    /// Input suspended: the device runs from the charger, the battery rests.
    pub bypass: Option<bool>,
    pub limit_node: Option<String>,
    pub limit: Option<u64>,
}

fn bypass_node(sys: &Sysfs) -> Option<(&'static str, bool)> {
    BYPASS_NODES.iter().copied().find(|(p, _)| sys.exists(p))
}

fn limit_node(sys: &Sysfs) -> Option<&'static str> {
    CHARGE_LIMIT_NODES.iter().copied().find(|p| sys.exists(p))
}

pub fn charging_controls(sys: &Sysfs) -> ChargingControls {
    let bypass = bypass_node(sys);
    let limit = limit_node(sys);
    ChargingControls {
        bypass_node: bypass.map(|(p, _)| p.to_string()),
        bypass: bypass.and_then(|(p, inverted)| sys.read_u64(p).map(|v| (v == 1) != inverted)),
        limit_node: limit.map(str::to_string),
        limit: limit.and_then(|p| sys.read_u64(p)),
    }
}

pub fn set_bypass_charging(dev: &Device, on: bool) -> Result<()> {
    let (node, inverted) = bypass_node(&dev.sysfs).ok_or_else(|| Error::NotFound("bypass charging node".to_string()))?;
    dev.sysfs.write_if_changed(node, if on != inverted { 1 } else { 0 })?;
    tracing::info!("BATT: bypass charging {} via {}", if on { "on" } else { "off" }, node);
    Ok(())
}

pub fn set_charge_limit(dev: &Device, value: u64) -> Result<()> {
    let node = limit_node(&dev.sysfs).ok_or_else(|| Error::NotFound("charge limit node".to_string()))?;
    dev.sysfs.write_if_changed(node, value)?;
    tracing::info!("BATT: charge limit {} via {}", value, node);
    Ok(())
}

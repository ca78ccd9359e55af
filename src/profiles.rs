use serde::{Deserialize, Serialize};

use crate::{
    apply::Step,
    cpu,
    device::Device,
    error::Result,
    thermal::{self, ThermalPreset},
};

fn default_governor() -> String {
    "schedutil".to_string()
}

fn yes() -> bool {
    true
}

/// Settings forced while a given app is in the foreground.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    pub package: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_governor")]
    pub governor: String,
    #[serde(default)]
    pub thermal_preset: ThermalPreset,
    /// Hz; 0 leaves the display alone.
    #[serde(default)]
    pub refresh_rate: u32,
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl AppProfile {
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.package } else { &self.name }
    }
}

pub fn find_profile<'a>(profiles: &'a [AppProfile], package: &str) -> Option<&'a AppProfile> {
    profiles.iter().find(|p| p.enabled && p.package == package)
}

const REFRESH_KEYS: &[(&str, &str)] = &[
    ("system", "peak_refresh_rate"),
    ("system", "min_refresh_rate"),
    ("secure", "peak_refresh_rate"),
    ("secure", "min_refresh_rate"),
];

/// Pins the display to `hz`. 0 removes the overrides so the system default
/// takes over again.
pub fn set_refresh_rate(dev: &Device, hz: u32) -> Result<()> {
    for (ns, key) in REFRESH_KEYS {
        let cmd = if hz == 0 {
            format!("settings delete {} {}", ns, key)
        } else {
            format!("settings put {} {} {}.0", ns, key, hz)
        };
        dev.exec(&cmd)?;
    }
    tracing::info!("DISPLAY: refresh rate {}", if hz == 0 { "default".to_string() } else { format!("{} Hz", hz) });
    Ok(())
}

pub fn apply_app_profile(dev: &Device, p: &AppProfile) -> Vec<Step> {
    let mut steps = Vec::new();
    steps.push(if p.governor.is_empty() {
        Step::skipped("profile.governor", "not set")
    } else {
        Step::from_result("profile.governor", cpu::set_governor_all(dev, &p.governor))
    });
    steps.push(if p.thermal_preset.is_set() {
        Step::from_result("profile.thermal", thermal::apply_thermal_preset(dev, p.thermal_preset))
    } else {
        Step::skipped("profile.thermal", "Not Set")
    });
    if p.refresh_rate > 0 {
        steps.push(Step::from_result("profile.refresh_rate", set_refresh_rate(dev, p.refresh_rate)));
    }
    tracing::info!("PROFILE: {} applied ({} / {})", p.label(), p.governor, p.thermal_preset);
    steps
}

/// Tracks the foreground package and decides what to apply on each change.
#[derive(Debug, Default)]
pub struct ProfileSwitcher {
    active: Option<AppProfile>,
}

impl ProfileSwitcher {
    pub fn active(&self) -> Option<&AppProfile> {
        self.active.as_ref()
    }

    /// Applies the profile for `package` when it differs from the active one.
    /// Leaving a profile that changed the refresh rate restores the default.
    /// Returns the newly applied profile.
    pub fn on_foreground(
        &mut self,
        dev: &Device,
        profiles: &[AppProfile],
        package: Option<&str>,
    ) -> Option<AppProfile> {
        let next = package.and_then(|pkg| find_profile(profiles, pkg)).cloned();
        if next == self.active {
            return None;
        }

        let restore_rate = self.active.as_ref().is_some_and(|p| p.refresh_rate > 0)
            && next.as_ref().map_or(true, |n| n.refresh_rate == 0);
        if restore_rate {
            if let Err(e) = set_refresh_rate(dev, 0) {
                tracing::warn!("PROFILE: refresh rate restore failed: {}", e);
            }
        }

        if let Some(p) = &next {
            apply_app_profile(dev, p);
        } else if let Some(prev) = &self.active {
            tracing::info!("PROFILE: left {}", prev.label());
        }
        self.active = next.clone();
        next
    }
}

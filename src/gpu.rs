use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    device::Device,
    error::{Error, Result},
    freq::{clamp_range, within_tolerance},
    shell::{getprop, setprop},
    sysfs::Sysfs,
};

const GPU_BASES: &[&str] = &["/sys/class/kgsl/kgsl-3d0", "/sys/kernel/gpu"];

const RENDERER_PROP: &str = "debug.hwui.renderer";
/// Cleared before a new renderer is set; also the keys owned in the prop file.
const RENDERER_PROPS: &[&str] = &[
    "debug.hwui.renderer",
    "debug.hwui.skia_atrace_enabled",
    "ro.hwui.use_vulkan",
    "debug.angle.backend",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuRenderer {
    /// Leave the renderer alone.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "OpenGL ES", alias = "opengl")]
    OpenGl,
    #[serde(rename = "Vulkan", alias = "vulkan")]
    Vulkan,
    #[serde(rename = "SkiaGL", alias = "skiagl")]
    SkiaGl,
    #[serde(rename = "SkiaVulkan", alias = "skiavk")]
    SkiaVulkan,
    #[serde(rename = "ANGLE", alias = "angle")]
    Angle,
}

impl GpuRenderer {
    pub const ALL: [GpuRenderer; 5] = [
        GpuRenderer::OpenGl,
        GpuRenderer::Vulkan,
        GpuRenderer::SkiaGl,
        GpuRenderer::SkiaVulkan,
        GpuRenderer::Angle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GpuRenderer::Auto => "auto",
            GpuRenderer::OpenGl => "OpenGL ES",
            GpuRenderer::Vulkan => "Vulkan",
            GpuRenderer::SkiaGl => "SkiaGL",
            GpuRenderer::SkiaVulkan => "SkiaVulkan",
            GpuRenderer::Angle => "ANGLE",
        }
    }

    /// Value for `debug.hwui.renderer`.
    pub fn prop_value(self) -> Option<&'static str> {
        match self {
            GpuRenderer::Auto => None,
            GpuRenderer::OpenGl => Some("opengl"),
            GpuRenderer::Vulkan => Some("vulkan"),
            GpuRenderer::SkiaGl => Some("skiagl"),
            GpuRenderer::SkiaVulkan => Some("skiavk"),
            GpuRenderer::Angle => Some("angle"),
        }
    }

    /// Every property this renderer needs, main one first.
    pub fn props(self) -> Vec<(&'static str, &'static str)> {
        let Some(value) = self.prop_value() else {
            return Vec::new();
        };
        let mut out = vec![(RENDERER_PROP, value)];
        match self {
            GpuRenderer::Vulkan | GpuRenderer::SkiaVulkan => out.push(("ro.hwui.use_vulkan", "true")),
            GpuRenderer::Angle => out.push(("debug.angle.backend", "opengl")),
            _ => {}
        }
        out
    }

    fn from_prop(value: &str) -> Option<Self> {
        let v = value.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.prop_value().is_some_and(|p| p.eq_ignore_ascii_case(v)))
    }
}

impl fmt::Display for GpuRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GpuRenderer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(GpuRenderer::Auto);
        }
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .or_else(|| Self::from_prop(s))
            .ok_or_else(|| Error::Invalid(format!("unknown renderer {:?}", s)))
    }
}

/// Frequencies are MHz.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub base: String,
    pub frequencies: Vec<u64>,
    pub cur_freq: u64,
    pub min_freq: u64,
    pub max_freq: u64,
    pub power_level: Option<u32>,
    pub num_power_levels: Option<u32>,
    pub renderer: GpuRenderer,
}

impl GpuInfo {
    pub fn hw_range(&self) -> (u64, u64) {
        match (self.frequencies.first(), self.frequencies.last()) {
            (Some(&lo), Some(&hi)) => (lo, hi),
            _ => (self.min_freq, self.max_freq),
        }
    }
}

/// kgsl reports Hz, some vendor trees MHz.
fn to_mhz(v: u64) -> u64 {
    if v >= 1_000_000 { v / 1_000_000 } else { v }
}

fn gpu_base(sys: &Sysfs) -> Option<&'static str> {
    GPU_BASES.iter().copied().find(|b| sys.exists(b))
}

fn read_freq_table(sys: &Sysfs, base: &str) -> Vec<u64> {
    let mut freqs: Vec<u64> = ["gpu_available_frequencies", "devfreq/available_frequencies", "gpu_freq_table"]
        .iter()
        .map(|n| sys.read_list(format!("{}/{}", base, n)))
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .iter()
        .filter_map(|s| s.parse::<u64>().ok())
        .map(to_mhz)
        .collect();
    freqs.sort_unstable();
    freqs.dedup();
    freqs
}

/// Raw table entry (Hz) matching `mhz`, falling back to the scaled value.
fn table_hz(sys: &Sysfs, base: &str, mhz: u64) -> u64 {
    ["gpu_available_frequencies", "devfreq/available_frequencies"]
        .iter()
        .flat_map(|n| sys.read_list(format!("{}/{}", base, n)))
        .filter_map(|s| s.parse::<u64>().ok())
        .find(|&hz| hz >= 1_000_000 && hz / 1_000_000 == mhz)
        .unwrap_or(mhz * 1_000_000)
}

fn first_u64(sys: &Sysfs, base: &str, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|n| sys.read_u64(format!("{}/{}", base, n)))
}

pub fn detect_gpu(dev: &Device) -> Option<GpuInfo> {
    let sys = &dev.sysfs;
    let base = gpu_base(sys)?;
    let frequencies = read_freq_table(sys, base);
    let (lo, hi) = match (frequencies.first(), frequencies.last()) {
        (Some(&lo), Some(&hi)) => (lo, hi),
        _ => (0, 0),
    };

    Some(GpuInfo {
        base: base.to_string(),
        cur_freq: first_u64(sys, base, &["gpuclk", "devfreq/cur_freq", "gpu_clock"]).map(to_mhz).unwrap_or(0),
        min_freq: first_u64(sys, base, &["devfreq/min_freq", "min_clock_mhz"]).map(to_mhz).unwrap_or(lo),
        max_freq: first_u64(sys, base, &["devfreq/max_freq", "max_clock_mhz"]).map(to_mhz).unwrap_or(hi),
        power_level: first_u64(sys, base, &["default_pwrlevel"]).map(|v| v as u32),
        num_power_levels: first_u64(sys, base, &["num_pwrlevels"]).map(|v| v as u32),
        renderer: detect_renderer(dev),
        frequencies,
    })
}

fn require_gpu(dev: &Device) -> Result<GpuInfo> {
    detect_gpu(dev).ok_or_else(|| Error::NotFound("gpu".to_string()))
}

/// Writes the devfreq window in Hz, or the `*_clock_mhz` pair on trees
/// without devfreq. Returns the applied `(min, max)` in MHz.
pub fn set_gpu_frequency(dev: &Device, min: u64, max: u64) -> Result<(u64, u64)> {
    let info = require_gpu(dev)?;
    let (hw_min, hw_max) = info.hw_range();
    if hw_max == 0 {
        return Err(Error::NotFound("gpu frequency table".to_string()));
    }
    let (min, max) = clamp_range(min, max, hw_min, hw_max, &info.frequencies);

    let devfreq = format!("{}/devfreq/min_freq", info.base);
    let (min_node, max_node, min_raw, max_raw) = if dev.sysfs.exists(&devfreq) {
        (
            devfreq,
            format!("{}/devfreq/max_freq", info.base),
            table_hz(&dev.sysfs, &info.base, min),
            table_hz(&dev.sysfs, &info.base, max),
        )
    } else {
        (format!("{}/min_clock_mhz", info.base), format!("{}/max_clock_mhz", info.base), min, max)
    };

    if max >= info.min_freq {
        dev.sysfs.write(&max_node, max_raw)?;
        dev.sysfs.write(&min_node, min_raw)?;
    } else {
        dev.sysfs.write(&min_node, min_raw)?;
        dev.sysfs.write(&max_node, max_raw)?;
    }

    for (node, wanted) in [(&min_node, min), (&max_node, max)] {
        let got = dev.sysfs.read_u64(node).map(to_mhz).unwrap_or(0);
        if !within_tolerance(wanted, got) {
            return Err(Error::Verify {
                path: dev.sysfs.path(node),
                wanted: format!("{} MHz", wanted),
                got: format!("{} MHz", got),
            });
        }
    }

    tracing::info!("GPU: {}-{} MHz", min, max);
    Ok((min, max))
}

pub fn set_power_level(dev: &Device, level: u32) -> Result<()> {
    let info = require_gpu(dev)?;
    let levels = info
        .num_power_levels
        .ok_or_else(|| Error::NotFound("num_pwrlevels".to_string()))?;
    if level >= levels {
        return Err(Error::Invalid(format!("power level {} out of range 0..{}", level, levels)));
    }
    dev.sysfs.write_if_changed(format!("{}/default_pwrlevel", info.base), level)?;
    tracing::info!("GPU: default power level {}", level);
    Ok(())
}

/// Live prop first, then the persisted prop file, else OpenGL ES.
pub fn detect_renderer(dev: &Device) -> GpuRenderer {
    let live = getprop(dev.shell.as_ref(), RENDERER_PROP);
    let value = if live.is_empty() || live == "null" {
        dev.sysfs
            .read_string(&dev.renderer_prop_file)
            .and_then(|s| prop_file_value(&s, RENDERER_PROP))
            .unwrap_or_default()
    } else {
        live
    };
    GpuRenderer::from_prop(&value).unwrap_or(GpuRenderer::OpenGl)
}

fn prop_file_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|l| {
        let (k, v) = l.trim().split_once('=')?;
        (k.trim() == key && !v.trim().is_empty()).then(|| v.trim().to_string())
    })
}

/// Drops every renderer key from `existing` and appends `props`.
pub fn rewrite_prop_file(existing: &str, props: &[(&str, &str)]) -> String {
    let mut out: Vec<String> = existing
        .lines()
        .filter(|l| {
            let key = l.split_once('=').map(|(k, _)| k.trim()).unwrap_or("");
            !RENDERER_PROPS.contains(&key)
        })
        .map(str::to_string)
        .collect();
    out.extend(props.iter().map(|(k, v)| format!("{}={}", k, v)));
    let mut s = out.join("\n");
    s.push('\n');
    s
}

fn persist_renderer(dev: &Device, renderer: GpuRenderer) -> Result<()> {
    let path = dev.sysfs.path(&dev.renderer_prop_file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    std::fs::write(&path, rewrite_prop_file(&existing, &renderer.props())).map_err(|e| Error::io(&path, e))
}

/// Sets the runtime props and persists them for the next boot. Returns
/// whether a reboot is needed for the change to take effect.
pub fn set_renderer(dev: &Device, renderer: GpuRenderer) -> Result<bool> {
    if renderer == GpuRenderer::Auto {
        return Ok(false);
    }
    let sh = dev.shell.as_ref();
    for prop in RENDERER_PROPS {
        if let Err(e) = setprop(sh, prop, "") {
            tracing::debug!("GPU: clear {} failed: {}", prop, e);
        }
    }
    let props = renderer.props();
    for (name, value) in &props {
        setprop(sh, name, value)?;
    }
    if let Err(e) = persist_renderer(dev, renderer) {
        tracing::warn!("GPU: renderer not persisted: {}", e);
    }
    tracing::info!("GPU: renderer {} (reboot required)", renderer);
    Ok(true)
}

fn parse_u8_token(s: &str) -> Option<u8> {
    let tok = s.split_whitespace().next()?.trim();
    let tok = tok.trim_end_matches('%');
    tok.parse::<u8>().ok()
}

fn read_gpu_util_from_busy_percentage(sys: &Sysfs, path: &Path) -> Option<u8> {
    let s = sys.read_string(path)?;
    let v = parse_u8_token(&s)?;
    Some(v.min(100))
}

fn read_gpu_util_from_gpubusy_ratio(sys: &Sysfs, path: &Path) -> Option<u8> {
    let s = sys.read_string(path)?;
    let mut it = s.split_whitespace();
    let busy: u64 = it.next()?.parse().ok()?;
    let total: u64 = it.next()?.parse().ok()?;
    if total == 0 { return Some(0); }
    Some(((busy.saturating_mul(100) / total).min(100)) as u8)
}

/// Prefers `gpu_busy_percentage`; a zero there is cross-checked against the
/// `gpubusy` ratio which some drivers keep more current.
pub fn read_gpu_util(sys: &Sysfs, base: &str) -> u8 {
    let busy_percent = Path::new(base).join("gpu_busy_percentage");
    let gpubusy = Path::new(base).join("gpubusy");
    if let Some(v) = read_gpu_util_from_busy_percentage(sys, &busy_percent) {
        if v > 0 { return v; }
        if let Some(v2) = read_gpu_util_from_gpubusy_ratio(sys, &gpubusy) { return v2; }
        return v;
    }
    read_gpu_util_from_gpubusy_ratio(sys, &gpubusy).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::testutil::{dropping_node, fake_device, fake_gpu, node};

    const FREQS: &[u64] = &[257_000_000, 345_000_000, 427_000_000, 499_000_000, 585_000_000];

    #[test]
    fn detects_kgsl_gpu() {
        let dir = tempdir().unwrap();
        fake_gpu(dir.path(), FREQS);
        let (dev, sh) = fake_device(dir.path());
        sh.respond("getprop debug.hwui.renderer", "skiavk\n");

        let info = detect_gpu(&dev).unwrap();
        assert_eq!(info.frequencies, vec![257, 345, 427, 499, 585]);
        assert_eq!((info.min_freq, info.max_freq), (257, 585));
        assert_eq!(info.num_power_levels, Some(5));
        assert_eq!(info.renderer, GpuRenderer::SkiaVulkan);
        assert_eq!(read_gpu_util(&dev.sysfs, &info.base), 12);
    }

    #[test]
    fn frequency_that_does_not_stick_is_a_verify_error() {
        let dir = tempdir().unwrap();
        fake_gpu(dir.path(), FREQS);
        dropping_node(dir.path(), "/sys/class/kgsl/kgsl-3d0/devfreq/max_freq");
        let (dev, _sh) = fake_device(dir.path());

        match set_gpu_frequency(&dev, 257, 499) {
            Err(Error::Verify { path, wanted, .. }) => {
                assert!(path.ends_with("devfreq/max_freq"));
                assert_eq!(wanted, "499 MHz");
            }
            other => panic!("expected a verify error, got {:?}", other),
        }
    }

    #[test]
    fn no_gpu_tree_is_none() {
        let dir = tempdir().unwrap();
        let (dev, _sh) = fake_device(dir.path());
        assert!(detect_gpu(&dev).is_none());
        assert!(matches!(set_power_level(&dev, 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn frequency_written_in_hz_and_clamped() {
        let dir = tempdir().unwrap();
        fake_gpu(dir.path(), FREQS);
        let (dev, _sh) = fake_device(dir.path());

        assert_eq!(set_gpu_frequency(&dev, 300, 10_000).unwrap(), (257, 585));
        assert_eq!(set_gpu_frequency(&dev, 350, 450).unwrap(), (345, 427));
        assert_eq!(
            dev.sysfs.read_u64("/sys/class/kgsl/kgsl-3d0/devfreq/max_freq"),
            Some(427_000_000)
        );
    }

    #[test]
    fn power_level_must_be_in_range() {
        let dir = tempdir().unwrap();
        fake_gpu(dir.path(), FREQS);
        let (dev, _sh) = fake_device(dir.path());

        set_power_level(&dev, 2).unwrap();
        assert_eq!(dev.sysfs.read_u64("/sys/class/kgsl/kgsl-3d0/default_pwrlevel"), Some(2));
        assert!(matches!(set_power_level(&dev, 5), Err(Error::Invalid(_))));
    }

    #[test]
    fn renderer_names_parse_leniently() {
        assert_eq!("OpenGL ES".parse::<GpuRenderer>().unwrap(), GpuRenderer::OpenGl);
        assert_eq!("skiavk".parse::<GpuRenderer>().unwrap(), GpuRenderer::SkiaVulkan);
        assert_eq!("angle".parse::<GpuRenderer>().unwrap(), GpuRenderer::Angle);
        assert_eq!("".parse::<GpuRenderer>().unwrap(), GpuRenderer::Auto);
        assert!("metal".parse::<GpuRenderer>().is_err());
    }

    #[test]
    fn set_renderer_clears_sets_and_persists() {
        let dir = tempdir().unwrap();
        let (dev, sh) = fake_device(dir.path());
        node(
            dir.path(),
            crate::device::DEFAULT_RENDERER_PROP_FILE,
            "ro.config.foo=1\ndebug.hwui.renderer=opengl\n",
        );

        assert!(set_renderer(&dev, GpuRenderer::Vulkan).unwrap());
        let cmds = sh.commands();
        assert_eq!(cmds.len(), RENDERER_PROPS.len() + 2);
        assert_eq!(cmds[0], "setprop debug.hwui.renderer ''");
        assert_eq!(cmds[4], "setprop debug.hwui.renderer 'vulkan'");
        assert_eq!(cmds[5], "setprop ro.hwui.use_vulkan 'true'");

        let persisted = dev.sysfs.read_string(&dev.renderer_prop_file).unwrap();
        assert_eq!(
            persisted,
            "ro.config.foo=1\ndebug.hwui.renderer=vulkan\nro.hwui.use_vulkan=true"
        );
        // Falls back to the prop file when the live prop is unset.
        assert_eq!(detect_renderer(&dev), GpuRenderer::Vulkan);
    }

    #[test]
    fn auto_renderer_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (dev, sh) = fake_device(dir.path());
        assert!(!set_renderer(&dev, GpuRenderer::Auto).unwrap());
        assert!(sh.commands().is_empty());
    }

    #[test]
    fn rewrite_prop_file_replaces_owned_keys() {
        let out = rewrite_prop_file(
            "a=1\ndebug.angle.backend=vulkan\nro.hwui.use_vulkan=true\n",
            &GpuRenderer::Angle.props(),
        );
        assert_eq!(out, "a=1\ndebug.hwui.renderer=angle\ndebug.angle.backend=opengl\n");
    }
}

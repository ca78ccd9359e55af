use serde::{Deserialize, Serialize};

use crate::shell::{getprop, Shell};

const UNKNOWN: &str = "unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// Device identity recorded in exported profiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocInfo {
    #[serde(default = "unknown")]
    pub hardware: String,
    #[serde(default = "unknown")]
    pub platform: String,
    #[serde(default = "unknown")]
    pub soc: String,
    #[serde(default = "unknown")]
    pub device: String,
    #[serde(default = "unknown")]
    pub model: String,
}

impl Default for SocInfo {
    fn default() -> Self {
        Self {
            hardware: unknown(),
            platform: unknown(),
            soc: unknown(),
            device: unknown(),
            model: unknown(),
        }
    }
}

fn prop_or_unknown(shell: &dyn Shell, names: &[&str]) -> String {
    names
        .iter()
        .map(|n| getprop(shell, n))
        .find(|v| !v.is_empty())
        .unwrap_or_else(unknown)
}

impl SocInfo {
    pub fn detect(shell: &dyn Shell) -> Self {
        Self {
            hardware: prop_or_unknown(shell, &["ro.hardware"]),
            platform: prop_or_unknown(shell, &["ro.board.platform"]),
            soc: prop_or_unknown(shell, &["ro.hardware.chipname", "ro.soc.model"]),
            device: prop_or_unknown(shell, &["ro.product.device"]),
            model: prop_or_unknown(shell, &["ro.product.model"]),
        }
    }
}

fn same(a: &str, b: &str) -> bool {
    a != UNKNOWN && b != UNKNOWN && a.eq_ignore_ascii_case(b)
}

/// A profile is compatible when platform, hardware or SoC name match.
pub fn is_compatible(file: &SocInfo, current: &SocInfo) -> bool {
    same(&file.platform, &current.platform)
        || same(&file.hardware, &current.hardware)
        || same(&file.soc, &current.soc)
}

pub fn compatibility_warning(file: &SocInfo, current: &SocInfo) -> String {
    format!(
        "This profile was exported from a different device.\n\
         File:    {} ({}) SoC {} platform {}\n\
         Current: {} ({}) SoC {} platform {}\n\
         Frequencies and governors may not exist on this device.",
        file.model, file.device, file.soc, file.platform,
        current.model, current.device, current.soc, current.platform,
    )
}

fn sanitize(s: &str) -> String {
    let out: String = s
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if out.is_empty() { unknown() } else { out }
}

/// `<soc>_<device>_<model>_<stamp>.toml`, safe for any filesystem.
pub fn export_file_name(info: &SocInfo, stamp: &str) -> String {
    format!(
        "{}_{}_{}_{}.toml",
        sanitize(&info.soc),
        sanitize(&info.device),
        sanitize(&info.model),
        sanitize(stamp)
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::shell::RecordingShell;

    fn info(platform: &str, hardware: &str, soc: &str) -> SocInfo {
        SocInfo {
            hardware: hardware.to_string(),
            platform: platform.to_string(),
            soc: soc.to_string(),
            device: "alioth".to_string(),
            model: "POCO F3".to_string(),
        }
    }

    #[test]
    fn detect_falls_back_for_soc_name() {
        let sh = RecordingShell::new();
        sh.respond("getprop ro.hardware", "qcom\n")
            .respond("getprop ro.board.platform", "kona\n")
            .respond("getprop ro.soc.model", "SM8250\n")
            .respond("getprop ro.product.device", "alioth\n");

        let got = SocInfo::detect(&sh);
        assert_eq!(
            got,
            SocInfo {
                hardware: "qcom".to_string(),
                platform: "kona".to_string(),
                soc: "SM8250".to_string(),
                device: "alioth".to_string(),
                model: "unknown".to_string(),
            }
        );
    }

    #[test]
    fn compatibility_is_any_identity_match() {
        let cur = info("kona", "qcom", "SM8250");
        assert!(is_compatible(&info("KONA", "mt6893", "x"), &cur));
        assert!(is_compatible(&info("lahaina", "qcom", "SM8350"), &cur));
        assert!(is_compatible(&info("lahaina", "mt", "sm8250"), &cur));
        assert!(!is_compatible(&info("lahaina", "mt6893", "SM8350"), &cur));
        assert!(!is_compatible(&SocInfo::default(), &SocInfo::default()));
    }

    #[test]
    fn warning_names_both_devices() {
        let w = compatibility_warning(&info("lahaina", "qcom", "SM8350"), &info("kona", "qcom", "SM8250"));
        assert!(w.contains("SoC SM8350 platform lahaina"));
        assert!(w.contains("SoC SM8250 platform kona"));
    }

    #[test]
    fn export_name_is_sanitised() {
        let name = export_file_name(&info("kona", "qcom", "SM8250"), "20240102-030405");
        assert_eq!(name, "SM8250_alioth_POCO_F3_20240102-030405.toml");
        assert_eq!(export_file_name(&SocInfo::default(), "x"), "unknown_unknown_unknown_x.toml");
    }
}

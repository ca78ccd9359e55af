//! TOML tuning profiles: one file per export, device identity embedded so an
//! import on different hardware can warn before anything is applied.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ram::RamConfig,
    soc::{compatibility_warning, export_file_name, is_compatible, SocInfo},
    tuning::{ClusterConfig, GpuConfig, ThermalConfig, TuningConfig},
    tweaks::AdditionalConfig,
};

#[derive(Debug, Serialize, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    device_info: SocInfo,
    #[serde(default)]
    cpu: BTreeMap<String, ClusterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gpu: Option<GpuConfig>,
    #[serde(default)]
    thermal: ThermalConfig,
    #[serde(default)]
    ram: RamConfig,
    #[serde(default)]
    additional: AdditionalConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportReport {
    pub config: TuningConfig,
    pub file_soc: SocInfo,
    pub current_soc: SocInfo,
    pub compatible: bool,
    /// Set when the file came from other hardware. Never blocks the import.
    pub warning: Option<String>,
}

pub fn export_profile(cfg: &TuningConfig, info: &SocInfo, at: DateTime<Local>) -> Result<String> {
    let doc = ProfileDocument {
        device_info: info.clone(),
        cpu: cfg
            .cpu_clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (format!("cluster{}", i), c.clone()))
            .collect(),
        gpu: cfg.gpu.clone(),
        thermal: cfg.thermal.clone(),
        ram: cfg.ram.clone(),
        additional: cfg.additional.clone(),
    };
    let body = toml::to_string(&doc)?;
    Ok(format!(
        "# kern-tuner tuning profile\n# Exported: {}\n# Device: {} ({}), SoC {}\n\n{}",
        at.format("%Y-%m-%d %H:%M:%S"),
        info.model,
        info.device,
        info.soc,
        body
    ))
}

/// Parses a profile and checks it against `current`. Clusters are read as
/// `cluster0`, `cluster1`, ... up to the first gap.
pub fn import_profile(text: &str, current: &SocInfo) -> Result<ImportReport> {
    let mut doc: ProfileDocument = toml::from_str(text)?;

    let mut cpu_clusters = Vec::new();
    while let Some(c) = doc.cpu.remove(&format!("cluster{}", cpu_clusters.len())) {
        cpu_clusters.push(c);
    }
    if !doc.cpu.is_empty() {
        tracing::warn!("IMPORT: ignoring cpu tables after a gap: {:?}", doc.cpu.keys().collect::<Vec<_>>());
    }

    let compatible = is_compatible(&doc.device_info, current);
    let warning = (!compatible).then(|| compatibility_warning(&doc.device_info, current));
    if let Some(w) = &warning {
        tracing::warn!("IMPORT: {}", w.replace('\n', " "));
    }

    Ok(ImportReport {
        config: TuningConfig {
            cpu_clusters,
            gpu: doc.gpu,
            thermal: doc.thermal,
            ram: doc.ram,
            additional: doc.additional,
        },
        file_soc: doc.device_info,
        current_soc: current.clone(),
        compatible,
        warning,
    })
}

pub fn import_file(path: &Path, current: &SocInfo) -> Result<ImportReport> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    import_profile(&text, current)
}

/// Writes `<dir>/<soc>_<device>_<model>_<stamp>.toml` and returns its path.
pub fn export_to_dir(cfg: &TuningConfig, info: &SocInfo, dir: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let text = export_profile(cfg, info, now)?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let path = dir.join(export_file_name(info, &now.format("%Y%m%d-%H%M%S").to_string()));
    fs::write(&path, text).map_err(|e| Error::io(&path, e))?;
    tracing::info!("EXPORT: {}", path.display());
    Ok(path)
}

/// Saved profiles in `dir`, newest name last.
pub fn list_saved(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::io(dir, e))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "toml"))
        .collect();
    out.sort();
    Ok(out)
}

use std::fmt::Display;

use serde::Serialize;

use crate::{
    cpu,
    device::Device,
    gpu,
    ram::apply_ram_config,
    thermal,
    tuning::{owned_cores, TuningConfig},
    tweaks::apply_additional,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Skipped(String),
    Failed(String),
}

/// Outcome of one privileged write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

impl Step {
    pub fn ok(name: impl Into<String>) -> Self {
        Self { name: name.into(), status: StepStatus::Ok }
    }

    pub fn skipped(name: impl Into<String>, why: impl Into<String>) -> Self {
        Self { name: name.into(), status: StepStatus::Skipped(why.into()) }
    }

    pub fn failed(name: impl Into<String>, err: impl Display) -> Self {
        Self { name: name.into(), status: StepStatus::Failed(err.to_string()) }
    }

    pub fn from_result<T, E: Display>(name: impl Into<String>, res: Result<T, E>) -> Self {
        let name = name.into();
        match res {
            Ok(_) => Self::ok(name),
            Err(e) => {
                tracing::warn!("APPLY: {} failed: {}", name, e);
                Self::failed(name, e)
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplyReport {
    pub steps: Vec<Step>,
    pub reboot_required: bool,
}

impl ApplyReport {
    pub fn ok(&self) -> bool {
        !self.steps.iter().any(Step::is_failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_failed())
    }

    /// One line for logs and notifications.
    pub fn summary(&self) -> String {
        let failed = self.failures().count();
        let skipped = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Skipped(_)))
            .count();
        let applied = self.steps.len() - failed - skipped;
        let mut s = format!("{} applied, {} skipped, {} failed", applied, skipped, failed);
        if self.reboot_required {
            s.push_str(" (reboot required)");
        }
        s
    }
}

fn apply_cpu(dev: &Device, cfg: &TuningConfig, steps: &mut Vec<Step>) {
    if cfg.cpu_clusters.is_empty() {
        return;
    }
    let clusters = cpu::detect_clusters(&dev.sysfs);
    let all: Vec<usize> = cpu::core_states(&dev.sysfs).iter().map(|s| s.core).collect();

    // Hotplug first so frequency writes reach every wanted core.
    let mut hotplug_errors = Vec::new();
    for (i, c) in cfg.cpu_clusters.iter().enumerate() {
        for core in owned_cores(&clusters, i, &all) {
            if core == 0 {
                continue;
            }
            let online = !c.disabled_cores.contains(&core);
            if let Err(e) = cpu::set_core_online(dev, core, online) {
                hotplug_errors.push(format!("cpu{}: {}", core, e));
            }
        }
    }
    steps.push(if hotplug_errors.is_empty() {
        Step::ok("cpu.cores")
    } else {
        Step::failed("cpu.cores", hotplug_errors.join("; "))
    });

    for (i, c) in cfg.cpu_clusters.iter().enumerate() {
        let prefix = format!("cpu.cluster{}", i);
        if i >= clusters.len() {
            steps.push(Step::skipped(prefix, "cluster not present on this device"));
            continue;
        }
        steps.push(Step::from_result(
            format!("{}.freq", prefix),
            cpu::set_cluster_frequency(dev, i, c.min_freq, c.max_freq),
        ));
        steps.push(if c.governor.is_empty() {
            Step::skipped(format!("{}.governor", prefix), "not set")
        } else {
            Step::from_result(format!("{}.governor", prefix), cpu::set_cluster_governor(dev, i, &c.governor))
        });
    }
}

fn apply_gpu(dev: &Device, cfg: &TuningConfig, steps: &mut Vec<Step>) -> bool {
    let Some(g) = &cfg.gpu else {
        return false;
    };
    if gpu::detect_gpu(dev).is_none() {
        steps.push(Step::skipped("gpu", "no gpu found"));
        return false;
    }
    steps.push(Step::from_result("gpu.freq", gpu::set_gpu_frequency(dev, g.min_freq, g.max_freq)));
    if let Some(level) = g.power_level {
        steps.push(Step::from_result("gpu.power_level", gpu::set_power_level(dev, level)));
    }
    match gpu::set_renderer(dev, g.renderer) {
        Ok(false) => {
            steps.push(Step::skipped("gpu.renderer", "auto"));
            false
        }
        Ok(true) => {
            steps.push(Step::ok("gpu.renderer"));
            true
        }
        Err(e) => {
            steps.push(Step::failed("gpu.renderer", e));
            false
        }
    }
}

/// Runs every section of `cfg` in a fixed order. Nothing is retried or
/// rolled back; each step reports on its own.
pub fn apply_config(dev: &Device, cfg: &TuningConfig) -> ApplyReport {
    let mut report = ApplyReport::default();

    apply_cpu(dev, cfg, &mut report.steps);
    report.reboot_required = apply_gpu(dev, cfg, &mut report.steps);

    report.steps.push(match thermal::apply_thermal_preset(dev, cfg.thermal.preset) {
        Ok(true) => Step::ok("thermal"),
        Ok(false) => Step::skipped("thermal", "Not Set"),
        Err(e) => Step::failed("thermal", e),
    });

    report.steps.extend(apply_ram_config(dev, &cfg.ram));
    report.steps.extend(apply_additional(dev, &cfg.additional));

    tracing::info!("APPLY: {}", report.summary());
    report
}

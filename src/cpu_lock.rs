//! Frequency locks on CPU clusters, with a thermal guard.
//!
//! A lock pins the listed clusters to a min/max window and records the window
//! and governor each one had before. A smart lock is watched by the poller:
//! past the policy's emergency or critical limit the recorded settings come
//! back (with `powersave` when the policy asks for it), and once the CPU has
//! stayed at or below the restore limit for the restore delay the lock is
//! applied again.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::{
    cpu,
    device::Device,
    error::{Error, Result},
    fmt::fmt_c,
    thermal::Temps,
};

/// Locking above this without a smart policy is allowed but logged.
pub const SAFE_LOCK_C: i32 = 75;
const RESTORE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalAction {
    /// Put the recorded frequencies back.
    Unlock,
    /// Same, then `powersave` on every cluster.
    UnlockPowersave,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Normal,
    Warning,
    Emergency,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Emergency => "emergency",
            Severity::Critical => "critical",
        })
    }
}

/// Limits in whole degrees C.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyLimits {
    pub restore_c: i32,
    pub warning_c: i32,
    pub emergency_c: i32,
    pub critical_c: i32,
    #[serde(skip)]
    pub restore_delay: Duration,
    pub on_emergency: ThermalAction,
    pub on_critical: ThermalAction,
    pub auto_restore: bool,
    pub max_restores_per_hour: usize,
}

impl PolicyLimits {
    pub fn severity(&self, temp_mc: i32) -> Severity {
        let c = |deg: i32| deg * 1000;
        if temp_mc >= c(self.critical_c) {
            Severity::Critical
        } else if temp_mc >= c(self.emergency_c) {
            Severity::Emergency
        } else if temp_mc >= c(self.warning_c) {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }

    pub fn is_cool(&self, temp_mc: i32) -> bool {
        temp_mc <= self.restore_c * 1000
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    Performance,
    #[default]
    Balanced,
    Conservative,
    Gaming,
    BatterySaver,
}

impl LockPolicy {
    pub const ALL: [LockPolicy; 5] = [
        LockPolicy::Performance,
        LockPolicy::Balanced,
        LockPolicy::Conservative,
        LockPolicy::Gaming,
        LockPolicy::BatterySaver,
    ];

    pub fn limits(self) -> PolicyLimits {
        use ThermalAction::*;
        let (restore_c, warning_c, emergency_c, critical_c, delay_s, on_emergency, auto_restore, max_restores_per_hour) =
            match self {
                LockPolicy::Performance => (70, 75, 85, 90, 15, Unlock, true, 5),
                LockPolicy::Balanced => (68, 72, 82, 87, 10, Unlock, true, 3),
                LockPolicy::Conservative => (65, 68, 78, 85, 8, UnlockPowersave, true, 2),
                LockPolicy::Gaming => (72, 76, 86, 92, 20, Unlock, true, 8),
                LockPolicy::BatterySaver => (62, 65, 75, 80, 5, UnlockPowersave, false, 1),
            };
        PolicyLimits {
            restore_c,
            warning_c,
            emergency_c,
            critical_c,
            restore_delay: Duration::from_secs(delay_s),
            on_emergency,
            on_critical: UnlockPowersave,
            auto_restore,
            max_restores_per_hour,
        }
    }
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockPolicy::Performance => "performance",
            LockPolicy::Balanced => "balanced",
            LockPolicy::Conservative => "conservative",
            LockPolicy::Gaming => "gaming",
            LockPolicy::BatterySaver => "battery_saver",
        })
    }
}

impl FromStr for LockPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "performance" | "a" => Ok(LockPolicy::Performance),
            "balanced" | "balance" | "b" => Ok(LockPolicy::Balanced),
            "conservative" | "c" => Ok(LockPolicy::Conservative),
            "gaming" | "game" => Ok(LockPolicy::Gaming),
            "battery_saver" | "battery" => Ok(LockPolicy::BatterySaver),
            other => Err(Error::Invalid(format!("unknown lock policy {:?}", other))),
        }
    }
}

/// CPU temperature used for lock decisions: the CPU zones, or the SoC figure
/// when the device has no zone typed as CPU.
pub fn cpu_temp_mc(temps: &Temps) -> Option<i32> {
    temps.cpu_mc.or(temps.soc_mc)
}

/// An unknown temperature counts as safe.
pub fn is_safe(temp_mc: Option<i32>, max_c: i32) -> bool {
    temp_mc.map_or(true, |t| t <= max_c * 1000)
}

/// Window for one cluster, MHz.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLock {
    pub cluster: usize,
    pub min_freq: u64,
    pub max_freq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalFreq {
    pub min_freq: u64,
    pub max_freq: u64,
    pub governor: String,
}

/// A lock in force, as stored in the user config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLock {
    pub clusters: Vec<ClusterLock>,
    #[serde(default)]
    pub smart: bool,
    #[serde(default)]
    pub policy: LockPolicy,
    /// Settings each cluster had before it was first locked.
    #[serde(default)]
    pub originals: BTreeMap<usize, OriginalFreq>,
    /// Changes whenever the lock is replaced.
    pub locked_at: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LockRequest {
    pub clusters: Vec<ClusterLock>,
    #[serde(default)]
    pub smart: bool,
    #[serde(default)]
    pub policy: LockPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockFailure {
    pub cluster: usize,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LockOutcome {
    pub lock: CpuLock,
    pub failed: Vec<LockFailure>,
}

/// Applies `req` on top of `prev`. Clusters already locked keep their
/// recorded originals, so an unlock always returns to the pre-lock state.
/// Nothing is written when the request is malformed or a smart lock is asked
/// for above the policy's critical limit. Fails only when no cluster locked.
pub fn lock(dev: &Device, req: &LockRequest, prev: Option<&CpuLock>, temp_mc: Option<i32>) -> Result<LockOutcome> {
    if req.clusters.is_empty() {
        return Err(Error::Invalid("no clusters to lock".to_string()));
    }
    let mut seen = Vec::new();
    for c in &req.clusters {
        if c.min_freq > c.max_freq {
            return Err(Error::Invalid(format!("cluster{}: min {} > max {}", c.cluster, c.min_freq, c.max_freq)));
        }
        if seen.contains(&c.cluster) {
            return Err(Error::Invalid(format!("cluster{} listed twice", c.cluster)));
        }
        seen.push(c.cluster);
    }

    let limits = req.policy.limits();
    match temp_mc {
        Some(t) if req.smart && limits.severity(t) == Severity::Critical => {
            return Err(Error::Invalid(format!(
                "cpu at {} is past the {} critical limit of {}C",
                fmt_c(t as i64),
                req.policy,
                limits.critical_c
            )));
        }
        _ if !is_safe(temp_mc, SAFE_LOCK_C) => {
            tracing::warn!("CPU: locking at {}", fmt_c(temp_mc.unwrap_or_default() as i64));
        }
        _ => {}
    }

    let detected = cpu::detect_clusters(&dev.sysfs);
    let mut originals = prev.map(|p| p.originals.clone()).unwrap_or_default();
    for c in &req.clusters {
        let info = detected
            .iter()
            .find(|d| d.index == c.cluster)
            .ok_or_else(|| Error::NotFound(format!("cpu cluster {}", c.cluster)))?;
        originals.entry(c.cluster).or_insert_with(|| OriginalFreq {
            min_freq: info.cur_min,
            max_freq: info.cur_max,
            governor: info.governor.clone(),
        });
    }

    let mut clusters: Vec<ClusterLock> = prev
        .map(|p| p.clusters.iter().filter(|c| !seen.contains(&c.cluster)).copied().collect())
        .unwrap_or_default();
    let mut failed = Vec::new();
    let mut first_err = None;
    for c in &req.clusters {
        match cpu::set_cluster_frequency(dev, c.cluster, c.min_freq, c.max_freq) {
            Ok((min_freq, max_freq)) => clusters.push(ClusterLock { cluster: c.cluster, min_freq, max_freq }),
            Err(e) => {
                tracing::warn!("CPU: lock cluster{} failed: {}", c.cluster, e);
                failed.push(LockFailure { cluster: c.cluster, error: e.to_string() });
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    if let (true, Some(e)) = (failed.len() == req.clusters.len(), first_err) {
        return Err(e);
    }
    clusters.sort_by_key(|c| c.cluster);

    tracing::info!(
        "CPU: locked {:?}{}",
        clusters.iter().map(|c| c.cluster).collect::<Vec<_>>(),
        if req.smart { format!(" (smart, {})", req.policy) } else { String::new() }
    );
    Ok(LockOutcome {
        lock: CpuLock {
            clusters,
            smart: req.smart,
            policy: req.policy,
            originals,
            locked_at: Local::now().to_rfc3339(),
        },
        failed,
    })
}

/// Writes the lock windows again. Returns how many clusters took them.
pub fn apply_lock(dev: &Device, lock: &CpuLock) -> Result<usize> {
    let mut ok = 0;
    let mut last_err = None;
    for c in &lock.clusters {
        match cpu::set_cluster_frequency(dev, c.cluster, c.min_freq, c.max_freq) {
            Ok(_) => ok += 1,
            Err(e) => last_err = Some(e),
        }
    }
    match (ok, last_err) {
        (0, Some(e)) => Err(e),
        _ => Ok(ok),
    }
}

fn restore_governors(dev: &Device, lock: &CpuLock) -> Result<()> {
    let mut last_err = None;
    for (&idx, orig) in &lock.originals {
        if let Err(e) = cpu::set_cluster_governor(dev, idx, &orig.governor) {
            last_err = Some(e);
        }
    }
    last_err.map_or(Ok(()), Err)
}

/// Puts back the recorded window and governor of every cluster the lock
/// touched. Every cluster is attempted; the last failure is returned.
pub fn release(dev: &Device, lock: &CpuLock) -> Result<()> {
    let mut last_err = None;
    for (&idx, orig) in &lock.originals {
        if let Err(e) = cpu::set_cluster_frequency(dev, idx, orig.min_freq, orig.max_freq) {
            tracing::warn!("CPU: restore cluster{} failed: {}", idx, e);
            last_err = Some(e);
        }
    }
    if let Err(e) = restore_governors(dev, lock) {
        last_err = Some(e);
    }
    last_err.map_or(Ok(()), Err)
}

pub fn unlock(dev: &Device, lock: Option<&CpuLock>) -> Result<()> {
    let lock = lock.ok_or_else(|| Error::Invalid("cpu frequencies are not locked".to_string()))?;
    release(dev, lock)?;
    tracing::info!("CPU: unlocked {:?}", lock.originals.keys().collect::<Vec<_>>());
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LockEvent {
    Warning { temp_mc: i32 },
    Released { severity: Severity, temp_mc: i32, powersave: bool },
    Restored { temp_mc: i32 },
    RestoreFailed { error: String },
}

impl LockEvent {
    pub fn message(&self) -> String {
        match self {
            LockEvent::Warning { temp_mc } => format!("CPU at {}, nearing the lock limit", fmt_c(*temp_mc as i64)),
            LockEvent::Released { severity, temp_mc, powersave } => format!(
                "CPU {} at {}: lock released{}",
                severity,
                fmt_c(*temp_mc as i64),
                if *powersave { ", powersave" } else { "" }
            ),
            LockEvent::Restored { temp_mc } => format!("CPU cooled to {}: lock restored", fmt_c(*temp_mc as i64)),
            LockEvent::RestoreFailed { error } => format!("CPU lock restore failed: {}", error),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub smart: bool,
    pub policy: Option<LockPolicy>,
    pub clusters: Vec<ClusterLock>,
    /// Held off by the thermal guard.
    pub released: bool,
    pub severity: Severity,
    pub temp_mc: Option<i32>,
}

/// Thermal state machine for the stored lock, stepped by the poller.
#[derive(Debug, Default)]
pub struct LockGuard {
    /// `locked_at` of the lock last written to the device.
    applied: Option<String>,
    released: Option<ThermalAction>,
    severity: Severity,
    cool_since: Option<Instant>,
    restores: VecDeque<Instant>,
    temp_mc: Option<i32>,
}

impl LockGuard {
    pub fn status(&self, lock: Option<&CpuLock>) -> LockStatus {
        match lock {
            Some(l) => LockStatus {
                locked: true,
                smart: l.smart,
                policy: Some(l.policy),
                clusters: l.clusters.clone(),
                released: self.released.is_some(),
                severity: self.severity,
                temp_mc: self.temp_mc,
            },
            None => LockStatus { temp_mc: self.temp_mc, ..LockStatus::default() },
        }
    }

    /// One step. A lock not seen before is written first, which covers
    /// daemon start and locks made from the CLI.
    pub fn check(&mut self, dev: &Device, lock: Option<&CpuLock>, temp_mc: Option<i32>, now: Instant) -> Option<LockEvent> {
        let Some(lock) = lock else {
            *self = LockGuard { temp_mc, ..LockGuard::default() };
            return None;
        };
        if self.applied.as_deref() != Some(lock.locked_at.as_str()) {
            *self = LockGuard { applied: Some(lock.locked_at.clone()), ..LockGuard::default() };
            if let Err(e) = apply_lock(dev, lock) {
                tracing::warn!("CPU: lock not applied: {}", e);
            }
        }
        self.temp_mc = temp_mc;
        if !lock.smart {
            return None;
        }
        let temp = temp_mc?;

        let limits = lock.policy.limits();
        let severity = limits.severity(temp);
        let prev = std::mem::replace(&mut self.severity, severity);
        match severity {
            Severity::Critical => self.trip(dev, lock, limits.on_critical, severity, temp),
            Severity::Emergency => self.trip(dev, lock, limits.on_emergency, severity, temp),
            Severity::Warning => {
                self.cool_since = None;
                (prev == Severity::Normal && self.released.is_none()).then(|| {
                    tracing::info!("CPU: {} nearing the {} limits", fmt_c(temp as i64), lock.policy);
                    LockEvent::Warning { temp_mc: temp }
                })
            }
            Severity::Normal => self.try_restore(dev, lock, &limits, temp, now),
        }
    }

    fn trip(&mut self, dev: &Device, lock: &CpuLock, action: ThermalAction, severity: Severity, temp: i32) -> Option<LockEvent> {
        self.cool_since = None;
        let powersave = action == ThermalAction::UnlockPowersave;
        let escalate = powersave && self.released != Some(ThermalAction::UnlockPowersave);
        if self.released.is_some() && !escalate {
            return None;
        }
        if self.released.is_none() {
            if let Err(e) = release(dev, lock) {
                tracing::warn!("CPU: release failed: {}", e);
            }
        }
        if powersave {
            if let Err(e) = cpu::set_governor_all(dev, "powersave") {
                tracing::warn!("CPU: powersave failed: {}", e);
            }
        }
        self.released = Some(action);
        tracing::warn!(
            "CPU: {} at {}, lock released{}",
            severity,
            fmt_c(temp as i64),
            if powersave { " with powersave" } else { "" }
        );
        Some(LockEvent::Released { severity, temp_mc: temp, powersave })
    }

    fn try_restore(&mut self, dev: &Device, lock: &CpuLock, limits: &PolicyLimits, temp: i32, now: Instant) -> Option<LockEvent> {
        let released = self.released?;
        if !limits.is_cool(temp) {
            self.cool_since = None;
            return None;
        }
        if !limits.auto_restore {
            return None;
        }
        let since = *self.cool_since.get_or_insert(now);
        if now.duration_since(since) < limits.restore_delay {
            return None;
        }
        while self.restores.front().is_some_and(|t| now.duration_since(*t) >= RESTORE_WINDOW) {
            self.restores.pop_front();
        }
        if self.restores.len() >= limits.max_restores_per_hour {
            tracing::debug!("CPU: restore limit reached for this hour");
            return None;
        }

        self.cool_since = None;
        self.restores.push_back(now);
        let res = match released {
            ThermalAction::UnlockPowersave => restore_governors(dev, lock).and_then(|_| apply_lock(dev, lock)),
            ThermalAction::Unlock => apply_lock(dev, lock),
        };
        match res {
            Ok(_) => {
                self.released = None;
                tracing::info!("CPU: {}, lock restored", fmt_c(temp as i64));
                Some(LockEvent::Restored { temp_mc: temp })
            }
            Err(e) => {
                tracing::warn!("CPU: lock restore failed: {}", e);
                Some(LockEvent::RestoreFailed { error: e.to_string() })
            }
        }
    }
}

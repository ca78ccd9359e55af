//! Periodic device snapshots for clients, and the foreground-app watcher that
//! drives per-app profiles and game mode.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Local;
use serde::Serialize;

use crate::{
    battery::{BatteryInfo, ChargeProbe},
    cpu::{self, CoreState, CpuStatSample},
    cpu_lock::{cpu_temp_mc, LockGuard},
    device::Device,
    gamemode::{get_foreground_package, GameEvent, GameModeController},
    gpu,
    mem::{read_meminfo, MemInfo},
    notify::post_notification,
    profiles::ProfileSwitcher,
    ram::{zram_status, ZramInfo},
    screen::{detect_screen_probe, screen_on, ScreenProbe},
    state::{read_state, write_state, Shared},
    thermal::{self, ThermalPreset, Temps, ZoneSet},
    user_config::UserConfig,
};

const FOREGROUND_INTERVAL: Duration = Duration::from_secs(2);
const SCREEN_OFF_RECHECK: Duration = Duration::from_secs(2);
/// Upper bound on the poll step while a smart CPU lock is held.
const LOCK_CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterSnapshot {
    pub index: usize,
    pub cores: Vec<usize>,
    pub cur_freq: u64,
    pub min_freq: u64,
    pub max_freq: u64,
    pub governor: String,
    pub util: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GpuSnapshot {
    pub cur_freq: u64,
    pub min_freq: u64,
    pub max_freq: u64,
    pub util: u8,
    pub power_level: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub taken_at: Option<String>,
    pub clusters: Vec<ClusterSnapshot>,
    pub cores: Vec<CoreState>,
    pub gpu: Option<GpuSnapshot>,
    pub temps: Temps,
    pub memory: Option<MemInfo>,
    pub zram: Option<ZramInfo>,
    pub battery: Option<BatteryInfo>,
    pub thermal_preset: Option<ThermalPreset>,
    pub screen_on: bool,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            taken_at: None,
            clusters: Vec::new(),
            cores: Vec::new(),
            gpu: None,
            temps: Temps::default(),
            memory: None,
            zram: None,
            battery: None,
            thermal_preset: None,
            screen_on: true,
        }
    }
}

/// Probes are detected once; the CPU stat sample carries over between polls
/// so utilisation is measured over the poll interval.
pub struct Poller {
    dev: Device,
    zones: ZoneSet,
    screen: Option<ScreenProbe>,
    charge: Option<ChargeProbe>,
    prev_stat: Option<CpuStatSample>,
    was_on: bool,
    lock_guard: LockGuard,
}

impl Poller {
    pub fn new(dev: Device) -> Self {
        let sys = &dev.sysfs;
        let zones = ZoneSet::detect(sys);
        let screen = detect_screen_probe(sys);
        let charge = ChargeProbe::detect(sys);
        tracing::info!(
            "MON: zones cpu={} gpu={} battery={}, screen probe {:?}, charge probe {}",
            zones.cpu.len(),
            zones.gpu.len(),
            zones.battery.is_some(),
            screen,
            charge.is_some()
        );
        Self { dev, zones, screen, charge, prev_stat: None, was_on: true, lock_guard: LockGuard::default() }
    }

    /// No probe means we cannot tell, so treat it as on.
    pub fn screen_on(&self) -> bool {
        self.screen.as_ref().map_or(true, |p| screen_on(&self.dev.sysfs, p))
    }

    pub fn snapshot(&mut self) -> DeviceSnapshot {
        let sys = &self.dev.sysfs;
        let utils = cpu::cpu_utils_by_core(sys, &mut self.prev_stat).unwrap_or_default();

        let clusters = cpu::detect_clusters(sys)
            .into_iter()
            .map(|c| ClusterSnapshot {
                util: cpu::avg_util(&utils, &c.cores),
                index: c.index,
                cur_freq: c.cur_freq,
                min_freq: c.cur_min,
                max_freq: c.cur_max,
                governor: c.governor,
                cores: c.cores,
            })
            .collect();

        let gpu = gpu::detect_gpu(&self.dev).map(|g| GpuSnapshot {
            util: gpu::read_gpu_util(sys, &g.base),
            cur_freq: g.cur_freq,
            min_freq: g.min_freq,
            max_freq: g.max_freq,
            power_level: g.power_level,
        });

        DeviceSnapshot {
            taken_at: Some(Local::now().to_rfc3339()),
            clusters,
            cores: cpu::core_states(sys),
            gpu,
            temps: thermal::read_temps(sys, &self.zones),
            memory: read_meminfo(sys),
            zram: zram_status(sys),
            battery: self.charge.as_ref().map(|c| c.read(sys)),
            thermal_preset: thermal::current_preset(sys),
            screen_on: self.screen_on(),
        }
    }

    /// One poll step. Publishes a fresh snapshot while the screen is on;
    /// with it off only `screen_on = false` is published. The CPU lock guard
    /// runs either way. Returns how long to sleep before the next step.
    pub fn tick(&mut self, shared: &Shared) -> Duration {
        let (lock, notify, interval) = {
            let s = read_state(shared);
            (s.config.cpu_lock.clone(), s.config.notifications.enabled, s.config.poll_interval_secs.max(1))
        };

        let on = self.screen_on();
        if on != self.was_on {
            tracing::info!("MON: screen {}, polling {}", if on { "on" } else { "off" }, if on { "resumed" } else { "paused" });
        }
        let snap = on.then(|| self.snapshot());
        let temps = snap.as_ref().map_or_else(|| thermal::read_temps(&self.dev.sysfs, &self.zones), |s| s.temps);
        let event = self.lock_guard.check(&self.dev, lock.as_ref(), cpu_temp_mc(&temps), Instant::now());

        {
            let mut s = write_state(shared);
            match snap {
                Some(snap) => s.snapshot = snap,
                None => s.snapshot.screen_on = false,
            }
            s.runtime.cpu_lock = self.lock_guard.status(lock.as_ref());
        }
        if let (Some(ev), true) = (&event, notify) {
            post_notification(self.dev.shell.as_ref(), &ev.message());
        }
        self.was_on = on;

        let mut sleep = if on { Duration::from_secs(interval) } else { SCREEN_OFF_RECHECK };
        if lock.is_some_and(|l| l.smart) {
            sleep = sleep.min(LOCK_CHECK_INTERVAL);
        }
        sleep
    }
}

/// Refreshes the shared snapshot every `poll_interval_secs` while the screen
/// is on. With the screen off only the screen state and the CPU lock guard
/// are rechecked.
pub fn spawn_poller(shared: Shared, dev: Device) {
    thread::spawn(move || {
        let mut poller = Poller::new(dev);
        loop {
            let sleep = poller.tick(&shared);
            thread::sleep(sleep);
        }
    });
}

/// What a foreground change produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ForegroundUpdate {
    pub game: Option<GameEvent>,
    pub profile: Option<String>,
    pub left_profile: bool,
}

/// Game mode first, then the app's own profile so its governor and thermal
/// preset take precedence.
#[derive(Debug, Default)]
pub struct ForegroundHandler {
    game: GameModeController,
    profiles: ProfileSwitcher,
}

impl ForegroundHandler {
    pub fn game_package(&self) -> Option<&str> {
        self.game.active()
    }

    pub fn active_profile(&self) -> Option<&str> {
        self.profiles.active().map(|p| p.label())
    }

    pub fn on_change(&mut self, dev: &Device, cfg: &UserConfig, package: Option<&str>) -> ForegroundUpdate {
        let had_profile = self.profiles.active().is_some();
        let game = self.game.on_foreground(dev, &cfg.game_mode, cfg.perf_mode, package);
        let profile = self
            .profiles
            .on_foreground(dev, &cfg.app_profiles, package)
            .map(|p| p.label().to_string());
        ForegroundUpdate {
            game,
            left_profile: had_profile && self.profiles.active().is_none(),
            profile,
        }
    }
}

pub fn spawn_foreground_watch(shared: Shared, dev: Device) {
    thread::spawn(move || {
        let mut handler = ForegroundHandler::default();
        let screen = detect_screen_probe(&dev.sysfs);
        let mut last: (Option<String>, u64) = (None, u64::MAX);
        loop {
            thread::sleep(FOREGROUND_INTERVAL);
            if screen.as_ref().is_some_and(|p| !screen_on(&dev.sysfs, p)) {
                continue;
            }

            let pkg = get_foreground_package(dev.shell.as_ref());
            let (cfg, rev) = {
                let s = read_state(&shared);
                (s.config.clone(), s.config_rev)
            };
            if last.0 == pkg && last.1 == rev {
                continue;
            }
            last = (pkg.clone(), rev);

            let up = handler.on_change(&dev, &cfg, pkg.as_deref());
            {
                let mut s = write_state(&shared);
                s.runtime.foreground = pkg.clone();
                s.runtime.game_mode = handler.game_package().map(str::to_string);
                s.runtime.active_profile = handler.active_profile().map(str::to_string);
            }

            if !cfg.notifications.enabled {
                continue;
            }
            let msg = match (&up.game, &up.profile) {
                (_, Some(p)) => Some(format!("Profile: {}", p)),
                (Some(GameEvent::Entered(g)), None) => Some(format!("Game mode on: {}", g)),
                (Some(GameEvent::Exited), None) => Some("Game mode off".to_string()),
                (None, None) => None,
            };
            if let Some(m) = msg {
                post_notification(dev.shell.as_ref(), &m);
            }
        }
    });
}

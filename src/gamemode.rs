use std::{collections::BTreeMap, thread, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    device::Device,
    error::{Error, Result},
    mem::read_meminfo,
    shell::Shell,
    tweaks::{apply_perf_mode, PerfMode},
};

const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";

fn yes() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameApp {
    pub package: String,
    #[serde(default = "yes")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameModeConfig {
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub apps: Vec<GameApp>,
    /// Do-not-disturb while a game is in front.
    #[serde(default)]
    pub dnd: bool,
    #[serde(default)]
    pub clear_ram_on_start: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GameModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            apps: Vec::new(),
            dnd: false,
            clear_ram_on_start: false,
            extra: BTreeMap::new(),
        }
    }
}

impl GameModeConfig {
    pub fn is_game(&self, package: &str) -> bool {
        self.enabled && self.apps.iter().any(|a| a.enabled && a.package == package)
    }
}

pub fn sanitize_pkg(s: &str) -> String {
    let s = s.trim();
    s.trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        .to_string()
}

fn parse_pkg_from_line(line: &str) -> Option<String> {
    for tok in line.split_whitespace() {
        if let Some((pkg, _rest)) = tok.split_once('/') {
            if pkg.contains('.') {
                let p = sanitize_pkg(pkg);
                if !p.is_empty() {
                    return Some(p);
                }
            }
        }
    }

    if let Some(pos) = line.find("com.") {
        let sub = &line[pos..];
        let end = sub.find('/').or_else(|| sub.find(' ')).unwrap_or(sub.len());
        return Some(sanitize_pkg(&sub[..end]));
    }

    None
}

const FOREGROUND_QUERIES: &[&str] = &[
    "cmd activity get-top-activity 2>/dev/null",
    "dumpsys activity activities 2>/dev/null | grep -m 1 -E 'mResumedActivity|topResumedActivity|ResumedActivity'",
    "dumpsys window windows 2>/dev/null | grep -m 1 -E 'mCurrentFocus|mFocusedApp'",
];

/// First query that yields a package wins.
pub fn get_foreground_package(shell: &dyn Shell) -> Option<String> {
    FOREGROUND_QUERIES.iter().find_map(|q| {
        let out = shell.exec(q).ok()?;
        out.lines().find_map(parse_pkg_from_line)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClearRamResult {
    pub before_kb: u64,
    pub after_kb: u64,
    pub freed_mb: u64,
}

/// Drops page caches and kills cached background apps. Succeeds when at
/// least one of the three actions worked.
pub fn clear_ram(dev: &Device) -> Result<ClearRamResult> {
    let avail = || read_meminfo(&dev.sysfs).map(|m| m.available_kb).unwrap_or(0);
    let before_kb = avail();

    let results = [
        dev.exec("sync").map(|_| ()),
        dev.sysfs.write(DROP_CACHES, 3),
        dev.exec("am kill-all").map(|_| ()),
    ];
    if results.iter().all(|r| r.is_err()) {
        return Err(Error::Invalid("clear ram: every action failed".to_string()));
    }

    thread::sleep(Duration::from_millis(500));
    let after_kb = avail();
    let freed_mb = after_kb.saturating_sub(before_kb) / 1024;
    tracing::info!("RAM: cleared, {} MB freed", freed_mb);
    Ok(ClearRamResult { before_kb, after_kb, freed_mb })
}

pub fn set_dnd(dev: &Device, on: bool) -> Result<()> {
    dev.exec(if on { "cmd notification set_dnd priority" } else { "cmd notification set_dnd off" })?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    Entered(String),
    Exited,
}

#[derive(Debug, Default)]
pub struct GameModeController {
    active: Option<String>,
    /// DND was turned on by us and must be turned off on exit.
    dnd_on: bool,
}

impl GameModeController {
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Enters game mode when `package` is a listed game and leaves it when
    /// the foreground app is anything else. `normal_mode` is restored on exit.
    pub fn on_foreground(
        &mut self,
        dev: &Device,
        cfg: &GameModeConfig,
        normal_mode: Option<PerfMode>,
        package: Option<&str>,
    ) -> Option<GameEvent> {
        let game = package.filter(|p| cfg.is_game(p));
        match (game, &self.active) {
            (Some(pkg), Some(cur)) if pkg == cur => None,
            (Some(pkg), _) => {
                tracing::info!("GAME: ON ({})", pkg);
                if let Err(e) = apply_perf_mode(dev, PerfMode::Performance) {
                    tracing::warn!("GAME: perf mode failed: {}", e);
                }
                if cfg.dnd && !self.dnd_on {
                    match set_dnd(dev, true) {
                        Ok(()) => self.dnd_on = true,
                        Err(e) => tracing::warn!("GAME: dnd failed: {}", e),
                    }
                }
                if cfg.clear_ram_on_start && self.active.is_none() {
                    if let Err(e) = clear_ram(dev) {
                        tracing::warn!("GAME: clear ram failed: {}", e);
                    }
                }
                self.active = Some(pkg.to_string());
                Some(GameEvent::Entered(pkg.to_string()))
            }
            (None, Some(_)) => {
                tracing::info!("GAME: OFF");
                let mode = normal_mode.unwrap_or(PerfMode::Balance);
                if let Err(e) = apply_perf_mode(dev, mode) {
                    tracing::warn!("GAME: restore {} failed: {}", mode, e);
                }
                if self.dnd_on {
                    if let Err(e) = set_dnd(dev, false) {
                        tracing::warn!("GAME: dnd off failed: {}", e);
                    }
                    self.dnd_on = false;
                }
                self.active = None;
                Some(GameEvent::Exited)
            }
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        shell::RecordingShell,
        testutil::{fake_cpu, fake_device, node},
    };

    #[test]
    fn parses_top_activity_lines() {
        assert_eq!(
            parse_pkg_from_line("  mResumedActivity: ActivityRecord{a1b2 u0 com.miHoYo.GenshinImpact/.MainActivity t12}"),
            Some("com.miHoYo.GenshinImpact".to_string())
        );
        assert_eq!(
            parse_pkg_from_line("mCurrentFocus=Window{9f u0 org.telegram.messenger/org.telegram.ui.LaunchActivity}"),
            Some("org.telegram.messenger".to_string())
        );
        assert_eq!(parse_pkg_from_line("nothing here"), None);
    }

    #[test]
    fn foreground_falls_through_queries() {
        let sh = RecordingShell::new();
        sh.fail("cmd activity get-top-activity", 1).respond(
            "dumpsys activity activities",
            "  topResumedActivity=ActivityRecord{1 u0 com.tencent.ig/.MainActivity t3}\n",
        );
        assert_eq!(get_foreground_package(&sh), Some("com.tencent.ig".to_string()));
        assert_eq!(sh.commands().len(), 2);
    }

    #[test]
    fn clear_ram_reports_freed_memory() {
        let dir = tempdir().unwrap();
        node(dir.path(), DROP_CACHES, "0");
        node(dir.path(), "/proc/meminfo", "MemTotal: 8000000 kB\nMemAvailable: 2000000 kB\n");
        let (dev, sh) = fake_device(dir.path());

        let res = clear_ram(&dev).unwrap();
        assert_eq!(res.before_kb, 2000000);
        assert_eq!(res.freed_mb, 0);
        assert_eq!(dev.sysfs.read_u64(DROP_CACHES), Some(3));
        assert_eq!(sh.commands(), vec!["sync".to_string(), "am kill-all".to_string()]);
    }

    #[test]
    fn enter_and_exit_game_mode() {
        let dir = tempdir().unwrap();
        fake_cpu(dir.path(), 0, &[300000, 1800000], "schedutil");
        let (dev, sh) = fake_device(dir.path());
        let cfg = GameModeConfig {
            apps: vec![
                GameApp { package: "com.game".to_string(), enabled: true },
                GameApp { package: "com.off".to_string(), enabled: false },
            ],
            dnd: true,
            ..GameModeConfig::default()
        };
        let gov = || dev.sysfs.read_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor");
        let mut ctl = GameModeController::default();

        assert_eq!(ctl.on_foreground(&dev, &cfg, None, Some("com.off")), None);
        assert_eq!(
            ctl.on_foreground(&dev, &cfg, None, Some("com.game")),
            Some(GameEvent::Entered("com.game".to_string()))
        );
        assert_eq!(gov().as_deref(), Some("performance"));
        assert_eq!(ctl.on_foreground(&dev, &cfg, None, Some("com.game")), None);

        assert_eq!(
            ctl.on_foreground(&dev, &cfg, Some(PerfMode::Battery), Some("com.launcher")),
            Some(GameEvent::Exited)
        );
        assert_eq!(gov().as_deref(), Some("powersave"));
        assert_eq!(
            sh.commands(),
            vec![
                "cmd notification set_dnd priority".to_string(),
                "cmd notification set_dnd off".to_string(),
            ]
        );
    }

    #[test]
    fn dnd_is_released_after_the_setting_is_turned_off_mid_game() {
        let dir = tempdir().unwrap();
        fake_cpu(dir.path(), 0, &[300000, 1800000], "schedutil");
        let (dev, sh) = fake_device(dir.path());
        let mut cfg = GameModeConfig {
            apps: vec![GameApp { package: "com.game".to_string(), enabled: true }],
            dnd: true,
            ..GameModeConfig::default()
        };
        let mut ctl = GameModeController::default();

        ctl.on_foreground(&dev, &cfg, None, Some("com.game"));
        cfg.dnd = false;
        assert_eq!(ctl.on_foreground(&dev, &cfg, None, None), Some(GameEvent::Exited));
        assert_eq!(sh.commands().last().map(String::as_str), Some("cmd notification set_dnd off"));

        // Never turned on, so nothing to turn off.
        ctl.on_foreground(&dev, &cfg, None, Some("com.game"));
        ctl.on_foreground(&dev, &cfg, None, None);
        assert_eq!(sh.commands().iter().filter(|c| c.contains("set_dnd")).count(), 2);
    }

    #[test]
    fn disabled_game_mode_never_triggers() {
        let cfg = GameModeConfig {
            enabled: false,
            apps: vec![GameApp { package: "com.game".to_string(), enabled: true }],
            ..GameModeConfig::default()
        };
        assert!(!cfg.is_game("com.game"));
    }
}

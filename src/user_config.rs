use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    cpu_lock::CpuLock,
    device::{Device, DEFAULT_RENDERER_PROP_FILE, DEFAULT_SWAP_FILE},
    gamemode::{sanitize_pkg, GameModeConfig},
    profiles::AppProfile,
    shell::{Shell, ShellKind},
    sysfs::Sysfs,
    tuning::TuningConfig,
    tweaks::PerfMode,
};

pub const CONFIG_PATH: &str = "/data/adb/kern-tuner/config.json";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:1004";
pub const DEFAULT_EXPORT_DIR: &str = "/sdcard/KernTuner/profiles";
const TOKEN_LEN: usize = 48;

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_export_dir() -> PathBuf {
    PathBuf::from(DEFAULT_EXPORT_DIR)
}

fn default_swap_file() -> PathBuf {
    PathBuf::from(DEFAULT_SWAP_FILE)
}

fn default_renderer_prop_file() -> PathBuf {
    PathBuf::from(DEFAULT_RENDERER_PROP_FILE)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    /// Token local clients send with every /api/* request. Generated and
    /// persisted when missing or empty.
    #[serde(default)]
    pub api_token: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub shell: ShellKind,
    /// Seconds between device snapshots while the screen is on.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_swap_file")]
    pub swap_file: PathBuf,
    #[serde(default = "default_renderer_prop_file")]
    pub renderer_prop_file: PathBuf,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Re-apply `tuning` at boot.
    #[serde(default)]
    pub set_on_boot: bool,
    /// Last configuration applied through the daemon or CLI.
    #[serde(default)]
    pub tuning: Option<TuningConfig>,
    /// Mode restored when game mode ends.
    #[serde(default)]
    pub perf_mode: Option<PerfMode>,
    /// Cluster frequency lock kept in force by the daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_lock: Option<CpuLock>,

    #[serde(default)]
    pub app_profiles: Vec<AppProfile>,
    #[serde(default)]
    pub game_mode: GameModeConfig,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            bind_addr: default_bind_addr(),
            shell: ShellKind::default(),
            poll_interval_secs: default_poll_interval(),
            export_dir: default_export_dir(),
            swap_file: default_swap_file(),
            renderer_prop_file: default_renderer_prop_file(),
            notifications: NotificationsConfig::default(),
            set_on_boot: false,
            tuning: None,
            perf_mode: None,
            cpu_lock: None,
            app_profiles: Vec::new(),
            game_mode: GameModeConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub enabled: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra: BTreeMap::new(),
        }
    }
}

impl UserConfig {
    pub fn validate_and_normalize(&mut self) -> Result<(), String> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("bind_addr {:?}: {}", self.bind_addr, e))?;

        self.poll_interval_secs = self.poll_interval_secs.clamp(1, 60);

        if let Some(t) = &self.tuning {
            t.ram.validate().map_err(|e| e.to_string())?;
        }
        if let Some(c) = self.cpu_lock.iter().flat_map(|l| &l.clusters).find(|c| c.min_freq > c.max_freq) {
            return Err(format!("cpu_lock cluster{}: min {} > max {}", c.cluster, c.min_freq, c.max_freq));
        }

        // Packages: trimmed, non-empty, first entry wins.
        let mut seen = BTreeSet::new();
        self.app_profiles.retain_mut(|p| {
            p.package = sanitize_pkg(&p.package);
            !p.package.is_empty() && seen.insert(p.package.clone())
        });
        let mut seen = BTreeSet::new();
        self.game_mode.apps.retain_mut(|a| {
            a.package = sanitize_pkg(&a.package);
            !a.package.is_empty() && seen.insert(a.package.clone())
        });

        Ok(())
    }

    /// Device handle rooted at `sysfs` with the configured file locations.
    pub fn device(&self, sysfs: Sysfs, shell: Arc<dyn Shell>) -> Device {
        Device::new(sysfs, shell)
            .with_swap_file(&self.swap_file)
            .with_renderer_prop_file(&self.renderer_prop_file)
    }
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Defaults, keeping `token` when one survives so clients stay authorised.
fn reset_to_default(path: &Path, token: Option<String>) -> UserConfig {
    let mut def = UserConfig {
        api_token: token.unwrap_or_default(),
        ..UserConfig::default()
    };
    ensure_api_token(&mut def);
    if let Err(e) = write_config_atomic(path, &def) {
        tracing::warn!("CFG: cannot write {}: {}", path.display(), e);
    }
    def
}

/// Read-only load; `None` when missing or invalid.
pub fn read_config(path: &Path) -> Option<UserConfig> {
    let mut cfg: UserConfig = serde_json::from_str(&fs::read_to_string(path).ok()?).ok()?;
    cfg.validate_and_normalize().ok()?;
    Some(cfg)
}

/// Token from a file that no longer parses, if it still has one.
fn salvage_token(text: &str) -> Option<String> {
    let v: Value = serde_json::from_str(text).ok()?;
    let token = v.get("api_token")?.as_str()?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn load_or_init(path: &Path) -> UserConfig {
    match fs::read_to_string(path) {
        Ok(s) => match serde_json::from_str::<UserConfig>(&s) {
            Ok(mut cfg) => {
                if let Err(e) = cfg.validate_and_normalize() {
                    tracing::warn!("CFG: invalid config: {} (reset to default)", e);
                    reset_to_default(path, salvage_token(&s))
                } else {
                    // Persist a freshly generated token.
                    if ensure_api_token(&mut cfg) {
                        let _ = write_config_atomic(path, &cfg);
                    }
                    cfg
                }
            }
            Err(e) => {
                tracing::warn!("CFG: failed to parse config: {} (reset to default)", e);
                reset_to_default(path, salvage_token(&s))
            }
        },
        Err(_) => {
            tracing::info!("CFG: creating {}", path.display());
            reset_to_default(path, None)
        }
    }
}

pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Fills an empty token; returns whether one was generated.
fn ensure_api_token(cfg: &mut UserConfig) -> bool {
    if !cfg.api_token.trim().is_empty() {
        return false;
    }
    cfg.api_token = generate_token();
    true
}

pub fn write_config_atomic(path: &Path, cfg: &UserConfig) -> io::Result<()> {
    ensure_parent_dir(path)?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let data = serde_json::to_string_pretty(cfg)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    fs::write(&tmp, data.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::gamemode::GameApp;

    #[test]
    fn missing_file_creates_defaults_with_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg/config.json");

        let cfg = load_or_init(&path);
        assert_eq!(cfg.api_token.len(), TOKEN_LEN);
        assert!(cfg.api_token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(cfg.poll_interval_secs, 5);

        let again = load_or_init(&path);
        assert_eq!(again.api_token, cfg.api_token);
    }

    #[test]
    fn garbage_resets_to_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let cfg = load_or_init(&path);
        assert!(cfg.app_profiles.is_empty());
        let on_disk: UserConfig = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.api_token, cfg.api_token);
    }

    #[test]
    fn invalid_config_keeps_its_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"api_token":"keepme","bind_addr":"nowhere"}"#).unwrap();

        let cfg = load_or_init(&path);
        assert_eq!(cfg.api_token, "keepme");
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(load_or_init(&path).api_token, "keepme");
    }

    #[test]
    fn tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn unknown_keys_survive_a_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"api_token":"abc","ui_theme":"dark","notifications":{"enabled":false,"sound":true}}"#,
        )
        .unwrap();

        let cfg = load_or_init(&path);
        assert_eq!(cfg.api_token, "abc");
        assert!(!cfg.notifications.enabled);
        write_config_atomic(&path, &cfg).unwrap();

        let v: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["ui_theme"], "dark");
        assert_eq!(v["notifications"]["sound"], true);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn normalize_clamps_and_dedupes() {
        let mut cfg = UserConfig {
            poll_interval_secs: 0,
            ..UserConfig::default()
        };
        let app = |p: &str| GameApp { package: p.to_string(), enabled: true };
        cfg.game_mode.apps = vec![app(" com.a "), app("com.a"), app(""), app("com.b")];
        cfg.app_profiles = serde_json::from_str(r#"[{"package":"com.x"},{"package":"com.x","governor":"performance"}]"#).unwrap();

        cfg.validate_and_normalize().unwrap();
        assert_eq!(cfg.poll_interval_secs, 1);
        let pkgs: Vec<&str> = cfg.game_mode.apps.iter().map(|a| a.package.as_str()).collect();
        assert_eq!(pkgs, vec!["com.a", "com.b"]);
        assert_eq!(cfg.app_profiles.len(), 1);
        assert_eq!(cfg.app_profiles[0].governor, "schedutil");
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        let mut cfg = UserConfig {
            bind_addr: "localhost".to_string(),
            ..UserConfig::default()
        };
        assert!(cfg.validate_and_normalize().unwrap_err().contains("bind_addr"));

        let lock: CpuLock = serde_json::from_str(
            r#"{"clusters":[{"cluster":1,"min_freq":2000,"max_freq":900}],"locked_at":"x"}"#,
        )
        .unwrap();
        let mut cfg = UserConfig { cpu_lock: Some(lock), ..UserConfig::default() };
        assert!(cfg.validate_and_normalize().unwrap_err().contains("cpu_lock cluster1"));
    }
}

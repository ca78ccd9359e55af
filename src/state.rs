use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::{apply::ApplyReport, cpu_lock::LockStatus, monitor::DeviceSnapshot, user_config::UserConfig};

#[derive(Clone, Debug, Default, Serialize)]
pub struct RuntimeInfo {
    pub foreground: Option<String>,
    /// Package that put the device into game mode.
    pub game_mode: Option<String>,
    pub active_profile: Option<String>,
    pub last_apply: Option<ApplyReport>,
    pub cpu_lock: LockStatus,
}

#[derive(Clone, Debug)]
pub struct SharedState {
    pub config: UserConfig,
    pub config_rev: u64,
    pub last_config_error: Option<String>,

    pub snapshot: DeviceSnapshot,
    pub runtime: RuntimeInfo,
}

impl SharedState {
    pub fn new(config: UserConfig) -> Self {
        Self {
            config,
            config_rev: 0,
            last_config_error: None,
            snapshot: DeviceSnapshot::default(),
            runtime: RuntimeInfo::default(),
        }
    }
}

pub type Shared = Arc<RwLock<SharedState>>;

pub fn shared(config: UserConfig) -> Shared {
    Arc::new(RwLock::new(SharedState::new(config)))
}

// A panicked writer leaves plain data behind; keep serving it.
pub fn read_state(s: &Shared) -> RwLockReadGuard<'_, SharedState> {
    s.read().unwrap_or_else(|p| p.into_inner())
}

pub fn write_state(s: &Shared) -> RwLockWriteGuard<'_, SharedState> {
    s.write().unwrap_or_else(|p| p.into_inner())
}

use crate::{
    state::{write_state, Shared},
    user_config::{load_or_init, write_config_atomic, UserConfig},
};
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

fn mtime_secs(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

/// Poll config.json for changes. On parse/validation errors resets to default.
pub fn spawn(shared: Shared, path: PathBuf) {
    thread::spawn(move || {
        let mut last_mtime = mtime_secs(&path);
        loop {
            // Config changes are rare; poll slowly.
            thread::sleep(Duration::from_millis(1500));
            let mtime = mtime_secs(&path);

            if mtime.is_some() && mtime != last_mtime {
                let cfg = load_or_init(path.as_path());
                tracing::info!("CFG: reloaded {}", path.display());
                {
                    let mut s = write_state(&shared);
                    s.config = cfg;
                    s.config_rev = s.config_rev.wrapping_add(1);
                    s.last_config_error = None;
                }
                last_mtime = mtime_secs(&path);
            } else if mtime.is_none() && last_mtime.is_some() {
                tracing::warn!("CFG: {} removed, writing defaults", path.display());
                let mut def = UserConfig::default();
                {
                    let mut s = write_state(&shared);
                    // Keep the token so connected clients stay authorised.
                    def.api_token = s.config.api_token.clone();
                    s.config = def.clone();
                    s.config_rev = s.config_rev.wrapping_add(1);
                    s.last_config_error = Some("config missing: reset to default".to_string());
                }
                if let Err(e) = write_config_atomic(path.as_path(), &def) {
                    tracing::warn!("CFG: write failed: {}", e);
                }
                last_mtime = mtime_secs(&path);
            }
        }
    });
}

/// Apply a new config into shared state and persist to disk.
/// Returns error string for HTTP responses.
pub fn apply_and_persist(shared: &Shared, path: &Path, mut cfg: UserConfig) -> Result<(), String> {
    cfg.validate_and_normalize()?;
    write_config_atomic(path, &cfg).map_err(|e| e.to_string())?;
    {
        let mut s = write_state(shared);
        s.config = cfg;
        s.config_rev = s.config_rev.wrapping_add(1);
        s.last_config_error = None;
    }
    Ok(())
}

/// Read-modify-write of the current config.
pub fn update(shared: &Shared, path: &Path, f: impl FnOnce(&mut UserConfig)) -> Result<(), String> {
    let mut cfg = crate::state::read_state(shared).config.clone();
    f(&mut cfg);
    apply_and_persist(shared, path, cfg)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::state::{read_state, shared};

    #[test]
    fn persist_bumps_revision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let st = shared(UserConfig::default());

        update(&st, &path, |c| c.set_on_boot = true).unwrap();
        assert_eq!(read_state(&st).config_rev, 1);
        assert!(read_state(&st).config.set_on_boot);
        assert!(load_or_init(&path).set_on_boot);

        let err = update(&st, &path, |c| c.bind_addr = "nope".to_string()).unwrap_err();
        assert!(err.contains("bind_addr"));
        assert_eq!(read_state(&st).config_rev, 1);
    }
}

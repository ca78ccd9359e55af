use std::{path::PathBuf, sync::Arc};

use crate::{shell::Shell, sysfs::Sysfs};

pub const DEFAULT_SWAP_FILE: &str = "/data/swap/swapfile";
pub const DEFAULT_RENDERER_PROP_FILE: &str = "/data/adb/modules/kern-tuner/system.prop";

/// Handle every control operation goes through: kernel nodes are plain file
/// I/O under `sysfs`, anything that needs a binary goes through `shell`.
#[derive(Clone)]
pub struct Device {
    pub sysfs: Sysfs,
    pub shell: Arc<dyn Shell>,
    pub swap_file: PathBuf,
    pub renderer_prop_file: PathBuf,
}

impl Device {
    pub fn new(sysfs: Sysfs, shell: Arc<dyn Shell>) -> Self {
        Self {
            sysfs,
            shell,
            swap_file: PathBuf::from(DEFAULT_SWAP_FILE),
            renderer_prop_file: PathBuf::from(DEFAULT_RENDERER_PROP_FILE),
        }
    }

    pub fn with_swap_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.swap_file = path.into();
        self
    }

    pub fn with_renderer_prop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.renderer_prop_file = path.into();
        self
    }

    pub fn exec(&self, cmd: &str) -> crate::error::Result<String> {
        self.shell.exec(cmd)
    }

    /// Needed after a renderer change. `svc power reboot` lets the framework
    /// shut down cleanly; plain `reboot` is the fallback.
    pub fn reboot(&self) -> crate::error::Result<()> {
        tracing::warn!("DEV: rebooting");
        self.exec("svc power reboot || reboot")?;
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("sysfs", &self.sysfs)
            .field("swap_file", &self.swap_file)
            .field("renderer_prop_file", &self.renderer_prop_file)
            .finish()
    }
}

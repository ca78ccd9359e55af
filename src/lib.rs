//! Kernel tuning for rooted Android: hardware detection, sysfs/procfs writes
//! through a root shell, TOML profiles, and a small daemon with a local API.

pub mod apply;
pub mod battery;
pub mod boot;
pub mod cli;
pub mod config_watch;
pub mod cpu;
pub mod cpu_lock;
pub mod device;
pub mod error;
pub mod fmt;
pub mod freq;
pub mod gamemode;
pub mod gpu;
pub mod mem;
pub mod monitor;
pub mod notify;
pub mod profile_io;
pub mod profiles;
pub mod ram;
pub mod screen;
pub mod shell;
pub mod soc;
pub mod state;
pub mod sysfs;
pub mod thermal;
pub mod tuning;
pub mod tweaks;
pub mod user_config;
pub mod web;

#[cfg(test)]
mod testutil;

pub use device::Device;
pub use error::{Error, Result};

use std::{
    path::Path,
    process::Command,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Privileged command channel. A command string goes in, stdout comes back
/// on success.
pub trait Shell: Send + Sync {
    fn exec(&self, cmd: &str) -> Result<String>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// Already running as root: plain `sh -c`.
    #[default]
    Sh,
    /// Escalate through `su -c`.
    Su,
}

#[derive(Clone, Debug)]
pub struct RootShell {
    kind: ShellKind,
}

impl RootShell {
    pub fn new(kind: ShellKind) -> Self {
        Self { kind }
    }

    fn command(&self, cmd: &str) -> Command {
        match self.kind {
            ShellKind::Sh => {
                let sh = if Path::new("/system/bin/sh").exists() {
                    "/system/bin/sh"
                } else {
                    "sh"
                };
                let mut c = Command::new(sh);
                c.args(["-c", cmd]);
                c
            }
            ShellKind::Su => {
                let mut c = Command::new("su");
                c.args(["-c", cmd]);
                c
            }
        }
    }
}

impl Shell for RootShell {
    fn exec(&self, cmd: &str) -> Result<String> {
        tracing::trace!("SH: {}", cmd);
        let out = self.command(cmd).output().map_err(|source| Error::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;
        if !out.status.success() {
            return Err(Error::Command {
                cmd: cmd.to_string(),
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Records every command instead of running it. Responses are scripted by
/// leading words: `"swapon"` matches `swapon /dev/block/zram0` but
/// `"getprop ro.hardware"` does not match `getprop ro.hardware.chipname`.
/// Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingShell {
    log: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, std::result::Result<String, i32>)>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: &str) -> &Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push((prefix.to_string(), Ok(output.to_string())));
        }
        self
    }

    pub fn fail(&self, prefix: &str, status: i32) -> &Self {
        if let Ok(mut r) = self.responses.lock() {
            r.push((prefix.to_string(), Err(status)));
        }
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl Shell for RecordingShell {
    fn exec(&self, cmd: &str) -> Result<String> {
        tracing::info!("SH(dry): {}", cmd);
        if let Ok(mut l) = self.log.lock() {
            l.push(cmd.to_string());
        }
        let responses = match self.responses.lock() {
            Ok(r) => r,
            Err(_) => return Ok(String::new()),
        };
        // Later scripts override earlier ones for the same prefix.
        let matches = |p: &str| {
            cmd.strip_prefix(p)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
        };
        match responses.iter().rev().find(|(p, _)| matches(p)) {
            Some((_, Ok(out))) => Ok(out.clone()),
            Some((_, Err(status))) => Err(Error::Command {
                cmd: cmd.to_string(),
                status: *status,
                stderr: String::new(),
            }),
            None => Ok(String::new()),
        }
    }
}

/// Single-quote a value for `sh -c`.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Empty string when the property is unset or getprop fails.
pub fn getprop(shell: &dyn Shell, name: &str) -> String {
    shell
        .exec(&format!("getprop {}", name))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

pub fn setprop(shell: &dyn Shell, name: &str, value: &str) -> Result<()> {
    shell.exec(&format!("setprop {} {}", name, quote(value)))?;
    Ok(())
}

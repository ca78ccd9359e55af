use serde::Serialize;

use crate::sysfs::Sysfs;

fn field_kb(s: &str, key: &str) -> Option<u64> {
    s.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse::<u64>().ok()
    })
}

/// Read VmRSS (resident set size) in kB from /proc/self/status.
pub fn read_vmrss_kb(sys: &Sysfs) -> Option<u64> {
    field_kb(&sys.read_string("/proc/self/status")?, "VmRSS")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemInfo {
    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }

    pub fn swap_used_kb(&self) -> u64 {
        self.swap_total_kb.saturating_sub(self.swap_free_kb)
    }
}

pub fn read_meminfo(sys: &Sysfs) -> Option<MemInfo> {
    let s = sys.read_string("/proc/meminfo")?;
    Some(MemInfo {
        total_kb: field_kb(&s, "MemTotal")?,
        available_kb: field_kb(&s, "MemAvailable").or_else(|| field_kb(&s, "MemFree"))?,
        swap_total_kb: field_kb(&s, "SwapTotal").unwrap_or(0),
        swap_free_kb: field_kb(&s, "SwapFree").unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::testutil::node;

    #[test]
    fn parses_meminfo() {
        let dir = tempdir().unwrap();
        node(
            dir.path(),
            "/proc/meminfo",
            "MemTotal:       11745932 kB\nMemFree:          301220 kB\nMemAvailable:    4123456 kB\nSwapTotal:       4194300 kB\nSwapFree:        3194300 kB\n",
        );
        let mi = read_meminfo(&Sysfs::new(dir.path())).unwrap();
        assert_eq!(mi.total_kb, 11745932);
        assert_eq!(mi.available_kb, 4123456);
        assert_eq!(mi.used_kb(), 11745932 - 4123456);
        assert_eq!(mi.swap_used_kb(), 1_000_000);
    }

    #[test]
    fn vmrss_from_status() {
        let dir = tempdir().unwrap();
        node(dir.path(), "/proc/self/status", "Name:\tkern-tuner\nVmRSS:\t    2048 kB\n");
        assert_eq!(read_vmrss_kb(&Sysfs::new(dir.path())), Some(2048));
    }
}

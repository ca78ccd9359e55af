use std::{
    fmt::Display,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

fn read_to_string(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// Kernel nodes resolved under a root prefix. Production uses `/`; tests
/// point it at a scratch directory holding a fake tree.
#[derive(Clone, Debug)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, node: impl AsRef<Path>) -> PathBuf {
        let node = node.as_ref();
        let rel = node.strip_prefix("/").unwrap_or(node);
        self.root.join(rel)
    }

    pub fn exists(&self, node: impl AsRef<Path>) -> bool {
        self.path(node).exists()
    }

    /// Trimmed contents, `None` if missing or unreadable.
    pub fn read_string(&self, node: impl AsRef<Path>) -> Option<String> {
        read_to_string(&self.path(node)).map(|s| s.trim().to_string())
    }

    pub fn read_u64(&self, node: impl AsRef<Path>) -> Option<u64> {
        self.read_string(node)?.parse::<u64>().ok()
    }

    pub fn read_i64(&self, node: impl AsRef<Path>) -> Option<i64> {
        self.read_string(node)?.parse::<i64>().ok()
    }

    /// Whitespace separated tokens. Empty when the node is missing.
    pub fn read_list(&self, node: impl AsRef<Path>) -> Vec<String> {
        self.read_string(node)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Sorted entry names of a directory node.
    pub fn list_dir(&self, node: impl AsRef<Path>) -> Vec<String> {
        let mut out: Vec<String> = fs::read_dir(self.path(node))
            .map(|rd| {
                rd.flatten()
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn write(&self, node: impl AsRef<Path>, value: impl Display) -> Result<()> {
        let path = self.path(node);
        fs::write(&path, format!("{}\n", value).as_bytes()).map_err(|e| Error::io(&path, e))
    }

    /// Skips the write when the node already holds `value`. Returns whether a
    /// write happened. A missing node is an error.
    pub fn write_if_changed(&self, node: impl AsRef<Path>, value: impl Display) -> Result<bool> {
        let node = node.as_ref();
        let path = self.path(node);
        if !path.exists() {
            return Err(Error::NotFound(node.display().to_string()));
        }
        let target = value.to_string();
        if let Some(cur) = read_to_string(&path) {
            if cur.trim() == target {
                return Ok(false);
            }
        }
        self.write(node, &target)?;
        Ok(true)
    }

    pub fn set_mode(&self, node: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = self.path(node);
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(&path, e))
    }
}

/// Parses kernel choice lists such as `lzo [lz4] zstd` into the options and
/// the bracketed current selection.
pub fn parse_choices(s: &str) -> (Vec<String>, Option<String>) {
    let mut options = Vec::new();
    let mut current = None;
    for tok in s.split_whitespace() {
        if let Some(inner) = tok.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            current = Some(inner.to_string());
            options.push(inner.to_string());
        } else {
            options.push(tok.to_string());
        }
    }
    (options, current)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolves_absolute_nodes_under_root() {
        let sys = Sysfs::new("/tmp/fake");
        assert_eq!(
            sys.path("/proc/sys/vm/swappiness"),
            PathBuf::from("/tmp/fake/proc/sys/vm/swappiness")
        );
        assert_eq!(Sysfs::default().path("/proc/stat"), PathBuf::from("/proc/stat"));
    }

    #[test]
    fn reads_and_writes_nodes() {
        let dir = tempdir().unwrap();
        let sys = Sysfs::new(dir.path());
        fs::create_dir_all(dir.path().join("proc/sys/vm")).unwrap();
        fs::write(dir.path().join("proc/sys/vm/swappiness"), "60\n").unwrap();

        assert_eq!(sys.read_u64("/proc/sys/vm/swappiness"), Some(60));
        assert!(!sys.write_if_changed("/proc/sys/vm/swappiness", 60).unwrap());
        assert!(sys.write_if_changed("/proc/sys/vm/swappiness", 100).unwrap());
        assert_eq!(sys.read_string("/proc/sys/vm/swappiness").as_deref(), Some("100"));
        assert!(matches!(
            sys.write_if_changed("/proc/sys/vm/missing", 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn list_and_dir_helpers() {
        let dir = tempdir().unwrap();
        let sys = Sysfs::new(dir.path());
        fs::create_dir_all(dir.path().join("sys/block/sda")).unwrap();
        fs::create_dir_all(dir.path().join("sys/block/loop0")).unwrap();
        fs::write(dir.path().join("sys/block/sda/avail"), "none mq-deadline  kyber\n").unwrap();

        assert_eq!(sys.list_dir("/sys/block"), vec!["loop0", "sda"]);
        assert_eq!(sys.read_list("/sys/block/sda/avail"), vec!["none", "mq-deadline", "kyber"]);
        assert!(sys.read_list("/sys/block/sda/nope").is_empty());
    }

    #[test]
    fn parses_bracketed_choice() {
        let (opts, cur) = parse_choices("lzo lzo-rle [lz4] zstd");
        assert_eq!(opts, vec!["lzo", "lzo-rle", "lz4", "zstd"]);
        assert_eq!(cur.as_deref(), Some("lz4"));

        let (opts, cur) = parse_choices("cubic reno");
        assert_eq!(opts.len(), 2);
        assert_eq!(cur, None);
    }
}

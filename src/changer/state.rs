#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing as log;

use super::{drive::MAX_DRIVES, slots::MAX_SLOTS};
use crate::error::{IoContext, Result};

const DRIVE_STATE_PREFIX: &str = "drive_state-";
const MAGAZINE_STATE_PREFIX: &str = "magazine_state-";
const DYNAMIC_CONF: &str = "dynamic.conf";

/// Layout of the per-changer work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<()> {
        if self.root.is_dir() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(&self.root)
                .io_context(|| format!("create work dir {}", self.root.display()))
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(&self.root)
                .io_context(|| format!("create work dir {}", self.root.display()))
        }
    }

    pub fn drive_state(&self, drv: usize) -> PathBuf {
        self.root.join(format!("{DRIVE_STATE_PREFIX}{drv}"))
    }

    pub fn drive_link(&self, drv: usize) -> PathBuf {
        self.root.join(drv.to_string())
    }

    pub fn magazine_state(&self, bay: usize) -> PathBuf {
        self.root.join(format!("{MAGAZINE_STATE_PREFIX}{bay}"))
    }

    pub fn dynamic_conf(&self) -> PathBuf {
        self.root.join(DYNAMIC_CONF)
    }

    /// Highest drive index below `MAX_DRIVES` with a state file, if any.
    pub fn max_drive_with_state(&self) -> Result<Option<usize>> {
        let entries = fs::read_dir(&self.root)
            .io_context(|| format!("read work dir {}", self.root.display()))?;
        let mut max = None;
        for entry in entries {
            let entry =
                entry.io_context(|| format!("read work dir {}", self.root.display()))?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_drive_state_name) {
                Some(n) if n >= MAX_DRIVES => {
                    log::warn!("[state] ignoring {}: drive index too large", entry.path().display());
                }
                Some(n) => max = max.max(Some(n)),
                None => {}
            }
        }
        Ok(max)
    }
}

fn parse_drive_state_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(DRIVE_STATE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Writes a small state file, readable by owner and group only.
pub fn write_state_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        opts.mode(0o640);
    }
    let mut f = opts.open(path)?;
    f.write_all(contents.as_bytes())?;
    f.flush()
}

/// Removes a state file. Returns whether it existed.
pub fn remove_state_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Changer-wide values that outlive a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub max_slot: usize,
}

impl DynamicConfig {
    /// Missing or unreadable state means a fresh changer.
    pub fn restore(work: &WorkDir) -> Self {
        let path = work.dynamic_conf();
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::error!("[state] cannot read {}: {e}", path.display());
                return Self::default();
            }
        };
        match toml::from_str::<Self>(&raw) {
            Ok(dc) if dc.max_slot > MAX_SLOTS => {
                log::warn!(
                    "[state] ignoring {}: max_slot {} out of range",
                    path.display(),
                    dc.max_slot
                );
                Self::default()
            }
            Ok(dc) => dc,
            Err(e) => {
                log::warn!("[state] ignoring corrupt {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, work: &WorkDir) -> Result<()> {
        let path = work.dynamic_conf();
        let body = toml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .io_context(|| format!("encode {}", path.display()))?;
        write_state_file(&path, &body).io_context(|| format!("write {}", path.display()))?;
        log::debug!("[state] max_slot={} saved", self.max_slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn layout_names() {
        let w = WorkDir::new("/var/spool/vchanger/c1");
        assert_eq!(w.drive_state(3), Path::new("/var/spool/vchanger/c1/drive_state-3"));
        assert_eq!(w.drive_link(3), Path::new("/var/spool/vchanger/c1/3"));
        assert_eq!(
            w.magazine_state(0),
            Path::new("/var/spool/vchanger/c1/magazine_state-0")
        );
    }

    #[test]
    fn drive_state_names() {
        assert_eq!(parse_drive_state_name("drive_state-0"), Some(0));
        assert_eq!(parse_drive_state_name("drive_state-12"), Some(12));
        assert_eq!(parse_drive_state_name("drive_state-"), None);
        assert_eq!(parse_drive_state_name("drive_state-1a"), None);
        assert_eq!(parse_drive_state_name("drive_state--1"), None);
        assert_eq!(parse_drive_state_name("magazine_state-1"), None);
    }

    #[test]
    fn max_drive_scans_state_files() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path());
        assert_eq!(w.max_drive_with_state().unwrap(), None);

        fs::write(w.drive_state(2), "d,l\n").unwrap();
        fs::write(w.drive_state(0), "d,l\n").unwrap();
        fs::write(tmp.path().join("drive_state-x"), "").unwrap();
        assert_eq!(w.max_drive_with_state().unwrap(), Some(2));
    }

    #[test]
    fn oversized_drive_index_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path());
        fs::write(tmp.path().join("drive_state-99999999999"), "d,l\n").unwrap();
        fs::write(tmp.path().join("drive_state-99999999999999999999999"), "d,l\n").unwrap();
        fs::write(w.drive_state(MAX_DRIVES), "d,l\n").unwrap();
        assert_eq!(w.max_drive_with_state().unwrap(), None);

        fs::write(w.drive_state(MAX_DRIVES - 1), "d,l\n").unwrap();
        assert_eq!(w.max_drive_with_state().unwrap(), Some(MAX_DRIVES - 1));
    }

    #[test]
    fn unreadable_work_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path().join("missing"));
        assert!(w.max_drive_with_state().is_err());
        w.ensure().unwrap();
        assert_eq!(w.max_drive_with_state().unwrap(), None);
    }

    #[test]
    fn dynamic_config_round_trip() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path());
        assert_eq!(DynamicConfig::restore(&w), DynamicConfig::default());

        DynamicConfig { max_slot: 17 }.save(&w).unwrap();
        assert_eq!(DynamicConfig::restore(&w).max_slot, 17);
    }

    #[test]
    fn corrupt_dynamic_config_resets() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path());
        fs::write(w.dynamic_conf(), "max_slot = \"many\"").unwrap();
        assert_eq!(DynamicConfig::restore(&w).max_slot, 0);
    }

    #[test]
    fn huge_max_slot_resets() {
        let tmp = TempDir::new().unwrap();
        let w = WorkDir::new(tmp.path());
        fs::write(w.dynamic_conf(), "max_slot = 1000000000000\n").unwrap();
        assert_eq!(DynamicConfig::restore(&w), DynamicConfig::default());

        fs::write(w.dynamic_conf(), format!("max_slot = {MAX_SLOTS}\n")).unwrap();
        assert_eq!(DynamicConfig::restore(&w).max_slot, MAX_SLOTS);
    }

    #[test]
    fn remove_missing_state_file_is_ok() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("drive_state-9");
        assert!(!remove_state_file(&p).unwrap());
        write_state_file(&p, "x\n").unwrap();
        assert!(remove_state_file(&p).unwrap());
    }
}

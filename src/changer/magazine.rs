#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use tracing as log;

use super::{
    slots::MAX_SLOTS,
    state::{WorkDir, write_state_file},
};
use crate::error::{ChangerError, IoContext, Result};

pub const UUID_PREFIX: &str = "UUID:";
const BY_UUID_DIR: &str = "/dev/disk/by-uuid";
const MOUNT_TABLE: &str = "/proc/mounts";

/// One configured magazine bay.
#[derive(Debug, Clone)]
pub struct Magazine {
    pub bay: usize,
    /// Configured spec: a directory, or `UUID:<fs-uuid>`.
    pub device: String,
    pub mountpoint: Option<PathBuf>,
    pub volumes: Vec<String>,
    pub start_slot: Option<usize>,
    pub prev_start_slot: usize,
    pub prev_num_slots: usize,
}

impl Magazine {
    pub fn new(bay: usize, device: impl Into<String>) -> Self {
        Self {
            bay,
            device: device.into(),
            mountpoint: None,
            volumes: Vec::new(),
            start_slot: None,
            prev_start_slot: 0,
            prev_num_slots: 0,
        }
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.volumes.len()
    }

    #[inline]
    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }

    /// Previous range as `start..end`, if the bay held any slots last run.
    pub fn prev_range(&self) -> Option<std::ops::Range<usize>> {
        if self.prev_start_slot == 0 || self.prev_num_slots == 0 {
            return None;
        }
        let end = self.prev_start_slot.checked_add(self.prev_num_slots)?;
        Some(self.prev_start_slot..end)
    }

    /// Refreshes mountpoint and volume list from the filesystem.
    pub fn scan(&mut self) {
        self.mountpoint = None;
        self.volumes.clear();
        self.start_slot = None;

        let Some(dir) = resolve_mountpoint(&self.device) else {
            log::info!("[magazine] {} ({}) is not mounted", self.bay, self.device);
            return;
        };
        match list_volumes(&dir) {
            Ok(vols) => {
                log::info!(
                    "[magazine] {} has {} volumes on {}",
                    self.bay,
                    vols.len(),
                    dir.display()
                );
                self.volumes = vols;
                self.mountpoint = Some(dir);
            }
            Err(e) => {
                log::warn!("[magazine] {} cannot list {}: {e}", self.bay, dir.display());
            }
        }
    }

    /// Loads the slot range this bay held last run. A record written for a
    /// different device is ignored.
    pub fn restore(&mut self, work: &WorkDir) {
        self.prev_start_slot = 0;
        self.prev_num_slots = 0;
        let path = work.magazine_state(self.bay);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                log::error!("[magazine] cannot read {}: {e}", path.display());
                return;
            }
        };
        match parse_state_record(&raw) {
            Some((dev, start, num)) if dev == self.device => {
                self.prev_start_slot = start;
                self.prev_num_slots = num;
            }
            Some((dev, ..)) => {
                log::info!(
                    "[magazine] bay {} was {dev}, now {}; previous slots dropped",
                    self.bay,
                    self.device
                );
            }
            None => log::warn!("[magazine] ignoring corrupt {}", path.display()),
        }
    }

    /// Persists the current assignment as the next run's previous range.
    pub fn save(&self, work: &WorkDir) -> Result<()> {
        let path = work.magazine_state(self.bay);
        let start = self.start_slot.unwrap_or(0);
        let num = if start > 0 { self.num_slots() } else { 0 };
        write_state_file(&path, &format!("{},{start},{num}\n", self.device))
            .io_context(|| format!("write {}", path.display()))
    }

    pub fn volume_label(&self, index: usize) -> Option<&str> {
        self.volumes.get(index).map(String::as_str)
    }

    pub fn volume_path(&self, index: usize) -> Option<PathBuf> {
        let dir = self.mountpoint.as_ref()?;
        self.volumes.get(index).map(|v| dir.join(v))
    }

    pub fn find_volume(&self, label: &str) -> Option<usize> {
        self.volumes.iter().position(|v| v == label)
    }

    /// Creates an empty volume file. Never overwrites an existing file.
    pub fn create_volume(&mut self, label: &str) -> Result<()> {
        let Some(dir) = self.mountpoint.as_ref() else {
            return Err(ChangerError::NotFound(format!(
                "magazine {} is not mounted",
                self.bay
            )));
        };
        if label.is_empty() || label.contains(['/', '\\']) || label.starts_with('.') {
            return Err(ChangerError::InvalidArgument(format!(
                "invalid volume label '{label}'"
            )));
        }
        let path = dir.join(label);
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            opts.mode(0o640);
        }
        opts.open(&path)
            .io_context(|| format!("create volume {}", path.display()))?;
        log::info!("[magazine] created volume {}", path.display());
        self.volumes.push(label.to_string());
        Ok(())
    }
}

/// `device,start,num`. A range reaching past `MAX_SLOTS` counts as corrupt.
fn parse_state_record(raw: &str) -> Option<(&str, usize, usize)> {
    let line = raw.lines().next()?.trim();
    let mut it = line.rsplitn(3, ',');
    let num: usize = it.next()?.trim().parse().ok()?;
    let start: usize = it.next()?.trim().parse().ok()?;
    let dev = it.next()?;
    if dev.is_empty() || start.checked_add(num)? > MAX_SLOTS + 1 {
        return None;
    }
    Some((dev, start, num))
}

fn list_volumes(dir: &Path) -> io::Result<Vec<String>> {
    let mut vols = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            log::warn!(
                "[magazine] skipping non UTF-8 file name {}",
                entry.path().display()
            );
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        vols.push(name);
    }
    vols.sort();
    Ok(vols)
}

/// Maps a magazine spec onto the directory currently holding its volumes.
pub fn resolve_mountpoint(device: &str) -> Option<PathBuf> {
    if let Some(uuid) = device.strip_prefix(UUID_PREFIX) {
        let dev = fs::canonicalize(Path::new(BY_UUID_DIR).join(uuid)).ok()?;
        let table = fs::read_to_string(MOUNT_TABLE).ok()?;
        return find_mount(&table, &dev);
    }
    let dir = Path::new(device);
    if !dir.is_dir() {
        return None;
    }
    fs::canonicalize(dir).ok()
}

/// Finds the mountpoint of `device` in a `/proc/mounts`-format table.
pub fn find_mount(table: &str, device: &Path) -> Option<PathBuf> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let src = unescape_mount_field(fields.next()?);
        let target = unescape_mount_field(fields.next()?);
        let src = Path::new(&src);
        let same = src == device
            || fs::canonicalize(src)
                .map(|p| p == device)
                .unwrap_or(false);
        same.then(|| PathBuf::from(target))
    })
}

/// Decodes the `\ooo` octal escapes the kernel uses for blanks in mount paths.
fn unescape_mount_field(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let v = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(b) = u8::try_from(v) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn mag_dir(tmp: &TempDir, name: &str, vols: &[&str]) -> PathBuf {
        let dir = tmp.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        for v in vols {
            fs::write(dir.join(v), "").unwrap();
        }
        dir
    }

    #[test]
    fn scan_sorts_volumes_and_skips_noise() {
        let tmp = TempDir::new().unwrap();
        let dir = mag_dir(&tmp, "m0", &["c", "a", "b", ".hidden"]);
        fs::create_dir(dir.join("subdir")).unwrap();

        let mut m = Magazine::new(0, dir.display().to_string());
        m.scan();
        assert!(m.is_mounted());
        assert_eq!(m.volumes, vec!["a", "b", "c"]);
        assert_eq!(m.num_slots(), 3);
        assert_eq!(m.find_volume("b"), Some(1));
        assert_eq!(m.find_volume("zz"), None);
        assert_eq!(
            m.volume_path(2),
            Some(fs::canonicalize(&dir).unwrap().join("c"))
        );
        assert_eq!(m.volume_label(3), None);
    }

    #[test]
    fn missing_dir_is_unmounted() {
        let tmp = TempDir::new().unwrap();
        let mut m = Magazine::new(1, tmp.path().join("gone").display().to_string());
        m.scan();
        assert!(!m.is_mounted());
        assert_eq!(m.num_slots(), 0);
        assert_eq!(m.volume_path(0), None);
    }

    #[test]
    fn save_then_restore() {
        let tmp = TempDir::new().unwrap();
        let work = WorkDir::new(tmp.path());
        let dir = mag_dir(&tmp, "m0", &["v1", "v2"]);
        let dev = dir.display().to_string();

        let mut m = Magazine::new(0, dev.clone());
        m.scan();
        m.start_slot = Some(4);
        m.save(&work).unwrap();

        let mut again = Magazine::new(0, dev);
        again.restore(&work);
        assert_eq!((again.prev_start_slot, again.prev_num_slots), (4, 2));
        assert_eq!(again.prev_range(), Some(4..6));
    }

    #[test]
    fn unassigned_saves_empty_range() {
        let tmp = TempDir::new().unwrap();
        let work = WorkDir::new(tmp.path());
        let mut m = Magazine::new(0, "/nowhere");
        m.prev_start_slot = 3;
        m.prev_num_slots = 2;
        m.save(&work).unwrap();

        let mut again = Magazine::new(0, "/nowhere");
        again.restore(&work);
        assert_eq!(again.prev_range(), None);
    }

    #[test]
    fn restore_ignores_other_device() {
        let tmp = TempDir::new().unwrap();
        let work = WorkDir::new(tmp.path());
        fs::write(work.magazine_state(0), "/mnt/old,1,5\n").unwrap();

        let mut m = Magazine::new(0, "/mnt/new");
        m.restore(&work);
        assert_eq!(m.prev_range(), None);
    }

    #[test]
    fn restore_ignores_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let work = WorkDir::new(tmp.path());
        fs::write(work.magazine_state(0), "garbage").unwrap();

        let mut m = Magazine::new(0, "garbage");
        m.restore(&work);
        assert_eq!((m.prev_start_slot, m.prev_num_slots), (0, 0));
    }

    #[test]
    fn out_of_range_records_are_corrupt() {
        let max = usize::MAX;
        assert_eq!(parse_state_record(&format!("/mnt/a,{max},2")), None);
        assert_eq!(parse_state_record("/mnt/a,1000000000000,1"), None);
        assert_eq!(parse_state_record(&format!("/mnt/a,1,{MAX_SLOTS}")), Some(("/mnt/a", 1, MAX_SLOTS)));
        assert_eq!(parse_state_record(&format!("/mnt/a,2,{MAX_SLOTS}")), None);

        let tmp = TempDir::new().unwrap();
        let work = WorkDir::new(tmp.path());
        fs::write(work.magazine_state(0), format!("/mnt/a,{max},2\n")).unwrap();
        let mut m = Magazine::new(0, "/mnt/a");
        m.restore(&work);
        assert_eq!(m.prev_range(), None);

        m.prev_start_slot = max;
        m.prev_num_slots = 2;
        assert_eq!(m.prev_range(), None);
    }

    #[test]
    fn state_record_allows_commas_in_device() {
        assert_eq!(
            parse_state_record("/mnt/a,b,7,3\n"),
            Some(("/mnt/a,b", 7, 3))
        );
        assert_eq!(parse_state_record(",1,2"), None);
        assert_eq!(parse_state_record("/mnt,x,2"), None);
        assert_eq!(parse_state_record(""), None);
    }

    #[test]
    fn create_volume_appends_and_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let dir = mag_dir(&tmp, "m0", &["a"]);
        let mut m = Magazine::new(0, dir.display().to_string());
        m.scan();

        m.create_volume("z").unwrap();
        assert_eq!(m.volumes, vec!["a", "z"]);
        assert!(dir.join("z").is_file());

        let err = m.create_volume("a").unwrap_err();
        assert!(matches!(err, ChangerError::Io { .. }), "err was: {err}");
        let err = m.create_volume("../escape").unwrap_err();
        assert!(matches!(err, ChangerError::InvalidArgument(_)));
    }

    #[test]
    fn create_volume_on_unmounted_magazine() {
        let mut m = Magazine::new(2, "/nonexistent/vchanger-mag");
        m.scan();
        let err = m.create_volume("x").unwrap_err();
        assert!(matches!(err, ChangerError::NotFound(_)));
    }

    #[test]
    fn mount_table_lookup() {
        let table = "\
sysfs /sys sysfs rw 0 0
/dev/sdb1 /mnt/backup\\0401 ext4 rw,relatime 0 0
/dev/sdc1 /mnt/other ext4 rw 0 0
";
        assert_eq!(
            find_mount(table, Path::new("/dev/sdb1")),
            Some(PathBuf::from("/mnt/backup 1"))
        );
        assert_eq!(find_mount(table, Path::new("/dev/sdz9")), None);
    }

    #[test]
    fn unescape_leaves_plain_text() {
        assert_eq!(unescape_mount_field("/mnt/a\\011b"), "/mnt/a\tb");
        assert_eq!(unescape_mount_field("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_field("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn unknown_uuid_is_unmounted() {
        assert_eq!(resolve_mountpoint("UUID:0000-not-a-real-uuid"), None);
    }
}

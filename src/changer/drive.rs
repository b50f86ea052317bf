use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing as log;

/// Drive indices at or above this are refused.
pub const MAX_DRIVES: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drive {
    pub slot: Option<usize>,
}

impl Drive {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

/// Contents of `drive_state-N`: magazine device and loaded volume label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveRecord {
    pub device: String,
    pub label: String,
}

impl DriveRecord {
    /// `None` for anything but one `device,label` line with both fields set.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.lines().next()?.trim();
        let (device, label) = line.rsplit_once(',')?;
        let (device, label) = (device.trim(), label.trim());
        if device.is_empty() || label.is_empty() {
            return None;
        }
        Some(Self {
            device: device.to_string(),
            label: label.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("{},{}\n", self.device, self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Keep,
    Create,
    Replace,
}

pub fn reconcile(desired: &Path, existing: Option<&Path>) -> LinkAction {
    match existing {
        None => LinkAction::Create,
        Some(p) if p == desired => LinkAction::Keep,
        Some(_) => LinkAction::Replace,
    }
}

/// Makes `link` a symlink to `target`, leaving a correct one untouched.
pub fn ensure_link(link: &Path, target: &Path) -> io::Result<LinkAction> {
    let existing = read_link_opt(link)?;
    let action = reconcile(target, existing.as_deref());
    match action {
        LinkAction::Keep => {
            log::info!("[drive] found symlink {} -> {}", link.display(), target.display());
        }
        LinkAction::Replace => {
            fs::remove_file(link)?;
            symlink(target, link)?;
            log::info!("[drive] replaced symlink {} -> {}", link.display(), target.display());
        }
        LinkAction::Create => {
            symlink(target, link)?;
            log::info!("[drive] created symlink {} -> {}", link.display(), target.display());
        }
    }
    Ok(action)
}

/// Removes the drive symlink. A missing link is not an error.
pub fn remove_link(link: &Path) -> io::Result<bool> {
    match fs::remove_file(link) {
        Ok(()) => {
            log::info!("[drive] deleted symlink {}", link.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_link_opt(link: &Path) -> io::Result<Option<PathBuf>> {
    match fs::read_link(link) {
        Ok(p) => Ok(Some(p)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

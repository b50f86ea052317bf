//! Virtual autochanger state: magazines mapped onto virtual slots, and
//! virtual drives "loaded" by symlinking to a slot's volume file.
//!
//! Every invocation rebuilds the whole picture from the work directory and
//! the mounted magazines, mutates it, and persists it before releasing the
//! command lock.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing as log;

pub mod drive;
pub mod magazine;
pub mod slots;
pub mod state;

use crate::{
    config::ChangerConfig,
    error::{ChangerError, IoContext, Result},
    utils::lock::LockGuard,
};
use drive::{Drive, DriveRecord, MAX_DRIVES, ensure_link, remove_link};
use magazine::Magazine;
use slots::{SlotTable, assign_magazines};
use state::{DynamicConfig, WorkDir, remove_state_file, write_state_file};

/// Console actions owed to the backup director after this run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub update_slots: bool,
    pub label_barcodes: bool,
}

impl Pending {
    #[inline]
    pub fn any(&self) -> bool {
        self.update_slots || self.label_barcodes
    }
}

#[derive(Debug)]
pub struct Changer {
    storage_name: String,
    work: WorkDir,
    magazines: Vec<Magazine>,
    slots: SlotTable,
    drives: Vec<Drive>,
    dynamic: DynamicConfig,
    pending: Pending,
}

impl Changer {
    /// Rebuilds magazine, slot and drive state. The caller must hold the
    /// changer's command lock for as long as it uses the returned value.
    pub fn initialize(cfg: &ChangerConfig, _held: &LockGuard<'_>) -> Result<Self> {
        let work = WorkDir::new(&cfg.work_dir);
        let dynamic = DynamicConfig::restore(&work);
        let mut changer = Self {
            storage_name: cfg.storage_name.clone(),
            work,
            magazines: Vec::with_capacity(cfg.magazines.len()),
            slots: SlotTable::new(),
            drives: Vec::new(),
            dynamic,
            pending: Pending::default(),
        };
        changer.init_magazines(&cfg.magazines);
        changer.init_slots()?;
        changer.init_drives()?;
        Ok(changer)
    }

    fn init_magazines(&mut self, devices: &[String]) {
        for (bay, dev) in devices.iter().enumerate() {
            let mut mag = Magazine::new(bay, dev.clone());
            mag.restore(&self.work);
            mag.scan();
            self.magazines.push(mag);
        }
    }

    fn init_slots(&mut self) -> Result<()> {
        self.slots.ensure_len(self.dynamic.max_slot);
        if assign_magazines(&mut self.slots, &mut self.magazines) {
            self.pending.update_slots = true;
        }
        for mag in &self.magazines {
            mag.save(&self.work)?;
        }
        if self.slots.len() != self.dynamic.max_slot {
            self.dynamic.max_slot = self.slots.len();
            self.dynamic.save(&self.work)?;
        }
        Ok(())
    }

    fn init_drives(&mut self) -> Result<()> {
        let max_drive = self.work.max_drive_with_state()?.unwrap_or(0);
        self.drives = vec![Drive::default(); max_drive + 1];
        for drv in 0..=max_drive {
            self.restore_drive(drv);
        }
        Ok(())
    }

    fn restore_drive(&mut self, drv: usize) {
        let state_path = self.work.drive_state(drv);
        let raw = match fs::read_to_string(&state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Err(e) = remove_link(&self.work.drive_link(drv)) {
                    log::error!("[drive] cannot delete stale symlink for drive {drv}: {e}");
                }
                log::debug!("[drive] drive {drv} previously unloaded");
                return;
            }
            Err(e) => {
                log::error!("[drive] drive {drv} state file is not readable: {e}");
                return;
            }
        };
        let Some(record) = DriveRecord::parse(&raw) else {
            log::warn!("[drive] deleting corrupt state file for drive {drv}");
            self.discard_drive_state(drv);
            return;
        };
        let Some(slot) = self.find_slot_by_label(&record.label) else {
            log::info!(
                "[drive] volume {} no longer available, unloading drive {drv}",
                record.label
            );
            self.discard_drive_state(drv);
            return;
        };
        if let Some(other) = self.slot_drive(slot) {
            log::warn!(
                "[drive] volume {} already restored into drive {other}, unloading drive {drv}",
                record.label
            );
            self.discard_drive_state(drv);
            return;
        }
        let Some(target) = self.volume_path(slot) else {
            self.discard_drive_state(drv);
            return;
        };
        if let Err(e) = ensure_link(&self.work.drive_link(drv), &target) {
            log::error!("[drive] cannot create symlink for drive {drv}: {e}");
            return;
        }
        self.drives[drv].slot = Some(slot);
        if let Some(vs) = self.slots.get_mut(slot) {
            vs.drive = Some(drv);
        }
        log::info!(
            "[drive] drive {drv} previously loaded from slot {slot} ({})",
            record.label
        );
    }

    fn discard_drive_state(&self, drv: usize) {
        if let Err(e) = remove_state_file(&self.work.drive_state(drv)) {
            log::error!("[drive] cannot delete state file for drive {drv}: {e}");
        }
        if let Err(e) = remove_link(&self.work.drive_link(drv)) {
            log::error!("[drive] cannot delete symlink for drive {drv}: {e}");
        }
    }

    fn find_slot_by_label(&self, label: &str) -> Option<usize> {
        self.slots
            .iter()
            .find(|&(s, _)| self.volume_label(s) == Some(label))
            .map(|(s, _)| s)
    }

    fn ensure_drive(&mut self, drv: usize) -> Result<()> {
        let len = drv
            .checked_add(1)
            .filter(|&n| n <= MAX_DRIVES)
            .ok_or_else(|| {
                ChangerError::InvalidArgument(format!(
                    "invalid drive {drv}, at most {MAX_DRIVES} drives"
                ))
            })?;
        if len > self.drives.len() {
            self.drives.resize(len, Drive::default());
        }
        Ok(())
    }

    fn drive_record(&self, slot: usize) -> Option<DriveRecord> {
        let vol = self.slots.get(slot)?.volume?;
        let mag = self.magazines.get(vol.bay)?;
        Some(DriveRecord {
            device: mag.device.clone(),
            label: mag.volume_label(vol.index)?.to_string(),
        })
    }

    /// Writes the drive's state file, or deletes it when the drive is empty.
    fn save_drive_state(&self, drv: usize) -> Result<()> {
        let path = self.work.drive_state(drv);
        let Some(slot) = self.drive_slot(drv) else {
            let existed = remove_state_file(&path)
                .io_context(|| format!("delete state file for drive {drv}"))?;
            if existed {
                log::info!("[drive] deleted state file for drive {drv}");
            }
            return Ok(());
        };
        let record = self.drive_record(slot).ok_or_else(|| {
            ChangerError::NotFound(format!("slot {slot} loaded in drive {drv} has no volume"))
        })?;
        write_state_file(&path, &record.render())
            .io_context(|| format!("write state file for drive {drv}"))?;
        log::debug!("[drive] wrote state file for drive {drv}");
        Ok(())
    }

    pub fn load_drive(&mut self, drv: usize, slot: usize) -> Result<()> {
        self.ensure_drive(drv)?;
        let Some(vs) = self.slots.get(slot).copied() else {
            return Err(ChangerError::InvalidArgument(format!(
                "cannot load drive {drv} from invalid slot {slot}"
            )));
        };
        if let Some(cur) = self.drives[drv].slot {
            if cur == slot {
                return Ok(());
            }
            return Err(ChangerError::Conflict(format!(
                "drive {drv} already loaded from slot {cur}"
            )));
        }
        if let Some(other) = vs.drive {
            return Err(ChangerError::Conflict(format!(
                "requested slot {slot} already loaded in drive {other}"
            )));
        }
        if vs.is_empty() {
            return Err(ChangerError::InvalidArgument(format!(
                "cannot load drive {drv} from empty slot {slot}"
            )));
        }
        let target = self.volume_path(slot).ok_or_else(|| {
            ChangerError::NotFound(format!("volume for slot {slot} is not available"))
        })?;

        let link = self.work.drive_link(drv);
        ensure_link(&link, &target)
            .io_context(|| format!("create symlink for drive {drv}"))?;
        self.drives[drv].slot = Some(slot);
        if let Err(e) = self.save_drive_state(drv) {
            self.drives[drv].slot = None;
            if let Err(re) = remove_link(&link) {
                log::error!("[drive] cannot roll back symlink for drive {drv}: {re}");
            }
            return Err(e);
        }
        if let Some(vs) = self.slots.get_mut(slot) {
            vs.drive = Some(drv);
        }
        log::info!(
            "[drive] loaded drive {drv} from slot {slot} ({})",
            self.volume_label(slot).unwrap_or_default()
        );
        Ok(())
    }

    pub fn unload_drive(&mut self, drv: usize) -> Result<()> {
        self.ensure_drive(drv)?;
        let Some(slot) = self.drives[drv].slot else {
            return Ok(());
        };
        remove_link(&self.work.drive_link(drv))
            .io_context(|| format!("delete symlink for drive {drv}"))?;
        if let Some(vs) = self.slots.get_mut(slot) {
            vs.drive = None;
        }
        self.drives[drv].slot = None;
        self.save_drive_state(drv)?;
        log::info!("[drive] unloaded drive {drv}");
        Ok(())
    }

    /// Creates `count` empty volumes on magazine `bay`, labelled
    /// `<prefix>NNNN`. Returns the labels created.
    pub fn create_volumes(
        &mut self,
        bay: usize,
        count: usize,
        start: Option<usize>,
        label_prefix: &str,
    ) -> Result<Vec<String>> {
        let Some(mag) = self.magazines.get_mut(bay) else {
            return Err(ChangerError::InvalidArgument(format!("invalid magazine {bay}")));
        };
        let count = count.max(1);
        let prefix = match label_prefix.trim() {
            "" => format!("{}_{bay:04}_", self.storage_name),
            p => p.to_string(),
        };
        let mut next = match start {
            Some(n) => n,
            None => (1..=mag.num_slots() * 5)
                .rev()
                .find(|&i| mag.find_volume(&volume_label(&prefix, i)).is_some())
                .unwrap_or(0),
        };

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let mut label = volume_label(&prefix, next);
            while mag.find_volume(&label).is_some() {
                next += 1;
                label = volume_label(&prefix, next);
            }
            let made = mag.create_volume(&label).map(|()| created.push(label));
            if let Err(e) = made.and_then(|()| mag.save(&self.work)) {
                if !created.is_empty() {
                    self.pending.update_slots = true;
                    self.pending.label_barcodes = true;
                }
                return Err(e);
            }
            next += 1;
        }

        self.pending.update_slots = true;
        self.pending.label_barcodes = true;
        log::info!("[magazine] {} volumes added to magazine {bay}", created.len());
        Ok(created)
    }

    pub fn pending(&self) -> Pending {
        self.pending
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn work_dir(&self) -> &Path {
        self.work.root()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_drives(&self) -> usize {
        self.drives.len()
    }

    pub fn num_magazines(&self) -> usize {
        self.magazines.len()
    }

    pub fn volume_label(&self, slot: usize) -> Option<&str> {
        let vol = self.slots.get(slot)?.volume?;
        self.magazines.get(vol.bay)?.volume_label(vol.index)
    }

    pub fn volume_path(&self, slot: usize) -> Option<PathBuf> {
        let vol = self.slots.get(slot)?.volume?;
        self.magazines.get(vol.bay)?.volume_path(vol.index)
    }

    pub fn magazine_empty(&self, bay: usize) -> bool {
        self.magazines.get(bay).is_none_or(|m| !m.is_mounted())
    }

    pub fn slot_empty(&self, slot: usize) -> bool {
        self.slots.get(slot).is_none_or(|s| s.is_empty())
    }

    pub fn drive_empty(&self, drv: usize) -> bool {
        self.drives.get(drv).is_none_or(|d| d.is_empty())
    }

    pub fn drive_slot(&self, drv: usize) -> Option<usize> {
        self.drives.get(drv)?.slot
    }

    pub fn slot_drive(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot)?.drive
    }

    pub fn magazine_slots(&self, bay: usize) -> usize {
        self.magazines.get(bay).map_or(0, Magazine::num_slots)
    }

    pub fn magazine_start_slot(&self, bay: usize) -> Option<usize> {
        self.magazines.get(bay)?.start_slot
    }

    pub fn magazine_mountpoint(&self, bay: usize) -> Option<&Path> {
        self.magazines.get(bay)?.mountpoint.as_deref()
    }
}

fn volume_label(prefix: &str, n: usize) -> String {
    format!("{prefix}{n:04}")
}

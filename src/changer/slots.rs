use std::ops::Range;

use tracing as log;

use super::magazine::Magazine;

/// Highest slot number a persisted record may name.
pub const MAX_SLOTS: usize = 100_000;

/// Location of a volume: magazine bay plus index within that magazine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRef {
    pub bay: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualSlot {
    pub volume: Option<VolumeRef>,
    pub drive: Option<usize>,
}

impl VirtualSlot {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.volume.is_none()
    }
}

/// Virtual slots indexed from 1. Index 0 is a permanent, never-mapped
/// sentinel so slot numbers can be used directly as indices.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<VirtualSlot>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: vec![VirtualSlot::default()],
        }
    }

    /// Number of addressable slots (the highest slot number).
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the table so `last` is addressable. Never shrinks.
    pub fn ensure_len(&mut self, last: usize) {
        if last > self.len() {
            self.slots.resize(last + 1, VirtualSlot::default());
        }
    }

    pub fn get(&self, slot: usize) -> Option<&VirtualSlot> {
        if slot == 0 {
            return None;
        }
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut VirtualSlot> {
        if slot == 0 {
            return None;
        }
        self.slots.get_mut(slot)
    }

    /// Slot numbers `1..=len` with their descriptors.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &VirtualSlot)> {
        self.slots.iter().enumerate().skip(1)
    }

    /// True when every slot of `range` exists and is unmapped.
    pub fn range_free(&self, range: Range<usize>) -> bool {
        range.start > 0
            && range.end <= self.slots.len()
            && self.slots[range].iter().all(VirtualSlot::is_empty)
    }

    /// First run of `count` unmapped slots, scanning from slot 1 and growing
    /// the table when the trailing gap is too short. Returns its first slot.
    pub fn find_free_range(&mut self, count: usize) -> usize {
        let mut start = 1;
        let mut found = 0;
        for n in 1..self.slots.len() {
            if found == count {
                break;
            }
            if self.slots[n].is_empty() {
                if found == 0 {
                    start = n;
                }
                found += 1;
            } else {
                found = 0;
            }
        }
        if found == 0 {
            start = self.slots.len();
        }
        self.ensure_len(start + count - 1);
        start
    }

    /// Maps `count` volumes of `bay` onto slots starting at `start`.
    pub fn assign(&mut self, bay: usize, start: usize, count: usize) {
        self.ensure_len(start + count - 1);
        for index in 0..count {
            self.slots[start + index].volume = Some(VolumeRef { bay, index });
        }
    }
}

/// Places every mounted magazine's volumes into the table, preferring each
/// bay's previous range. Returns true when the slot-to-volume mapping
/// differs from the previous run.
pub fn assign_magazines(table: &mut SlotTable, magazines: &mut [Magazine]) -> bool {
    let mut changed = false;

    for mag in magazines.iter_mut() {
        let prev = mag.prev_range();
        if let Some(ref r) = prev {
            table.ensure_len(r.end - 1);
        }
        if !mag.is_mounted() {
            if let Some(r) = prev {
                log::warn!(
                    "[slots] update slots needed. magazine {} no longer mounted; previous: {} volumes in slots {}-{}",
                    mag.bay,
                    r.len(),
                    r.start,
                    r.end - 1
                );
                changed = true;
            }
            continue;
        }
        if mag.num_slots() != mag.prev_num_slots {
            log::warn!(
                "[slots] update slots needed. magazine {} has {} volumes, previously had {}",
                mag.bay,
                mag.num_slots(),
                mag.prev_num_slots
            );
            changed = true;
            continue;
        }
        if mag.num_slots() == 0 {
            continue;
        }
        let Some(r) = prev else {
            changed = true;
            continue;
        };
        if !table.range_free(r.clone()) {
            log::warn!(
                "[slots] update slots needed. magazine {} previous slots {}-{} are not available",
                mag.bay,
                r.start,
                r.end - 1
            );
            changed = true;
            continue;
        }
        table.assign(mag.bay, r.start, mag.num_slots());
        mag.start_slot = Some(r.start);
        log_assigned(mag);
    }

    for mag in magazines.iter_mut() {
        if !mag.is_mounted() || mag.start_slot.is_some() || mag.num_slots() == 0 {
            continue;
        }
        let start = table.find_free_range(mag.num_slots());
        table.assign(mag.bay, start, mag.num_slots());
        mag.start_slot = Some(start);
        log_assigned(mag);
    }

    changed
}

fn log_assigned(mag: &Magazine) {
    if let Some(start) = mag.start_slot {
        log::info!(
            "[slots] {} volumes on magazine {} assigned slots {}-{}",
            mag.num_slots(),
            mag.bay,
            start,
            start + mag.num_slots() - 1
        );
    }
}

use std::io::Write;

use anyhow::Result;

use crate::changer::Changer;

/// One line per slot; a loaded slot still shows its label.
pub fn list(ch: &Changer, out: &mut dyn Write) -> Result<()> {
    for slot in 1..=ch.num_slots() {
        match ch.volume_label(slot) {
            Some(label) => writeln!(out, "{slot}:{label}")?,
            None => writeln!(out, "{slot}:")?,
        }
    }
    Ok(())
}

pub fn slots(ch: &Changer, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{}", ch.num_slots())?;
    Ok(())
}

pub fn listall(ch: &Changer, out: &mut dyn Write) -> Result<()> {
    for drv in 0..ch.num_drives() {
        match ch.drive_slot(drv) {
            Some(slot) => writeln!(
                out,
                "D:{drv}:F:{slot}:{}",
                ch.volume_label(slot).unwrap_or_default()
            )?,
            None => writeln!(out, "D:{drv}:E")?,
        }
    }
    for slot in 1..=ch.num_slots() {
        match ch.volume_label(slot) {
            Some(label) if ch.slot_drive(slot).is_none() => writeln!(out, "S:{slot}:F:{label}")?,
            _ => writeln!(out, "S:{slot}:E")?,
        }
    }
    Ok(())
}

pub fn listmags(ch: &Changer, out: &mut dyn Write) -> Result<()> {
    if ch.num_magazines() == 0 {
        writeln!(out, "No magazines are defined")?;
        return Ok(());
    }
    for bay in 0..ch.num_magazines() {
        match ch.magazine_mountpoint(bay) {
            Some(mnt) => writeln!(
                out,
                "{bay}:{}:{}:{}",
                ch.magazine_slots(bay),
                ch.magazine_start_slot(bay).unwrap_or(0),
                mnt.display()
            )?,
            None => writeln!(out, "{bay}:::")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::changer::tests::Fixture;

    fn render(ch: &Changer, f: fn(&Changer, &mut dyn Write) -> Result<()>) -> String {
        let mut buf = Vec::new();
        f(ch, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn listmags_shows_mounted_and_unmounted() {
        let fx = Fixture::new(&["m0", "m1"], &["m0"]);
        fx.add_volumes("m0", &["V1", "V2", "V3"]);
        let ch = fx.open();
        let mnt = fs::canonicalize(fx.mag_dir("m0")).unwrap();
        assert_eq!(
            render(&ch, listmags),
            format!("0:3:1:{}\n1:::\n", mnt.display())
        );
    }

    #[test]
    fn listmags_without_magazines() {
        let fx = Fixture::new(&[], &[]);
        let ch = fx.open();
        assert_eq!(render(&ch, listmags), "No magazines are defined\n");
    }

    #[test]
    fn list_and_listall_mark_loaded_and_empty_slots() {
        let fx = Fixture::new(&["m0", "m1"], &["m0", "m1"]);
        fx.add_volumes("m0", &["A1"]);
        fx.add_volumes("m1", &["B1", "B2"]);
        fx.open();
        fs::remove_file(fx.mag_dir("m0").join("A1")).unwrap();
        let mut ch = fx.open();
        ch.load_drive(0, 3).unwrap();

        assert_eq!(render(&ch, slots), "3\n");
        assert_eq!(render(&ch, list), "1:\n2:B1\n3:B2\n");
        assert_eq!(
            render(&ch, listall),
            "D:0:F:3:B2\nS:1:E\nS:2:F:B1\nS:3:E\n"
        );
    }
}

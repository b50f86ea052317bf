use std::io::Write;

use anyhow::Result;
use clap::Args;
use tracing as log;

use crate::{changer::Changer, error::ChangerError};

#[derive(Args, Debug)]
pub struct CreateVolsArgs {
    /// Magazine bay index.
    pub bay: usize,
    /// Number of volume files to create.
    pub count: usize,
    /// First label number; negative or absent continues after existing labels.
    #[arg(allow_negative_numbers = true)]
    pub start: Option<i64>,

    /// Label prefix. Defaults to `<storage_name>_<bay>_`.
    #[arg(short = 'l', long)]
    pub label: Option<String>,

    /// Pool for 'label barcodes'. Defaults to the configured default pool.
    #[arg(long)]
    pub pool: Option<String>,
}

impl CreateVolsArgs {
    pub fn run(&self, changer: &mut Changer, out: &mut dyn Write) -> Result<()> {
        if self.count == 0 {
            return Err(ChangerError::InvalidArgument("invalid volume count 0".into()).into());
        }
        let start = self.start.and_then(|s| usize::try_from(s).ok());
        let created = changer.create_volumes(
            self.bay,
            self.count,
            start,
            self.label.as_deref().unwrap_or_default(),
        )?;
        for label in &created {
            writeln!(out, "creating label '{label}'")?;
        }
        writeln!(
            out,
            "Created {} volume files on magazine {}",
            created.len(),
            self.bay
        )?;
        log::info!("[command] createvols created {} on bay {}", created.len(), self.bay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changer::tests::Fixture;

    fn args(bay: usize, count: usize, start: Option<i64>, label: Option<&str>) -> CreateVolsArgs {
        CreateVolsArgs {
            bay,
            count,
            start,
            label: label.map(str::to_string),
            pool: None,
        }
    }

    #[test]
    fn prints_each_label_then_summary() {
        let fx = Fixture::new(&["m0"], &["m0"]);
        fx.add_volumes("m0", &["X_0001", "X_0002", "X_0003", "X_0004"]);
        let mut ch = fx.open();

        let mut buf = Vec::new();
        args(0, 2, None, Some("X_")).run(&mut ch, &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "creating label 'X_0005'\ncreating label 'X_0006'\nCreated 2 volume files on magazine 0\n"
        );
        assert!(ch.pending().update_slots && ch.pending().label_barcodes);
    }

    #[test]
    fn negative_start_means_auto() {
        let fx = Fixture::new(&["m0"], &["m0"]);
        fx.add_volumes("m0", &["t0003"]);
        let mut ch = fx.open();

        let mut buf = Vec::new();
        args(0, 1, Some(-1), Some("t")).run(&mut ch, &mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("creating label 't0004'"));
    }

    #[test]
    fn zero_count_is_rejected() {
        let fx = Fixture::new(&["m0"], &["m0"]);
        let mut ch = fx.open();
        let mut buf = Vec::new();
        assert!(args(0, 0, None, None).run(&mut ch, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}

use std::io::Write;

use anyhow::Result;
use clap::Args;

use crate::{changer::Changer, error::ChangerError};

#[derive(Args, Debug)]
pub struct DriveArgs {
    /// Virtual slot (ignored by `loaded`).
    pub slot: usize,
    /// Archive device path as Bacula knows it.
    pub device: String,
    /// Virtual drive index.
    pub drive: usize,

    #[arg(hide = true, num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

impl DriveArgs {
    fn checked_slot(&self) -> Result<usize, ChangerError> {
        if self.slot < 1 {
            return Err(ChangerError::InvalidArgument(format!(
                "invalid slot number {}",
                self.slot
            )));
        }
        Ok(self.slot)
    }

    pub fn load(&self, changer: &mut Changer) -> Result<()> {
        let slot = self.checked_slot()?;
        changer.load_drive(self.drive, slot)?;
        Ok(())
    }

    pub fn unload(&self, changer: &mut Changer) -> Result<()> {
        self.checked_slot()?;
        changer.unload_drive(self.drive)?;
        Ok(())
    }

    pub fn loaded(&self, changer: &Changer, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "{}", changer.drive_slot(self.drive).unwrap_or(0))?;
        Ok(())
    }
}

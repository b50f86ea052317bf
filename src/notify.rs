//! Tells the backup director about slot changes and new volumes through its
//! console program.

use std::{path::PathBuf, time::Duration};

use tracing as log;

use crate::{
    changer::Pending,
    config::Config,
    error::{ChangerError, Result},
    utils::{
        bins::which,
        lock::{LockGuard, NamedMutex, Wait},
        process::{CmdSpec, ProcessRunner, Runner},
    },
};

pub const COMMAND_LOCK_WAIT: Duration = Duration::from_secs(300);
const CONSOLE_READY_WAIT: Duration = Duration::from_secs(30);

pub trait Notifier {
    fn is_configured(&self) -> bool;
    fn notify(&self, pending: Pending);
}

/// Runs the console handshake around `notifier`.
///
/// The command lock is released for the duration of the call, since the
/// console may start new instances of this program that need it. A console
/// lock already held elsewhere means we are such an instance, and nothing is
/// sent. Returns the re-acquired command lock, or `None` when it could not be
/// taken back within `relock_wait`; the command itself has finished by then.
pub fn notify_console<'a>(
    notifier: &dyn Notifier,
    pending: Pending,
    command: &'a NamedMutex,
    held: LockGuard<'a>,
    console: &NamedMutex,
    relock_wait: Duration,
) -> Result<Option<LockGuard<'a>>> {
    if !pending.any() {
        return Ok(Some(held));
    }
    if !notifier.is_configured() {
        if pending.update_slots {
            log::warn!("[console] no console configured; 'update slots' needed");
        }
        if pending.label_barcodes {
            log::warn!("[console] no console configured; 'label barcodes' needed");
        }
        return Ok(Some(held));
    }

    let console_held = match console.acquire(Wait::NoWait) {
        Ok(g) => g,
        Err(ChangerError::Timeout(_)) => {
            log::debug!("[console] invoked from console session, skipping notification");
            return Ok(Some(held));
        }
        Err(e) => return Err(e),
    };

    log::debug!("[console] holding {}, releasing {}", console_held.name(), held.name());
    held.release();
    notifier.notify(pending);
    let held = match command.acquire(Wait::For(relock_wait)) {
        Ok(g) => Some(g),
        Err(e) => {
            log::warn!("[console] cannot re-acquire {}: {e}", command.name());
            None
        }
    };
    console_held.release();
    Ok(held)
}

/// Console client for the Bacula director.
pub struct Bconsole<R: Runner = ProcessRunner> {
    runner: R,
    program: Option<PathBuf>,
    config: Option<PathBuf>,
    storage: String,
    pool: String,
}

impl Bconsole<ProcessRunner> {
    pub fn from_config(cfg: &Config, pool: &str) -> Self {
        Self::with_runner(ProcessRunner::new(), cfg, pool)
    }
}

impl<R: Runner> Bconsole<R> {
    pub fn with_runner(runner: R, cfg: &Config, pool: &str) -> Self {
        Self {
            runner,
            program: cfg.bconsole.program.clone(),
            config: cfg.bconsole.config.clone(),
            storage: cfg.changer.storage_name.clone(),
            pool: pool.to_string(),
        }
    }

    fn command(&self) -> Option<CmdSpec> {
        let configured = self.program.as_deref()?;
        let Some(program) = which(configured) else {
            log::warn!("[console] {} not found or not executable", configured.display());
            return None;
        };
        let mut spec = CmdSpec::new(program);
        if let Some(c) = &self.config {
            spec = spec.arg("-c").arg(c.display().to_string());
        }
        Some(spec.args(["-n", "-u", "30"]))
    }

    fn send(&self, spec: &CmdSpec, what: &str, input: &str) {
        match self.runner.run_with_input(spec, input, CONSOLE_READY_WAIT) {
            Ok(out) => {
                log::debug!("[console] output:\n{}", out.trim_end());
                log::info!("[console] {what} command success");
            }
            Err(e) => log::warn!("[console] '{what}' needed: {e:#}"),
        }
    }

    pub fn update_slots_input(&self) -> String {
        format!("update slots storage=\"{}\" drive=\"0\"\n", self.storage)
    }

    pub fn label_barcodes_input(&self) -> String {
        format!(
            "label storage=\"{}\" pool=\"{}\" barcodes\nyes\nyes\n\n",
            self.storage, self.pool
        )
    }
}

impl<R: Runner> Notifier for Bconsole<R> {
    fn is_configured(&self) -> bool {
        self.program.is_some()
    }

    fn notify(&self, pending: Pending) {
        let Some(spec) = self.command() else {
            return;
        };
        if pending.update_slots {
            self.send(&spec, "update slots", &self.update_slots_input());
        }
        if pending.label_barcodes {
            self.send(&spec, "label barcodes", &self.label_barcodes_input());
        }
    }
}

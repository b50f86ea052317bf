//! One invocation: lock, load state, run a command, notify, unlock.

use std::time::Duration;

use anyhow::Result;
use tracing as log;

use crate::{
    changer::{Changer, Pending, state::WorkDir},
    config::{ChangerConfig, Config},
    notify::{COMMAND_LOCK_WAIT, Notifier, notify_console},
    utils::lock::{LockGuard, NamedMutex, Wait},
};

pub fn command_lock_name(storage: &str) -> String {
    format!("{storage}-command")
}

pub fn console_lock_name(storage: &str) -> String {
    format!("{storage}-bconsole")
}

/// Runs `f` against freshly initialized changer state while holding the
/// changer's command lock, then tells the console about any changes.
/// `force_update` asks for 'update slots' even when nothing changed.
///
/// Changes are reported even when `f` fails, since state is persisted as it
/// is made; the command's error is returned afterwards.
pub fn execute<F>(cfg: &Config, notifier: &dyn Notifier, force_update: bool, f: F) -> Result<()>
where
    F: FnOnce(&mut Changer) -> Result<()>,
{
    run(cfg, notifier, force_update, COMMAND_LOCK_WAIT, f)
}

fn run<F>(
    cfg: &Config,
    notifier: &dyn Notifier,
    force_update: bool,
    relock_wait: Duration,
    f: F,
) -> Result<()>
where
    F: FnOnce(&mut Changer) -> Result<()>,
{
    let c = &cfg.changer;
    WorkDir::new(&c.work_dir).ensure()?;

    let command = NamedMutex::create(&c.lock_dir, &command_lock_name(&c.storage_name))?;
    let held = command.acquire(Wait::For(COMMAND_LOCK_WAIT))?;

    log::debug!("[session] holding {}", command.path().display());

    let mut changer = Changer::initialize(c, &held)?;
    log::debug!(
        "[session] {} ready: {} slots, {} drives in {}",
        changer.storage_name(),
        changer.num_slots(),
        changer.num_drives(),
        changer.work_dir().display()
    );
    let outcome = f(&mut changer);

    let mut pending = changer.pending();
    pending.update_slots |= force_update;
    if !pending.any() {
        return outcome;
    }
    log::debug!("[session] pending {pending:?}");

    let reported = report(notifier, pending, &command, held, c, relock_wait);
    command.destroy();
    match outcome {
        Ok(()) => reported,
        Err(e) => {
            if let Err(r) = reported {
                log::warn!("[session] {r:#}");
            }
            Err(e)
        }
    }
}

fn report(
    notifier: &dyn Notifier,
    pending: Pending,
    command: &NamedMutex,
    held: LockGuard<'_>,
    c: &ChangerConfig,
    relock_wait: Duration,
) -> Result<()> {
    let console = NamedMutex::create(&c.lock_dir, &console_lock_name(&c.storage_name))?;
    if let Some(held) = notify_console(notifier, pending, command, held, &console, relock_wait)? {
        held.release();
    }
    console.destroy();
    Ok(())
}

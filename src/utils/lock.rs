#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use tracing as log;

use crate::error::{ChangerError, IoContext, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `NamedMutex::acquire` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Indefinitely,
    NoWait,
    For(Duration),
}

/// Cross-process mutex backed by an exclusive flock on `<dir>/<name>.lock`.
///
/// Every `create` opens its own file description, so two handles for the same
/// name exclude each other even inside one process.
pub struct NamedMutex {
    file: File,
    path: PathBuf,
    name: String,
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Held lock. Dropping it releases the mutex.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    mutex: &'a NamedMutex,
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.mutex.name)
            .finish()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.mutex.file);
        log::trace!("[lock] released {}", self.mutex.name);
    }
}

impl LockGuard<'_> {
    pub fn release(self) {
        drop(self);
    }

    pub fn name(&self) -> &str {
        &self.mutex.name
    }
}

impl NamedMutex {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(lock_file_name(name));
        ensure_parent_dir(&path)?;
        let file = open_lockfile(&path)?;
        Ok(Self {
            file,
            path,
            name: name.to_string(),
        })
    }

    pub fn acquire(&self, wait: Wait) -> Result<LockGuard<'_>> {
        match wait {
            Wait::Indefinitely => {
                self.file
                    .lock_exclusive()
                    .io_context(|| format!("flock {}", self.path.display()))?;
            }
            Wait::NoWait => {
                if !self.try_once()? {
                    return Err(ChangerError::Timeout(format!(
                        "lock {} is held by another process",
                        self.name
                    )));
                }
            }
            Wait::For(limit) => {
                let deadline = Instant::now() + limit;
                while !self.try_once()? {
                    if Instant::now() >= deadline {
                        return Err(ChangerError::Timeout(format!(
                            "waiting {}s for lock {}",
                            limit.as_secs(),
                            self.name
                        )));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
        log::trace!("[lock] acquired {}", self.name);
        Ok(LockGuard { mutex: self })
    }

    /// Releases any hold and closes the handle. The lock file itself stays in
    /// place: unlinking it would let a waiter that already opened it lock an
    /// orphaned inode while a newcomer locks a fresh one.
    pub fn destroy(self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn try_once(&self) -> Result<bool> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
            Err(e) => Err(ChangerError::io(format!("flock {}", self.path.display()), e)),
        }
    }
}

/// `/var/lock` when writable, else the system temp dir.
pub fn default_lock_dir() -> PathBuf {
    let var_lock = PathBuf::from("/var/lock");
    if can_use_dir(&var_lock) {
        var_lock
    } else {
        std::env::temp_dir()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.exists()
    {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut b = fs::DirBuilder::new();
            b.recursive(true)
                .mode(0o755)
                .create(dir)
                .io_context(|| format!("create lock dir {}", dir.display()))?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(dir).io_context(|| format!("create lock dir {}", dir.display()))?;
        }
    }
    Ok(())
}

fn open_lockfile(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        opts.mode(0o660);
    }
    opts.open(path)
        .io_context(|| format!("open lockfile {}", path.display()))
}

fn can_use_dir(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let test = dir.join(".vchanger_lock_test");
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&test)
    {
        Ok(_) => {
            let _ = fs::remove_file(test);
            true
        }
        Err(_) => false,
    }
}

fn lock_file_name(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
        .collect();
    let filtered = filtered.trim_start_matches('.');

    if filtered.is_empty() {
        "vchanger.lock".to_string()
    } else {
        format!("vchanger-{filtered}.lock")
    }
}

use crate::bus::RegisterAddress;
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::HashMap,
    fmt::Display,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

pub const DEFAULT_LOCK_DIR: &str = "/var/lock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
// longer waits are clamped so the deadline stays representable
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const SPINWAIT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, PartialEq, Clone)]
pub enum LockError {
    Timeout(RegisterAddress, Duration),
    Io(String),
}

impl Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            LockError::Timeout(address, timeout) => format!(
                "timed out after {:?} waiting for exclusive access to {}",
                timeout, address
            ),
            LockError::Io(msg) => format!("lock I/O error: {}", msg),
        })
    }
}

// threads queue on the in-process mutex, processes on flock of the lock file
pub struct DeviceLock {
    address: RegisterAddress,
    path: PathBuf,
    local: Mutex<()>,
}

// field order matters: the file lock is released before the mutex
pub struct DeviceLockGuard<'a> {
    _flock: Flock<File>,
    _local: MutexGuard<'a, ()>,
}

impl DeviceLock {
    fn new(address: RegisterAddress, path: PathBuf) -> Self {
        DeviceLock {
            address,
            path,
            local: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self, timeout: Duration) -> Result<DeviceLockGuard<'_>, LockError> {
        let timeout = timeout.min(MAX_LOCK_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let local = match self.local.try_lock_until(deadline) {
            Some(guard) => guard,
            None => return Err(LockError::Timeout(self.address, timeout)),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LockError::Io(format!("failed to create {:?}: {}", parent, e)))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| LockError::Io(format!("failed to open {:?}: {}", self.path, e)))?;

        let mut waited = false;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    if waited {
                        debug!("{}: acquired lock after waiting on another process", self.address);
                    }

                    return Ok(DeviceLockGuard {
                        _flock: flock,
                        _local: local,
                    });
                }
                Err((f, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                    file = f;
                }
                Err((_, errno)) => {
                    return Err(LockError::Io(format!("failed to lock {:?}: {}", self.path, errno)));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{}: lock {:?} is still held by another process", self.address, self.path);
                return Err(LockError::Timeout(self.address, timeout));
            }

            waited = true;
            thread::sleep(SPINWAIT_INTERVAL.min(deadline - now));
        }
    }
}

pub struct LockRegistry {
    dir: PathBuf,
    locks: Mutex<HashMap<RegisterAddress, Arc<DeviceLock>>>,
}

impl LockRegistry {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        LockRegistry {
            dir: dir.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, address: &RegisterAddress) -> Arc<DeviceLock> {
        let mut locks = self.locks.lock();
        locks
            .entry(*address)
            .or_insert_with(|| {
                let path = self.dir.join(format!("{}.lock", address.resource_name()));
                Arc::new(DeviceLock::new(*address, path))
            })
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Exclusive per-channel ownership across processes.
//!
//! The daemon and the calibrator both take an advisory `flock` on
//! `<lock_dir>/<device>_<pwm>.lock` before touching a channel. The lock is
//! released when the [`ChannelLock`] is dropped or the process dies.

use crate::error::LockError;
use crate::hwmon::PwmRef;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Default directory for channel lock files.
pub const DEFAULT_LOCK_DIR: &str = "/run/fanctl";

pub struct ChannelLock {
    pwm: PwmRef,
    path: PathBuf,
    _lock: Flock<File>,
}

impl ChannelLock {
    /// Take the lock for `pwm` without blocking.
    pub fn acquire(dir: &Path, pwm: &PwmRef) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(format!("{}.lock", pwm.as_str().replace('/', "_")));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                log::debug!("Locked {pwm} ({})", path.display());
                Ok(Self {
                    pwm: pwm.clone(),
                    path,
                    _lock: lock,
                })
            }
            Err((_, Errno::EAGAIN)) => Err(LockError::Busy {
                pwm: pwm.to_string(),
                path,
            }),
            Err((_, errno)) => Err(LockError::Io {
                path,
                source: errno.into(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ChannelLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLock")
            .field("pwm", &self.pwm)
            .field("path", &self.path)
            .finish()
    }
}

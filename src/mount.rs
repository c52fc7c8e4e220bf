//! FunctionFS mount lifecycle.
//!
//! Each FunctionFS function needs its endpoint filesystem mounted before
//! `ep0` can be opened. The mount manager creates the mount point, mounts
//! or remounts the instance, waits for the kernel to expose `ep0` and
//! unmounts again on teardown when it owns the mount.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use nix::errno::Errno;

use crate::{
    error::{Error, Result},
    os,
};

/// Settle delay after mounting, giving the kernel time to populate the
/// endpoint files.
const MOUNT_DELAY: Duration = Duration::from_millis(50);

/// Upper bound on waiting for `ep0` to appear after a mount.
const EP0_WAIT: Duration = Duration::from_secs(1);

/// Retries of a plain unmount before falling back to a lazy detach.
const UMOUNT_RETRIES: u32 = 5;
const UMOUNT_BACKOFF: Duration = Duration::from_millis(20);

/// Mount options passed to the kernel as comma-separated data.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Keep endpoint files usable across disconnects.
    pub no_disconnect: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub rmode: Option<u32>,
    pub fmode: Option<u32>,
    pub mode: Option<u32>,
}

impl MountOptions {
    fn to_mount_data(&self) -> Option<String> {
        let mut opts = Vec::new();
        if self.no_disconnect {
            opts.push("no_disconnect=1".to_string());
        }
        if let Some(v) = self.uid {
            opts.push(format!("uid={v}"));
        }
        if let Some(v) = self.gid {
            opts.push(format!("gid={v}"));
        }
        if let Some(v) = self.rmode {
            opts.push(format!("rmode={v:o}"));
        }
        if let Some(v) = self.fmode {
            opts.push(format!("fmode={v:o}"));
        }
        if let Some(v) = self.mode {
            opts.push(format!("mode={v:o}"));
        }
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(","))
        }
    }
}

/// An ensured FunctionFS mount. Unmounts on drop when this manager
/// performed the mount itself.
#[derive(Debug)]
pub struct FfsMount {
    source: String,
    target: PathBuf,
    cleanup_on_close: bool,
    mounted: bool,
}

impl FfsMount {
    /// Make sure a FunctionFS instance named `source` is mounted at
    /// `target`, creating the mount point if needed. If endpoint files are
    /// already present the filesystem is remounted so the kernel recreates
    /// them, and ownership of the mount stays with whoever created it.
    pub fn ensure(source: &str, target: &Path, options: &MountOptions) -> Result<FfsMount> {
        std::fs::create_dir_all(target).map_err(|err| {
            Error::Environment(format!(
                "cannot create mount point {}: {err}",
                target.display()
            ))
        })?;

        let data = options.to_mount_data();
        let already_mounted = target.join("ep0").exists();
        let cleanup_on_close = if already_mounted {
            log::debug!("functionfs already mounted at {}, remounting", target.display());
            os::remount_functionfs(source, target, data.as_deref())
                .map_err(|err| classify_mount_error(err, source))?;
            std::thread::sleep(MOUNT_DELAY);
            false
        } else {
            log::debug!("mounting functionfs {source} at {}", target.display());
            os::mount_functionfs(source, target, data.as_deref())
                .map_err(|err| classify_mount_error(err, source))?;
            std::thread::sleep(MOUNT_DELAY);
            wait_for_ep0(target)?;
            true
        };

        Ok(FfsMount {
            source: source.to_string(),
            target: target.to_path_buf(),
            cleanup_on_close,
            mounted: true,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Path of the control endpoint file.
    pub fn ep0_path(&self) -> PathBuf {
        self.target.join("ep0")
    }

    /// Path of the data endpoint file with kernel index `index` (1-based).
    pub fn ep_path(&self, index: usize) -> PathBuf {
        self.target.join(format!("ep{index}"))
    }

    /// Unmount if this manager owns the mount. Never raises; a mount that
    /// refuses to go away is detached lazily and finally surrendered.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        if !self.cleanup_on_close {
            log::debug!(
                "leaving functionfs at {} mounted, not owned by us",
                self.target.display()
            );
            return;
        }

        for attempt in 0..UMOUNT_RETRIES {
            match os::umount(&self.target, false) {
                Ok(()) => return,
                Err(Errno::EBUSY) => {
                    log::debug!(
                        "functionfs at {} busy, retry {}",
                        self.target.display(),
                        attempt + 1
                    );
                    std::thread::sleep(UMOUNT_BACKOFF);
                }
                Err(errno) => {
                    log::warn!("unmount of {} failed: {errno}", self.target.display());
                    break;
                }
            }
        }

        match os::umount(&self.target, true) {
            Ok(()) => log::debug!("lazily detached functionfs at {}", self.target.display()),
            Err(errno) => log::warn!(
                "giving up unmounting functionfs at {}: {errno}",
                self.target.display()
            ),
        }
    }
}

impl Drop for FfsMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn wait_for_ep0(target: &Path) -> Result<()> {
    let ep0 = target.join("ep0");
    let deadline = Instant::now() + EP0_WAIT;
    while Instant::now() < deadline {
        if ep0.exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Err(Error::Environment(format!(
        "ep0 did not appear under {} within {:?}",
        target.display(),
        EP0_WAIT
    )))
}

fn classify_mount_error(err: Error, source: &str) -> Error {
    match err.errno() {
        Some(Errno::EPERM) => {
            Error::Environment("mounting functionfs needs CAP_SYS_ADMIN".into())
        }
        Some(Errno::ENODEV) => {
            Error::Environment("FunctionFS is not available in this kernel".into())
        }
        Some(Errno::ENOENT) => Error::Environment(format!(
            "FunctionFS instance {source} is not registered in configfs"
        )),
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_data_formatting() {
        let opts = MountOptions::default();
        assert_eq!(opts.to_mount_data(), None);

        let opts = MountOptions {
            no_disconnect: true,
            uid: Some(1000),
            gid: None,
            rmode: Some(0o770),
            fmode: None,
            mode: None,
        };
        assert_eq!(
            opts.to_mount_data().unwrap(),
            "no_disconnect=1,uid=1000,rmode=770"
        );
    }

    #[test]
    fn mount_errors_are_classified() {
        let eperm = classify_mount_error(Error::os("mount functionfs", Errno::EPERM), "g1");
        assert!(eperm.to_string().contains("CAP_SYS_ADMIN"));

        let enodev = classify_mount_error(Error::os("mount functionfs", Errno::ENODEV), "g1");
        assert!(enodev.to_string().contains("not available"));

        let enoent = classify_mount_error(Error::os("mount functionfs", Errno::ENOENT), "g1");
        assert!(enoent.to_string().contains("g1"));

        let ebusy = classify_mount_error(Error::os("mount functionfs", Errno::EBUSY), "g1");
        assert_eq!(ebusy.errno(), Some(Errno::EBUSY));
    }

    #[test]
    fn ep0_wait_times_out_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(wait_for_ep0(dir.path()).is_err());
    }

    #[test]
    fn ep0_wait_returns_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ep0"), b"").unwrap();
        assert!(wait_for_ep0(dir.path()).is_ok());
    }
}

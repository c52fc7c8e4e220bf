//! Low-level OS adapter: FunctionFS ioctls, mount wrappers and errno-mapped
//! file I/O shared by the endpoint and mount layers.

pub mod aio;

use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::Path,
    time::Duration,
};

use nix::{
    errno::Errno,
    ioctl_none, ioctl_read, ioctl_write_ptr,
    mount::{MntFlags, MsFlags},
};

use crate::error::{Error, Result};

/// Filesystem type of the per-function endpoint filesystem.
pub const FUNCTIONFS_FSTYPE: &str = "functionfs";

// FunctionFS ioctls, 'g' ioctl group (include/uapi/linux/usb/functionfs.h).
ioctl_none!(ffs_fifo_status, 'g', 1);
ioctl_none!(ffs_fifo_flush, 'g', 2);
ioctl_none!(ffs_clear_halt, 'g', 3);
ioctl_none!(ffs_endpoint_revmap, 'g', 129);
ioctl_read!(ffs_endpoint_desc, 'g', 130, [u8; 9]);

/// DMABUF transfer request for `ffs_dmabuf_transfer`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmabufTransferReq {
    pub fd: RawFd,
    pub flags: u32,
    pub length: u64,
}

ioctl_write_ptr!(ffs_dmabuf_attach, 'g', 131, RawFd);
ioctl_write_ptr!(ffs_dmabuf_detach, 'g', 132, RawFd);
ioctl_write_ptr!(ffs_dmabuf_transfer, 'g', 133, DmabufTransferReq);

/// Mount a FunctionFS instance at `target`.
///
/// `source` is the instance name as registered in configfs, i.e. the part
/// after `ffs.` in the function directory name.
pub fn mount_functionfs(source: &str, target: &Path, data: Option<&str>) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        Some(FUNCTIONFS_FSTYPE),
        MsFlags::empty(),
        data,
    )
    .map_err(|errno| Error::os("mount functionfs", errno))
}

/// Remount the FunctionFS instance already mounted at `target`.
pub fn remount_functionfs(source: &str, target: &Path, data: Option<&str>) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        Some(FUNCTIONFS_FSTYPE),
        MsFlags::MS_REMOUNT,
        data,
    )
    .map_err(|errno| Error::os("remount functionfs", errno))
}

/// Unmount `target`. With `lazy` the mount is detached even while busy.
pub fn umount(target: &Path, lazy: bool) -> std::result::Result<(), Errno> {
    let flags = if lazy { MntFlags::MNT_DETACH } else { MntFlags::empty() };
    nix::mount::umount2(target, flags)
}

/// One `write` system call, with the errno decoded.
pub(crate) fn write_fd(fd: BorrowedFd, buf: &[u8]) -> std::result::Result<usize, Errno> {
    let ret = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) };
    Errno::result(ret).map(|n| n as usize)
}

/// One `read` system call, with the errno decoded.
pub(crate) fn read_fd(fd: BorrowedFd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
    let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
    Errno::result(ret).map(|n| n as usize)
}

/// Write the whole buffer, retrying `EINTR` and, when `retry_again` is set,
/// sleeping briefly on `EAGAIN`. Used for EP0 where the kernel applies
/// backpressure during enumeration.
pub(crate) fn write_all<F: AsFd>(
    fd: F,
    buf: &[u8],
    retry_again: bool,
    op: &'static str,
) -> Result<usize> {
    let fd = fd.as_fd();
    let mut written = 0;
    while written < buf.len() {
        match write_fd(fd, &buf[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) if retry_again => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(errno) => return Err(Error::os(op, errno)),
        }
    }
    Ok(written)
}

/// Read into `buf`, mapping `EAGAIN` to an empty read.
pub(crate) fn read_nonblock(fd: BorrowedFd, buf: &mut [u8], op: &'static str) -> Result<usize> {
    loop {
        match read_fd(fd, buf) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(0),
            Err(errno) => return Err(Error::os(op, errno)),
        }
    }
}

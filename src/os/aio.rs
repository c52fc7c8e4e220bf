//! Linux AIO binding used by the asynchronous endpoint readers and writers.
//!
//! No crate wraps the raw `io_setup`/`io_submit`/`io_getevents`/`io_destroy`
//! interface, so the kernel ABI is declared here and invoked through
//! `libc::syscall`.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    os::fd::{AsRawFd, BorrowedFd},
    ptr::NonNull,
    time::Duration,
};

use nix::errno::Errno;

use crate::error::{Error, Result};

/// `IOCB_CMD_PREAD` opcode.
pub const IOCB_CMD_PREAD: u16 = 0;
/// `IOCB_CMD_PWRITE` opcode.
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel `struct iocb` (include/uapi/linux/aio_abi.h).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    #[cfg(target_endian = "little")]
    pub aio_rw_flags: u32,
    #[cfg(target_endian = "big")]
    pub aio_rw_flags: u32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    /// Build a read or write request against `fd`, tagged with `data` so the
    /// completion can be matched back to its slot.
    pub fn transfer(opcode: u16, fd: BorrowedFd, buf: *mut u8, len: usize, data: u64) -> Self {
        Iocb {
            aio_data: data,
            aio_lio_opcode: opcode,
            aio_fildes: fd.as_raw_fd() as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            ..Default::default()
        }
    }
}

/// Kernel `struct io_event`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    /// The errno of a failed request, if the result encodes one.
    pub fn error(&self) -> Option<Errno> {
        if self.res < 0 {
            Some(Errno::from_raw(-self.res as i32))
        } else {
            None
        }
    }
}

/// Owned kernel AIO context. Destroyed on drop.
#[derive(Debug)]
pub struct AioContext {
    ctx: libc::c_ulong,
}

// The context handle is only a kernel identifier.
unsafe impl Send for AioContext {}

impl AioContext {
    /// Create a context able to hold `nr_events` concurrent requests.
    pub fn new(nr_events: u32) -> Result<Self> {
        let mut ctx: libc::c_ulong = 0;
        let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr_events, &mut ctx) };
        if ret < 0 {
            return Err(Error::os("io_setup", Errno::last()));
        }
        Ok(AioContext { ctx })
    }

    /// Submit a single request.
    pub fn submit(&self, iocb: &mut Iocb) -> Result<()> {
        let mut ptrs = [iocb as *mut Iocb];
        let ret = unsafe { libc::syscall(libc::SYS_io_submit, self.ctx, 1i64, ptrs.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::os("io_submit", Errno::last()));
        }
        if ret != 1 {
            return Err(Error::os("io_submit", Errno::EAGAIN));
        }
        Ok(())
    }

    /// Reap up to `events.len()` completions, waiting for at least `min`
    /// of them or until `timeout` elapses. Returns the number reaped.
    pub fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let mut ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_mut()
            .map(|t| t as *mut libc::timespec)
            .unwrap_or(std::ptr::null_mut());
        loop {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min as i64,
                    events.len() as i64,
                    events.as_mut_ptr(),
                    ts_ptr,
                )
            };
            if ret < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                return Err(Error::os("io_getevents", errno));
            }
            return Ok(ret as usize);
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if ret < 0 {
            log::debug!("io_destroy failed: {}", Errno::last());
        }
    }
}

/// Page-aligned buffer handed to the kernel for AIO transfers.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `len` bytes aligned to the page size.
    pub fn new(len: usize) -> Self {
        let align = page_size();
        let layout = Layout::from_size_align(len.max(1), align).expect("buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("aligned allocation failed");
        AlignedBuf { ptr, layout }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        4096
    } else {
        ret as usize
    }
}

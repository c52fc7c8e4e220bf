//! Asynchronous OUT-endpoint reader.
//!
//! [`AioReader`] owns a thread that keeps a fixed window of
//! `IOCB_CMD_PREAD` requests in flight against the endpoint and broadcasts
//! completed buffers to every subscriber. Read failures are handled by a
//! transfer-type-specific policy: isochronous timing hiccups become empty
//! packets, aborted bulk and interrupt transfers are dropped silently, and
//! everything else is surfaced in-band. End of file ends the stream.

use std::{
    os::fd::{AsFd, OwnedFd},
    sync::{
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

use nix::errno::Errno;

use crate::{
    error::{Error, Result},
    os::aio::{AioContext, AlignedBuf, IoEvent, Iocb, IOCB_CMD_PREAD},
    usb::TransferType,
};

enum ReaderMsg {
    Subscribe(Sender<Result<Vec<u8>>>),
}

/// A subscription to an OUT endpoint's broadcast byte stream. Delivers
/// buffers in completion order; ends when the endpoint is closed or the
/// host stops the stream.
#[derive(Debug)]
pub struct ByteStream {
    rx: Receiver<Result<Vec<u8>>>,
}

impl ByteStream {
    pub fn recv(&self) -> Option<Result<Vec<u8>>> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Result<Vec<u8>>> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<Vec<u8>>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Iterator for ByteStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Handle to the reader thread of one OUT endpoint.
#[derive(Debug)]
pub(crate) struct AioReader {
    ctl: Sender<ReaderMsg>,
}

impl AioReader {
    pub(crate) fn spawn(
        fd: Arc<OwnedFd>,
        buffer_size: usize,
        num_buffers: usize,
        transfer: TransferType,
    ) -> Result<AioReader> {
        let ctx = AioContext::new(num_buffers as u32)?;
        let (ctl_tx, ctl_rx) = channel();
        thread::Builder::new()
            .name("usb-ep-reader".into())
            .spawn(move || {
                let mut engine = ReadEngine::new(ctx, fd, buffer_size, num_buffers, transfer, ctl_rx);
                engine.run();
            })
            .map_err(|err| Error::Environment(format!("cannot spawn AIO reader: {err}")))?;
        Ok(AioReader { ctl: ctl_tx })
    }

    pub(crate) fn subscribe(&self) -> Result<ByteStream> {
        let (tx, rx) = channel();
        self.ctl
            .send(ReaderMsg::Subscribe(tx))
            .map_err(|_| Error::InvalidState("async reader stopped".into()))?;
        Ok(ByteStream { rx })
    }
}

struct ReadEngine {
    ctx: AioContext,
    fd: Arc<OwnedFd>,
    buffers: Vec<AlignedBuf>,
    pending_submit: Vec<usize>,
    inflight: usize,
    transfer: TransferType,
    ctl: Receiver<ReaderMsg>,
    subscribers: Vec<Sender<Result<Vec<u8>>>>,
    detached: bool,
}

impl ReadEngine {
    fn new(
        ctx: AioContext,
        fd: Arc<OwnedFd>,
        buffer_size: usize,
        num_buffers: usize,
        transfer: TransferType,
        ctl: Receiver<ReaderMsg>,
    ) -> Self {
        ReadEngine {
            ctx,
            fd,
            buffers: (0..num_buffers).map(|_| AlignedBuf::new(buffer_size)).collect(),
            pending_submit: (0..num_buffers).collect(),
            inflight: 0,
            transfer,
            ctl,
            subscribers: Vec::new(),
            detached: false,
        }
    }

    fn run(&mut self) {
        log::debug!("AIO reader started ({:?})", self.transfer);
        loop {
            self.drain_control();
            if self.detached {
                break;
            }
            if self.subscribers.is_empty() && self.inflight == 0 {
                // Wait for the first subscriber before touching the
                // endpoint.
                match self.ctl.recv() {
                    Ok(ReaderMsg::Subscribe(tx)) => {
                        self.subscribers.push(tx);
                        continue;
                    }
                    Err(_) => break,
                }
            }
            self.submit_pending();
            if !self.reap() {
                break;
            }
        }
        log::debug!("AIO reader stopped");
    }

    fn drain_control(&mut self) {
        loop {
            match self.ctl.try_recv() {
                Ok(ReaderMsg::Subscribe(tx)) => self.subscribers.push(tx),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Owner endpoint dropped; stop producing.
                    self.detached = true;
                    break;
                }
            }
        }
    }

    fn submit_pending(&mut self) {
        while let Some(slot) = self.pending_submit.pop() {
            let len = self.buffers[slot].len();
            let mut iocb = Iocb::transfer(
                IOCB_CMD_PREAD,
                self.fd.as_fd(),
                self.buffers[slot].as_mut_ptr(),
                len,
                slot as u64,
            );
            match self.ctx.submit(&mut iocb) {
                Ok(()) => self.inflight += 1,
                Err(err) => {
                    log::debug!("AIO read submission failed: {err}");
                    self.broadcast_error(&err);
                    self.pending_submit.push(slot);
                    // Avoid a hot loop when submissions keep failing.
                    thread::sleep(Duration::from_millis(10));
                    return;
                }
            }
        }
    }

    /// Reap completions. Returns false when the stream must terminate.
    fn reap(&mut self) -> bool {
        if self.inflight == 0 {
            return true;
        }
        let mut events = [IoEvent::default(); 16];
        let reaped = match self
            .ctx
            .get_events(1, &mut events, Some(Duration::from_millis(100)))
        {
            Ok(n) => n,
            Err(err) => {
                self.broadcast_error(&err);
                return true;
            }
        };
        for event in &events[..reaped] {
            self.inflight -= 1;
            let slot = event.data as usize;
            match event.error() {
                None if event.res == 0 => {
                    log::debug!("OUT endpoint reached end of stream");
                    return false;
                }
                None => {
                    let data = self.buffers[slot].as_slice()[..event.res as usize].to_vec();
                    self.subscribers.retain(|tx| tx.send(Ok(data.clone())).is_ok());
                }
                Some(errno) => {
                    if !self.handle_read_error(errno) {
                        return false;
                    }
                }
            }
            self.pending_submit.push(slot);
        }
        true
    }

    /// Apply the per-transfer-type error policy. Returns false when the
    /// error is terminal.
    fn handle_read_error(&mut self, errno: Errno) -> bool {
        match (self.transfer, errno) {
            // Isochronous timing hiccup: deliver an empty packet.
            (TransferType::Isochronous, Errno::EIO)
            | (TransferType::Isochronous, Errno::ETIMEDOUT) => {
                self.subscribers.retain(|tx| tx.send(Ok(Vec::new())).is_ok());
                true
            }
            // Host aborted pending bulk or interrupt transfers.
            (TransferType::Bulk, Errno::EPIPE) | (TransferType::Interrupt, Errno::EPIPE) => {
                log::debug!("dropping aborted {:?} read", self.transfer);
                true
            }
            (_, Errno::EBADF) | (_, Errno::ESHUTDOWN) => {
                log::debug!("OUT endpoint closed ({errno}), ending stream");
                false
            }
            (_, errno) => {
                self.broadcast_error(&Error::os("aio read", errno));
                true
            }
        }
    }

    fn broadcast_error(&mut self, err: &Error) {
        let msg = err.to_string();
        self.subscribers
            .retain(|tx| tx.send(Err(Error::Protocol(msg.clone()))).is_ok());
    }
}

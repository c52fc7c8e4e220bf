//! Asynchronous IN-endpoint writer.
//!
//! [`AioWriter`] owns a thread that drives a Linux AIO context: queued
//! write requests are copied into page-aligned buffers and submitted as
//! `IOCB_CMD_PWRITE`, keeping up to the configured number of requests in
//! flight. Completions answer the per-request channels handed back to the
//! caller. Dropping the writer stops the thread after the queue drains.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::{AsFd, OwnedFd},
    sync::{
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    os::aio::{AioContext, AlignedBuf, IoEvent, Iocb, IOCB_CMD_PWRITE},
};

enum WriterMsg {
    Write {
        data: Vec<u8>,
        done: Sender<Result<usize>>,
    },
    Flush {
        done: Sender<Result<()>>,
    },
}

/// Completion handle of one `write_async` call: one channel per submitted
/// chunk, answered in submission order.
#[derive(Debug)]
pub struct WriteCompletion {
    parts: Vec<Receiver<Result<usize>>>,
}

impl WriteCompletion {
    /// Block until every chunk has completed and return the total byte
    /// count, or the first error.
    pub fn wait(self) -> Result<usize> {
        let mut total = 0;
        for part in self.parts {
            let result = part
                .recv()
                .map_err(|_| Error::InvalidState("async writer stopped".into()))?;
            total += result?;
        }
        Ok(total)
    }

    /// Whether every chunk has already completed, without blocking.
    pub fn is_done(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Handle to the writer thread of one IN endpoint.
#[derive(Debug)]
pub(crate) struct AioWriter {
    tx: Sender<WriterMsg>,
    buffer_size: usize,
}

impl AioWriter {
    pub(crate) fn spawn(
        fd: Arc<OwnedFd>,
        buffer_size: usize,
        num_buffers: usize,
    ) -> Result<AioWriter> {
        let buffer_size = buffer_size.max(1);
        let num_buffers = num_buffers.max(1);
        let ctx = AioContext::new(num_buffers as u32)?;
        let (tx, rx) = channel();
        thread::Builder::new()
            .name("usb-ep-writer".into())
            .spawn(move || {
                let mut engine = WriteEngine::new(ctx, fd, buffer_size, num_buffers, rx);
                engine.run();
            })
            .map_err(|err| Error::Environment(format!("cannot spawn AIO writer: {err}")))?;
        Ok(AioWriter { tx, buffer_size })
    }

    /// Queue `data`, chunked to the writer's buffer size.
    pub(crate) fn submit(&self, data: &[u8]) -> Result<WriteCompletion> {
        let mut parts = Vec::new();
        for chunk in data.chunks(self.buffer_size) {
            let (done_tx, done_rx) = channel();
            self.tx
                .send(WriterMsg::Write {
                    data: chunk.to_vec(),
                    done: done_tx,
                })
                .map_err(|_| Error::InvalidState("async writer stopped".into()))?;
            parts.push(done_rx);
        }
        Ok(WriteCompletion { parts })
    }

    /// Block until the queue and all in-flight requests have drained.
    pub(crate) fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = channel();
        self.tx
            .send(WriterMsg::Flush { done: done_tx })
            .map_err(|_| Error::InvalidState("async writer stopped".into()))?;
        done_rx
            .recv()
            .map_err(|_| Error::InvalidState("async writer stopped".into()))?
    }
}

struct Inflight {
    slot: usize,
    len: usize,
    done: Sender<Result<usize>>,
}

struct WriteEngine {
    ctx: AioContext,
    fd: Arc<OwnedFd>,
    buffers: Vec<AlignedBuf>,
    free: Vec<usize>,
    queue: VecDeque<(Vec<u8>, Sender<Result<usize>>)>,
    inflight: HashMap<u64, Inflight>,
    flushes: Vec<Sender<Result<()>>>,
    rx: Receiver<WriterMsg>,
    open: bool,
}

impl WriteEngine {
    fn new(
        ctx: AioContext,
        fd: Arc<OwnedFd>,
        buffer_size: usize,
        num_buffers: usize,
        rx: Receiver<WriterMsg>,
    ) -> Self {
        WriteEngine {
            ctx,
            fd,
            buffers: (0..num_buffers).map(|_| AlignedBuf::new(buffer_size)).collect(),
            free: (0..num_buffers).collect(),
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            flushes: Vec::new(),
            rx,
            open: true,
        }
    }

    fn run(&mut self) {
        log::debug!("AIO writer started");
        while self.open || !self.queue.is_empty() || !self.inflight.is_empty() {
            self.submit_ready();
            self.reap();
            self.answer_flushes();
            self.receive();
        }
        self.answer_flushes();
        log::debug!("AIO writer stopped");
    }

    fn submit_ready(&mut self) {
        while !self.queue.is_empty() && !self.free.is_empty() {
            let (data, done) = self.queue.pop_front().expect("queue entry");
            let slot = self.free.pop().expect("free slot");
            let len = data.len();
            self.buffers[slot].as_mut_slice()[..len].copy_from_slice(&data);

            let mut iocb = Iocb::transfer(
                IOCB_CMD_PWRITE,
                self.fd.as_fd(),
                self.buffers[slot].as_mut_ptr(),
                len,
                slot as u64,
            );
            match self.ctx.submit(&mut iocb) {
                Ok(()) => {
                    self.inflight.insert(slot as u64, Inflight { slot, len, done });
                }
                Err(err) => {
                    log::debug!("AIO write submission failed: {err}");
                    let _ = done.send(Err(err));
                    self.free.push(slot);
                }
            }
        }
    }

    fn reap(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        let mut events = [IoEvent::default(); 16];
        let reaped = match self
            .ctx
            .get_events(1, &mut events, Some(Duration::from_millis(10)))
        {
            Ok(n) => n,
            Err(err) => {
                log::debug!("AIO write reap failed: {err}");
                return;
            }
        };
        for event in &events[..reaped] {
            let Some(entry) = self.inflight.remove(&event.data) else {
                continue;
            };
            let result = match event.error() {
                Some(errno) => Err(Error::os("aio write", errno)),
                None if (event.res as usize) != entry.len => Err(Error::Protocol(format!(
                    "short write: {} of {} bytes",
                    event.res, entry.len
                ))),
                None => Ok(entry.len),
            };
            let _ = entry.done.send(result);
            self.free.push(entry.slot);
        }
    }

    fn answer_flushes(&mut self) {
        if self.queue.is_empty() && self.inflight.is_empty() {
            for done in self.flushes.drain(..) {
                let _ = done.send(Ok(()));
            }
        }
    }

    fn receive(&mut self) {
        if !self.open {
            return;
        }
        // Block only when idle; otherwise just drain what is pending.
        if self.queue.is_empty() && self.inflight.is_empty() {
            match self.rx.recv() {
                Ok(msg) => self.handle(msg),
                Err(_) => {
                    self.open = false;
                    return;
                }
            }
        }
        loop {
            match self.rx.try_recv() {
                Ok(msg) => self.handle(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.open = false;
                    break;
                }
            }
        }
    }

    fn handle(&mut self, msg: WriterMsg) {
        match msg {
            WriterMsg::Write { data, done } => {
                if data.is_empty() {
                    let _ = done.send(Ok(0));
                } else {
                    self.queue.push_back((data, done));
                }
            }
            WriterMsg::Flush { done } => {
                if self.queue.is_empty() && self.inflight.is_empty() {
                    let _ = done.send(Ok(()));
                } else {
                    self.flushes.push(done);
                }
            }
        }
    }
}

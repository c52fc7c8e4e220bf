//! Endpoint files of a mounted FunctionFS instance.
//!
//! The control endpoint (`ep0`) carries the descriptor blobs, control-plane
//! events and setup data phases. Data endpoints (`ep1`, `ep2`, ...) carry
//! the function's traffic: synchronous writes on IN endpoints, and
//! asynchronous bulk I/O through dedicated reader and writer threads that
//! drive Linux AIO and talk to the application purely by message.

mod reader;
mod writer;

pub use reader::ByteStream;
pub use writer::WriteCompletion;

use std::{
    fs::OpenOptions,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use nix::errno::Errno;

use crate::{
    error::{Error, Result},
    ffs::{self, Event},
    os,
    usb::{EndpointAddress, EndpointConfig, TransferType},
};

/// Default polling interval of the EP0 event stream.
pub const DEFAULT_EVENT_POLL: Duration = Duration::from_millis(100);

/// Maximum events decoded per EP0 read.
const EVENTS_PER_READ: usize = 4;

/// Default chunk size of the asynchronous IN writer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default number of concurrent requests of the asynchronous IN writer.
pub const DEFAULT_WRITE_BUFFERS: usize = 4;

fn open_endpoint(path: &Path, read: bool, write: bool, nonblock: bool) -> Result<Arc<OwnedFd>> {
    let mut options = OpenOptions::new();
    options.read(read).write(write);
    if nonblock {
        options.custom_flags(libc::O_NONBLOCK);
    }
    let file = options.open(path).map_err(|err| {
        Error::Environment(format!("cannot open endpoint {}: {err}", path.display()))
    })?;
    Ok(Arc::new(OwnedFd::from(file)))
}

/// The control endpoint of a FunctionFS function, opened read-write and
/// non-blocking.
#[derive(Debug)]
pub struct ControlEndpoint {
    fd: Arc<OwnedFd>,
    path: PathBuf,
}

impl ControlEndpoint {
    pub fn open(path: &Path) -> Result<Self> {
        let fd = open_endpoint(path, true, true, true)?;
        log::debug!("opened control endpoint {}", path.display());
        Ok(ControlEndpoint {
            fd,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole buffer, riding out `EAGAIN` backpressure from the
    /// kernel.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        os::write_all(&*self.fd, data, true, "write ep0")
    }

    /// Non-blocking read of up to `len` bytes. Returns an empty buffer when
    /// no data is pending. A zero `len` acknowledges an OUT control
    /// transfer.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = os::read_nonblock(self.fd.as_fd(), &mut buf, "read ep0")?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Acknowledge an OUT control transfer with a zero-length read.
    pub fn ack(&self) -> Result<()> {
        self.read_zero("ack ep0")
    }

    /// Stall the current control transfer. FunctionFS maps a zero-length
    /// read to a STALL handshake.
    pub fn halt(&self) -> Result<()> {
        log::debug!("stalling ep0");
        self.read_zero("stall ep0")
    }

    fn read_zero(&self, op: &'static str) -> Result<()> {
        match os::read_fd(self.fd.as_fd(), &mut []) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
            Err(errno) => Err(Error::os(op, errno)),
        }
    }

    /// Bytes pending in the endpoint FIFO.
    pub fn fifo_status(&self) -> Result<u32> {
        let ret = unsafe { os::ffs_fifo_status(self.fd.as_raw_fd()) }
            .map_err(|errno| Error::os("FUNCTIONFS_FIFO_STATUS", errno))?;
        Ok(ret as u32)
    }

    /// Discard any data pending in the endpoint FIFO.
    pub fn flush_fifo(&self) -> Result<()> {
        unsafe { os::ffs_fifo_flush(self.fd.as_raw_fd()) }
            .map_err(|errno| Error::os("FUNCTIONFS_FIFO_FLUSH", errno))?;
        Ok(())
    }

    /// Start the event poller for this endpoint. The returned listener
    /// hands out broadcast [`EventStream`]s; the poller stops once the
    /// endpoint is closed.
    pub fn listener(&self, poll: Duration) -> Result<EventListener> {
        let (ctl_tx, ctl_rx) = channel();
        let fd = Arc::downgrade(&self.fd);
        thread::Builder::new()
            .name("usb-ep0-events".into())
            .spawn(move || event_poller(fd, poll, ctl_rx))
            .map_err(|err| Error::Environment(format!("cannot spawn event poller: {err}")))?;
        Ok(EventListener { ctl: ctl_tx })
    }
}

enum ListenerMsg {
    Subscribe(Sender<Result<Event>>),
}

/// Handle to a running EP0 event poller.
#[derive(Debug, Clone)]
pub struct EventListener {
    ctl: Sender<ListenerMsg>,
}

impl EventListener {
    /// Subscribe to the broadcast event stream.
    pub fn subscribe(&self) -> Result<EventStream> {
        let (tx, rx) = channel();
        self.ctl
            .send(ListenerMsg::Subscribe(tx))
            .map_err(|_| Error::InvalidState("event poller has stopped".into()))?;
        Ok(EventStream { rx })
    }
}

/// A subscription to the EP0 event stream. Ends when the endpoint is
/// closed; decode failures are delivered in-band as errors.
#[derive(Debug)]
pub struct EventStream {
    pub(crate) rx: Receiver<Result<Event>>,
}

impl EventStream {
    pub fn recv(&self) -> Option<Result<Event>> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Result<Event>> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<Event>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Iterator for EventStream {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

fn event_poller(fd: Weak<OwnedFd>, poll: Duration, ctl: Receiver<ListenerMsg>) {
    log::debug!("ep0 event poller started");
    let mut subscribers: Vec<Sender<Result<Event>>> = Vec::new();
    let mut detached = false;

    loop {
        loop {
            match ctl.try_recv() {
                Ok(ListenerMsg::Subscribe(tx)) => subscribers.push(tx),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    detached = true;
                    break;
                }
            }
        }
        if subscribers.is_empty() {
            if detached {
                break;
            }
            // Do not consume events nobody is listening for yet.
            match ctl.recv() {
                Ok(ListenerMsg::Subscribe(tx)) => {
                    subscribers.push(tx);
                    continue;
                }
                Err(_) => break,
            }
        }

        let Some(fd) = fd.upgrade() else {
            log::debug!("ep0 closed, stopping event poller");
            break;
        };

        let mut buf = [0u8; EVENTS_PER_READ * Event::SIZE];
        match os::read_fd(fd.as_fd(), &mut buf) {
            Ok(0) => {}
            Ok(n) => match ffs::parse_events(&buf[..n]) {
                Ok(events) => {
                    for event in events {
                        log::debug!("ep0 event: {event:?}");
                        subscribers.retain(|tx| tx.send(Ok(event)).is_ok());
                    }
                }
                Err(err) => {
                    let msg = err.to_string();
                    subscribers.retain(|tx| tx.send(Err(Error::Protocol(msg.clone()))).is_ok());
                }
            },
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(Errno::EBADF) => {
                log::debug!("ep0 file descriptor revoked, stopping event poller");
                break;
            }
            Err(errno) => {
                let msg = Error::os("read ep0 events", errno).to_string();
                subscribers.retain(|tx| tx.send(Err(Error::Protocol(msg.clone()))).is_ok());
            }
        }
        drop(fd);

        thread::sleep(poll);
    }
    log::debug!("ep0 event poller stopped");
}

/// An IN (device to host) data endpoint.
#[derive(Debug)]
pub struct InEndpoint {
    fd: Arc<OwnedFd>,
    path: PathBuf,
    address: EndpointAddress,
    config: EndpointConfig,
    halted: AtomicBool,
    writer: Mutex<Option<writer::AioWriter>>,
}

impl InEndpoint {
    pub fn open(path: &Path, address: EndpointAddress, config: EndpointConfig) -> Result<Self> {
        let fd = open_endpoint(path, false, true, false)?;
        log::debug!("opened IN endpoint {} at {}", address.to_byte(), path.display());
        Ok(InEndpoint {
            fd,
            path: path.to_path_buf(),
            address,
            config,
            halted: AtomicBool::new(false),
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Synchronous write; blocks until the host has collected the data.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        os::write_all(&*self.fd, data, false, "write endpoint")
    }

    /// Queue `data` on the asynchronous writer, splitting it into chunks of
    /// the writer's buffer size. The writer is created on first use; later
    /// calls keep the original geometry.
    pub fn write_async(&self, data: &[u8]) -> Result<WriteCompletion> {
        self.write_async_with(data, DEFAULT_WRITE_BUFFER_SIZE, DEFAULT_WRITE_BUFFERS)
    }

    /// As [`write_async`](Self::write_async) with explicit geometry. The
    /// geometry only takes effect on the call that creates the writer.
    pub fn write_async_with(
        &self,
        data: &[u8],
        buffer_size: usize,
        num_buffers: usize,
    ) -> Result<WriteCompletion> {
        let mut writer = self.writer.lock().expect("writer lock");
        if writer.is_none() {
            *writer = Some(writer::AioWriter::spawn(
                self.fd.clone(),
                buffer_size,
                num_buffers,
            )?);
        }
        writer.as_ref().expect("writer present").submit(data)
    }

    /// Wait until every queued asynchronous write has completed.
    pub fn flush(&self) -> Result<()> {
        let writer = self.writer.lock().expect("writer lock");
        match writer.as_ref() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Signal a STALL on this endpoint by writing zero bytes.
    pub fn halt(&self) -> Result<()> {
        match os::write_fd(self.fd.as_fd(), &[]) {
            Ok(_) => {
                self.halted.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(errno) => Err(Error::os("halt endpoint", errno)),
        }
    }

    /// Clear a halt condition via `FUNCTIONFS_CLEAR_HALT`.
    pub fn clear_halt(&self) -> Result<()> {
        unsafe { os::ffs_clear_halt(self.fd.as_raw_fd()) }
            .map_err(|errno| Error::os("FUNCTIONFS_CLEAR_HALT", errno))?;
        self.halted.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// An OUT (host to device) data endpoint.
#[derive(Debug)]
pub struct OutEndpoint {
    fd: Arc<OwnedFd>,
    path: PathBuf,
    address: EndpointAddress,
    config: EndpointConfig,
    reader: Mutex<Option<reader::AioReader>>,
}

impl OutEndpoint {
    pub fn open(path: &Path, address: EndpointAddress, config: EndpointConfig) -> Result<Self> {
        let fd = open_endpoint(path, true, false, false)?;
        log::debug!("opened OUT endpoint {} at {}", address.to_byte(), path.display());
        Ok(OutEndpoint {
            fd,
            path: path.to_path_buf(),
            address,
            config,
            reader: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Read up to `len` bytes; empty when the host has not sent anything.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = os::read_nonblock(self.fd.as_fd(), &mut buf, "read endpoint")?;
        buf.truncate(n);
        Ok(buf)
    }

    /// The host controls OUT data flow; a device-side halt is not possible.
    pub fn halt(&self) -> Result<()> {
        Err(Error::Unsupported("OUT endpoints cannot be halted"))
    }

    pub fn clear_halt(&self) -> Result<()> {
        unsafe { os::ffs_clear_halt(self.fd.as_raw_fd()) }
            .map_err(|errno| Error::os("FUNCTIONFS_CLEAR_HALT", errno))?;
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        false
    }

    /// Subscribe to the broadcast byte stream fed by the AIO reader. The
    /// reader is created on first use with `num_buffers` concurrent
    /// requests and a buffer size chosen by transfer type; its geometry is
    /// immutable afterwards.
    pub fn stream(&self, num_buffers: usize) -> Result<ByteStream> {
        let mut reader = self.reader.lock().expect("reader lock");
        if reader.is_none() {
            let buffer_size = read_buffer_size(&self.config);
            *reader = Some(reader::AioReader::spawn(
                self.fd.clone(),
                buffer_size,
                num_buffers.max(1),
                self.config.transfer_type,
            )?);
        }
        reader.as_ref().expect("reader present").subscribe()
    }
}

/// Buffer size of the AIO reader: the endpoint's declared packet size, or
/// a transfer-type default.
fn read_buffer_size(config: &EndpointConfig) -> usize {
    if let Some(size) = config.max_packet_size {
        return usize::from(size & 0x07FF).max(1);
    }
    match config.transfer_type {
        TransferType::Bulk => 16 * 1024,
        TransferType::Interrupt => 64,
        TransferType::Isochronous => 1024,
        TransferType::Control => 64,
    }
}

/// A data endpoint of either direction, as stored in the function's
/// endpoint table.
#[derive(Debug, Clone)]
pub enum DataEndpoint {
    In(Arc<InEndpoint>),
    Out(Arc<OutEndpoint>),
}

impl DataEndpoint {
    pub fn address(&self) -> EndpointAddress {
        match self {
            DataEndpoint::In(ep) => ep.address(),
            DataEndpoint::Out(ep) => ep.address(),
        }
    }

    pub fn halt(&self) -> Result<()> {
        match self {
            DataEndpoint::In(ep) => ep.halt(),
            DataEndpoint::Out(ep) => ep.halt(),
        }
    }

    pub fn clear_halt(&self) -> Result<()> {
        match self {
            DataEndpoint::In(ep) => ep.clear_halt(),
            DataEndpoint::Out(ep) => ep.clear_halt(),
        }
    }

    pub fn is_halted(&self) -> bool {
        match self {
            DataEndpoint::In(ep) => ep.is_halted(),
            DataEndpoint::Out(ep) => ep.is_halted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::Direction;
    use std::io::Write;

    fn write_tempfile(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn control_endpoint_reads_and_writes_plain_files() {
        let file = write_tempfile(b"abcdef");
        let ep0 = ControlEndpoint::open(file.path()).unwrap();
        let data = ep0.read(4).unwrap();
        assert_eq!(data, b"abcd");
        // Regular files have no FunctionFS ioctls.
        assert!(ep0.fifo_status().is_err());
    }

    #[test]
    fn event_stream_delivers_and_terminates() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&Event::Enable.to_bytes());
        raw.extend_from_slice(&Event::Suspend.to_bytes());
        let file = write_tempfile(&raw);

        let ep0 = ControlEndpoint::open(file.path()).unwrap();
        let listener = ep0.listener(Duration::from_millis(5)).unwrap();
        let stream = listener.subscribe().unwrap();

        assert!(matches!(
            stream.recv_timeout(Duration::from_secs(2)),
            Some(Ok(Event::Enable))
        ));
        assert!(matches!(
            stream.recv_timeout(Duration::from_secs(2)),
            Some(Ok(Event::Suspend))
        ));

        // Closing the endpoint ends the stream without surfacing errors.
        drop(ep0);
        drop(listener);
        let next = stream.recv_timeout(Duration::from_secs(2));
        assert!(next.is_none(), "stream should end cleanly, got {next:?}");
    }

    #[test]
    fn broadcast_reaches_multiple_subscribers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&Event::Bind.to_bytes());
        let file = write_tempfile(&raw);

        let ep0 = ControlEndpoint::open(file.path()).unwrap();
        let listener = ep0.listener(Duration::from_millis(5)).unwrap();
        let a = listener.subscribe().unwrap();
        let b = listener.subscribe().unwrap();

        // Both subscribers existed before the first poll finds the event
        // only if subscription wins the race; accept either subscriber
        // missing the initial event but not both.
        let got_a = matches!(a.recv_timeout(Duration::from_secs(2)), Some(Ok(Event::Bind)));
        let got_b = matches!(b.recv_timeout(Duration::from_secs(2)), Some(Ok(Event::Bind)));
        assert!(got_a || got_b);
        drop(ep0);
    }

    #[test]
    fn out_endpoint_cannot_halt() {
        let file = write_tempfile(b"");
        let addr = EndpointAddress::new(1, Direction::Out).unwrap();
        let ep = OutEndpoint::open(file.path(), addr, EndpointConfig::bulk()).unwrap();
        assert!(matches!(ep.halt(), Err(Error::Unsupported(_))));
        assert!(!ep.is_halted());
    }

    #[test]
    fn read_buffer_sizes_follow_transfer_type() {
        use crate::usb::TransferType::*;
        for (transfer, expected) in [
            (Bulk, 16 * 1024),
            (Interrupt, 64),
            (Isochronous, 1024),
            (Control, 64),
        ] {
            assert_eq!(read_buffer_size(&EndpointConfig::new(transfer)), expected);
        }
        let config = EndpointConfig::interrupt(8, 14);
        assert_eq!(read_buffer_size(&config), 14);
    }

    #[test]
    fn in_endpoint_sync_write() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let ep = InEndpoint::open(file.path(), addr, EndpointConfig::interrupt(8, 14)).unwrap();
        assert_eq!(ep.write(b"report").unwrap(), 6);
        assert!(!ep.is_halted());
    }

    #[test]
    fn in_endpoint_async_write_completes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let ep = InEndpoint::open(file.path(), addr, EndpointConfig::bulk()).unwrap();

        let completion = ep.write_async(b"async data").unwrap();
        assert_eq!(completion.wait().unwrap(), 10);
        ep.flush().unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"async data");
    }

    #[test]
    fn out_endpoint_stream_reads_data() {
        let file = write_tempfile(b"stream payload");
        let addr = EndpointAddress::new(2, Direction::Out).unwrap();
        let ep = OutEndpoint::open(file.path(), addr, EndpointConfig::bulk()).unwrap();

        let stream = ep.stream(2).unwrap();
        let first = stream.recv_timeout(Duration::from_secs(2));
        match first {
            Some(Ok(data)) => assert_eq!(&data, b"stream payload"),
            other => panic!("expected data, got {other:?}"),
        }
    }
}

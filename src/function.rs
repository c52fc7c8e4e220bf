//! USB function runtime.
//!
//! A function is either backed by FunctionFS, with this crate serving its
//! descriptors and endpoint I/O, or by a kernel driver configured through
//! configfs attributes. Both kinds move through the same lifecycle and are
//! driven by the gadget controller through the [`UsbFunction`] trait.

pub mod hid;
pub mod kernel;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    endpoint::{
        ControlEndpoint, DataEndpoint, EventListener, EventStream, InEndpoint, OutEndpoint,
        DEFAULT_EVENT_POLL,
    },
    error::{Error, Result},
    ffs::{DescriptorBlob, Event, FfsFlags, StringsBlob},
    mount::{FfsMount, MountOptions},
    usb::{
        template::{validate_descriptors, DescriptorSet},
        Descriptor, Direction, Recipient, RequestKind, SetupPacket, Speed, StandardRequest,
        FEATURE_ENDPOINT_HALT,
    },
};

/// Default mount point root for FunctionFS instances.
pub const DEFAULT_MOUNT_ROOT: &str = "/dev/ffs";

/// Deadline for the host to deliver the data phase of an OUT setup
/// transfer.
const SETUP_DATA_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle states of a USB function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FunctionState {
    Uninitialized,
    Preparing,
    Ready,
    Bound,
    Enabled,
    Suspended,
    Disposed,
}

impl FunctionState {
    /// Whether this state is at or past `Ready` in the lifecycle.
    fn is_ready(&self) -> bool {
        matches!(
            self,
            FunctionState::Ready
                | FunctionState::Bound
                | FunctionState::Enabled
                | FunctionState::Suspended
        )
    }
}

impl fmt::Display for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FunctionState::Uninitialized => "uninitialized",
            FunctionState::Preparing => "preparing",
            FunctionState::Ready => "ready",
            FunctionState::Bound => "bound",
            FunctionState::Enabled => "enabled",
            FunctionState::Suspended => "suspended",
            FunctionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Shared state machine cell with waiters.
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<FunctionState>,
    changed: Condvar,
}

impl StateCell {
    fn new() -> Self {
        StateCell {
            inner: Mutex::new(FunctionState::Uninitialized),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> FunctionState {
        *self.inner.lock().expect("state lock")
    }

    pub(crate) fn set(&self, next: FunctionState) {
        let mut state = self.inner.lock().expect("state lock");
        if *state != next {
            log::debug!("function state {} -> {next}", *state);
            *state = next;
            self.changed.notify_all();
        }
    }

    /// Apply a kernel event to the state machine. Transitions outside the
    /// table are logged and ignored.
    pub(crate) fn apply_event(&self, event: &Event) {
        let mut state = self.inner.lock().expect("state lock");
        let next = match (*state, event) {
            (FunctionState::Ready, Event::Bind) => Some(FunctionState::Bound),
            (FunctionState::Bound, Event::Unbind) => Some(FunctionState::Ready),
            (FunctionState::Bound, Event::Enable) => Some(FunctionState::Enabled),
            (FunctionState::Enabled, Event::Disable) => Some(FunctionState::Bound),
            (FunctionState::Enabled, Event::Suspend) => Some(FunctionState::Suspended),
            (FunctionState::Suspended, Event::Resume) => Some(FunctionState::Enabled),
            (_, Event::Setup(_)) => None,
            (current, event) => {
                log::debug!("ignoring {event:?} in state {current}");
                None
            }
        };
        if let Some(next) = next {
            log::debug!("function state {} -> {next}", *state);
            *state = next;
            self.changed.notify_all();
        }
    }

    fn wait<F: Fn(FunctionState) -> bool>(
        &self,
        accept: F,
        what: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock().expect("state lock");
        loop {
            if accept(*state) {
                return Ok(());
            }
            if *state == FunctionState::Disposed {
                return Err(Error::InvalidState(format!(
                    "function was disposed while waiting for {what}"
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "function state {what} (currently {})",
                    *state
                )));
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("state lock");
            state = guard;
        }
    }
}

/// The lifecycle interface the gadget controller drives.
pub trait UsbFunction: Send {
    /// Short instance name, used in mount points and configfs names.
    fn name(&self) -> String;

    /// Directory name under `functions/`, e.g. `ffs.gamepad`.
    fn configfs_name(&self) -> String;

    /// Bring the function up far enough that the gadget may be bound.
    /// Called after the configfs function directory exists and before it
    /// is linked into a configuration.
    fn prepare(&mut self, configfs_path: &Path) -> Result<()>;

    /// Block until the function is ready for UDC binding.
    fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Release all runtime resources. Must not raise; called from
    /// teardown paths.
    fn dispose(&mut self);
}

/// Whether a setup override consumed the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetupFlow {
    Handled,
    NotHandled,
}

/// Lifecycle hooks of a FunctionFS function. The runtime performs the
/// state transition for each event before the hook runs; overrides add
/// class- or application-specific behavior on top.
#[allow(unused_variables)]
pub trait FfsHandler: Send {
    fn on_bind(&mut self, rt: &FfsRuntime) {}
    fn on_unbind(&mut self, rt: &FfsRuntime) {}
    fn on_enable(&mut self, rt: &FfsRuntime) {}
    fn on_disable(&mut self, rt: &FfsRuntime) {}
    fn on_suspend(&mut self, rt: &FfsRuntime) {}
    fn on_resume(&mut self, rt: &FfsRuntime) {}

    /// Inspect a setup request before the standard handler. Returning
    /// [`SetupFlow::NotHandled`] forwards the request to the built-in
    /// standard-request handler.
    fn on_setup(&mut self, rt: &FfsRuntime, setup: &SetupPacket) -> Result<SetupFlow> {
        Ok(SetupFlow::NotHandled)
    }
}

/// Handler with no overrides; every request goes to the standard handler.
#[derive(Debug, Default)]
pub struct DefaultFfsHandler;

impl FfsHandler for DefaultFfsHandler {}

/// Runtime face of a FunctionFS function: state, control endpoint and the
/// endpoint table, shared between the application and the event
/// dispatcher.
#[derive(Debug)]
pub struct FfsRuntime {
    name: String,
    state: StateCell,
    ep0: Mutex<Option<Arc<ControlEndpoint>>>,
    endpoints: Mutex<HashMap<u8, DataEndpoint>>,
}

impl FfsRuntime {
    fn new(name: String) -> Self {
        FfsRuntime {
            name,
            state: StateCell::new(),
            ep0: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(name: &str) -> Self {
        FfsRuntime::new(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FunctionState {
        self.state.get()
    }

    /// Block until the state machine reaches `target`. Waiting for the
    /// disposed state is a programming error.
    pub fn wait_state(&self, target: FunctionState, timeout: Duration) -> Result<()> {
        if target == FunctionState::Disposed {
            return Err(Error::InvalidState(
                "waiting for the disposed state is not supported".into(),
            ));
        }
        self.state
            .wait(|s| s == target, &target.to_string(), timeout)
    }

    /// The control endpoint; available once the function is prepared.
    pub fn ep0(&self) -> Result<Arc<ControlEndpoint>> {
        self.ep0
            .lock()
            .expect("ep0 lock")
            .clone()
            .ok_or_else(|| Error::InvalidState("function is not prepared".into()))
    }

    /// Look up a data endpoint by its full 8-bit wire address.
    pub fn endpoint(&self, address: u8) -> Option<DataEndpoint> {
        self.endpoints
            .lock()
            .expect("endpoint lock")
            .get(&address)
            .cloned()
    }

    /// The IN endpoint with the given number.
    pub fn get_endpoint_in(&self, number: u8) -> Result<Arc<InEndpoint>> {
        match self.endpoint(0x80 | number) {
            Some(DataEndpoint::In(ep)) => Ok(ep),
            Some(DataEndpoint::Out(_)) => Err(Error::InvalidConfig(format!(
                "endpoint {number} is an OUT endpoint"
            ))),
            None => Err(Error::InvalidConfig(format!(
                "no IN endpoint with number {number}"
            ))),
        }
    }

    /// The OUT endpoint with the given number.
    pub fn get_endpoint_out(&self, number: u8) -> Result<Arc<OutEndpoint>> {
        match self.endpoint(number & 0x0F) {
            Some(DataEndpoint::Out(ep)) => Ok(ep),
            Some(DataEndpoint::In(_)) => Err(Error::InvalidConfig(format!(
                "endpoint {number} is an IN endpoint"
            ))),
            None => Err(Error::InvalidConfig(format!(
                "no OUT endpoint with number {number}"
            ))),
        }
    }

    /// Stall the current control transfer.
    pub fn stall(&self) -> Result<()> {
        self.ep0()?.halt()
    }

    /// Read the data phase of an OUT setup transfer, polling the
    /// non-blocking control endpoint until the host has delivered it.
    pub fn read_setup_data(&self, len: usize) -> Result<Vec<u8>> {
        let ep0 = self.ep0()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + SETUP_DATA_TIMEOUT;
        loop {
            let data = ep0.read(len)?;
            if !data.is_empty() {
                return Ok(data);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("setup data phase".into()));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn set_ep0(&self, ep0: Arc<ControlEndpoint>) {
        *self.ep0.lock().expect("ep0 lock") = Some(ep0);
    }

    pub(crate) fn insert_endpoint(&self, endpoint: DataEndpoint) {
        let address = endpoint.address().to_byte();
        self.endpoints
            .lock()
            .expect("endpoint lock")
            .insert(address, endpoint);
    }

    fn clear(&self) {
        self.endpoints.lock().expect("endpoint lock").clear();
        *self.ep0.lock().expect("ep0 lock") = None;
    }

    /// The built-in handler for standard control requests. Non-standard
    /// requests and anything outside the supported set are stalled.
    pub fn handle_standard_setup(&self, setup: &SetupPacket) -> Result<()> {
        if setup.kind() != RequestKind::Standard {
            log::debug!("stalling non-standard request {:#04x}", setup.b_request);
            return self.stall();
        }

        match setup.standard_request() {
            Some(StandardRequest::GetStatus)
                if setup.direction() == Direction::In
                    && setup.w_length == 2
                    && setup.w_value == 0 =>
            {
                self.get_status(setup)
            }
            Some(request @ (StandardRequest::SetFeature | StandardRequest::ClearFeature))
                if setup.direction() == Direction::Out
                    && setup.w_length == 0
                    && setup.w_value == FEATURE_ENDPOINT_HALT
                    && setup.recipient() == Some(Recipient::Endpoint) =>
            {
                self.feature_endpoint_halt(setup, request == StandardRequest::SetFeature)
            }
            other => {
                log::debug!("stalling unhandled standard request {other:?}");
                self.stall()
            }
        }
    }

    fn get_status(&self, setup: &SetupPacket) -> Result<()> {
        match setup.recipient() {
            Some(Recipient::Interface) if setup.w_index == 0 => {
                self.ep0()?.write(&[0, 0])?;
                Ok(())
            }
            Some(Recipient::Endpoint) => match self.endpoint(setup.w_index as u8) {
                Some(endpoint) => {
                    let halted = endpoint.is_halted() as u8;
                    self.ep0()?.write(&[halted, 0])?;
                    Ok(())
                }
                None => {
                    log::debug!("GET_STATUS for unknown endpoint {:#04x}", setup.w_index);
                    self.stall()
                }
            },
            _ => self.stall(),
        }
    }

    fn feature_endpoint_halt(&self, setup: &SetupPacket, set: bool) -> Result<()> {
        match self.endpoint(setup.w_index as u8) {
            Some(endpoint) => {
                let result = if set {
                    endpoint.halt()
                } else {
                    endpoint.clear_halt()
                };
                match result {
                    Ok(()) => self.ep0()?.ack(),
                    Err(err) => {
                        log::debug!(
                            "endpoint halt change on {:#04x} failed: {err}",
                            setup.w_index
                        );
                        self.stall()
                    }
                }
            }
            None => {
                log::debug!("halt request for unknown endpoint {:#04x}", setup.w_index);
                self.stall()
            }
        }
    }
}

struct FfsShared {
    descriptors: Vec<Descriptor>,
    speeds: Vec<Speed>,
    strings: BTreeMap<u16, Vec<String>>,
    extra_flags: FfsFlags,
    mount_point: PathBuf,
    mount_options: MountOptions,
    event_poll: Duration,
    mount: Option<FfsMount>,
    listener: Option<EventListener>,
    handler: Option<Box<dyn FfsHandler>>,
}

/// A userspace USB function backed by FunctionFS.
///
/// Cloning yields another handle to the same function; one clone is
/// typically added to the gadget configuration while the application keeps
/// the other for endpoint I/O.
#[derive(Clone)]
pub struct FfsFunction {
    shared: Arc<Mutex<FfsShared>>,
    runtime: Arc<FfsRuntime>,
}

impl FfsFunction {
    /// Declare a FunctionFS function.
    ///
    /// `descriptors` must contain at least one interface descriptor with
    /// dense interface numbers and matching endpoint counts; every endpoint
    /// template must satisfy the packet-size limits of every requested
    /// speed. `strings` maps USB language ids to equally long string
    /// tables.
    pub fn new(
        name: &str,
        descriptors: Vec<Descriptor>,
        speeds: &[Speed],
        strings: BTreeMap<u16, Vec<String>>,
        flags: FfsFlags,
    ) -> Result<Self> {
        validate_instance_name(name)?;
        validate_descriptors(&descriptors)?;
        if speeds.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one speed must be requested".into(),
            ));
        }
        let mut speeds: Vec<Speed> = speeds.to_vec();
        speeds.sort();
        speeds.dedup();
        for descriptor in &descriptors {
            if let Descriptor::Endpoint(template) = descriptor {
                for speed in &speeds {
                    template.validate_for(*speed)?;
                }
            }
        }
        // Validate string-table symmetry up front.
        StringsBlob::new(strings.clone())?;

        let mount_point = Path::new(DEFAULT_MOUNT_ROOT).join(name);
        Ok(FfsFunction {
            shared: Arc::new(Mutex::new(FfsShared {
                descriptors,
                speeds,
                strings,
                extra_flags: flags,
                mount_point,
                mount_options: MountOptions::default(),
                event_poll: DEFAULT_EVENT_POLL,
                mount: None,
                listener: None,
                handler: Some(Box::new(DefaultFfsHandler)),
            })),
            runtime: Arc::new(FfsRuntime::new(name.to_string())),
        })
    }

    /// Override the mount point (default `/dev/ffs/<name>`).
    pub fn with_mount_point(self, mount_point: impl Into<PathBuf>) -> Self {
        self.shared.lock().expect("shared lock").mount_point = mount_point.into();
        self
    }

    pub fn with_mount_options(self, options: MountOptions) -> Self {
        self.shared.lock().expect("shared lock").mount_options = options;
        self
    }

    /// Override the EP0 event polling interval.
    pub fn with_event_poll(self, poll: Duration) -> Self {
        self.shared.lock().expect("shared lock").event_poll = poll;
        self
    }

    /// Install lifecycle and setup hooks.
    pub fn with_handler(self, handler: Box<dyn FfsHandler>) -> Self {
        self.shared.lock().expect("shared lock").handler = Some(handler);
        self
    }

    /// The runtime face shared with the event dispatcher.
    pub fn runtime(&self) -> &Arc<FfsRuntime> {
        &self.runtime
    }

    pub fn state(&self) -> FunctionState {
        self.runtime.state()
    }

    pub fn wait_state(&self, target: FunctionState, timeout: Duration) -> Result<()> {
        self.runtime.wait_state(target, timeout)
    }

    pub fn get_endpoint_in(&self, number: u8) -> Result<Arc<InEndpoint>> {
        self.runtime.get_endpoint_in(number)
    }

    pub fn get_endpoint_out(&self, number: u8) -> Result<Arc<OutEndpoint>> {
        self.runtime.get_endpoint_out(number)
    }

    fn prepare_inner(&self, shared: &mut FfsShared) -> Result<()> {
        let name = self.runtime.name().to_string();

        // Mount the endpoint filesystem and open the control endpoint.
        let mount = FfsMount::ensure(&name, &shared.mount_point, &shared.mount_options)?;
        let ep0 = Arc::new(ControlEndpoint::open(&mount.ep0_path())?);

        // Generate and publish the descriptor sets.
        let mut sets = Vec::new();
        for speed in &shared.speeds {
            sets.push(DescriptorSet::generate(&shared.descriptors, *speed)?);
        }
        let blob = DescriptorBlob::new(sets, shared.extra_flags)?;
        write_descriptors(&ep0, &blob)?;

        let strings = StringsBlob::new(shared.strings.clone())?;
        if !strings.is_empty() {
            ep0.write(&strings.to_bytes()?)?;
            log::debug!("wrote strings blob for {name}");
        }

        // The kernel creates ep1, ep2, ... in the order the endpoint
        // templates appear in the descriptor declaration, independent of
        // their USB addresses.
        let mut index = 0;
        for descriptor in &shared.descriptors {
            let Descriptor::Endpoint(template) = descriptor else {
                continue;
            };
            index += 1;
            let path = mount.ep_path(index);
            let endpoint = match template.address().direction() {
                Direction::In => DataEndpoint::In(Arc::new(InEndpoint::open(
                    &path,
                    template.address(),
                    *template.config(),
                )?)),
                Direction::Out => DataEndpoint::Out(Arc::new(OutEndpoint::open(
                    &path,
                    template.address(),
                    *template.config(),
                )?)),
            };
            self.runtime.insert_endpoint(endpoint);
        }

        // Start the event loop.
        let listener = ep0.listener(shared.event_poll)?;
        let stream = listener.subscribe()?;
        let handler = shared.handler.take().unwrap_or_else(|| Box::new(DefaultFfsHandler));
        let runtime = self.runtime.clone();
        thread::Builder::new()
            .name(format!("usb-fn-{name}"))
            .spawn(move || dispatch_events(runtime, stream, handler))
            .map_err(|err| Error::Environment(format!("cannot spawn dispatcher: {err}")))?;

        self.runtime.set_ep0(ep0);
        shared.listener = Some(listener);
        shared.mount = Some(mount);
        Ok(())
    }
}

impl UsbFunction for FfsFunction {
    fn name(&self) -> String {
        self.runtime.name().to_string()
    }

    fn configfs_name(&self) -> String {
        format!("ffs.{}", self.runtime.name())
    }

    fn prepare(&mut self, _configfs_path: &Path) -> Result<()> {
        let mut shared = self.shared.lock().expect("shared lock");
        let state = self.runtime.state();
        if state != FunctionState::Uninitialized {
            return Err(Error::InvalidState(format!(
                "cannot prepare function in state {state}"
            )));
        }
        self.runtime.state.set(FunctionState::Preparing);

        match self.prepare_inner(&mut shared) {
            Ok(()) => {
                self.runtime.state.set(FunctionState::Ready);
                log::debug!("function {} is ready", self.runtime.name());
                Ok(())
            }
            Err(err) => {
                log::debug!("prepare of {} failed: {err}", self.runtime.name());
                self.runtime.clear();
                shared.listener = None;
                if let Some(mut mount) = shared.mount.take() {
                    mount.unmount();
                }
                self.runtime.state.set(FunctionState::Uninitialized);
                Err(err)
            }
        }
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.runtime.state.wait(|s| s.is_ready(), "ready", timeout)
    }

    fn dispose(&mut self) {
        let mut shared = self.shared.lock().expect("shared lock");
        if self.runtime.state() == FunctionState::Disposed {
            return;
        }
        log::debug!("disposing function {}", self.runtime.name());
        self.runtime.state.set(FunctionState::Disposed);
        shared.listener = None;
        self.runtime.clear();
        if let Some(mut mount) = shared.mount.take() {
            mount.unmount();
        }
    }
}

/// Write the descriptors blob, falling back to the legacy format when the
/// kernel rejects the v2 header.
fn write_descriptors(ep0: &ControlEndpoint, blob: &DescriptorBlob) -> Result<()> {
    match ep0.write(&blob.to_bytes()?) {
        Ok(_) => Ok(()),
        Err(err) if err.errno() == Some(nix::errno::Errno::EINVAL) => {
            log::debug!("kernel rejected v2 descriptors, retrying legacy format");
            ep0.write(&blob.to_bytes_legacy()?)?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn dispatch_events(runtime: Arc<FfsRuntime>, stream: EventStream, mut handler: Box<dyn FfsHandler>) {
    log::debug!("event dispatcher for {} started", runtime.name());
    loop {
        // Poll with a timeout so disposal is noticed even while idle.
        let event = match stream.rx.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if runtime.state() == FunctionState::Disposed {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event {
            Ok(event) => {
                runtime.state.apply_event(&event);
                match event {
                    Event::Bind => handler.on_bind(&runtime),
                    Event::Unbind => handler.on_unbind(&runtime),
                    Event::Enable => handler.on_enable(&runtime),
                    Event::Disable => handler.on_disable(&runtime),
                    Event::Suspend => handler.on_suspend(&runtime),
                    Event::Resume => handler.on_resume(&runtime),
                    Event::Setup(setup) => match handler.on_setup(&runtime, &setup) {
                        Ok(SetupFlow::Handled) => {}
                        Ok(SetupFlow::NotHandled) => {
                            if let Err(err) = runtime.handle_standard_setup(&setup) {
                                log::debug!("standard setup handling failed: {err}");
                                let _ = runtime.stall();
                            }
                        }
                        Err(err) => {
                            log::debug!("setup hook failed: {err}");
                            let _ = runtime.stall();
                        }
                    },
                }
            }
            Err(err) => log::debug!("ep0 event error: {err}"),
        }
    }
    log::debug!("event dispatcher for {} stopped", runtime.name());
}

/// Validate a function or gadget instance name for use as a path
/// component.
pub(crate) fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig("name must not be empty".into()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidConfig(format!(
            "name {name:?} is not a valid path component"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{EndpointAddress, EndpointConfig};
    use std::io::Write;

    fn runtime_with_endpoints() -> (Arc<FfsRuntime>, tempfile::NamedTempFile, tempfile::NamedTempFile)
    {
        let runtime = Arc::new(FfsRuntime::new("test".into()));

        let ep0_file = tempfile::NamedTempFile::new().unwrap();
        let ep0 = ControlEndpoint::open(ep0_file.path()).unwrap();
        runtime.set_ep0(Arc::new(ep0));

        let in_file = tempfile::NamedTempFile::new().unwrap();
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let ep_in = InEndpoint::open(in_file.path(), addr, EndpointConfig::interrupt(8, 14)).unwrap();
        runtime.insert_endpoint(DataEndpoint::In(Arc::new(ep_in)));

        (runtime, ep0_file, in_file)
    }

    #[test]
    fn state_machine_follows_event_table() {
        let cell = StateCell::new();
        cell.set(FunctionState::Ready);

        cell.apply_event(&Event::Bind);
        assert_eq!(cell.get(), FunctionState::Bound);
        cell.apply_event(&Event::Enable);
        assert_eq!(cell.get(), FunctionState::Enabled);
        cell.apply_event(&Event::Suspend);
        assert_eq!(cell.get(), FunctionState::Suspended);
        cell.apply_event(&Event::Resume);
        assert_eq!(cell.get(), FunctionState::Enabled);
        cell.apply_event(&Event::Disable);
        assert_eq!(cell.get(), FunctionState::Bound);
        cell.apply_event(&Event::Unbind);
        assert_eq!(cell.get(), FunctionState::Ready);

        // Out-of-table events leave the state alone.
        cell.apply_event(&Event::Resume);
        assert_eq!(cell.get(), FunctionState::Ready);
    }

    #[test]
    fn waiting_for_disposed_is_rejected() {
        let runtime = FfsRuntime::new("t".into());
        assert!(matches!(
            runtime.wait_state(FunctionState::Disposed, Duration::from_millis(10)),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn wait_state_times_out_with_current_state() {
        let runtime = FfsRuntime::new("t".into());
        let err = runtime
            .wait_state(FunctionState::Enabled, Duration::from_millis(20))
            .unwrap_err();
        assert!(err.to_string().contains("uninitialized"));
    }

    #[test]
    fn endpoint_lookup_checks_direction() {
        let (runtime, _ep0, _in_file) = runtime_with_endpoints();
        assert!(runtime.get_endpoint_in(1).is_ok());
        assert!(runtime.get_endpoint_out(1).is_err());
        assert!(runtime.get_endpoint_in(2).is_err());
        assert!(runtime.endpoint(0x81).is_some());
        assert!(runtime.endpoint(0x01).is_none());
    }

    #[test]
    fn get_status_reports_halt_state() {
        let (runtime, ep0_file, _in_file) = runtime_with_endpoints();
        let setup = SetupPacket {
            bm_request_type: 0x82,
            b_request: 0x00,
            w_value: 0,
            w_index: 0x0081,
            w_length: 2,
        };
        runtime.handle_standard_setup(&setup).unwrap();
        assert_eq!(std::fs::read(ep0_file.path()).unwrap(), vec![0, 0]);

        // Halt the endpoint, status flips to 1.
        let setup_halt = SetupPacket {
            bm_request_type: 0x02,
            b_request: 0x03,
            w_value: 0,
            w_index: 0x0081,
            w_length: 0,
        };
        runtime.handle_standard_setup(&setup_halt).unwrap();
        assert!(runtime.get_endpoint_in(1).unwrap().is_halted());

        runtime.handle_standard_setup(&setup).unwrap();
        assert_eq!(std::fs::read(ep0_file.path()).unwrap(), vec![0, 0, 1, 0]);
    }

    #[test]
    fn get_status_for_interface_zero() {
        let (runtime, ep0_file, _in_file) = runtime_with_endpoints();
        let setup = SetupPacket {
            bm_request_type: 0x81,
            b_request: 0x00,
            w_value: 0,
            w_index: 0,
            w_length: 2,
        };
        runtime.handle_standard_setup(&setup).unwrap();
        assert_eq!(std::fs::read(ep0_file.path()).unwrap(), vec![0, 0]);
    }

    #[test]
    fn unknown_endpoint_and_vendor_requests_stall() {
        let (runtime, ep0_file, _in_file) = runtime_with_endpoints();
        // GET_STATUS for an endpoint that does not exist.
        let setup = SetupPacket {
            bm_request_type: 0x82,
            b_request: 0x00,
            w_value: 0,
            w_index: 0x0082,
            w_length: 2,
        };
        runtime.handle_standard_setup(&setup).unwrap();

        // Vendor request.
        let setup = SetupPacket {
            bm_request_type: 0x40,
            b_request: 0x42,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        };
        runtime.handle_standard_setup(&setup).unwrap();

        // Only stalls (zero-length reads), nothing written.
        assert!(std::fs::read(ep0_file.path()).unwrap().is_empty());
    }

    #[test]
    fn function_construction_validates() {
        use crate::usb::{hid::HidDescriptor, template::EndpointTemplate, InterfaceDescriptor};

        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let descriptors: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
            HidDescriptor::for_report(70).unwrap().into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 14))
                .unwrap()
                .into(),
        ];

        let function = FfsFunction::new(
            "gamepad",
            descriptors.clone(),
            &[Speed::Full, Speed::High],
            BTreeMap::new(),
            FfsFlags::empty(),
        )
        .unwrap();
        assert_eq!(function.configfs_name(), "ffs.gamepad");
        assert_eq!(function.state(), FunctionState::Uninitialized);

        // Name must be a path component.
        assert!(FfsFunction::new(
            "bad/name",
            descriptors.clone(),
            &[Speed::Full],
            BTreeMap::new(),
            FfsFlags::empty()
        )
        .is_err());

        // Packet size invalid for a requested speed.
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let oversized: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 512))
                .unwrap()
                .into(),
        ];
        assert!(FfsFunction::new(
            "gamepad",
            oversized,
            &[Speed::Full],
            BTreeMap::new(),
            FfsFlags::empty()
        )
        .is_err());
    }

    #[test]
    fn instance_names() {
        assert!(validate_instance_name("gamepad").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("a/b").is_err());
        assert!(validate_instance_name("..").is_err());
    }

    #[test]
    fn dispatcher_handles_events_from_stream() {
        // Feed a bind event through a fake ep0 and check the state
        // transition performed by the dispatcher.
        let mut raw = Vec::new();
        raw.extend_from_slice(&Event::Bind.to_bytes());
        let mut ep0_file = tempfile::NamedTempFile::new().unwrap();
        ep0_file.write_all(&raw).unwrap();
        ep0_file.flush().unwrap();

        let runtime = Arc::new(FfsRuntime::new("evt".into()));
        runtime.state.set(FunctionState::Ready);
        let ep0 = Arc::new(ControlEndpoint::open(ep0_file.path()).unwrap());
        let listener = ep0.listener(Duration::from_millis(5)).unwrap();
        let stream = listener.subscribe().unwrap();
        runtime.set_ep0(ep0);

        let rt = runtime.clone();
        let handle =
            thread::spawn(move || dispatch_events(rt, stream, Box::new(DefaultFfsHandler)));

        runtime
            .wait_state(FunctionState::Bound, Duration::from_secs(2))
            .unwrap();

        // Disposal ends the dispatcher.
        runtime.state.set(FunctionState::Disposed);
        runtime.clear();
        drop(listener);
        handle.join().unwrap();
    }
}

//! Gadget lifecycle controller.
//!
//! Materializes a gadget declaration in kernel configfs, drives every
//! function through preparation, binds the UDC and tears the tree down
//! symmetrically. All filesystem artifacts are tracked in creation order
//! so a failed bind leaves nothing behind.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::mpsc::{channel, Receiver},
    thread,
    time::{Duration, Instant},
};

use nix::errno::Errno;

use crate::{
    error::{Error, Result},
    function::{validate_instance_name, UsbFunction},
    udc::{Udc, UsbDeviceState},
    usb::Speed,
};

/// Root of the gadget tree within configfs.
pub const CONFIGFS_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";

/// Combined deadline for all functions to reach their ready state.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default polling interval for device-state observation.
pub const DEFAULT_STATE_POLL: Duration = Duration::from_millis(100);

/// USB device class triple written to the device descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceClass {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
}

/// Per-language device strings. Absent entries are left at their kernel
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct GadgetStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Power attributes of a configuration (`bmAttributes`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerMode {
    BusPowered = 0x80,
    SelfPowered = 0xC0,
    RemoteWakeup = 0xA0,
}

/// One USB configuration: power budget, descriptive strings and an
/// ordered list of functions.
pub struct Configuration {
    index: u8,
    max_power_raw: u8,
    power_mode: PowerMode,
    names: BTreeMap<u16, String>,
    functions: Vec<Box<dyn UsbFunction>>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration {
            index: 1,
            max_power_raw: (500u16 / 2) as u8,
            power_mode: PowerMode::BusPowered,
            names: BTreeMap::new(),
            functions: Vec::new(),
        }
    }

    /// Configuration index, 1-based.
    pub fn with_index(mut self, index: u8) -> Result<Self> {
        if index == 0 {
            return Err(Error::InvalidConfig(
                "configuration index must be at least 1".into(),
            ));
        }
        self.index = index;
        Ok(self)
    }

    /// Maximum bus power draw in milliamps. The wire encodes 2 mA units,
    /// so values above 510 mA are rejected.
    pub fn set_max_power_ma(&mut self, ma: u16) -> Result<()> {
        if ma > 510 {
            return Err(Error::InvalidConfig(format!(
                "maximum power of {ma} mA exceeds the 510 mA the descriptor can encode"
            )));
        }
        self.max_power_raw = (ma / 2) as u8;
        Ok(())
    }

    pub fn with_max_power_ma(mut self, ma: u16) -> Result<Self> {
        self.set_max_power_ma(ma)?;
        Ok(self)
    }

    /// Raw `bMaxPower` value (2 mA units).
    pub fn max_power_raw(&self) -> u8 {
        self.max_power_raw
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) {
        self.power_mode = mode;
    }

    pub fn with_power_mode(mut self, mode: PowerMode) -> Self {
        self.power_mode = mode;
        self
    }

    /// Set the configuration name for one language.
    pub fn add_name(&mut self, language: u16, name: impl AsRef<str>) {
        self.names.insert(language, name.as_ref().to_string());
    }

    pub fn with_name(mut self, language: u16, name: impl AsRef<str>) -> Self {
        self.add_name(language, name);
        self
    }

    /// Append a function. Order is preserved into configfs.
    pub fn add_function(&mut self, function: Box<dyn UsbFunction>) {
        self.functions.push(function);
    }

    pub fn with_function(mut self, function: Box<dyn UsbFunction>) -> Self {
        self.add_function(function);
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// A USB gadget declaration and its runtime binding state.
pub struct Gadget {
    name: String,
    vendor_id: u16,
    product_id: u16,
    bcd_device: u16,
    bcd_usb: u16,
    device_class: Option<DeviceClass>,
    max_packet_size0: Option<u8>,
    max_speed: Option<Speed>,
    strings: BTreeMap<u16, GadgetStrings>,
    configuration: Configuration,
    udc_name: Option<String>,
    configfs_root: PathBuf,

    bound: bool,
    udc: Option<Udc>,
    created_dirs: Vec<PathBuf>,
    created_symlinks: Vec<PathBuf>,
}

impl Gadget {
    /// Declare a gadget. `name` becomes the configfs directory name and
    /// must be usable as a path component.
    pub fn new(
        name: &str,
        vendor_id: u16,
        product_id: u16,
        configuration: Configuration,
    ) -> Result<Self> {
        validate_instance_name(name)?;
        Ok(Gadget {
            name: name.to_string(),
            vendor_id,
            product_id,
            bcd_device: 0x0100,
            bcd_usb: 0x0200,
            device_class: None,
            max_packet_size0: None,
            max_speed: None,
            strings: BTreeMap::new(),
            configuration,
            udc_name: None,
            configfs_root: PathBuf::from(CONFIGFS_GADGET_ROOT),
            bound: false,
            udc: None,
            created_dirs: Vec::new(),
            created_symlinks: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_bcd_device(mut self, bcd: u16) -> Self {
        self.bcd_device = bcd;
        self
    }

    pub fn with_bcd_usb(mut self, bcd: u16) -> Self {
        self.bcd_usb = bcd;
        self
    }

    pub fn with_device_class(mut self, class: DeviceClass) -> Self {
        self.device_class = Some(class);
        self
    }

    pub fn with_max_packet_size0(mut self, size: u8) -> Self {
        self.max_packet_size0 = Some(size);
        self
    }

    /// Cap the speed the UDC may negotiate.
    pub fn with_max_speed(mut self, speed: Speed) -> Self {
        self.max_speed = Some(speed);
        self
    }

    /// Set device strings for one language.
    pub fn with_strings(mut self, language: u16, strings: GadgetStrings) -> Self {
        self.strings.insert(language, strings);
        self
    }

    /// Select a UDC by name instead of requiring a unique controller.
    pub fn with_udc_name(mut self, name: impl AsRef<str>) -> Self {
        self.udc_name = Some(name.as_ref().to_string());
        self
    }

    /// Override the configfs gadget root, for hosts that mount configfs
    /// somewhere other than `/sys/kernel/config`.
    pub fn with_configfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.configfs_root = root.into();
        self
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The UDC this gadget is bound to.
    pub fn udc(&self) -> Option<&Udc> {
        self.udc.as_ref()
    }

    fn gadget_dir(&self) -> PathBuf {
        self.configfs_root.join(&self.name)
    }

    /// Materialize the gadget and bind it to a UDC.
    ///
    /// The bind is atomic in effect: on any failure every directory and
    /// symlink created so far is removed and the error re-raised.
    pub fn bind(&mut self) -> Result<()> {
        if self.bound {
            return Err(Error::AlreadyBound);
        }

        // Resolve the controller before creating any filesystem artifact.
        let udc = Udc::resolve(self.udc_name.as_deref())?;
        log::debug!("binding gadget {} to UDC {}", self.name, udc.name());

        match self.bind_inner(&udc) {
            Ok(()) => {
                self.udc = Some(udc);
                self.bound = true;
                log::debug!("gadget {} bound", self.name);
                Ok(())
            }
            Err(err) => {
                log::debug!("bind of {} failed, rolling back: {err}", self.name);
                self.teardown();
                Err(err)
            }
        }
    }

    fn bind_inner(&mut self, udc: &Udc) -> Result<()> {
        if !self.configfs_root.is_dir() {
            return Err(Error::Environment(format!(
                "configfs gadget root {} does not exist; is configfs mounted and libcomposite loaded?",
                self.configfs_root.display()
            )));
        }

        let dir = self.gadget_dir();
        self.create_dir(&dir)?;
        self.write_device_attributes(&dir)?;
        self.write_device_strings(&dir)?;
        let config_dir = self.write_configuration(&dir)?;
        self.prepare_functions(&dir)?;
        self.await_ready()?;
        self.release_conflicting_udc(udc);
        self.link_functions(&config_dir, &dir)?;
        self.write_udc(&dir, udc)
    }

    fn write_device_attributes(&mut self, dir: &Path) -> Result<()> {
        write_attr(dir, "idVendor", &hex_u16(self.vendor_id))?;
        write_attr(dir, "idProduct", &hex_u16(self.product_id))?;
        write_attr(dir, "bcdDevice", &hex_u16(self.bcd_device))?;
        write_attr(dir, "bcdUSB", &hex_u16(self.bcd_usb))?;
        if let Some(class) = self.device_class {
            write_attr(dir, "bDeviceClass", &hex_u8(class.class))?;
            write_attr(dir, "bDeviceSubClass", &hex_u8(class.sub_class))?;
            write_attr(dir, "bDeviceProtocol", &hex_u8(class.protocol))?;
        }
        if let Some(size) = self.max_packet_size0 {
            write_attr(dir, "bMaxPacketSize0", &hex_u8(size))?;
        }
        if let Some(speed) = self.max_speed {
            write_attr(dir, "max_speed", speed_attr(speed))?;
        }
        Ok(())
    }

    fn write_device_strings(&mut self, dir: &Path) -> Result<()> {
        let strings = std::mem::take(&mut self.strings);
        for (language, entry) in &strings {
            let lang_dir = dir.join("strings").join(format!("{language:#x}"));
            self.create_dir_all(&lang_dir)?;
            if let Some(manufacturer) = &entry.manufacturer {
                write_attr(&lang_dir, "manufacturer", manufacturer)?;
            }
            if let Some(product) = &entry.product {
                write_attr(&lang_dir, "product", product)?;
            }
            if let Some(serial) = &entry.serial_number {
                write_attr(&lang_dir, "serialnumber", serial)?;
            }
        }
        self.strings = strings;
        Ok(())
    }

    fn write_configuration(&mut self, dir: &Path) -> Result<PathBuf> {
        let config_dir = dir
            .join("configs")
            .join(format!("c.{}", self.configuration.index));
        self.create_dir_all(&config_dir)?;
        write_attr(
            &config_dir,
            "bmAttributes",
            &hex_u8(self.configuration.power_mode as u8),
        )?;
        write_attr(
            &config_dir,
            "MaxPower",
            &self.configuration.max_power_raw.to_string(),
        )?;

        let names = self.configuration.names.clone();
        for (language, name) in &names {
            let lang_dir = config_dir.join("strings").join(format!("{language:#x}"));
            self.create_dir_all(&lang_dir)?;
            write_attr(&lang_dir, "configuration", name)?;
        }
        Ok(config_dir)
    }

    fn prepare_functions(&mut self, dir: &Path) -> Result<()> {
        let functions_root = dir.join("functions");
        for index in 0..self.configuration.functions.len() {
            let configfs_name = self.configuration.functions[index].configfs_name();
            let func_dir = functions_root.join(&configfs_name);
            std::fs::create_dir_all(&func_dir).map_err(|err| {
                Error::Environment(format!(
                    "cannot create function {configfs_name}: {err} (is the kernel module loaded?)"
                ))
            })?;
            self.created_dirs.push(func_dir.clone());

            // Function attributes become immutable once the symlink into a
            // configuration exists, so preparation must finish first.
            log::debug!("preparing function {configfs_name}");
            self.configuration.functions[index].prepare(&func_dir)?;
        }
        Ok(())
    }

    fn await_ready(&mut self) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        for function in &self.configuration.functions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            function.wait_ready(remaining).map_err(|err| {
                Error::Timeout(format!(
                    "function {} did not become ready: {err}",
                    function.configfs_name()
                ))
            })?;
        }
        Ok(())
    }

    /// Clear any sibling gadget holding the target UDC; a stale binding is
    /// the usual reason the UDC write fails with EBUSY.
    fn release_conflicting_udc(&self, udc: &Udc) {
        let Ok(entries) = std::fs::read_dir(&self.configfs_root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.gadget_dir() || !path.is_dir() {
                continue;
            }
            let udc_file = path.join("UDC");
            let Ok(current) = std::fs::read_to_string(&udc_file) else {
                continue;
            };
            if current.trim() == udc.name() {
                log::debug!(
                    "releasing UDC {} from stale gadget {}",
                    udc.name(),
                    path.display()
                );
                if let Err(err) = std::fs::write(&udc_file, "\n") {
                    log::warn!("cannot release {}: {err}", udc_file.display());
                }
            }
        }
    }

    fn link_functions(&mut self, config_dir: &Path, dir: &Path) -> Result<()> {
        for function in &self.configuration.functions {
            let configfs_name = function.configfs_name();
            let target = dir.join("functions").join(&configfs_name);
            let link = config_dir.join(&configfs_name);
            std::os::unix::fs::symlink(&target, &link).map_err(|err| {
                Error::Environment(format!("cannot link {}: {err}", link.display()))
            })?;
            self.created_symlinks.push(link);
        }
        Ok(())
    }

    fn write_udc(&self, dir: &Path, udc: &Udc) -> Result<()> {
        match std::fs::write(dir.join("UDC"), udc.name()) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(Errno::EBUSY as i32) => {
                Err(Error::Environment(format!(
                    "UDC {} is busy; a function is probably not ready or another \
                     gadget still holds the controller",
                    udc.name()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn create_dir(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir(dir)
            .map_err(|err| Error::Environment(format!("cannot create {}: {err}", dir.display())))?;
        self.created_dirs.push(dir.to_path_buf());
        Ok(())
    }

    fn create_dir_all(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|err| Error::Environment(format!("cannot create {}: {err}", dir.display())))?;
        self.created_dirs.push(dir.to_path_buf());
        Ok(())
    }

    /// Unbind and remove the gadget. Idempotent; failures are logged, not
    /// raised, so teardown always runs to completion.
    pub fn unbind(&mut self) {
        if self.bound {
            let udc_file = self.gadget_dir().join("UDC");
            if let Err(err) = std::fs::write(&udc_file, "\n") {
                log::warn!("cannot clear {}: {err}", udc_file.display());
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        for function in self.configuration.functions.iter_mut().rev() {
            function.dispose();
        }
        for link in self.created_symlinks.drain(..).rev() {
            if let Err(err) = std::fs::remove_file(&link) {
                log::warn!("cannot remove symlink {}: {err}", link.display());
            }
        }
        for dir in self.created_dirs.drain(..).rev() {
            // configfs directories empty out once their children are gone;
            // fall back to a recursive removal for anything left behind.
            if let Err(err) = std::fs::remove_dir(&dir) {
                if std::fs::remove_dir_all(&dir).is_err() {
                    log::warn!("cannot remove {}: {err}", dir.display());
                }
            }
        }
        self.bound = false;
        self.udc = None;
    }

    fn observed_udc(&self) -> Result<Udc> {
        match &self.udc {
            Some(udc) => Ok(udc.clone()),
            None => Udc::resolve(self.udc_name.as_deref()),
        }
    }

    /// Read the USB device state from the bound (or preselected) UDC.
    pub fn current_state(&self) -> Result<UsbDeviceState> {
        self.observed_udc()?.state()
    }

    /// Poll until the device reaches `target`, failing after `timeout`
    /// with the last observed state.
    pub fn wait_for_state(
        &self,
        target: UsbDeviceState,
        poll: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let udc = self.observed_udc()?;
        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            let state = udc.state()?;
            if state == target {
                return Ok(());
            }
            last = Some(state);
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "device state {} (currently {})",
                    target.as_str(),
                    last.map(|s| s.as_str()).unwrap_or("unknown")
                )));
            }
            thread::sleep(poll);
        }
    }

    /// Observe device states as they change, with consecutive duplicates
    /// coalesced. The stream ends when dropped or when the UDC goes away.
    pub fn state_stream(&self, poll: Duration) -> Result<StateStream> {
        let udc = self.observed_udc()?;
        let (tx, rx) = channel();
        thread::Builder::new()
            .name("usb-state-poll".into())
            .spawn(move || {
                let mut last = None;
                loop {
                    match udc.state() {
                        Ok(state) => {
                            if coalesce(&mut last, state) && tx.send(state).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            log::debug!("state poll ended: {err}");
                            break;
                        }
                    }
                    thread::sleep(poll);
                }
            })
            .map_err(|err| Error::Environment(format!("cannot spawn state poller: {err}")))?;
        Ok(StateStream { rx })
    }
}

impl Drop for Gadget {
    fn drop(&mut self) {
        if self.bound || !self.created_dirs.is_empty() {
            self.unbind();
        }
    }
}

/// Stream of distinct USB device states.
#[derive(Debug)]
pub struct StateStream {
    rx: Receiver<UsbDeviceState>,
}

impl StateStream {
    pub fn recv(&self) -> Option<UsbDeviceState> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<UsbDeviceState> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Iterator for StateStream {
    type Item = UsbDeviceState;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Record `next` into `last`, reporting whether it differs from the
/// previous state.
fn coalesce(last: &mut Option<UsbDeviceState>, next: UsbDeviceState) -> bool {
    if *last == Some(next) {
        false
    } else {
        *last = Some(next);
        true
    }
}

fn write_attr(dir: &Path, name: &str, value: &str) -> Result<()> {
    let path = dir.join(name);
    log::debug!("writing {} = {value}", path.display());
    std::fs::write(&path, value)
        .map_err(|err| Error::Environment(format!("cannot write {}: {err}", path.display())))
}

fn hex_u16(value: u16) -> String {
    format!("0x{value:04X}")
}

fn hex_u8(value: u8) -> String {
    format!("0x{value:02X}")
}

fn speed_attr(speed: Speed) -> &'static str {
    match speed {
        Speed::Full => "full-speed",
        Speed::High => "high-speed",
        Speed::Super => "super-speed",
        Speed::SuperPlus => "super-speed-plus",
    }
}

//! Functions implemented by kernel drivers and configured through
//! configfs attributes.
//!
//! These functions have no userspace data path; `prepare` validates the
//! declaration, writes the driver's attribute files and is immediately
//! ready for binding.

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use macaddr::MacAddr6;

use crate::{
    error::{Error, Result},
    function::{validate_instance_name, UsbFunction},
};

/// Value of one configfs attribute file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttrValue {
    fn text(value: impl ToString) -> Self {
        AttrValue::Text(value.to_string())
    }

    fn flag(value: bool) -> Self {
        AttrValue::Text(if value { "1" } else { "0" }.to_string())
    }
}

/// One logical unit of a mass-storage function.
#[derive(Debug, Clone, Default)]
pub struct Lun {
    /// Path of the backing file or block device.
    pub file: PathBuf,
    pub cdrom: bool,
    pub ro: bool,
    pub removable: bool,
    /// Ignore the FUA flag on writes.
    pub nofua: bool,
}

impl Lun {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Lun {
            file: file.into(),
            ..Default::default()
        }
    }

    fn attributes(&self) -> Vec<(String, AttrValue)> {
        vec![
            ("file".into(), AttrValue::text(self.file.display())),
            ("cdrom".into(), AttrValue::flag(self.cdrom)),
            ("ro".into(), AttrValue::flag(self.ro)),
            ("removable".into(), AttrValue::flag(self.removable)),
            ("nofua".into(), AttrValue::flag(self.nofua)),
        ]
    }
}

/// Mass-storage function configuration.
#[derive(Debug, Clone, Default)]
pub struct MassStorageConfig {
    pub stall: Option<bool>,
    pub luns: Vec<Lun>,
}

/// Serial function configuration (ACM and generic serial).
#[derive(Debug, Clone, Default)]
pub struct SerialConfig {
    /// Use the port as a kernel console.
    pub console: Option<bool>,
}

/// Ethernet-style network function configuration.
#[derive(Debug, Clone, Default)]
pub struct NetConfig {
    pub dev_addr: Option<MacAddr6>,
    pub host_addr: Option<MacAddr6>,
}

impl NetConfig {
    /// Parse MAC addresses in `XX:XX:XX:XX:XX:XX` notation.
    pub fn with_addrs(dev_addr: &str, host_addr: &str) -> Result<Self> {
        Ok(NetConfig {
            dev_addr: Some(parse_mac(dev_addr)?),
            host_addr: Some(parse_mac(host_addr)?),
        })
    }
}

fn parse_mac(text: &str) -> Result<MacAddr6> {
    text.parse()
        .map_err(|err| Error::InvalidConfig(format!("invalid MAC address {text:?}: {err}")))
}

/// RNDIS function configuration.
#[derive(Debug, Clone, Default)]
pub struct RndisConfig {
    pub net: NetConfig,
    /// Announce the device as a Wireless RNDIS device.
    pub wceis: Option<bool>,
}

/// Kernel HID function configuration.
#[derive(Debug, Clone, Default)]
pub struct KernelHidConfig {
    pub protocol: u8,
    pub subclass: u8,
    pub report_length: u16,
    pub report_descriptor: Vec<u8>,
    pub no_out_endpoint: bool,
}

/// MIDI function configuration.
#[derive(Debug, Clone, Default)]
pub struct MidiConfig {
    pub id: Option<String>,
    pub in_ports: Option<u32>,
    pub out_ports: Option<u32>,
    pub buflen: Option<u32>,
    pub qlen: Option<u32>,
}

/// UAC1/UAC2 audio function configuration.
#[derive(Debug, Clone, Default)]
pub struct AudioConfig {
    pub c_chmask: Option<u32>,
    pub c_srate: Option<u32>,
    pub c_ssize: Option<u32>,
    pub p_chmask: Option<u32>,
    pub p_srate: Option<u32>,
    pub p_ssize: Option<u32>,
    pub req_number: Option<u32>,
}

/// UVC video function configuration.
#[derive(Debug, Clone, Default)]
pub struct UvcConfig {
    pub streaming_maxpacket: Option<u32>,
    pub streaming_maxburst: Option<u32>,
    pub streaming_interval: Option<u32>,
}

/// Printer function configuration.
#[derive(Debug, Clone, Default)]
pub struct PrinterConfig {
    pub pnp_string: Option<String>,
    pub q_len: Option<u32>,
}

/// Loopback test function configuration.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConfig {
    pub qlen: Option<u32>,
    pub buflen: Option<u32>,
}

/// Source/sink test function configuration.
#[derive(Debug, Clone, Default)]
pub struct SourceSinkConfig {
    pub pattern: Option<u32>,
    pub isoc_interval: Option<u32>,
    pub isoc_maxpacket: Option<u32>,
    pub isoc_mult: Option<u32>,
    pub isoc_maxburst: Option<u32>,
    pub bulk_buflen: Option<u32>,
}

#[derive(Debug, Clone)]
enum KernelFunctionKind {
    MassStorage(MassStorageConfig),
    Acm(SerialConfig),
    Gser(SerialConfig),
    Ecm(NetConfig),
    EcmSubset(NetConfig),
    Eem(NetConfig),
    Ncm(NetConfig),
    Rndis(RndisConfig),
    Hid(KernelHidConfig),
    Midi(MidiConfig),
    Uac1(AudioConfig),
    Uac2(AudioConfig),
    Uvc(UvcConfig),
    Printer(PrinterConfig),
    Loopback(LoopbackConfig),
    SourceSink(SourceSinkConfig),
}

impl KernelFunctionKind {
    fn driver(&self) -> &'static str {
        match self {
            KernelFunctionKind::MassStorage(_) => "mass_storage",
            KernelFunctionKind::Acm(_) => "acm",
            KernelFunctionKind::Gser(_) => "gser",
            KernelFunctionKind::Ecm(_) => "ecm",
            KernelFunctionKind::EcmSubset(_) => "geth",
            KernelFunctionKind::Eem(_) => "eem",
            KernelFunctionKind::Ncm(_) => "ncm",
            KernelFunctionKind::Rndis(_) => "rndis",
            KernelFunctionKind::Hid(_) => "hid",
            KernelFunctionKind::Midi(_) => "midi",
            KernelFunctionKind::Uac1(_) => "uac1",
            KernelFunctionKind::Uac2(_) => "uac2",
            KernelFunctionKind::Uvc(_) => "uvc",
            KernelFunctionKind::Printer(_) => "printer",
            KernelFunctionKind::Loopback(_) => "Loopback",
            KernelFunctionKind::SourceSink(_) => "SourceSink",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            KernelFunctionKind::MassStorage(config) => {
                if config.luns.is_empty() {
                    return Err(Error::InvalidConfig(
                        "mass storage needs at least one LUN".into(),
                    ));
                }
                if config.luns.len() > 8 {
                    return Err(Error::InvalidConfig(
                        "mass storage supports at most 8 LUNs".into(),
                    ));
                }
                Ok(())
            }
            KernelFunctionKind::Hid(config) => {
                if config.report_descriptor.is_empty() {
                    return Err(Error::InvalidConfig(
                        "kernel HID function needs a report descriptor".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn attributes(&self) -> Vec<(String, AttrValue)> {
        let mut attrs = Vec::new();
        let mut push_opt = |name: &str, value: Option<AttrValue>| {
            if let Some(value) = value {
                attrs.push((name.to_string(), value));
            }
        };

        match self {
            KernelFunctionKind::MassStorage(config) => {
                push_opt("stall", config.stall.map(AttrValue::flag));
            }
            KernelFunctionKind::Acm(config) | KernelFunctionKind::Gser(config) => {
                push_opt("console", config.console.map(AttrValue::flag));
            }
            KernelFunctionKind::Ecm(net)
            | KernelFunctionKind::EcmSubset(net)
            | KernelFunctionKind::Eem(net)
            | KernelFunctionKind::Ncm(net) => {
                push_opt("dev_addr", net.dev_addr.map(AttrValue::text));
                push_opt("host_addr", net.host_addr.map(AttrValue::text));
            }
            KernelFunctionKind::Rndis(config) => {
                push_opt("dev_addr", config.net.dev_addr.map(AttrValue::text));
                push_opt("host_addr", config.net.host_addr.map(AttrValue::text));
                push_opt("wceis", config.wceis.map(AttrValue::flag));
            }
            KernelFunctionKind::Hid(config) => {
                push_opt("protocol", Some(AttrValue::text(config.protocol)));
                push_opt("subclass", Some(AttrValue::text(config.subclass)));
                push_opt("report_length", Some(AttrValue::text(config.report_length)));
                push_opt("no_out_endpoint", Some(AttrValue::flag(config.no_out_endpoint)));
                push_opt(
                    "report_desc",
                    Some(AttrValue::Binary(config.report_descriptor.clone())),
                );
            }
            KernelFunctionKind::Midi(config) => {
                push_opt("id", config.id.clone().map(AttrValue::Text));
                push_opt("in_ports", config.in_ports.map(AttrValue::text));
                push_opt("out_ports", config.out_ports.map(AttrValue::text));
                push_opt("buflen", config.buflen.map(AttrValue::text));
                push_opt("qlen", config.qlen.map(AttrValue::text));
            }
            KernelFunctionKind::Uac1(config) | KernelFunctionKind::Uac2(config) => {
                push_opt("c_chmask", config.c_chmask.map(AttrValue::text));
                push_opt("c_srate", config.c_srate.map(AttrValue::text));
                push_opt("c_ssize", config.c_ssize.map(AttrValue::text));
                push_opt("p_chmask", config.p_chmask.map(AttrValue::text));
                push_opt("p_srate", config.p_srate.map(AttrValue::text));
                push_opt("p_ssize", config.p_ssize.map(AttrValue::text));
                push_opt("req_number", config.req_number.map(AttrValue::text));
            }
            KernelFunctionKind::Uvc(config) => {
                push_opt(
                    "streaming_maxpacket",
                    config.streaming_maxpacket.map(AttrValue::text),
                );
                push_opt(
                    "streaming_maxburst",
                    config.streaming_maxburst.map(AttrValue::text),
                );
                push_opt(
                    "streaming_interval",
                    config.streaming_interval.map(AttrValue::text),
                );
            }
            KernelFunctionKind::Printer(config) => {
                push_opt("pnp_string", config.pnp_string.clone().map(AttrValue::Text));
                push_opt("q_len", config.q_len.map(AttrValue::text));
            }
            KernelFunctionKind::Loopback(config) => {
                push_opt("qlen", config.qlen.map(AttrValue::text));
                push_opt("buflen", config.buflen.map(AttrValue::text));
            }
            KernelFunctionKind::SourceSink(config) => {
                push_opt("pattern", config.pattern.map(AttrValue::text));
                push_opt("isoc_interval", config.isoc_interval.map(AttrValue::text));
                push_opt("isoc_maxpacket", config.isoc_maxpacket.map(AttrValue::text));
                push_opt("isoc_mult", config.isoc_mult.map(AttrValue::text));
                push_opt("isoc_maxburst", config.isoc_maxburst.map(AttrValue::text));
                push_opt("bulk_buflen", config.bulk_buflen.map(AttrValue::text));
            }
        }
        attrs
    }
}

/// A kernel-driver-backed USB function.
#[derive(Debug)]
pub struct KernelFunction {
    instance: String,
    spec: KernelFunctionKind,
    path: Option<PathBuf>,
    /// Open runtime handle, e.g. `/dev/hidg<n>`.
    device: Option<File>,
}

macro_rules! kernel_ctor {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $config:ty) => {
        $(#[$doc])*
        pub fn $name(instance: &str, config: $config) -> Result<Self> {
            Self::new(instance, KernelFunctionKind::$variant(config))
        }
    };
}

impl KernelFunction {
    fn new(instance: &str, spec: KernelFunctionKind) -> Result<Self> {
        validate_instance_name(instance)?;
        spec.validate()?;
        Ok(KernelFunction {
            instance: instance.to_string(),
            spec,
            path: None,
            device: None,
        })
    }

    kernel_ctor!(
        /// Mass-storage function exposing one or more LUNs.
        mass_storage, MassStorage, MassStorageConfig
    );
    kernel_ctor!(
        /// CDC ACM serial port.
        acm, Acm, SerialConfig
    );
    kernel_ctor!(
        /// Generic serial port.
        gser, Gser, SerialConfig
    );
    kernel_ctor!(
        /// CDC ECM network adapter.
        ecm, Ecm, NetConfig
    );
    kernel_ctor!(
        /// CDC ECM subset network adapter.
        ecm_subset, EcmSubset, NetConfig
    );
    kernel_ctor!(
        /// CDC EEM network adapter.
        eem, Eem, NetConfig
    );
    kernel_ctor!(
        /// CDC NCM network adapter.
        ncm, Ncm, NetConfig
    );
    kernel_ctor!(
        /// RNDIS network adapter.
        rndis, Rndis, RndisConfig
    );
    kernel_ctor!(
        /// HID device served by the kernel driver.
        hid, Hid, KernelHidConfig
    );
    kernel_ctor!(
        /// MIDI streaming function.
        midi, Midi, MidiConfig
    );
    kernel_ctor!(
        /// USB Audio Class 1 function.
        uac1, Uac1, AudioConfig
    );
    kernel_ctor!(
        /// USB Audio Class 2 function.
        uac2, Uac2, AudioConfig
    );
    kernel_ctor!(
        /// USB Video Class function.
        uvc, Uvc, UvcConfig
    );
    kernel_ctor!(
        /// Printer function.
        printer, Printer, PrinterConfig
    );
    kernel_ctor!(
        /// Loopback test function.
        loopback, Loopback, LoopbackConfig
    );
    kernel_ctor!(
        /// Source/sink test function.
        source_sink, SourceSink, SourceSinkConfig
    );

    fn configfs_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| Error::InvalidState("function is not prepared".into()))
    }

    /// Device major and minor numbers of a kernel HID function, read from
    /// the `dev` attribute.
    pub fn device(&self) -> Result<(u32, u32)> {
        if !matches!(self.spec, KernelFunctionKind::Hid(_)) {
            return Err(Error::Unsupported(
                "only kernel HID functions expose a device number",
            ));
        }
        let path = self.configfs_path()?.join("dev");
        let text = std::fs::read_to_string(&path)?;
        let (major, minor) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed device number {text:?}")))?;
        let major = major
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed device major {major:?}")))?;
        let minor = minor
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed device minor {minor:?}")))?;
        Ok((major, minor))
    }

    /// Character device path of a kernel HID function.
    pub fn hidg_path(&self) -> Result<PathBuf> {
        let (_, minor) = self.device()?;
        Ok(PathBuf::from(format!("/dev/hidg{minor}")))
    }

    /// Open the HID character device for report I/O.
    pub fn open_device(&mut self) -> Result<&File> {
        if self.device.is_none() {
            let path = self.hidg_path()?;
            self.device = Some(File::options().read(true).write(true).open(&path).map_err(
                |err| Error::Environment(format!("cannot open {}: {err}", path.display())),
            )?);
        }
        Ok(self.device.as_ref().expect("device open"))
    }

    /// Trigger a forced eject of a mass-storage LUN.
    pub fn force_eject(&self, lun: usize) -> Result<()> {
        let KernelFunctionKind::MassStorage(config) = &self.spec else {
            return Err(Error::Unsupported(
                "forced eject applies to mass-storage functions only",
            ));
        };
        if lun >= config.luns.len() {
            return Err(Error::InvalidConfig(format!("no LUN {lun}")));
        }
        let path = self.configfs_path()?.join(format!("lun.{lun}/forced_eject"));
        std::fs::write(&path, "1")?;
        Ok(())
    }
}

impl UsbFunction for KernelFunction {
    fn name(&self) -> String {
        self.instance.clone()
    }

    fn configfs_name(&self) -> String {
        format!("{}.{}", self.spec.driver(), self.instance)
    }

    fn prepare(&mut self, configfs_path: &Path) -> Result<()> {
        self.spec.validate()?;
        if !configfs_path.is_dir() {
            return Err(Error::Environment(format!(
                "function directory {} does not exist; is the {} module loaded?",
                configfs_path.display(),
                self.spec.driver()
            )));
        }

        for (name, value) in self.spec.attributes() {
            write_attribute(configfs_path, &name, &value)?;
        }

        if let KernelFunctionKind::MassStorage(config) = &self.spec {
            for (index, lun) in config.luns.iter().enumerate() {
                let lun_dir = configfs_path.join(format!("lun.{index}"));
                // The kernel pre-creates lun.0.
                if !lun_dir.is_dir() {
                    std::fs::create_dir(&lun_dir)?;
                }
                for (name, value) in lun.attributes() {
                    write_attribute(&lun_dir, &name, &value)?;
                }
            }
        }

        self.path = Some(configfs_path.to_path_buf());
        log::debug!("prepared kernel function {}", self.configfs_name());
        Ok(())
    }

    fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        // Kernel functions are ready as soon as their attributes are
        // written.
        Ok(())
    }

    fn dispose(&mut self) {
        if self.device.take().is_some() {
            log::debug!("closed device handle of {}", self.configfs_name());
        }
        self.path = None;
    }
}

fn write_attribute(dir: &Path, name: &str, value: &AttrValue) -> Result<()> {
    let path = dir.join(name);
    let result = match value {
        AttrValue::Text(text) => {
            log::debug!("writing {} = {text}", path.display());
            std::fs::write(&path, text)
        }
        AttrValue::Binary(data) => {
            log::debug!("writing {} ({} bytes)", path.display(), data.len());
            std::fs::write(&path, data)
        }
    };
    result.map_err(|err| {
        Error::Environment(format!("cannot write attribute {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mass_storage_requires_a_lun() {
        assert!(KernelFunction::mass_storage("storage", MassStorageConfig::default()).is_err());

        let config = MassStorageConfig {
            stall: None,
            luns: vec![Lun::new("/tmp/disk.img")],
        };
        let function = KernelFunction::mass_storage("storage", config).unwrap();
        assert_eq!(function.configfs_name(), "mass_storage.storage");
    }

    #[test]
    fn mass_storage_prepare_writes_lun_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut lun = Lun::new("/tmp/disk.img");
        lun.removable = true;
        let config = MassStorageConfig {
            stall: Some(false),
            luns: vec![lun],
        };
        let mut function = KernelFunction::mass_storage("storage", config).unwrap();
        function.prepare(dir.path()).unwrap();

        let read = |p: &str| std::fs::read_to_string(dir.path().join(p)).unwrap();
        assert_eq!(read("stall"), "0");
        assert_eq!(read("lun.0/file"), "/tmp/disk.img");
        assert_eq!(read("lun.0/removable"), "1");
        assert_eq!(read("lun.0/ro"), "0");
    }

    #[test]
    fn prepare_fails_when_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("mass_storage.storage");
        let config = MassStorageConfig {
            stall: None,
            luns: vec![Lun::new("/tmp/disk.img")],
        };
        let mut function = KernelFunction::mass_storage("storage", config).unwrap();
        let err = function.prepare(&missing).unwrap_err();
        assert!(err.to_string().contains("module"));
    }

    #[test]
    fn network_functions_write_mac_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let net = NetConfig::with_addrs("02:11:22:33:44:55", "02:aa:bb:cc:dd:ee").unwrap();
        let mut function = KernelFunction::ecm("usb0", net).unwrap();
        function.prepare(dir.path()).unwrap();

        let dev = std::fs::read_to_string(dir.path().join("dev_addr")).unwrap();
        assert_eq!(dev.to_lowercase(), "02:11:22:33:44:55");
        assert!(dir.path().join("host_addr").exists());
    }

    #[test]
    fn invalid_mac_is_a_configuration_error() {
        assert!(NetConfig::with_addrs("not-a-mac", "02:aa:bb:cc:dd:ee").is_err());
    }

    #[test]
    fn kernel_hid_writes_binary_report_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelHidConfig {
            protocol: 1,
            subclass: 1,
            report_length: 8,
            report_descriptor: vec![0x05, 0x01, 0x09, 0x06],
            no_out_endpoint: true,
        };
        let mut function = KernelFunction::hid("kbd", config).unwrap();
        function.prepare(dir.path()).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("report_desc")).unwrap(),
            vec![0x05, 0x01, 0x09, 0x06]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("report_length")).unwrap(),
            "8"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("no_out_endpoint")).unwrap(),
            "1"
        );

        // The kernel publishes the device number in `dev`.
        std::fs::write(dir.path().join("dev"), "239:1\n").unwrap();
        assert_eq!(function.device().unwrap(), (239, 1));
        assert_eq!(function.hidg_path().unwrap(), PathBuf::from("/dev/hidg1"));
    }

    #[test]
    fn device_number_is_hid_only() {
        let config = MassStorageConfig {
            stall: None,
            luns: vec![Lun::new("/tmp/disk.img")],
        };
        let function = KernelFunction::mass_storage("storage", config).unwrap();
        assert!(matches!(function.device(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn kernel_functions_are_immediately_ready() {
        let config = SerialConfig { console: None };
        let function = KernelFunction::acm("gs0", config).unwrap();
        function.wait_ready(Duration::from_millis(1)).unwrap();
        assert_eq!(function.configfs_name(), "acm.gs0");
    }

    #[test]
    fn force_eject_validates_lun_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = MassStorageConfig {
            stall: None,
            luns: vec![Lun::new("/tmp/disk.img")],
        };
        let mut function = KernelFunction::mass_storage("storage", config).unwrap();
        function.prepare(dir.path()).unwrap();

        assert!(function.force_eject(3).is_err());
        function.force_eject(0).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lun.0/forced_eject")).unwrap(),
            "1"
        );
    }
}

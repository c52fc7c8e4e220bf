//! HID function overlay on top of the FunctionFS runtime.
//!
//! Builds the fixed HID descriptor list from a topology, answers HID
//! class requests (reports, idle rate, protocol) on EP0 and exposes
//! report I/O to the application.

use std::collections::{BTreeMap, HashMap};

use crate::{
    endpoint::ByteStream,
    error::{Error, Result},
    ffs::FfsFlags,
    function::{FfsFunction, FfsHandler, FfsRuntime, FunctionState, SetupFlow, UsbFunction},
    usb::{
        hid::{
            HidDescriptor, HidDescriptorType, HidInterfaceProtocol, HidProtocolMode, HidReportType,
            HidRequest, HidSubclass, HID_INTERFACE_CLASS,
        },
        template::EndpointTemplate,
        Descriptor, Direction, EndpointAddress, EndpointConfig, InterfaceDescriptor, Recipient,
        RequestKind, SetupPacket, Speed, StandardRequest,
    },
};

use packed_struct::PrimitiveEnum;

/// Concurrent buffers of the OUT report stream.
const REPORT_STREAM_BUFFERS: usize = 4;

/// Endpoint topology of a HID function. The IN endpoint, when present, is
/// always endpoint 1; a bidirectional function adds the OUT endpoint as
/// endpoint 2, an output-only function carries OUT on endpoint 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidLayout {
    InputOnly { poll_ms: u8, max_packet_size: u16 },
    Bidirectional { poll_ms: u8, max_packet_size: u16 },
    OutputOnly { poll_ms: u8, max_packet_size: u16 },
}

impl HidLayout {
    fn endpoint_count(&self) -> u8 {
        match self {
            HidLayout::InputOnly { .. } | HidLayout::OutputOnly { .. } => 1,
            HidLayout::Bidirectional { .. } => 2,
        }
    }

    fn has_in(&self) -> bool {
        !matches!(self, HidLayout::OutputOnly { .. })
    }

    fn out_endpoint_number(&self) -> Option<u8> {
        match self {
            HidLayout::InputOnly { .. } => None,
            HidLayout::Bidirectional { .. } => Some(2),
            HidLayout::OutputOnly { .. } => Some(1),
        }
    }

    fn templates(&self) -> Result<Vec<EndpointTemplate>> {
        let (poll_ms, max_packet_size) = match *self {
            HidLayout::InputOnly {
                poll_ms,
                max_packet_size,
            }
            | HidLayout::Bidirectional {
                poll_ms,
                max_packet_size,
            }
            | HidLayout::OutputOnly {
                poll_ms,
                max_packet_size,
            } => (poll_ms, max_packet_size),
        };
        let config = EndpointConfig::interrupt(poll_ms, max_packet_size);

        let mut templates = Vec::new();
        if self.has_in() {
            templates.push(EndpointTemplate::new(
                EndpointAddress::new(1, Direction::In)?,
                config,
            )?);
        }
        if let Some(number) = self.out_endpoint_number() {
            templates.push(EndpointTemplate::new(
                EndpointAddress::new(number, Direction::Out)?,
                config,
            )?);
        }
        Ok(templates)
    }
}

/// Application hooks for HID report traffic. All methods have no-op
/// defaults; `on_get_report` may supply report data that overrides the
/// cache.
#[allow(unused_variables)]
pub trait HidCallbacks: Send {
    fn on_get_report(&mut self, report_type: HidReportType, report_id: u8) -> Option<Vec<u8>> {
        None
    }
    fn on_set_report(&mut self, report_type: HidReportType, report_id: u8, data: &[u8]) {}
    fn on_set_idle(&mut self, report_id: u8, duration: u8) {}
    fn on_set_protocol(&mut self, protocol: HidProtocolMode) {}
}

/// Callbacks that leave everything to the report cache.
#[derive(Debug, Default)]
pub struct NoHidCallbacks;

impl HidCallbacks for NoHidCallbacks {}

/// Declarative configuration of a HID function.
pub struct HidConfig {
    pub report_descriptor: Vec<u8>,
    pub subclass: HidSubclass,
    pub protocol: HidInterfaceProtocol,
    pub layout: HidLayout,
    pub speeds: Vec<Speed>,
    pub strings: BTreeMap<u16, Vec<String>>,
}

struct HidHandler {
    hid_descriptor: Vec<u8>,
    report_descriptor: Vec<u8>,
    idle_rate: u8,
    protocol: HidProtocolMode,
    reports: HashMap<(HidReportType, u8), Vec<u8>>,
    callbacks: Box<dyn HidCallbacks>,
}

impl HidHandler {
    fn handle_get_descriptor(&mut self, rt: &FfsRuntime, setup: &SetupPacket) -> Result<SetupFlow> {
        let descriptor = match HidDescriptorType::from_primitive((setup.w_value >> 8) as u8) {
            Some(HidDescriptorType::Hid) => &self.hid_descriptor,
            Some(HidDescriptorType::Report) => &self.report_descriptor,
            _ => return Ok(SetupFlow::NotHandled),
        };
        let len = usize::from(setup.w_length).min(descriptor.len());
        rt.ep0()?.write(&descriptor[..len])?;
        Ok(SetupFlow::Handled)
    }

    fn handle_class_request(&mut self, rt: &FfsRuntime, setup: &SetupPacket) -> Result<SetupFlow> {
        let report_type = HidReportType::from_primitive((setup.w_value >> 8) as u8);
        let report_id = setup.w_value as u8;

        match HidRequest::from_primitive(setup.b_request) {
            Some(HidRequest::GetReport)
                if setup.direction() == Direction::In && setup.w_length > 0 =>
            {
                let Some(report_type) = report_type else {
                    return stall(rt);
                };
                let data = self
                    .callbacks
                    .on_get_report(report_type, report_id)
                    .or_else(|| self.reports.get(&(report_type, report_id)).cloned());
                match data {
                    Some(mut data) => {
                        data.resize(usize::from(setup.w_length), 0);
                        rt.ep0()?.write(&data)?;
                        Ok(SetupFlow::Handled)
                    }
                    None => {
                        log::debug!("no report for GET_REPORT {report_type:?}/{report_id}");
                        stall(rt)
                    }
                }
            }
            Some(HidRequest::GetIdle)
                if setup.direction() == Direction::In && setup.w_length == 1 =>
            {
                rt.ep0()?.write(&[self.idle_rate])?;
                Ok(SetupFlow::Handled)
            }
            Some(HidRequest::GetProtocol)
                if setup.direction() == Direction::In
                    && setup.w_length == 1
                    && setup.w_value == 0 =>
            {
                rt.ep0()?.write(&[self.protocol as u8])?;
                Ok(SetupFlow::Handled)
            }
            Some(HidRequest::SetReport) if setup.direction() == Direction::Out => {
                let Some(report_type) = report_type else {
                    return stall(rt);
                };
                if setup.w_length == 0 {
                    return stall(rt);
                }
                let data = rt.read_setup_data(usize::from(setup.w_length))?;
                self.reports.insert((report_type, report_id), data.clone());
                self.callbacks.on_set_report(report_type, report_id, &data);
                rt.ep0()?.ack()?;
                Ok(SetupFlow::Handled)
            }
            Some(HidRequest::SetIdle)
                if setup.direction() == Direction::Out && setup.w_length == 0 =>
            {
                let duration = (setup.w_value >> 8) as u8;
                self.idle_rate = duration;
                self.callbacks.on_set_idle(report_id, duration);
                rt.ep0()?.ack()?;
                Ok(SetupFlow::Handled)
            }
            Some(HidRequest::SetProtocol)
                if setup.direction() == Direction::Out && setup.w_length == 0 =>
            {
                match HidProtocolMode::from_primitive(setup.w_value as u8) {
                    Some(protocol) => {
                        self.protocol = protocol;
                        self.callbacks.on_set_protocol(protocol);
                        rt.ep0()?.ack()?;
                        Ok(SetupFlow::Handled)
                    }
                    None => stall(rt),
                }
            }
            other => {
                log::debug!("stalling unknown HID request {:#04x} ({other:?})", setup.b_request);
                stall(rt)
            }
        }
    }
}

fn stall(rt: &FfsRuntime) -> Result<SetupFlow> {
    rt.stall()?;
    Ok(SetupFlow::Handled)
}

impl FfsHandler for HidHandler {
    fn on_enable(&mut self, rt: &FfsRuntime) {
        // Endpoints were opened during prepare; surface a missing one
        // early instead of on the first report.
        if let Err(err) = rt.get_endpoint_in(1) {
            log::debug!("HID function enabled without IN endpoint: {err}");
        }
        log::debug!("HID function {} enabled", rt.name());
    }

    fn on_setup(&mut self, rt: &FfsRuntime, setup: &SetupPacket) -> Result<SetupFlow> {
        if setup.kind() == RequestKind::Standard
            && setup.direction() == Direction::In
            && setup.recipient() == Some(Recipient::Interface)
            && setup.standard_request() == Some(StandardRequest::GetDescriptor)
        {
            return self.handle_get_descriptor(rt, setup);
        }
        if setup.kind() == RequestKind::Class && setup.recipient() == Some(Recipient::Interface) {
            return self.handle_class_request(rt, setup);
        }
        Ok(SetupFlow::NotHandled)
    }
}

/// A HID device function: fixed interface and HID descriptors, report
/// handling on EP0, and report I/O over interrupt endpoints.
#[derive(Clone)]
pub struct HidFunction {
    inner: FfsFunction,
    layout: HidLayout,
}

impl HidFunction {
    /// Create a HID function without application callbacks; GET_REPORT is
    /// answered from the report cache.
    pub fn new(name: &str, config: HidConfig) -> Result<Self> {
        Self::with_callbacks(name, config, Box::new(NoHidCallbacks))
    }

    /// Create a HID function with report callbacks.
    pub fn with_callbacks(
        name: &str,
        config: HidConfig,
        callbacks: Box<dyn HidCallbacks>,
    ) -> Result<Self> {
        if config.report_descriptor.is_empty() {
            return Err(Error::InvalidConfig(
                "HID report descriptor must not be empty".into(),
            ));
        }
        let report_len = u16::try_from(config.report_descriptor.len()).map_err(|_| {
            Error::InvalidConfig("HID report descriptor exceeds 65535 bytes".into())
        })?;
        let hid_descriptor = HidDescriptor::for_report(report_len)?;

        let mut descriptors: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(
                0,
                config.layout.endpoint_count(),
                HID_INTERFACE_CLASS,
                config.subclass as u8,
                config.protocol as u8,
            )
            .into(),
            hid_descriptor.clone().into(),
        ];
        for template in config.layout.templates()? {
            descriptors.push(template.into());
        }

        let handler = HidHandler {
            hid_descriptor: hid_descriptor.bytes()?,
            report_descriptor: config.report_descriptor,
            idle_rate: 0,
            protocol: HidProtocolMode::Report,
            reports: HashMap::new(),
            callbacks,
        };

        let inner = FfsFunction::new(
            name,
            descriptors,
            &config.speeds,
            config.strings,
            FfsFlags::empty(),
        )?
        .with_handler(Box::new(handler));

        Ok(HidFunction {
            inner,
            layout: config.layout,
        })
    }

    pub fn state(&self) -> FunctionState {
        self.inner.state()
    }

    pub fn wait_state(&self, target: FunctionState, timeout: std::time::Duration) -> Result<()> {
        self.inner.wait_state(target, timeout)
    }

    /// The underlying FunctionFS function.
    pub fn ffs(&self) -> &FfsFunction {
        &self.inner
    }

    /// Send an input report to the host over the interrupt IN endpoint.
    pub fn send_report(&self, data: &[u8]) -> Result<usize> {
        if !self.layout.has_in() {
            return Err(Error::Unsupported(
                "HID topology has no IN endpoint for input reports",
            ));
        }
        self.inner.get_endpoint_in(1)?.write(data)
    }

    /// Broadcast stream of output reports arriving on the OUT endpoint.
    pub fn stream_reports(&self) -> Result<ByteStream> {
        let Some(number) = self.layout.out_endpoint_number() else {
            return Err(Error::Unsupported(
                "HID topology has no OUT endpoint for output reports",
            ));
        };
        self.inner
            .get_endpoint_out(number)?
            .stream(REPORT_STREAM_BUFFERS)
    }
}

impl UsbFunction for HidFunction {
    fn name(&self) -> String {
        UsbFunction::name(&self.inner)
    }

    fn configfs_name(&self) -> String {
        self.inner.configfs_name()
    }

    fn prepare(&mut self, configfs_path: &std::path::Path) -> Result<()> {
        self.inner.prepare(configfs_path)
    }

    fn wait_ready(&self, timeout: std::time::Duration) -> Result<()> {
        self.inner.wait_ready(timeout)
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ControlEndpoint, DataEndpoint, InEndpoint};
    use std::{io::Write, sync::Arc};

    fn handler() -> HidHandler {
        let hid_descriptor = HidDescriptor::for_report(4).unwrap();
        HidHandler {
            hid_descriptor: hid_descriptor.bytes().unwrap(),
            report_descriptor: vec![0x05, 0x01, 0x09, 0x04],
            idle_rate: 0,
            protocol: HidProtocolMode::Report,
            reports: HashMap::new(),
            callbacks: Box::new(NoHidCallbacks),
        }
    }

    fn runtime_with_ep0(content: &[u8]) -> (Arc<FfsRuntime>, tempfile::NamedTempFile) {
        let runtime = Arc::new(crate::function::FfsRuntime::new_for_tests("hid"));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        runtime.set_ep0(Arc::new(ControlEndpoint::open(file.path()).unwrap()));
        (runtime, file)
    }

    fn class_setup(request: u8, direction_in: bool, w_value: u16, w_length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: if direction_in { 0xA1 } else { 0x21 },
            b_request: request,
            w_value,
            w_index: 0,
            w_length,
        }
    }

    #[test]
    fn layouts_produce_expected_endpoints() {
        let input = HidLayout::InputOnly {
            poll_ms: 8,
            max_packet_size: 14,
        };
        let templates = input.templates().unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].address().to_byte(), 0x81);

        let bidi = HidLayout::Bidirectional {
            poll_ms: 4,
            max_packet_size: 64,
        };
        let templates = bidi.templates().unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].address().to_byte(), 0x81);
        assert_eq!(templates[1].address().to_byte(), 0x02);

        let output = HidLayout::OutputOnly {
            poll_ms: 4,
            max_packet_size: 64,
        };
        let templates = output.templates().unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].address().to_byte(), 0x01);
    }

    #[test]
    fn report_descriptor_request_is_truncated_to_wlength() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(b"");

        let setup = SetupPacket {
            bm_request_type: 0x81,
            b_request: 0x06,
            w_value: 0x2200,
            w_index: 0,
            w_length: 2,
        };
        assert_eq!(
            handler.on_setup(&runtime, &setup).unwrap(),
            SetupFlow::Handled
        );
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0x05, 0x01]);
    }

    #[test]
    fn hid_descriptor_request_returns_descriptor() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(b"");

        let setup = SetupPacket {
            bm_request_type: 0x81,
            b_request: 0x06,
            w_value: 0x2100,
            w_index: 0,
            w_length: 64,
        };
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x04, 0x00]
        );
    }

    #[test]
    fn get_report_without_cache_stalls() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(b"");

        let setup = class_setup(0x01, true, 0x0100, 8);
        assert_eq!(
            handler.on_setup(&runtime, &setup).unwrap(),
            SetupFlow::Handled
        );
        // Only a stall (zero-length read); no data written.
        assert!(std::fs::read(file.path()).unwrap().is_empty());
        assert!(handler.reports.is_empty());
    }

    #[test]
    fn set_report_caches_and_get_report_pads() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(&[0xAA, 0xBB]);

        // SET_REPORT(output, id 0) reads the two pending bytes.
        let setup = class_setup(0x09, false, 0x0200, 2);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(
            handler.reports.get(&(HidReportType::Output, 0)),
            Some(&vec![0xAA, 0xBB])
        );

        // GET_REPORT for the same report, padded to 4 bytes.
        let setup = class_setup(0x01, true, 0x0200, 4);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            vec![0xAA, 0xBB, 0xAA, 0xBB, 0x00, 0x00]
        );
    }

    #[test]
    fn idle_and_protocol_round_trip() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(b"");

        // SET_IDLE duration 0x20, report id 3.
        let setup = class_setup(0x0A, false, 0x2003, 0);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(handler.idle_rate, 0x20);

        // GET_IDLE returns it.
        let setup = class_setup(0x02, true, 0, 1);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0x20]);

        // SET_PROTOCOL to boot, then GET_PROTOCOL.
        let setup = class_setup(0x0B, false, 0, 0);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(handler.protocol, HidProtocolMode::Boot);

        let setup = class_setup(0x03, true, 0, 1);
        handler.on_setup(&runtime, &setup).unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0x20, 0x00]);
    }

    #[test]
    fn unknown_hid_request_stalls_without_side_effects() {
        let mut handler = handler();
        let (runtime, file) = runtime_with_ep0(b"");

        let setup = class_setup(0x7F, false, 0, 0);
        assert_eq!(
            handler.on_setup(&runtime, &setup).unwrap(),
            SetupFlow::Handled
        );
        assert!(std::fs::read(file.path()).unwrap().is_empty());
        assert!(handler.reports.is_empty());
    }

    #[test]
    fn vendor_requests_fall_through() {
        let mut handler = handler();
        let (runtime, _file) = runtime_with_ep0(b"");
        let setup = SetupPacket {
            bm_request_type: 0x41,
            b_request: 0x01,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        };
        assert_eq!(
            handler.on_setup(&runtime, &setup).unwrap(),
            SetupFlow::NotHandled
        );
    }

    #[test]
    fn topology_gates_report_io() {
        let config = HidConfig {
            report_descriptor: vec![0x05, 0x01],
            subclass: HidSubclass::None,
            protocol: HidInterfaceProtocol::None,
            layout: HidLayout::InputOnly {
                poll_ms: 8,
                max_packet_size: 14,
            },
            speeds: vec![Speed::Full, Speed::High],
            strings: BTreeMap::new(),
        };
        let function = HidFunction::new("gamepad", config).unwrap();
        assert_eq!(function.configfs_name(), "ffs.gamepad");
        // No OUT endpoint in this topology.
        assert!(matches!(
            function.stream_reports(),
            Err(Error::Unsupported(_))
        ));
        // IN endpoint exists in the topology but is not opened before
        // prepare.
        assert!(function.send_report(&[0; 4]).is_err());
    }

    #[test]
    fn empty_report_descriptor_is_rejected() {
        let config = HidConfig {
            report_descriptor: Vec::new(),
            subclass: HidSubclass::None,
            protocol: HidInterfaceProtocol::None,
            layout: HidLayout::InputOnly {
                poll_ms: 8,
                max_packet_size: 14,
            },
            speeds: vec![Speed::Full],
            strings: BTreeMap::new(),
        };
        assert!(HidFunction::new("gamepad", config).is_err());
    }

    #[test]
    fn enable_hook_logs_missing_endpoint() {
        let mut handler = handler();
        let (runtime, _file) = runtime_with_ep0(b"");
        // Must not panic even though no endpoints are registered.
        handler.on_enable(&runtime);

        let in_file = tempfile::NamedTempFile::new().unwrap();
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let ep =
            InEndpoint::open(in_file.path(), addr, EndpointConfig::interrupt(8, 14)).unwrap();
        runtime.insert_endpoint(DataEndpoint::In(Arc::new(ep)));
        handler.on_enable(&runtime);
    }
}

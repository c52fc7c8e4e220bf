//! Typed USB descriptors and control-request primitives.
//!
//! Every descriptor serializes to the exact byte layout the USB specification
//! mandates; multi-byte fields are little-endian.

pub mod hid;
pub mod template;

use packed_struct::prelude::*;

use crate::error::{Error, Result};

/// Descriptor type codes (bDescriptorType).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Interface = 0x04,
    Endpoint = 0x05,
    InterfaceAssociation = 0x0B,
    Hid = 0x21,
    HidReport = 0x22,
    SsEndpointCompanion = 0x30,
    SspIsocEndpointCompanion = 0x31,
}

/// USB bus speeds a FunctionFS function can publish descriptors for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Speed {
    Full,
    High,
    Super,
    SuperPlus,
}

impl Speed {
    /// All speeds, in the order FunctionFS expects descriptor sets.
    pub const ALL: [Speed; 4] = [Speed::Full, Speed::High, Speed::Super, Speed::SuperPlus];
}

/// Transfer direction relative to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Address of an endpoint: number 0..=15 plus direction, serialized with the
/// direction in bit 7.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    number: u8,
    direction: Direction,
}

impl EndpointAddress {
    /// Create an address; endpoint numbers above 15 are rejected.
    pub fn new(number: u8, direction: Direction) -> Result<Self> {
        if number > 0x0F {
            return Err(Error::InvalidConfig(format!(
                "endpoint number {number} out of range 0..=15"
            )));
        }
        Ok(EndpointAddress { number, direction })
    }

    pub const fn number(&self) -> u8 {
        self.number
    }

    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Wire encoding: `0x80 | number` for IN, `number` for OUT.
    pub const fn to_byte(&self) -> u8 {
        match self.direction {
            Direction::In => 0x80 | self.number,
            Direction::Out => self.number,
        }
    }

    /// Decode a wire address byte.
    pub fn from_byte(byte: u8) -> Self {
        let direction = if byte & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        EndpointAddress {
            number: byte & 0x0F,
            direction,
        }
    }
}

/// Endpoint transfer types, encoded in the low two bits of `bmAttributes`.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Synchronization type of an isochronous endpoint (bmAttributes bits 2..3).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoSync {
    None = 0,
    Asynchronous = 1,
    Adaptive = 2,
    Synchronous = 3,
}

/// Usage type of an isochronous endpoint (bmAttributes bits 4..5).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoUsage {
    Data = 0,
    Feedback = 1,
    ImplicitFeedback = 2,
}

/// Per-endpoint transfer configuration. Packet size and interval are
/// optional; speed-appropriate defaults are substituted when generating
/// concrete descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub transfer_type: TransferType,
    /// Desired polling interval in milliseconds, for periodic endpoints.
    pub poll_interval_ms: Option<u8>,
    /// Desired maximum packet size; validated against per-speed limits.
    pub max_packet_size: Option<u16>,
    pub iso_sync: Option<IsoSync>,
    pub iso_usage: Option<IsoUsage>,
}

impl EndpointConfig {
    pub fn new(transfer_type: TransferType) -> Self {
        EndpointConfig {
            transfer_type,
            poll_interval_ms: None,
            max_packet_size: None,
            iso_sync: None,
            iso_usage: None,
        }
    }

    pub fn interrupt(poll_interval_ms: u8, max_packet_size: u16) -> Self {
        EndpointConfig {
            transfer_type: TransferType::Interrupt,
            poll_interval_ms: Some(poll_interval_ms),
            max_packet_size: Some(max_packet_size),
            iso_sync: None,
            iso_usage: None,
        }
    }

    pub fn bulk() -> Self {
        Self::new(TransferType::Bulk)
    }

    /// The `bmAttributes` byte: transfer type in bits 0..1, iso sync and
    /// usage in bits 2..5.
    pub fn attributes(&self) -> u8 {
        let mut attrs = self.transfer_type as u8;
        if self.transfer_type == TransferType::Isochronous {
            attrs |= (self.iso_sync.unwrap_or(IsoSync::None) as u8) << 2;
            attrs |= (self.iso_usage.unwrap_or(IsoUsage::Data) as u8) << 4;
        }
        attrs
    }
}

/// Request kind carried in bits 5..6 of `bmRequestType`.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Request recipient carried in bits 0..4 of `bmRequestType`.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes (bRequest) handled by the function runtime.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Feature selector of SET_FEATURE/CLEAR_FEATURE for endpoint halt.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// The 8-byte header of a USB control transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(buf: &[u8; 8]) -> Self {
        SetupPacket {
            bm_request_type: buf[0],
            b_request: buf[1],
            w_value: u16::from_le_bytes([buf[2], buf[3]]),
            w_index: u16::from_le_bytes([buf[4], buf[5]]),
            w_length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.bm_request_type;
        buf[1] = self.b_request;
        buf[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        buf[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        buf
    }

    /// Transfer direction of the data phase.
    pub fn direction(&self) -> Direction {
        if self.bm_request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Decoded request kind; `Reserved` requests must be stalled.
    pub fn kind(&self) -> RequestKind {
        RequestKind::from_primitive((self.bm_request_type >> 5) & 0x03)
            .unwrap_or(RequestKind::Reserved)
    }

    /// Decoded recipient. Reserved recipient values yield `None`.
    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_primitive(self.bm_request_type & 0x1F)
    }

    /// Decoded standard request code, when the kind is standard.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        StandardRequest::from_primitive(self.b_request)
    }
}

/// The Interface Descriptor announces one interface of the function:
/// its number, class triple and how many endpoints follow it. 9 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    /// Size of this descriptor in bytes.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Interface Descriptor Type = 4.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// The number of this interface.
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    /// Value used to select an alternate setting for this interface.
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    /// Number of endpoints used by this interface (excluding endpoint zero).
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    /// Class code (assigned by the USB-IF).
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    /// Subclass code (assigned by the USB-IF).
    #[packed_field(bytes = "6")]
    pub b_interface_subclass: u8,
    /// Protocol code (assigned by the USB-IF).
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    /// Index of string descriptor describing this interface.
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, num_endpoints: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        InterfaceDescriptor {
            b_length: 9,
            b_descriptor_type: DescriptorType::Interface as u8,
            b_interface_number: number,
            b_alternate_setting: 0,
            b_num_endpoints: num_endpoints,
            b_interface_class: class,
            b_interface_subclass: subclass,
            b_interface_protocol: protocol,
            i_interface: 0,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// The Endpoint Descriptor in its 7-byte (non-audio) form.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    /// Size of this descriptor in bytes.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Endpoint Descriptor Type = 5.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Endpoint number in bits 3..0, direction in bit 7 (1 = IN).
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    /// Transfer type in bits 1..0; iso sync and usage in bits 5..2.
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    /// Maximum packet size. For high-speed periodic endpoints bits 12..11
    /// carry additional transactions per microframe.
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    /// Polling interval, in frames or an exponent of 125 us units depending
    /// on the operating speed.
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: DescriptorType::Endpoint as u8,
            b_endpoint_address: address,
            bm_attributes: attributes,
            w_max_packet_size: Integer::from_primitive(max_packet_size),
            b_interval: interval,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// The 9-byte audio form of the Endpoint Descriptor, which appends the
/// refresh rate and the address of the synchronization endpoint.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct AudioEndpointDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
    /// Rate feedback refresh, as a power of two of frames.
    #[packed_field(bytes = "7")]
    pub b_refresh: u8,
    /// Address of the endpoint providing synchronization.
    #[packed_field(bytes = "8")]
    pub b_synch_address: u8,
}

impl AudioEndpointDescriptor {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// SuperSpeed Endpoint Companion Descriptor, 6 bytes, following each
/// endpoint descriptor in SuperSpeed descriptor sets.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "6")]
pub struct SsEndpointCompanion {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Companion Descriptor Type = 0x30.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Maximum number of packets per burst minus one.
    #[packed_field(bytes = "2")]
    pub b_max_burst: u8,
    /// Bulk: streams; isochronous: mult. Zero for a single packet per
    /// service interval.
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    /// Bytes transferred per service interval (periodic endpoints).
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_bytes_per_interval: Integer<u16, packed_bits::Bits<16>>,
}

impl SsEndpointCompanion {
    /// Companion for a single packet per burst.
    pub fn single_packet(bytes_per_interval: u16) -> Self {
        SsEndpointCompanion {
            b_length: 6,
            b_descriptor_type: DescriptorType::SsEndpointCompanion as u8,
            b_max_burst: 0,
            bm_attributes: 0,
            w_bytes_per_interval: Integer::from_primitive(bytes_per_interval),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// SuperSpeedPlus Isochronous Endpoint Companion Descriptor, 8 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SspIsocEndpointCompanion {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Companion Descriptor Type = 0x31.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Reserved, must be zero.
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_reserved: Integer<u16, packed_bits::Bits<16>>,
    /// Bytes transferred per service interval.
    #[packed_field(bytes = "4..=7", endian = "lsb")]
    pub dw_bytes_per_interval: Integer<u32, packed_bits::Bits<32>>,
}

impl SspIsocEndpointCompanion {
    pub fn new(bytes_per_interval: u32) -> Self {
        SspIsocEndpointCompanion {
            b_length: 8,
            b_descriptor_type: DescriptorType::SspIsocEndpointCompanion as u8,
            w_reserved: Integer::from_primitive(0),
            dw_bytes_per_interval: Integer::from_primitive(bytes_per_interval),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// Interface Association Descriptor, grouping several interfaces into one
/// function. 8 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct InterfaceAssociationDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Interface Association Descriptor Type = 0x0B.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// First interface number of the association.
    #[packed_field(bytes = "2")]
    pub b_first_interface: u8,
    /// Number of contiguous interfaces associated.
    #[packed_field(bytes = "3")]
    pub b_interface_count: u8,
    #[packed_field(bytes = "4")]
    pub b_function_class: u8,
    #[packed_field(bytes = "5")]
    pub b_function_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_function_protocol: u8,
    /// Index of string descriptor describing this function.
    #[packed_field(bytes = "7")]
    pub i_function: u8,
}

impl InterfaceAssociationDescriptor {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.pack_to_vec()?)
    }
}

/// Raw class-specific descriptor carried verbatim into every speed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDescriptor {
    pub descriptor_type: u8,
    /// Payload without the leading length and type bytes.
    pub data: Vec<u8>,
}

impl CustomDescriptor {
    pub fn new(descriptor_type: u8, data: Vec<u8>) -> Self {
        CustomDescriptor {
            descriptor_type,
            data,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        let len = self.data.len() + 2;
        if len > u8::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "custom descriptor payload of {} bytes does not fit",
                self.data.len()
            )));
        }
        let mut out = Vec::with_capacity(len);
        out.push(len as u8);
        out.push(self.descriptor_type);
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// One entry of a FunctionFS function's descriptor declaration. Endpoint
/// entries are templates materialized per speed; everything else is emitted
/// verbatim into every speed set.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    InterfaceAssociation(InterfaceAssociationDescriptor),
    Hid(hid::HidDescriptor),
    Endpoint(template::EndpointTemplate),
    Custom(CustomDescriptor),
}

impl From<InterfaceDescriptor> for Descriptor {
    fn from(value: InterfaceDescriptor) -> Self {
        Descriptor::Interface(value)
    }
}

impl From<InterfaceAssociationDescriptor> for Descriptor {
    fn from(value: InterfaceAssociationDescriptor) -> Self {
        Descriptor::InterfaceAssociation(value)
    }
}

impl From<hid::HidDescriptor> for Descriptor {
    fn from(value: hid::HidDescriptor) -> Self {
        Descriptor::Hid(value)
    }
}

impl From<template::EndpointTemplate> for Descriptor {
    fn from(value: template::EndpointTemplate) -> Self {
        Descriptor::Endpoint(value)
    }
}

impl From<CustomDescriptor> for Descriptor {
    fn from(value: CustomDescriptor) -> Self {
        Descriptor::Custom(value)
    }
}

//! HID (Human Interface Device) descriptors and class requests
//! https://www.usb.org/sites/default/files/hid1_11.pdf

use packed_struct::prelude::*;

use crate::error::{Error, Result};

/// HID interface class code.
pub const HID_INTERFACE_CLASS: u8 = 0x03;

/// HID class specification release published in the HID descriptor.
pub const BCD_HID: u16 = 0x0111;

/// HID class-specific descriptor types (wValue high byte of GET_DESCRIPTOR).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidDescriptorType {
    Hid = 0x21,
    Report = 0x22,
    Physical = 0x23,
}

/// HID class-specific request codes (bRequest).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidRequest {
    /// The Get_Report request allows the host to receive a report via the
    /// Control pipe.
    GetReport = 0x01,
    /// The Get_Idle request reads the current idle rate for a particular
    /// Input report.
    GetIdle = 0x02,
    /// The Get_Protocol request reads which protocol is currently active
    /// (either the boot protocol or the report protocol).
    GetProtocol = 0x03,
    /// The Set_Report request allows the host to send a report to the
    /// device, possibly setting the state of input, output, or feature
    /// controls.
    SetReport = 0x09,
    /// The Set_Idle request silences a particular report on the Interrupt
    /// In pipe until a new event occurs or the specified amount of time
    /// passes.
    SetIdle = 0x0A,
    /// The Set_Protocol switches between the boot protocol and the report
    /// protocol (or vice versa).
    SetProtocol = 0x0B,
}

/// Report kinds addressed by GET_REPORT/SET_REPORT (wValue high byte).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HidReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

/// Subclass codes for HID interfaces.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidSubclass {
    None = 0x00,
    Boot = 0x01,
}

/// Interface protocols for HID boot devices. Only meaningful when the
/// subclass declares boot support, otherwise `None`.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidInterfaceProtocol {
    None = 0x00,
    Keyboard = 0x01,
    Mouse = 0x02,
}

/// Protocol modes reported by GET_PROTOCOL and selected by SET_PROTOCOL.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum HidProtocolMode {
    Boot = 0,
    Report = 1,
}

/// Fixed 6-byte head of the HID descriptor; subordinate descriptor entries
/// follow it on the wire.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "6")]
pub struct HidDescriptorHeader {
    /// Total size of the HID descriptor including subordinate entries.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// HID Descriptor Type = 0x21.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// HID Class Specification release in binary-coded decimal.
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_hid: Integer<u16, packed_bits::Bits<16>>,
    /// Country code of the localized hardware, 0 when not localized.
    #[packed_field(bytes = "4")]
    pub b_country_code: u8,
    /// Number of subordinate class descriptors (at least the report
    /// descriptor).
    #[packed_field(bytes = "5")]
    pub b_num_descriptors: u8,
}

/// One subordinate entry of the HID descriptor: the type and total length
/// of a class descriptor retrievable with GET_DESCRIPTOR.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "3")]
pub struct HidSubordinateDescriptor {
    #[packed_field(bytes = "0", ty = "enum")]
    pub b_descriptor_type: HidDescriptorType,
    #[packed_field(bytes = "1..=2", endian = "lsb")]
    pub w_descriptor_length: Integer<u16, packed_bits::Bits<16>>,
}

/// Complete HID descriptor: header plus one or two subordinate entries,
/// 9 or 12 bytes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HidDescriptor {
    pub header: HidDescriptorHeader,
    pub subordinates: Vec<HidSubordinateDescriptor>,
}

impl HidDescriptor {
    /// Descriptor referencing one report descriptor of `report_len` bytes.
    /// A zero report length is rejected.
    pub fn for_report(report_len: u16) -> Result<Self> {
        if report_len == 0 {
            return Err(Error::InvalidConfig(
                "HID report descriptor must not be empty".into(),
            ));
        }
        Ok(HidDescriptor {
            header: HidDescriptorHeader {
                b_length: 9,
                b_descriptor_type: HidDescriptorType::Hid as u8,
                bcd_hid: Integer::from_primitive(BCD_HID),
                b_country_code: 0,
                b_num_descriptors: 1,
            },
            subordinates: vec![HidSubordinateDescriptor {
                b_descriptor_type: HidDescriptorType::Report,
                w_descriptor_length: Integer::from_primitive(report_len),
            }],
        })
    }

    /// Append a subordinate class descriptor entry, growing `b_length` and
    /// `b_num_descriptors` accordingly.
    pub fn push_subordinate(&mut self, descriptor_type: HidDescriptorType, len: u16) {
        self.subordinates.push(HidSubordinateDescriptor {
            b_descriptor_type: descriptor_type,
            w_descriptor_length: Integer::from_primitive(len),
        });
        self.header.b_num_descriptors += 1;
        self.header.b_length += 3;
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut out = self.header.pack_to_vec()?;
        for sub in &self.subordinates {
            out.extend(sub.pack_to_vec()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_descriptor_nine_byte_form() {
        let desc = HidDescriptor::for_report(70).unwrap();
        let bytes = desc.bytes().unwrap();
        assert_eq!(
            bytes,
            vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x46, 0x00]
        );
        assert_eq!(bytes.len(), desc.header.b_length as usize);
    }

    #[test]
    fn hid_descriptor_twelve_byte_form() {
        let mut desc = HidDescriptor::for_report(70).unwrap();
        desc.push_subordinate(HidDescriptorType::Physical, 16);
        let bytes = desc.bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 12);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[9], HidDescriptorType::Physical as u8);
    }

    #[test]
    fn empty_report_descriptor_is_rejected() {
        assert!(HidDescriptor::for_report(0).is_err());
    }

    #[test]
    fn hid_requests_decode_closed() {
        assert_eq!(HidRequest::from_primitive(0x01), Some(HidRequest::GetReport));
        assert_eq!(HidRequest::from_primitive(0x0B), Some(HidRequest::SetProtocol));
        assert_eq!(HidRequest::from_primitive(0x7F), None);
        assert_eq!(HidReportType::from_primitive(0), None);
        assert_eq!(HidReportType::from_primitive(3), Some(HidReportType::Feature));
    }
}

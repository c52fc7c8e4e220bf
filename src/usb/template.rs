//! Speed-aware descriptor generation.
//!
//! A function declares its endpoints once as [`EndpointTemplate`]s; the
//! generator materializes a concrete descriptor set per requested speed,
//! substituting speed-appropriate packet sizes, interval encodings and
//! SuperSpeed companion descriptors.

use super::{
    Descriptor, EndpointAddress, EndpointConfig, EndpointDescriptor, Speed, SsEndpointCompanion,
    TransferType,
};
use crate::error::{Error, Result};

/// A speed-independent endpoint declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTemplate {
    address: EndpointAddress,
    config: EndpointConfig,
}

impl EndpointTemplate {
    /// Declare an endpoint. A zero polling interval is rejected; packet
    /// sizes are checked against the per-speed tables when descriptor sets
    /// are generated and at function construction.
    pub fn new(address: EndpointAddress, config: EndpointConfig) -> Result<Self> {
        if config.poll_interval_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "endpoint polling interval must be at least 1 ms".into(),
            ));
        }
        if address.number() == 0 {
            return Err(Error::InvalidConfig(
                "endpoint 0 is reserved for the control endpoint".into(),
            ));
        }
        Ok(EndpointTemplate { address, config })
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Check the declared packet size against the limits for `speed`.
    pub fn validate_for(&self, speed: Speed) -> Result<()> {
        let Some(size) = self.config.max_packet_size else {
            return Ok(());
        };
        if max_packet_size_allowed(speed, self.config.transfer_type, size) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "max packet size {size} not allowed for {:?} endpoint at {speed:?} speed",
                self.config.transfer_type
            )))
        }
    }

    /// Packet size used at `speed`, falling back to the speed default.
    pub fn max_packet_size(&self, speed: Speed) -> u16 {
        self.config
            .max_packet_size
            .unwrap_or_else(|| default_max_packet_size(speed, self.config.transfer_type))
    }

    /// Concrete descriptor bytes for `speed`: the endpoint descriptor and,
    /// for SuperSpeed and SuperSpeedPlus, the companion descriptor.
    pub fn materialize(&self, speed: Speed) -> Result<Vec<Vec<u8>>> {
        self.validate_for(speed)?;

        let size = self.max_packet_size(speed);
        let interval = interval_for(speed, self.config.transfer_type, self.config.poll_interval_ms);
        let desc =
            EndpointDescriptor::new(self.address.to_byte(), self.config.attributes(), size, interval);

        let mut out = vec![desc.bytes()?];
        if matches!(speed, Speed::Super | Speed::SuperPlus) {
            let bytes_per_interval = match self.config.transfer_type {
                TransferType::Interrupt | TransferType::Isochronous => size & 0x07FF,
                TransferType::Control | TransferType::Bulk => 0,
            };
            out.push(SsEndpointCompanion::single_packet(bytes_per_interval).bytes()?);
        }
        Ok(out)
    }
}

/// Whether `size` is a legal wMaxPacketSize for the transfer type at the
/// given speed.
pub fn max_packet_size_allowed(speed: Speed, transfer: TransferType, size: u16) -> bool {
    match speed {
        Speed::Full => match transfer {
            TransferType::Control | TransferType::Bulk => {
                matches!(size, 8 | 16 | 32 | 64)
            }
            TransferType::Interrupt => size <= 64,
            TransferType::Isochronous => size <= 1023,
        },
        Speed::High => match transfer {
            TransferType::Control => size == 64,
            TransferType::Bulk => size == 512,
            // Periodic endpoints may carry 1..3 transactions per microframe
            // in bits 11..12 on top of a base size of up to 1024.
            TransferType::Interrupt | TransferType::Isochronous => {
                let base = size & 0x07FF;
                let extra = (size >> 11) & 0x03;
                base <= 1024 && extra <= 2 && (size >> 13) == 0
            }
        },
        Speed::Super | Speed::SuperPlus => match transfer {
            TransferType::Control => size == 512,
            TransferType::Bulk => size == 1024,
            TransferType::Interrupt | TransferType::Isochronous => {
                matches!(size, 512 | 1024)
            }
        },
    }
}

/// Default wMaxPacketSize used when the template leaves it unset.
pub fn default_max_packet_size(speed: Speed, transfer: TransferType) -> u16 {
    match speed {
        Speed::Full => match transfer {
            TransferType::Control | TransferType::Bulk | TransferType::Interrupt => 64,
            TransferType::Isochronous => 1023,
        },
        Speed::High => match transfer {
            TransferType::Control => 64,
            TransferType::Bulk => 512,
            TransferType::Interrupt | TransferType::Isochronous => 1024,
        },
        Speed::Super | Speed::SuperPlus => match transfer {
            TransferType::Control => 512,
            _ => 1024,
        },
    }
}

/// Encode the polling interval for the descriptor at the given speed.
///
/// Full speed uses raw frames. High speed and SuperSpeed use an exponent
/// `n` giving `2^(n-1)` microframes (125 us units); the largest exponent
/// not exceeding the requested interval is chosen. Control and bulk
/// endpoints have no polling interval.
pub fn interval_for(speed: Speed, transfer: TransferType, poll_ms: Option<u8>) -> u8 {
    let ms = poll_ms.unwrap_or(1).max(1);
    match (speed, transfer) {
        (_, TransferType::Control) | (_, TransferType::Bulk) => 0,
        (Speed::Full, _) => ms,
        (Speed::High, TransferType::Isochronous) => 1,
        (Speed::High, TransferType::Interrupt)
        | (Speed::Super, _)
        | (Speed::SuperPlus, _) => interval_exponent(ms),
    }
}

/// Exponent encoding of a millisecond interval in 125 us units: the value
/// `n` in 1..=16 such that `2^(n-1)` microframes is the largest power of
/// two not above the request.
fn interval_exponent(ms: u8) -> u8 {
    let microframes = u32::from(ms) * 8;
    let n = 32 - microframes.leading_zeros();
    n.clamp(1, 16) as u8
}

/// A concrete, serialized descriptor sequence for one speed.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    speed: Speed,
    entries: Vec<Vec<u8>>,
}

impl DescriptorSet {
    /// Materialize `descriptors` for `speed`. Non-endpoint entries are
    /// emitted verbatim; endpoint templates become concrete endpoint
    /// descriptors plus SuperSpeed companions where applicable.
    pub fn generate(descriptors: &[Descriptor], speed: Speed) -> Result<Self> {
        let mut entries = Vec::new();
        for desc in descriptors {
            match desc {
                Descriptor::Interface(d) => entries.push(d.bytes()?),
                Descriptor::InterfaceAssociation(d) => entries.push(d.bytes()?),
                Descriptor::Hid(d) => entries.push(d.bytes()?),
                Descriptor::Custom(d) => entries.push(d.bytes()?),
                Descriptor::Endpoint(template) => entries.extend(template.materialize(speed)?),
            }
        }
        Ok(DescriptorSet { speed, entries })
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Number of descriptors in the set, companions included.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Total byte length of the serialized set.
    pub fn total_length(&self) -> usize {
        self.entries.iter().map(Vec::len).sum()
    }

    /// Concatenated descriptor bytes in declaration order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length());
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
        out
    }
}

/// Structural validation of a declaration list: at least one interface,
/// interface numbers dense from zero, and each interface's endpoint count
/// matching the templates that follow it.
pub fn validate_descriptors(descriptors: &[Descriptor]) -> Result<()> {
    let mut interface_numbers = Vec::new();
    let mut current: Option<(u8, u8, u8)> = None; // number, declared, seen

    let mut check_complete = |current: &Option<(u8, u8, u8)>| -> Result<()> {
        if let Some((number, declared, seen)) = current {
            if declared != seen {
                return Err(Error::InvalidConfig(format!(
                    "interface {number} declares {declared} endpoints but {seen} follow it"
                )));
            }
        }
        Ok(())
    };

    for desc in descriptors {
        match desc {
            Descriptor::Interface(iface) => {
                check_complete(&current)?;
                interface_numbers.push(iface.b_interface_number);
                current = Some((iface.b_interface_number, iface.b_num_endpoints, 0));
            }
            Descriptor::Endpoint(_) => match current.as_mut() {
                Some((_, _, seen)) => *seen += 1,
                None => {
                    return Err(Error::InvalidConfig(
                        "endpoint declared before any interface".into(),
                    ))
                }
            },
            _ => {}
        }
    }
    check_complete(&current)?;

    if interface_numbers.is_empty() {
        return Err(Error::InvalidConfig(
            "descriptor list contains no interface".into(),
        ));
    }
    let mut sorted = interface_numbers.clone();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != interface_numbers.len() {
        return Err(Error::InvalidConfig("duplicate interface numbers".into()));
    }
    for (i, number) in sorted.iter().enumerate() {
        if *number != i as u8 {
            return Err(Error::InvalidConfig(format!(
                "interface numbers must be dense from 0, found {number}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{hid::HidDescriptor, Direction, InterfaceDescriptor};

    fn gamepad_descriptors() -> Vec<Descriptor> {
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        vec![
            InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
            HidDescriptor::for_report(70).unwrap().into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 14))
                .unwrap()
                .into(),
        ]
    }

    #[test]
    fn full_speed_gamepad_set() {
        let set = DescriptorSet::generate(&gamepad_descriptors(), Speed::Full).unwrap();
        assert_eq!(set.count(), 3);
        let bytes = set.to_bytes();
        let expected: Vec<u8> = [
            vec![0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00],
            vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x46, 0x00],
            vec![0x07, 0x05, 0x81, 0x03, 0x0E, 0x00, 0x08],
        ]
        .concat();
        assert_eq!(bytes, expected);
        assert_eq!(set.total_length(), expected.len());
    }

    #[test]
    fn high_speed_substitutes_interval_exponent() {
        let set = DescriptorSet::generate(&gamepad_descriptors(), Speed::High).unwrap();
        let bytes = set.to_bytes();
        // 8 ms is 64 microframes, encoded as exponent 7.
        assert_eq!(&bytes[bytes.len() - 7..], &[0x07, 0x05, 0x81, 0x03, 0x0E, 0x00, 0x07]);
    }

    #[test]
    fn super_speed_appends_companion() {
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let descriptors: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 1024))
                .unwrap()
                .into(),
        ];
        let set = DescriptorSet::generate(&descriptors, Speed::Super).unwrap();
        assert_eq!(set.count(), 3);
        let bytes = set.to_bytes();
        let companion = &bytes[bytes.len() - 6..];
        assert_eq!(companion[0], 6);
        assert_eq!(companion[1], 0x30);
        assert_eq!(u16::from_le_bytes([companion[4], companion[5]]), 1024);
    }

    #[test]
    fn every_entry_carries_its_own_length() {
        for speed in Speed::ALL {
            let descriptors = if speed == Speed::Super || speed == Speed::SuperPlus {
                // Sized for SuperSpeed limits.
                let addr = EndpointAddress::new(1, Direction::In).unwrap();
                vec![
                    InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
                    EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 1024))
                        .unwrap()
                        .into(),
                ]
            } else {
                gamepad_descriptors()
            };
            let set = DescriptorSet::generate(&descriptors, speed).unwrap();
            for entry in &set.entries {
                assert_eq!(entry[0] as usize, entry.len());
            }
            assert_eq!(
                set.total_length(),
                set.entries.iter().map(|e| e[0] as usize).sum::<usize>()
            );
        }
    }

    #[test]
    fn packet_size_tables() {
        use TransferType::*;
        assert!(max_packet_size_allowed(Speed::Full, Control, 64));
        assert!(!max_packet_size_allowed(Speed::Full, Control, 48));
        assert!(!max_packet_size_allowed(Speed::Full, Bulk, 512));
        assert!(max_packet_size_allowed(Speed::Full, Interrupt, 0));
        assert!(!max_packet_size_allowed(Speed::Full, Interrupt, 65));
        assert!(max_packet_size_allowed(Speed::Full, Isochronous, 1023));
        assert!(!max_packet_size_allowed(Speed::Full, Isochronous, 1024));

        assert!(max_packet_size_allowed(Speed::High, Bulk, 512));
        assert!(!max_packet_size_allowed(Speed::High, Bulk, 64));
        assert!(max_packet_size_allowed(Speed::High, Isochronous, 1024));
        // Two additional transactions per microframe.
        assert!(max_packet_size_allowed(Speed::High, Isochronous, (2 << 11) | 1024));
        assert!(!max_packet_size_allowed(Speed::High, Isochronous, (3 << 11) | 8));

        assert!(max_packet_size_allowed(Speed::Super, Bulk, 1024));
        assert!(!max_packet_size_allowed(Speed::Super, Bulk, 512));
        assert!(max_packet_size_allowed(Speed::Super, Interrupt, 512));
        assert!(!max_packet_size_allowed(Speed::Super, Interrupt, 64));
    }

    #[test]
    fn oversized_template_fails_generation() {
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let template = EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 512)).unwrap();
        assert!(template.validate_for(Speed::Full).is_err());
        assert!(template.validate_for(Speed::High).is_ok());
        assert!(template.materialize(Speed::Full).is_err());
    }

    #[test]
    fn interval_encodings() {
        use TransferType::*;
        assert_eq!(interval_for(Speed::Full, Interrupt, Some(8)), 8);
        assert_eq!(interval_for(Speed::Full, Isochronous, Some(255)), 255);
        assert_eq!(interval_for(Speed::High, Isochronous, Some(8)), 1);
        assert_eq!(interval_for(Speed::High, Interrupt, Some(1)), 4);
        assert_eq!(interval_for(Speed::High, Interrupt, Some(8)), 7);
        assert_eq!(interval_for(Speed::Super, Interrupt, Some(8)), 7);
        assert_eq!(interval_for(Speed::Super, Bulk, Some(8)), 0);
        assert_eq!(interval_for(Speed::High, Control, None), 0);
    }

    #[test]
    fn descriptor_list_validation() {
        assert!(validate_descriptors(&gamepad_descriptors()).is_ok());

        // Endpoint count mismatch.
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let bad: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(0, 2, 0x03, 0, 0).into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 14))
                .unwrap()
                .into(),
        ];
        assert!(validate_descriptors(&bad).is_err());

        // Interface numbers not dense.
        let bad: Vec<Descriptor> = vec![InterfaceDescriptor::new(1, 0, 0x03, 0, 0).into()];
        assert!(validate_descriptors(&bad).is_err());

        // No interface at all.
        assert!(validate_descriptors(&[]).is_err());
    }
}

//! FunctionFS wire formats: the descriptors and strings blobs written to
//! EP0 after opening it, and the 12-byte events read back from it.

use std::collections::BTreeMap;

use bitflags::bitflags;
use byteorder::{WriteBytesExt, LE};

use crate::{
    error::{Error, Result},
    usb::{template::DescriptorSet, SetupPacket, Speed},
};

bitflags! {
    /// Flags word of the v2 descriptors blob. The low four bits announce
    /// which speed sets are present; the upper bits select optional
    /// FunctionFS behaviors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FfsFlags: u32 {
        const HAS_FS_DESC = 1 << 0;
        const HAS_HS_DESC = 1 << 1;
        const HAS_SS_DESC = 1 << 2;
        const HAS_SSP_DESC = 1 << 3;
        /// Endpoint addresses in descriptors are virtual and remapped by
        /// the kernel.
        const VIRTUAL_ADDR = 1 << 4;
        /// Deliver all control requests to EP0, not only those the kernel
        /// cannot handle.
        const ALL_CTRL_RECIP = 1 << 5;
        /// Deliver setup events while the device is unconfigured.
        const CONFIG0_SETUP = 1 << 6;
    }
}

impl FfsFlags {
    /// The flag bit announcing a descriptor set for `speed`.
    pub fn for_speed(speed: Speed) -> FfsFlags {
        match speed {
            Speed::Full => FfsFlags::HAS_FS_DESC,
            Speed::High => FfsFlags::HAS_HS_DESC,
            Speed::Super => FfsFlags::HAS_SS_DESC,
            Speed::SuperPlus => FfsFlags::HAS_SSP_DESC,
        }
    }
}

/// The descriptors blob: a header followed by per-speed counts and the
/// concatenated descriptor bytes of each present speed.
#[derive(Debug, Clone)]
pub struct DescriptorBlob {
    extra_flags: FfsFlags,
    sets: Vec<DescriptorSet>,
}

impl DescriptorBlob {
    /// Magic of the v2 format.
    pub const MAGIC_V2: u32 = 0x0000_0003;
    /// Magic of the legacy v1 format.
    pub const MAGIC_V1: u32 = 0x0000_0001;

    /// Assemble a blob from generated descriptor sets. `extra_flags` may
    /// carry behavior bits; speed presence bits are recomputed from the
    /// sets themselves.
    pub fn new(sets: Vec<DescriptorSet>, extra_flags: FfsFlags) -> Result<Self> {
        let mut seen = FfsFlags::empty();
        for set in &sets {
            let bit = FfsFlags::for_speed(set.speed());
            if seen.contains(bit) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate descriptor set for {:?} speed",
                    set.speed()
                )));
            }
            seen.insert(bit);
        }
        if sets.is_empty() {
            return Err(Error::InvalidConfig(
                "descriptors blob requires at least one speed set".into(),
            ));
        }
        Ok(DescriptorBlob {
            extra_flags: extra_flags - Self::speed_mask(),
            sets,
        })
    }

    fn speed_mask() -> FfsFlags {
        FfsFlags::HAS_FS_DESC | FfsFlags::HAS_HS_DESC | FfsFlags::HAS_SS_DESC | FfsFlags::HAS_SSP_DESC
    }

    /// The complete flags word: computed speed bits plus behavior bits.
    pub fn flags(&self) -> FfsFlags {
        let mut flags = self.extra_flags;
        for set in &self.sets {
            flags.insert(FfsFlags::for_speed(set.speed()));
        }
        flags
    }

    fn set_for(&self, speed: Speed) -> Option<&DescriptorSet> {
        self.sets.iter().find(|s| s.speed() == speed)
    }

    /// Serialize in the v2 format: magic, total length, flags, one u32
    /// count per present speed, then the descriptor data per speed, all in
    /// FS/HS/SS/SSP order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.write_u32::<LE>(Self::MAGIC_V2)?;
        data.write_u32::<LE>(0)?; // length, backpatched below
        data.write_u32::<LE>(self.flags().bits())?;

        for speed in Speed::ALL {
            if let Some(set) = self.set_for(speed) {
                data.write_u32::<LE>(count_u32(set)?)?;
            }
        }
        for speed in Speed::ALL {
            if let Some(set) = self.set_for(speed) {
                data.extend(set.to_bytes());
            }
        }

        patch_length(&mut data)?;
        Ok(data)
    }

    /// Serialize in the legacy v1 format understood by older kernels:
    /// magic, total length, then fixed FS/HS/SS counts and data. A
    /// SuperSpeedPlus set cannot be represented.
    pub fn to_bytes_legacy(&self) -> Result<Vec<u8>> {
        if self.set_for(Speed::SuperPlus).is_some() {
            return Err(Error::InvalidConfig(
                "legacy descriptors format cannot carry SuperSpeedPlus descriptors".into(),
            ));
        }

        let mut data = Vec::new();
        data.write_u32::<LE>(Self::MAGIC_V1)?;
        data.write_u32::<LE>(0)?;
        for speed in [Speed::Full, Speed::High, Speed::Super] {
            match self.set_for(speed) {
                Some(set) => data.write_u32::<LE>(count_u32(set)?)?,
                None => data.write_u32::<LE>(0)?,
            }
        }
        for speed in [Speed::Full, Speed::High, Speed::Super] {
            if let Some(set) = self.set_for(speed) {
                data.extend(set.to_bytes());
            }
        }

        patch_length(&mut data)?;
        Ok(data)
    }
}

fn count_u32(set: &DescriptorSet) -> Result<u32> {
    u32::try_from(set.count())
        .map_err(|_| Error::InvalidConfig("too many descriptor entries".into()))
}

fn patch_length(data: &mut [u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::InvalidConfig("descriptor blob too large".into()))?;
    data[4..8].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// The strings blob: UTF-8 string tables keyed by USB language id. Every
/// language must contribute the same number of strings.
#[derive(Debug, Clone, Default)]
pub struct StringsBlob {
    languages: BTreeMap<u16, Vec<String>>,
}

impl StringsBlob {
    pub const MAGIC: u32 = 0x0000_0002;

    pub fn new(languages: BTreeMap<u16, Vec<String>>) -> Result<Self> {
        let blob = StringsBlob { languages };
        blob.strings_per_language()?;
        Ok(blob)
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() || self.languages.values().all(Vec::is_empty)
    }

    /// The common string count, validated across languages.
    pub fn strings_per_language(&self) -> Result<usize> {
        let count = self
            .languages
            .values()
            .next()
            .map(Vec::len)
            .unwrap_or_default();
        if self.languages.values().any(|v| v.len() != count) {
            return Err(Error::StringsDifferAcrossLanguages);
        }
        Ok(count)
    }

    /// Serialize: magic, total length, strings per language, language
    /// count, then per language the id and the NUL-terminated strings.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let str_count = self.strings_per_language()?;

        let mut data = Vec::new();
        data.write_u32::<LE>(Self::MAGIC)?;
        data.write_u32::<LE>(0)?;
        data.write_u32::<LE>(str_count as u32)?;
        data.write_u32::<LE>(self.languages.len() as u32)?;

        for (lang, strings) in &self.languages {
            data.write_u16::<LE>(*lang)?;
            for string in strings {
                data.extend_from_slice(string.as_bytes());
                data.write_u8(0)?;
            }
        }

        patch_length(&mut data)?;
        Ok(data)
    }
}

/// Control-plane events delivered by the kernel on EP0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    Bind,
    Unbind,
    Enable,
    Disable,
    Setup(SetupPacket),
    Suspend,
    Resume,
}

impl Event {
    /// Size of one raw event.
    pub const SIZE: usize = 12;

    const TYPE_BIND: u8 = 0;
    const TYPE_UNBIND: u8 = 1;
    const TYPE_ENABLE: u8 = 2;
    const TYPE_DISABLE: u8 = 3;
    const TYPE_SETUP: u8 = 4;
    const TYPE_SUSPEND: u8 = 5;
    const TYPE_RESUME: u8 = 6;

    /// Decode one 12-byte frame. Unknown event types yield `None` and are
    /// skipped by callers.
    pub fn parse(buf: &[u8; Event::SIZE]) -> Option<Event> {
        match buf[8] {
            Self::TYPE_BIND => Some(Event::Bind),
            Self::TYPE_UNBIND => Some(Event::Unbind),
            Self::TYPE_ENABLE => Some(Event::Enable),
            Self::TYPE_DISABLE => Some(Event::Disable),
            Self::TYPE_SETUP => {
                let mut setup = [0u8; 8];
                setup.copy_from_slice(&buf[..8]);
                Some(Event::Setup(SetupPacket::from_bytes(&setup)))
            }
            Self::TYPE_SUSPEND => Some(Event::Suspend),
            Self::TYPE_RESUME => Some(Event::Resume),
            _ => None,
        }
    }

    /// Encode to the 12-byte wire frame. Only setup events carry payload;
    /// the trailing three bytes are padding.
    pub fn to_bytes(&self) -> [u8; Event::SIZE] {
        let mut buf = [0u8; Event::SIZE];
        match self {
            Event::Bind => buf[8] = Self::TYPE_BIND,
            Event::Unbind => buf[8] = Self::TYPE_UNBIND,
            Event::Enable => buf[8] = Self::TYPE_ENABLE,
            Event::Disable => buf[8] = Self::TYPE_DISABLE,
            Event::Setup(setup) => {
                buf[..8].copy_from_slice(&setup.to_bytes());
                buf[8] = Self::TYPE_SETUP;
            }
            Event::Suspend => buf[8] = Self::TYPE_SUSPEND,
            Event::Resume => buf[8] = Self::TYPE_RESUME,
        }
        buf
    }
}

/// Split a raw EP0 read into events. The buffer must be a whole number of
/// 12-byte frames; frames with unknown type bytes are skipped.
pub fn parse_events(buf: &[u8]) -> Result<Vec<Event>> {
    if buf.len() % Event::SIZE != 0 {
        return Err(Error::Protocol(format!(
            "event buffer of {} bytes is not a multiple of {}",
            buf.len(),
            Event::SIZE
        )));
    }
    let mut events = Vec::with_capacity(buf.len() / Event::SIZE);
    for frame in buf.chunks_exact(Event::SIZE) {
        let mut raw = [0u8; Event::SIZE];
        raw.copy_from_slice(frame);
        match Event::parse(&raw) {
            Some(event) => events.push(event),
            None => log::debug!("skipping unknown ep0 event type {}", raw[8]),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{
        hid::HidDescriptor,
        template::{DescriptorSet, EndpointTemplate},
        Descriptor, Direction, EndpointAddress, EndpointConfig, InterfaceDescriptor,
    };

    fn gamepad_sets(speeds: &[Speed]) -> Vec<DescriptorSet> {
        let addr = EndpointAddress::new(1, Direction::In).unwrap();
        let descriptors: Vec<Descriptor> = vec![
            InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
            HidDescriptor::for_report(70).unwrap().into(),
            EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 14))
                .unwrap()
                .into(),
        ];
        speeds
            .iter()
            .map(|s| DescriptorSet::generate(&descriptors, *s).unwrap())
            .collect()
    }

    #[test]
    fn v2_blob_matches_reference_layout() {
        let sets = gamepad_sets(&[Speed::Full, Speed::High]);
        let blob = DescriptorBlob::new(sets, FfsFlags::empty()).unwrap();
        let bytes = blob.to_bytes().unwrap();

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 3);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize,
            bytes.len()
        );
        // FS and HS flags only.
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0x03);
        // Three descriptors per speed.
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 3);

        let fs = &bytes[20..20 + 25];
        assert_eq!(&fs[..9], &[0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(&fs[9..18], &[0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x46, 0x00]);
        assert_eq!(&fs[18..], &[0x07, 0x05, 0x81, 0x03, 0x0E, 0x00, 0x08]);

        let hs = &bytes[20 + 25..];
        assert_eq!(hs.len(), 25);
        assert_eq!(&hs[18..], &[0x07, 0x05, 0x81, 0x03, 0x0E, 0x00, 0x07]);
    }

    #[test]
    fn behavior_flags_are_carried() {
        let sets = gamepad_sets(&[Speed::Full]);
        let blob = DescriptorBlob::new(sets, FfsFlags::ALL_CTRL_RECIP).unwrap();
        assert_eq!(blob.flags(), FfsFlags::HAS_FS_DESC | FfsFlags::ALL_CTRL_RECIP);
    }

    #[test]
    fn duplicate_speed_sets_are_rejected() {
        let sets = gamepad_sets(&[Speed::Full, Speed::Full]);
        assert!(DescriptorBlob::new(sets, FfsFlags::empty()).is_err());
    }

    #[test]
    fn legacy_blob_layout() {
        let sets = gamepad_sets(&[Speed::Full, Speed::High]);
        let blob = DescriptorBlob::new(sets, FfsFlags::empty()).unwrap();
        let bytes = blob.to_bytes_legacy().unwrap();

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize,
            bytes.len()
        );
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 0);
    }

    #[test]
    fn strings_blob_layout() {
        let mut languages = BTreeMap::new();
        languages.insert(0x0409u16, vec!["Simple Gamepad".to_string()]);
        let blob = StringsBlob::new(languages).unwrap();
        let bytes = blob.to_bytes().unwrap();

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize,
            bytes.len()
        );
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(bytes[16..18].try_into().unwrap()), 0x0409);
        assert_eq!(&bytes[18..], b"Simple Gamepad\0");
    }

    #[test]
    fn mismatched_string_counts_are_rejected() {
        let mut languages = BTreeMap::new();
        languages.insert(0x0409u16, vec!["a".to_string(), "b".to_string()]);
        languages.insert(0x0407u16, vec!["a".to_string()]);
        assert!(matches!(
            StringsBlob::new(languages),
            Err(Error::StringsDifferAcrossLanguages)
        ));
    }

    #[test]
    fn event_round_trip() {
        let events = [
            Event::Bind,
            Event::Unbind,
            Event::Enable,
            Event::Disable,
            Event::Setup(SetupPacket {
                bm_request_type: 0x82,
                b_request: 0x00,
                w_value: 0,
                w_index: 0x0081,
                w_length: 2,
            }),
            Event::Suspend,
            Event::Resume,
        ];
        for event in events {
            let bytes = event.to_bytes();
            assert_eq!(Event::parse(&bytes), Some(event));
        }
    }

    #[test]
    fn unknown_events_are_skipped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&Event::Enable.to_bytes());
        let mut unknown = [0u8; Event::SIZE];
        unknown[8] = 0x7F;
        buf.extend_from_slice(&unknown);
        buf.extend_from_slice(&Event::Disable.to_bytes());

        let events = parse_events(&buf).unwrap();
        assert_eq!(events, vec![Event::Enable, Event::Disable]);
    }

    #[test]
    fn misaligned_event_buffer_is_an_error() {
        assert!(parse_events(&[0u8; 13]).is_err());
    }
}

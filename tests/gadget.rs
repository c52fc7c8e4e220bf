//! Integration tests of the public API. Tests marked `#[ignore]` need a
//! real UDC, root privileges and a kernel with FunctionFS; run them with
//! `cargo test -- --ignored` on gadget-capable hardware.

use std::{collections::BTreeMap, time::Duration};

use usb_peripheral::{
    error::Error,
    ffs::{DescriptorBlob, FfsFlags},
    function::hid::{HidConfig, HidFunction, HidLayout},
    gadget::{Configuration, Gadget, GadgetStrings},
    udc::UsbDeviceState,
    usb::{
        hid::{HidDescriptor, HidInterfaceProtocol, HidSubclass},
        template::{DescriptorSet, EndpointTemplate},
        Descriptor, Direction, EndpointAddress, EndpointConfig, InterfaceDescriptor,
    },
    FunctionState, Speed, UsbFunction,
};

const LANG_EN_US: u16 = 0x0409;

fn gamepad_function() -> HidFunction {
    let mut strings = BTreeMap::new();
    strings.insert(LANG_EN_US, vec!["Simple Gamepad".to_string()]);
    HidFunction::new(
        "gamepad",
        HidConfig {
            report_descriptor: vec![0x05; 70],
            subclass: HidSubclass::None,
            protocol: HidInterfaceProtocol::None,
            layout: HidLayout::InputOnly {
                poll_ms: 8,
                max_packet_size: 14,
            },
            speeds: vec![Speed::Full, Speed::High],
            strings,
        },
    )
    .unwrap()
}

#[test]
fn gamepad_descriptor_blob_is_bit_exact() {
    // The same descriptor list the HID overlay builds, assembled through
    // the public descriptor API.
    let addr = EndpointAddress::new(1, Direction::In).unwrap();
    let descriptors: Vec<Descriptor> = vec![
        InterfaceDescriptor::new(0, 1, 0x03, 0, 0).into(),
        HidDescriptor::for_report(70).unwrap().into(),
        EndpointTemplate::new(addr, EndpointConfig::interrupt(8, 14))
            .unwrap()
            .into(),
    ];
    let sets = vec![
        DescriptorSet::generate(&descriptors, Speed::Full).unwrap(),
        DescriptorSet::generate(&descriptors, Speed::High).unwrap(),
    ];
    let blob = DescriptorBlob::new(sets, FfsFlags::empty()).unwrap();
    let bytes = blob.to_bytes().unwrap();

    // v2 magic, total length, FS|HS flags.
    assert_eq!(&bytes[0..4], &[0x03, 0x00, 0x00, 0x00]);
    assert_eq!(
        u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize,
        bytes.len()
    );
    assert_eq!(&bytes[8..12], &[0x03, 0x00, 0x00, 0x00]);
    // Counts: 3 descriptors each.
    assert_eq!(&bytes[12..16], &[3, 0, 0, 0]);
    assert_eq!(&bytes[16..20], &[3, 0, 0, 0]);
    // Full-speed sequence: interface, HID, endpoint.
    let fs_expected: Vec<u8> = [
        vec![0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00],
        vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x46, 0x00],
        vec![0x07, 0x05, 0x81, 0x03, 0x0E, 0x00, 0x08],
    ]
    .concat();
    assert_eq!(&bytes[20..20 + 25], &fs_expected[..]);
    // High-speed substitutes the interval exponent.
    assert_eq!(bytes[bytes.len() - 1], 0x07);
}

#[test]
fn hid_function_declares_cleanly() {
    let function = gamepad_function();
    assert_eq!(function.state(), FunctionState::Uninitialized);
    assert_eq!(function.configfs_name(), "ffs.gamepad");
    assert!(matches!(
        function.stream_reports(),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn gadget_declaration_validates_names() {
    let config = Configuration::new();
    assert!(Gadget::new("", 0x1d6b, 0x0104, config).is_err());

    let config = Configuration::new();
    assert!(Gadget::new("a/b", 0x1d6b, 0x0104, config).is_err());
}

#[test]
#[ignore = "needs a UDC, root and FunctionFS"]
fn gamepad_binds_and_enumerates() {
    let hid = gamepad_function();
    let config = Configuration::new()
        .with_name(LANG_EN_US, "Gamepad Configuration")
        .with_function(Box::new(hid.clone()));
    let mut gadget = Gadget::new("it-gamepad", 0x1d6b, 0x0104, config)
        .unwrap()
        .with_strings(
            LANG_EN_US,
            GadgetStrings {
                manufacturer: Some("usb-peripheral".into()),
                product: Some("Simple Gamepad".into()),
                serial_number: Some("0001".into()),
            },
        );

    gadget.bind().unwrap();
    assert!(gadget.is_bound());

    // Binding twice must fail without touching anything.
    assert!(matches!(gadget.bind(), Err(Error::AlreadyBound)));

    let stream = gadget.state_stream(Duration::from_millis(100)).unwrap();

    gadget
        .wait_for_state(
            UsbDeviceState::Configured,
            Duration::from_millis(100),
            Duration::from_secs(30),
        )
        .unwrap();

    // No consecutive duplicates in the observed states.
    let mut seen = Vec::new();
    while let Some(state) = stream.recv_timeout(Duration::from_millis(200)) {
        seen.push(state);
        if state == UsbDeviceState::Configured {
            break;
        }
    }
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    hid.send_report(&[0x01, 0x10, 0x00]).unwrap();

    gadget.unbind();
    assert!(!gadget.is_bound());
    // Unbind is idempotent.
    gadget.unbind();
}

use std::{collections::BTreeMap, thread, time::Duration};

use simple_logger::SimpleLogger;
use usb_peripheral::{
    function::hid::{HidConfig, HidFunction, HidLayout},
    gadget::{Configuration, Gadget, GadgetStrings},
    udc::UsbDeviceState,
    usb::hid::{HidInterfaceProtocol, HidSubclass},
    Speed,
};

mod descriptor;

const LANG_EN_US: u16 = 0x0409;

fn main() {
    SimpleLogger::new().init().unwrap();

    let mut strings = BTreeMap::new();
    strings.insert(LANG_EN_US, vec!["Simple Gamepad".to_string()]);

    let hid = match HidFunction::new(
        "gamepad",
        HidConfig {
            report_descriptor: descriptor::REPORT_DESCRIPTOR.to_vec(),
            subclass: HidSubclass::None,
            protocol: HidInterfaceProtocol::None,
            layout: HidLayout::InputOnly {
                poll_ms: 8,
                max_packet_size: 14,
            },
            speeds: vec![Speed::Full, Speed::High],
            strings,
        },
    ) {
        Ok(hid) => hid,
        Err(e) => {
            log::error!("cannot declare gamepad: {e}");
            return;
        }
    };

    let config = Configuration::new()
        .with_name(LANG_EN_US, "Gamepad Configuration")
        .with_function(Box::new(hid.clone()));

    let gadget = Gadget::new("gamepad", 0x1d6b, 0x0104, config).map(|g| {
        g.with_strings(
            LANG_EN_US,
            GadgetStrings {
                manufacturer: Some("usb-peripheral".into()),
                product: Some("Simple Gamepad".into()),
                serial_number: Some("0001".into()),
            },
        )
    });
    let mut gadget = match gadget {
        Ok(gadget) => gadget,
        Err(e) => {
            log::error!("cannot declare gadget: {e}");
            return;
        }
    };

    if let Err(e) = gadget.bind() {
        log::error!("bind failed: {e}");
        return;
    }
    println!("Gadget bound, waiting for the host to configure it...");

    if let Err(e) = gadget.wait_for_state(
        UsbDeviceState::Configured,
        Duration::from_millis(100),
        Duration::from_secs(30),
    ) {
        log::error!("host did not configure the device: {e}");
        gadget.unbind();
        return;
    }
    println!("Configured. Wiggling the stick for a while.");

    for i in 0..100u8 {
        let x = if i % 2 == 0 { 40 } else { -40 };
        let report = descriptor::report(0x01, x, 0);
        if let Err(e) = hid.send_report(&report) {
            log::error!("report failed: {e}");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    gadget.unbind();
    println!("Finished!");
}

use std::{env, thread, time::Duration};

use simple_logger::SimpleLogger;
use usb_peripheral::{
    function::kernel::{KernelFunction, Lun, MassStorageConfig},
    gadget::{Configuration, Gadget, GadgetStrings},
};

const LANG_EN_US: u16 = 0x0409;

fn main() {
    SimpleLogger::new().init().unwrap();

    let image = env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/disk.img".to_string());

    let mut lun = Lun::new(&image);
    lun.removable = true;
    let storage = match KernelFunction::mass_storage(
        "storage",
        MassStorageConfig {
            stall: None,
            luns: vec![lun],
        },
    ) {
        Ok(storage) => storage,
        Err(e) => {
            log::error!("cannot declare mass storage: {e}");
            return;
        }
    };

    let config = Configuration::new()
        .with_name(LANG_EN_US, "Mass Storage")
        .with_function(Box::new(storage));

    let gadget = Gadget::new("ms", 0x1d6b, 0x0104, config).map(|g| {
        g.with_strings(
            LANG_EN_US,
            GadgetStrings {
                manufacturer: Some("usb-peripheral".into()),
                product: Some("Example Disk".into()),
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
    println!("Exposing {image} to the host for 60 seconds...");
    thread::sleep(Duration::from_secs(60));

    gadget.unbind();
    println!("Finished!");
}

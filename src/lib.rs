//! Implement USB peripherals (gadgets) in userspace on Linux.
//!
//! The kernel's configfs gadget interface declares a composite USB device;
//! FunctionFS lets a process implement a function of that device by
//! writing descriptors to `ep0` and servicing endpoint files. This crate
//! wraps both: declare a [`gadget::Gadget`] with one configuration and a
//! set of functions, call [`gadget::Gadget::bind`], and the machine shows
//! up on the host as the device you described.
//!
//! Functions are either FunctionFS-backed ([`function::FfsFunction`], with
//! the HID overlay in [`function::hid`]) or configured kernel drivers
//! ([`function::kernel::KernelFunction`]) such as mass storage, serial and
//! network adapters.
//!
//! Requires Linux with configfs mounted, the `libcomposite` module, a USB
//! device controller and, for FunctionFS functions, `CAP_SYS_ADMIN` to
//! mount the endpoint filesystem.

pub mod endpoint;
pub mod error;
pub mod ffs;
pub mod function;
pub mod gadget;
pub mod mount;
pub mod os;
pub mod udc;
pub mod usb;

pub use error::{Error, Result};
pub use function::{FfsFunction, FunctionState, UsbFunction};
pub use gadget::{Configuration, Gadget};
pub use udc::{Udc, UsbDeviceState};
pub use usb::Speed;

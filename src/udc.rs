//! USB device controller discovery and state observation through sysfs.

use std::path::{Path, PathBuf};

use libudev::{Context, Device};

use crate::error::{Error, Result};

/// Directory listing one entry per UDC on the system.
pub const UDC_CLASS_DIR: &str = "/sys/class/udc";

/// States of the USB device state machine as reported by the per-UDC
/// `state` attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbDeviceState {
    NotAttached,
    Attached,
    Powered,
    Reconnecting,
    Unauthenticated,
    Default,
    Addressed,
    Configured,
    Suspended,
}

impl UsbDeviceState {
    /// Decode the sysfs attribute text. Unknown strings yield `None` and
    /// are skipped by observers.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "not attached" => Some(UsbDeviceState::NotAttached),
            "attached" => Some(UsbDeviceState::Attached),
            "powered" => Some(UsbDeviceState::Powered),
            "reconnecting" => Some(UsbDeviceState::Reconnecting),
            "unauthenticated" => Some(UsbDeviceState::Unauthenticated),
            "default" => Some(UsbDeviceState::Default),
            "addressed" => Some(UsbDeviceState::Addressed),
            "configured" => Some(UsbDeviceState::Configured),
            "suspended" => Some(UsbDeviceState::Suspended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UsbDeviceState::NotAttached => "not attached",
            UsbDeviceState::Attached => "attached",
            UsbDeviceState::Powered => "powered",
            UsbDeviceState::Reconnecting => "reconnecting",
            UsbDeviceState::Unauthenticated => "unauthenticated",
            UsbDeviceState::Default => "default",
            UsbDeviceState::Addressed => "addressed",
            UsbDeviceState::Configured => "configured",
            UsbDeviceState::Suspended => "suspended",
        }
    }
}

/// A USB device controller found under `/sys/class/udc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Udc {
    name: String,
    syspath: PathBuf,
}

impl Udc {
    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, syspath: PathBuf) -> Self {
        Udc {
            name: name.to_string(),
            syspath,
        }
    }

    fn from_name(class_dir: &Path, name: &str) -> Self {
        Udc {
            name: name.to_string(),
            syspath: class_dir.join(name),
        }
    }

    /// Enumerate all UDCs on the system.
    pub fn list() -> Result<Vec<Udc>> {
        Self::list_in(Path::new(UDC_CLASS_DIR))
    }

    fn list_in(class_dir: &Path) -> Result<Vec<Udc>> {
        let entries = match std::fs::read_dir(class_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut udcs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            udcs.push(Udc::from_name(class_dir, &name));
        }
        udcs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(udcs)
    }

    /// Resolve the controller to bind: the named one when `preferred` is
    /// given, otherwise the unique entry. Zero controllers or an
    /// ambiguous choice fail.
    pub fn resolve(preferred: Option<&str>) -> Result<Udc> {
        let udcs = Self::list()?;
        match preferred {
            Some(name) => udcs
                .into_iter()
                .find(|udc| udc.name == name)
                .ok_or_else(|| {
                    Error::Environment(format!("USB device controller {name} not found"))
                }),
            None => {
                let mut names: Vec<String> = udcs.iter().map(|u| u.name.clone()).collect();
                match udcs.len() {
                    0 => Err(Error::NoUdc),
                    1 => Ok(udcs.into_iter().next().expect("one udc")),
                    _ => {
                        names.sort();
                        Err(Error::AmbiguousUdc(names))
                    }
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn syspath(&self) -> &Path {
        &self.syspath
    }

    /// Read the current device state from the `state` sysfs attribute.
    pub fn state(&self) -> Result<UsbDeviceState> {
        let context = Context::new()?;
        let device = Device::from_syspath(&context, &self.syspath).map_err(|err| {
            Error::Environment(format!(
                "USB device controller {} disappeared: {err}",
                self.name
            ))
        })?;
        let value = device.attribute_value("state").ok_or_else(|| {
            Error::Environment(format!("controller {} has no state attribute", self.name))
        })?;
        let text = value.to_string_lossy();
        UsbDeviceState::parse(&text).ok_or_else(|| {
            Error::Protocol(format!("unknown USB device state {:?}", text.trim()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            UsbDeviceState::NotAttached,
            UsbDeviceState::Attached,
            UsbDeviceState::Powered,
            UsbDeviceState::Default,
            UsbDeviceState::Addressed,
            UsbDeviceState::Configured,
            UsbDeviceState::Suspended,
        ] {
            assert_eq!(UsbDeviceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(UsbDeviceState::parse("configured\n"), Some(UsbDeviceState::Configured));
        assert_eq!(UsbDeviceState::parse("warp speed"), None);
    }

    #[test]
    fn listing_missing_class_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("udc");
        assert!(Udc::list_in(&missing).unwrap().is_empty());
    }

    #[test]
    fn listing_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b.udc")).unwrap();
        std::fs::create_dir(dir.path().join("a.udc")).unwrap();
        let udcs = Udc::list_in(dir.path()).unwrap();
        let names: Vec<_> = udcs.iter().map(|u| u.name()).collect();
        assert_eq!(names, ["a.udc", "b.udc"]);
        assert_eq!(udcs[0].syspath(), dir.path().join("a.udc"));
    }
}

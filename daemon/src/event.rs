/// Structured event records produced by classification and written to the audit log.
///
/// A [`NotificationEvent`] is stamped once, when it is classified, and its
/// [`EventKind`] is never revised afterwards.
use chrono::{DateTime, Local};
use std::fmt;

/// `{A5DCBF10-6530-11D2-901F-00C04FB951ED}` (GUID_DEVINTERFACE_USB_DEVICE).
pub const USB_DEVICE_INTERFACE_CLASS: ClassGuid =
    ClassGuid(0xA5DCBF10_6530_11D2_901F_00C04FB951ED);

/// 128-bit device-interface class identifier.
///
/// Stored in the same big-endian field order the registry form is written in,
/// so `Display` reproduces `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassGuid(pub u128);

impl ClassGuid {
    pub fn is_usb_device_interface(&self) -> bool {
        *self == USB_DEVICE_INTERFACE_CLASS
    }
}

impl fmt::Display for ClassGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF,
        )
    }
}

/// Payload of a device-interface arrival or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterfaceEvent {
    pub device_class_guid: ClassGuid,
    /// True iff `device_class_guid` is the USB device-interface class.
    pub is_usb_class: bool,
    /// Empty when the OS path was zero-length or not valid UTF-16.
    pub device_path: String,
}

impl DeviceInterfaceEvent {
    pub fn new(device_class_guid: ClassGuid, device_path: String) -> Self {
        Self {
            is_usb_class: device_class_guid.is_usb_device_interface(),
            device_class_guid,
            device_path,
        }
    }
}

/// Payload of a volume mount or unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeEvent {
    /// `'A'..='Z'`, or [`VolumeEvent::UNKNOWN_DRIVE`] when the unit mask was empty.
    pub drive_letter: char,
    pub arrival: bool,
}

impl VolumeEvent {
    pub const UNKNOWN_DRIVE: char = '?';
}

/// The single variant tag decided at classification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ClipboardChanged,
    DeviceInterfaceArrival(DeviceInterfaceEvent),
    DeviceInterfaceRemoval(DeviceInterfaceEvent),
    VolumeArrival(VolumeEvent),
    VolumeRemoval(VolumeEvent),
    /// Diagnostic text describing a device change that could not be classified.
    Unrecognized(String),
}

impl EventKind {
    /// Human-readable one-line description written to the audit log.
    pub fn summary(&self) -> String {
        match self {
            EventKind::ClipboardChanged => {
                "Clipboard content changed (Copy/Paste detected).".to_string()
            }
            EventKind::DeviceInterfaceArrival(dev) if dev.is_usb_class => {
                format!("USB Device Plugged In: {}", dev.device_path)
            }
            EventKind::DeviceInterfaceRemoval(dev) if dev.is_usb_class => {
                format!("USB Device Removed: {}", dev.device_path)
            }
            EventKind::DeviceInterfaceArrival(dev) => format!(
                "Non-USB Device Interface Arrival (Potential Driver/Software Install?): {} [class {}]",
                dev.device_path, dev.device_class_guid
            ),
            EventKind::DeviceInterfaceRemoval(dev) => format!(
                "Non-USB Device Interface Removal: {} [class {}]",
                dev.device_path, dev.device_class_guid
            ),
            EventKind::VolumeArrival(vol) | EventKind::VolumeRemoval(vol) => {
                let verb = if vol.arrival { "Mounted" } else { "Removed" };
                format!("Volume/Drive {verb}: {}:\\", vol.drive_letter)
            }
            EventKind::Unrecognized(detail) => format!("Unrecognized device change ({detail})"),
        }
    }
}

/// A classified, timestamped event ready for the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub captured_at: DateTime<Local>,
    pub kind: EventKind,
}

impl NotificationEvent {
    pub fn new(kind: EventKind, captured_at: DateTime<Local>) -> Self {
        Self { captured_at, kind }
    }

    /// Stamps `kind` with the current local time.
    pub fn now(kind: EventKind) -> Self {
        Self::new(kind, Local::now())
    }

    pub fn summary(&self) -> String {
        self.kind.summary()
    }
}

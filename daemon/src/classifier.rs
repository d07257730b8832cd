/// Device classification: turns a raw `WM_DEVICECHANGE` notification into an [`EventKind`].
///
/// The platform layer copies the OS payload into an owned
/// [`RawDeviceNotification`] before it gets here, so everything in this module
/// is a pure function over plain data and never touches OS memory.
use crate::event::{ClassGuid, DeviceInterfaceEvent, EventKind, VolumeEvent};

/// `DBT_DEVICEARRIVAL`
pub const ACTION_ARRIVAL: u32 = 0x8000;
/// `DBT_DEVICEREMOVECOMPLETE`
pub const ACTION_REMOVE_COMPLETE: u32 = 0x8004;

/// `DBT_DEVTYP_VOLUME`
#[cfg_attr(not(windows), allow(dead_code))]
pub const DEVICE_TYPE_VOLUME: u32 = 0x0000_0002;
/// `DBT_DEVTYP_DEVICEINTERFACE`
#[cfg_attr(not(windows), allow(dead_code))]
pub const DEVICE_TYPE_INTERFACE: u32 = 0x0000_0005;

const DRIVE_LETTER_COUNT: u32 = 26;

/// Owned copy of a device-change payload as delivered by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
pub enum DevicePayload {
    /// No header, or a declared size too small to hold the device type.
    Missing,
    /// The header's declared size is too small for its device type.
    Truncated { device_type: u32 },
    /// Device interface; `name` holds the UTF-16 path without its terminator.
    Interface { class: ClassGuid, name: Vec<u16> },
    Volume { unit_mask: u32 },
    Other { device_type: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeviceNotification {
    pub action: u32,
    pub payload: DevicePayload,
}

/// Classifies a device notification.
///
/// Returns `None` for any action other than arrival or removal. Every other
/// input yields exactly one event; payloads that cannot be interpreted become
/// [`EventKind::Unrecognized`].
pub fn classify(raw: &RawDeviceNotification) -> Option<EventKind> {
    let arrival = match raw.action {
        ACTION_ARRIVAL => true,
        ACTION_REMOVE_COMPLETE => false,
        _ => return None,
    };

    let kind = match &raw.payload {
        DevicePayload::Interface { class, name } => {
            let dev = DeviceInterfaceEvent::new(*class, decode_wide_path(name));
            if arrival {
                EventKind::DeviceInterfaceArrival(dev)
            } else {
                EventKind::DeviceInterfaceRemoval(dev)
            }
        }
        DevicePayload::Volume { unit_mask } => {
            let vol = VolumeEvent {
                drive_letter: drive_letter_from_mask(*unit_mask),
                arrival,
            };
            if arrival {
                EventKind::VolumeArrival(vol)
            } else {
                EventKind::VolumeRemoval(vol)
            }
        }
        DevicePayload::Other { device_type } | DevicePayload::Truncated { device_type } => {
            EventKind::Unrecognized(format!(
                "action={:#06x}, device type={:#010x}",
                raw.action, device_type
            ))
        }
        DevicePayload::Missing => EventKind::Unrecognized(format!(
            "action={:#06x}, device type=unknown",
            raw.action
        )),
    };
    Some(kind)
}

/// Lowest set bit among the 26 drive bits wins; an empty mask yields `'?'`.
pub fn drive_letter_from_mask(unit_mask: u32) -> char {
    (0..DRIVE_LETTER_COUNT)
        .find(|bit| unit_mask & (1 << bit) != 0)
        .map(|bit| char::from(b'A' + bit as u8))
        .unwrap_or(VolumeEvent::UNKNOWN_DRIVE)
}

/// Decodes a UTF-16 device path. Invalid UTF-16 yields an empty string.
pub fn decode_wide_path(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16(&units[..end]).unwrap_or_default()
}

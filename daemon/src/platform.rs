/// Windows notification context: a hidden message-only window.
///
/// The window procedure runs on the same thread as [`MessageWindow::next_signal`]
/// (messages are dispatched from inside `GetMessageW`). It copies each payload
/// into an owned [`Signal`], queues it, and posts a wake-up message so the
/// pump returns to the caller. Nothing outside this module sees OS memory.
///
/// On non-Windows platforms [`MessageWindow::create`] always fails, which the
/// daemon treats as a fatal startup error.
use std::fmt;

use crate::classifier::{DevicePayload, DEVICE_TYPE_INTERFACE, DEVICE_TYPE_VOLUME};
use crate::dispatcher::{NotificationContext, Signal};
use crate::event::ClassGuid;
use crate::subscription::{Category, OsError};

/// A fatal failure while establishing the notification context.
#[derive(Debug)]
pub struct ContextError {
    /// The OS call that failed, used as the audit-log error context.
    pub operation: &'static str,
    pub source: OsError,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.source)
    }
}

/// Extracts the Win32 error code from an `HRESULT_FROM_WIN32` value.
/// Any other `HRESULT` is returned unchanged.
#[cfg_attr(not(windows), allow(dead_code))]
fn win32_code(hresult: i32) -> u32 {
    let raw = hresult as u32;
    if raw & 0xFFFF_0000 == 0x8007_0000 {
        raw & 0xFFFF
    } else {
        raw
    }
}

pub struct MessageWindow {
    #[cfg(windows)]
    inner: imp::Window,
    #[cfg(not(windows))]
    never: std::convert::Infallible,
}

impl MessageWindow {
    /// Registers the window class and creates the message-only window.
    ///
    /// With `usb_interfaces_only` the device subscription is filtered to the
    /// USB device-interface class; otherwise all interface classes are delivered.
    pub fn create(usb_interfaces_only: bool) -> Result<Self, ContextError> {
        #[cfg(windows)]
        {
            imp::Window::create(usb_interfaces_only).map(|inner| Self { inner })
        }
        #[cfg(not(windows))]
        {
            let _ = usb_interfaces_only;
            Err(ContextError {
                operation: "MessageWindow::create",
                source: OsError::new(0, "Notification subsystem is only available on Windows"),
            })
        }
    }

    /// Turns Ctrl+C into a close request on this window, so shutdown arrives
    /// through the same message queue as every other notification.
    pub fn forward_ctrl_c(&self) {
        #[cfg(windows)]
        {
            let hwnd = self.inner.raw_handle();
            let spawned = std::thread::Builder::new()
                .name("ctrl-c".into())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            eprintln!("[shutdown] Failed to start signal runtime: {e}");
                            return;
                        }
                    };
                    runtime.block_on(async {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            eprintln!("[shutdown] Ctrl+C received, closing message window");
                            imp::post_close(hwnd);
                        }
                    });
                });
            if let Err(e) = spawned {
                eprintln!("[shutdown] Failed to spawn Ctrl+C thread: {e}");
            }
        }
        #[cfg(not(windows))]
        {
            match self.never {}
        }
    }
}

impl NotificationContext for MessageWindow {
    fn subscribe(&mut self, category: Category) -> Result<(), OsError> {
        #[cfg(windows)]
        {
            self.inner.subscribe(category)
        }
        #[cfg(not(windows))]
        {
            let _ = category;
            match self.never {}
        }
    }

    fn unsubscribe(&mut self, category: Category) {
        #[cfg(windows)]
        self.inner.unsubscribe(category);
        #[cfg(not(windows))]
        {
            let _ = category;
            match self.never {}
        }
    }

    fn next_signal(&mut self) -> Signal {
        #[cfg(windows)]
        {
            self.inner.next_signal()
        }
        #[cfg(not(windows))]
        {
            match self.never {}
        }
    }
}

// ── Device broadcast layout ───────────────────────────────────────────────────

// Little-endian `DEV_BROADCAST_*` layout. `dbch_size` counts the whole record.
const BROADCAST_HEADER_LEN: usize = 12;
const DEVICE_TYPE_OFFSET: usize = 4;
const INTERFACE_CLASS_OFFSET: usize = 12;
const INTERFACE_NAME_OFFSET: usize = 28;
const VOLUME_UNIT_MASK_OFFSET: usize = 12;

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let field = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(field.try_into().ok()?))
}

/// In-memory `GUID` (three little-endian fields, then eight raw bytes) to [`ClassGuid`].
fn read_guid(bytes: &[u8], offset: usize) -> Option<ClassGuid> {
    let field: &[u8; 16] = bytes.get(offset..offset + 16)?.try_into().ok()?;
    let data1 = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
    let data2 = u16::from_le_bytes([field[4], field[5]]);
    let data3 = u16::from_le_bytes([field[6], field[7]]);
    let mut data4 = [0u8; 8];
    data4.copy_from_slice(&field[8..]);
    Some(ClassGuid(
        (data1 as u128) << 96
            | (data2 as u128) << 80
            | (data3 as u128) << 64
            | u64::from_be_bytes(data4) as u128,
    ))
}

/// Copies a device broadcast record into an owned [`DevicePayload`].
///
/// `bytes` is exactly the `dbch_size` bytes the header declares. A record too
/// short to hold its device type is `Missing`; one too short for the fixed part
/// of its type is `Truncated`. The interface name ends at the first NUL or at
/// the end of the record, whichever comes first.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_broadcast(bytes: &[u8]) -> DevicePayload {
    let Some(device_type) = read_u32(bytes, DEVICE_TYPE_OFFSET) else {
        return DevicePayload::Missing;
    };
    if bytes.len() < BROADCAST_HEADER_LEN {
        return DevicePayload::Truncated { device_type };
    }

    match device_type {
        DEVICE_TYPE_INTERFACE => {
            let Some(class) = read_guid(bytes, INTERFACE_CLASS_OFFSET) else {
                return DevicePayload::Truncated { device_type };
            };
            let name = bytes[INTERFACE_NAME_OFFSET..]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|&unit| unit != 0)
                .collect();
            DevicePayload::Interface { class, name }
        }
        DEVICE_TYPE_VOLUME => match read_u32(bytes, VOLUME_UNIT_MASK_OFFSET) {
            Some(unit_mask) => DevicePayload::Volume { unit_mask },
            None => DevicePayload::Truncated { device_type },
        },
        other => DevicePayload::Other { device_type: other },
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::ffi::c_void;
    use std::mem::{offset_of, size_of};

    use windows::core::{w, GUID};
    use windows::Win32::Foundation::{HANDLE, HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::DataExchange::{
        AddClipboardFormatListener, RemoveClipboardFormatListener,
    };
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW, IsWindow,
        PostMessageW, PostQuitMessage, RegisterClassW, RegisterDeviceNotificationW,
        TranslateMessage, UnregisterDeviceNotification, DEVICE_NOTIFY_ALL_INTERFACE_CLASSES,
        DEVICE_NOTIFY_WINDOW_HANDLE, DEV_BROADCAST_DEVICEINTERFACE_W, DEV_BROADCAST_HDR,
        DEV_BROADCAST_VOLUME, HDEVNOTIFY, HWND_MESSAGE, MSG, WINDOW_EX_STYLE, WINDOW_STYLE,
        WM_APP, WM_CLIPBOARDUPDATE, WM_CLOSE, WM_DESTROY, WM_DEVICECHANGE, WNDCLASSW,
    };

    use super::{
        parse_broadcast, win32_code, ContextError, BROADCAST_HEADER_LEN, DEVICE_TYPE_OFFSET,
        INTERFACE_CLASS_OFFSET, INTERFACE_NAME_OFFSET, VOLUME_UNIT_MASK_OFFSET,
    };
    use crate::classifier::{
        DevicePayload, RawDeviceNotification, ACTION_ARRIVAL, ACTION_REMOVE_COMPLETE,
        DEVICE_TYPE_INTERFACE,
    };
    use crate::dispatcher::Signal;
    use crate::event::USB_DEVICE_INTERFACE_CLASS;
    use crate::subscription::{Category, OsError};

    /// Posted after a signal is queued so that `GetMessageW` returns.
    const WM_SIGNAL_QUEUED: u32 = WM_APP + 1;

    thread_local! {
        /// Signals produced by `window_proc`, drained by `Window::next_signal`.
        static PENDING: RefCell<VecDeque<Signal>> = RefCell::new(VecDeque::new());
    }

    impl From<windows::core::Error> for OsError {
        fn from(e: windows::core::Error) -> Self {
            OsError::new(win32_code(e.code().0), e.message().to_string())
        }
    }

    fn last_os_error() -> OsError {
        windows::core::Error::from_win32().into()
    }

    pub struct Window {
        hwnd: HWND,
        usb_interfaces_only: bool,
        device_notify: Option<HDEVNOTIFY>,
    }

    impl Window {
        pub fn create(usb_interfaces_only: bool) -> Result<Self, ContextError> {
            let class_name = w!("SecurityMonitorMessageWindowClass");
            unsafe {
                let instance: HINSTANCE = GetModuleHandleW(None)
                    .map_err(|e| ContextError { operation: "GetModuleHandleW", source: e.into() })?
                    .into();

                let class = WNDCLASSW {
                    lpfnWndProc: Some(window_proc),
                    hInstance: instance,
                    lpszClassName: class_name,
                    ..Default::default()
                };
                if RegisterClassW(&class) == 0 {
                    return Err(ContextError { operation: "RegisterClassW", source: last_os_error() });
                }

                // HWND_MESSAGE parent: receives messages, never shown.
                let hwnd = CreateWindowExW(
                    WINDOW_EX_STYLE::default(),
                    class_name,
                    w!("SecurityMonitor Hidden Window"),
                    WINDOW_STYLE::default(),
                    0,
                    0,
                    0,
                    0,
                    HWND_MESSAGE,
                    None,
                    instance,
                    None,
                );
                if hwnd.0 == 0 {
                    return Err(ContextError {
                        operation: "CreateWindowExW (Message Window)",
                        source: last_os_error(),
                    });
                }

                Ok(Self { hwnd, usb_interfaces_only, device_notify: None })
            }
        }

        pub fn raw_handle(&self) -> isize {
            self.hwnd.0
        }

        pub fn subscribe(&mut self, category: Category) -> Result<(), OsError> {
            match category {
                Category::Clipboard => unsafe { AddClipboardFormatListener(self.hwnd)? },
                Category::DeviceInterface => {
                    let mut filter = DEV_BROADCAST_DEVICEINTERFACE_W {
                        dbcc_size: size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32,
                        dbcc_devicetype: DEVICE_TYPE_INTERFACE,
                        ..Default::default()
                    };
                    let flags = if self.usb_interfaces_only {
                        filter.dbcc_classguid = GUID::from_u128(USB_DEVICE_INTERFACE_CLASS.0);
                        DEVICE_NOTIFY_WINDOW_HANDLE
                    } else {
                        DEVICE_NOTIFY_WINDOW_HANDLE | DEVICE_NOTIFY_ALL_INTERFACE_CLASSES
                    };
                    let handle = unsafe {
                        RegisterDeviceNotificationW(
                            HANDLE(self.hwnd.0),
                            &filter as *const _ as *const c_void,
                            flags,
                        )?
                    };
                    self.device_notify = Some(handle);
                }
            }
            Ok(())
        }

        pub fn unsubscribe(&mut self, category: Category) {
            unsafe {
                match category {
                    Category::Clipboard => {
                        let _ = RemoveClipboardFormatListener(self.hwnd);
                    }
                    Category::DeviceInterface => {
                        if let Some(handle) = self.device_notify.take() {
                            let _ = UnregisterDeviceNotification(handle);
                        }
                    }
                }
            }
        }

        pub fn next_signal(&mut self) -> Signal {
            loop {
                if let Some(signal) = PENDING.with(|q| q.borrow_mut().pop_front()) {
                    return signal;
                }

                let mut msg = MSG::default();
                // GetMessageW: >0 = message, 0 = WM_QUIT, -1 = error.
                match unsafe { GetMessageW(&mut msg, None, 0, 0) }.0 {
                    0 => return Signal::Terminate { exit_code: msg.wParam.0 as i32 },
                    -1 => {
                        eprintln!("[platform] GetMessageW failed: {}", last_os_error());
                        return Signal::Terminate { exit_code: 1 };
                    }
                    _ => unsafe {
                        let _ = TranslateMessage(&msg);
                        DispatchMessageW(&msg);
                    },
                }
            }
        }
    }

    impl Drop for Window {
        fn drop(&mut self) {
            self.unsubscribe(Category::DeviceInterface);
            unsafe {
                if IsWindow(self.hwnd).as_bool() {
                    let _ = DestroyWindow(self.hwnd);
                }
            }
            PENDING.with(|q| q.borrow_mut().clear());
        }
    }

    /// Asks the window to close; `DefWindowProcW` destroys it on the owning thread.
    pub fn post_close(hwnd: isize) {
        unsafe {
            let _ = PostMessageW(HWND(hwnd), WM_CLOSE, WPARAM(0), LPARAM(0));
        }
    }

    unsafe extern "system" fn window_proc(
        hwnd: HWND,
        msg: u32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        match msg {
            WM_CLIPBOARDUPDATE => {
                enqueue(hwnd, Signal::ClipboardUpdate);
                LRESULT(0)
            }
            WM_DEVICECHANGE => {
                enqueue(hwnd, Signal::DeviceChange(read_device_change(w_param, l_param)));
                LRESULT(1)
            }
            WM_SIGNAL_QUEUED => LRESULT(0),
            WM_DESTROY => {
                PostQuitMessage(0);
                LRESULT(0)
            }
            _ => DefWindowProcW(hwnd, msg, w_param, l_param),
        }
    }

    fn enqueue(hwnd: HWND, signal: Signal) {
        PENDING.with(|q| q.borrow_mut().push_back(signal));
        unsafe {
            let _ = PostMessageW(hwnd, WM_SIGNAL_QUEUED, WPARAM(0), LPARAM(0));
        }
    }

    /// `l_param` is only dereferenced for arrival and removal, the two actions
    /// documented to carry a `DEV_BROADCAST_HDR`.
    unsafe fn read_device_change(w_param: WPARAM, l_param: LPARAM) -> RawDeviceNotification {
        let action = w_param.0 as u32;
        let payload = match action {
            ACTION_ARRIVAL | ACTION_REMOVE_COMPLETE => {
                read_broadcast(l_param.0 as *const DEV_BROADCAST_HDR)
            }
            _ => DevicePayload::Missing,
        };
        RawDeviceNotification { action, payload }
    }

    pub(super) unsafe fn read_broadcast(header: *const DEV_BROADCAST_HDR) -> DevicePayload {
        if header.is_null() {
            return DevicePayload::Missing;
        }
        let size = (*header).dbch_size as usize;
        let bytes = std::slice::from_raw_parts(header as *const u8, size);
        parse_broadcast(bytes)
    }

    const _: () = {
        assert!(size_of::<DEV_BROADCAST_HDR>() == BROADCAST_HEADER_LEN);
        assert!(offset_of!(DEV_BROADCAST_HDR, dbch_devicetype) == DEVICE_TYPE_OFFSET);
        assert!(
            offset_of!(DEV_BROADCAST_DEVICEINTERFACE_W, dbcc_classguid) == INTERFACE_CLASS_OFFSET
        );
        assert!(offset_of!(DEV_BROADCAST_DEVICEINTERFACE_W, dbcc_name) == INTERFACE_NAME_OFFSET);
        assert!(offset_of!(DEV_BROADCAST_VOLUME, dbcv_unitmask) == VOLUME_UNIT_MASK_OFFSET);
    };
}

// ── Tests ─────────────────────────────────────────────────────────────────────

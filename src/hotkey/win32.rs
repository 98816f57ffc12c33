//! Windows hotkey backend: `RegisterHotKey` against a message-only window

use std::time::Duration;

use windows::core::w;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    RegisterHotKey, UnregisterHotKey, HOT_KEY_MODIFIERS,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, MsgWaitForMultipleObjects,
    PeekMessageW, RegisterClassW, TranslateMessage, HWND_MESSAGE, MSG, PM_REMOVE, QS_ALLINPUT,
    WINDOW_EX_STYLE, WINDOW_STYLE, WNDCLASSW,
};

use super::backend::{HotkeyBackend, NativeMessage, SlotId};
use super::KeyCombination;
use crate::native::OsError;

unsafe extern "system" fn listener_window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

/// Hidden message-only window that receives hotkey notifications.
///
/// Must be created and used on the listener thread.
pub struct Win32Hotkeys {
    hwnd: HWND,
}

impl Win32Hotkeys {
    pub fn new() -> Result<Self, OsError> {
        unsafe {
            let instance =
                GetModuleHandleW(None).map_err(|e| OsError::from(("GetModuleHandleW", e)))?;
            let class_name = w!("DisplayHotkeysListener");

            let class = WNDCLASSW {
                lpfnWndProc: Some(listener_window_proc),
                hInstance: instance.into(),
                lpszClassName: class_name,
                ..Default::default()
            };
            // A second registration in the same process fails harmlessly.
            let _ = RegisterClassW(&class);

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                class_name,
                w!(""),
                WINDOW_STYLE(0),
                0,
                0,
                0,
                0,
                Some(HWND_MESSAGE),
                None,
                Some(instance.into()),
                None,
            )
            .map_err(|e| OsError::from(("CreateWindowExW", e)))?;

            log::debug!("Created hotkey listener window {:?}", hwnd);
            Ok(Self { hwnd })
        }
    }
}

impl HotkeyBackend for Win32Hotkeys {
    fn register(&mut self, slot: SlotId, combination: &KeyCombination) -> Result<(), OsError> {
        unsafe {
            RegisterHotKey(
                Some(self.hwnd),
                slot.0,
                HOT_KEY_MODIFIERS(combination.modifier_bits() as u32),
                combination.key as u32,
            )
        }
        .map_err(|e| OsError::from(("RegisterHotKey", e)))
    }

    fn unregister(&mut self, slot: SlotId) -> Result<(), OsError> {
        unsafe { UnregisterHotKey(Some(self.hwnd), slot.0) }
            .map_err(|e| OsError::from(("UnregisterHotKey", e)))
    }

    fn pump(&mut self, timeout: Duration) -> Vec<NativeMessage> {
        let mut messages = Vec::new();
        unsafe {
            let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
            let _ = MsgWaitForMultipleObjects(None, false, millis, QS_ALLINPUT);

            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
                messages.push(NativeMessage {
                    message: msg.message,
                    wparam: msg.wParam.0,
                    lparam: msg.lParam.0,
                });
            }
        }
        messages
    }
}

impl Drop for Win32Hotkeys {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = DestroyWindow(self.hwnd) {
                log::warn!("Failed to destroy hotkey listener window: {}", e);
            }
        }
    }
}

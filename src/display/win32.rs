//! Windows display backend: CCD (`QueryDisplayConfig`) for identity and HDR,
//! GDI (`EnumDisplaySettingsW` / `ChangeDisplaySettingsExW`) for modes.

use std::mem::size_of;

use windows::core::PCWSTR;
use windows::Win32::Devices::Display::{
    DisplayConfigGetDeviceInfo, DisplayConfigSetDeviceInfo, GetDisplayConfigBufferSizes,
    QueryDisplayConfig, DISPLAYCONFIG_DEVICE_INFO_GET_ADVANCED_COLOR_INFO,
    DISPLAYCONFIG_DEVICE_INFO_GET_SOURCE_NAME, DISPLAYCONFIG_DEVICE_INFO_GET_TARGET_NAME,
    DISPLAYCONFIG_DEVICE_INFO_HEADER, DISPLAYCONFIG_DEVICE_INFO_SET_ADVANCED_COLOR_STATE,
    DISPLAYCONFIG_DEVICE_INFO_TYPE,
    DISPLAYCONFIG_GET_ADVANCED_COLOR_INFO, DISPLAYCONFIG_MODE_INFO, DISPLAYCONFIG_PATH_INFO,
    DISPLAYCONFIG_SET_ADVANCED_COLOR_STATE, DISPLAYCONFIG_SOURCE_DEVICE_NAME,
    DISPLAYCONFIG_TARGET_DEVICE_NAME, QDC_ONLY_ACTIVE_PATHS,
};
use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, ERROR_SUCCESS, LUID, POINTL};
use windows::Win32::Graphics::Gdi::{
    ChangeDisplaySettingsExW, EnumDisplaySettingsW, CDS_NORESET, CDS_SET_PRIMARY, CDS_TYPE,
    CDS_UPDATEREGISTRY, DEVMODEW, DISP_CHANGE, DISP_CHANGE_SUCCESSFUL, DM_DISPLAYFREQUENCY,
    DM_POSITION, ENUM_CURRENT_SETTINGS, ENUM_DISPLAY_SETTINGS_MODE,
};

use super::{
    AdapterLuid, DeviceHandle, DisplayBackend, DisplayId, DisplayMode, DisplayState,
    DisplayTopologySnapshot,
};
use crate::native::OsError;

/// Stateless handle to the Windows display configuration APIs.
#[derive(Debug, Default)]
pub struct Win32Displays;

impl Win32Displays {
    pub fn new() -> Self {
        Self
    }
}

fn wide_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn luid(adapter: AdapterLuid) -> LUID {
    LUID {
        LowPart: adapter.low,
        HighPart: adapter.high,
    }
}

fn header<T>(
    kind: DISPLAYCONFIG_DEVICE_INFO_TYPE,
    adapter: LUID,
    id: u32,
) -> DISPLAYCONFIG_DEVICE_INFO_HEADER {
    DISPLAYCONFIG_DEVICE_INFO_HEADER {
        r#type: kind,
        size: size_of::<T>() as u32,
        adapterId: adapter,
        id,
    }
}

fn check_device_info(call: &'static str, status: i32) -> Result<(), OsError> {
    if status == ERROR_SUCCESS.0 as i32 {
        Ok(())
    } else {
        Err(OsError::new(call, format!("status {}", status)))
    }
}

fn check_disp_change(call: &'static str, result: DISP_CHANGE) -> Result<(), OsError> {
    if result == DISP_CHANGE_SUCCESSFUL {
        Ok(())
    } else {
        Err(OsError::new(call, format!("DISP_CHANGE {}", result.0)))
    }
}

fn empty_devmode() -> DEVMODEW {
    DEVMODEW {
        dmSize: size_of::<DEVMODEW>() as u16,
        ..Default::default()
    }
}

fn query_active_paths() -> Result<Vec<DISPLAYCONFIG_PATH_INFO>, OsError> {
    // The topology can change between the size query and the read; retry on
    // a short buffer.
    loop {
        let mut path_count = 0u32;
        let mut mode_count = 0u32;
        let status = unsafe {
            GetDisplayConfigBufferSizes(QDC_ONLY_ACTIVE_PATHS, &mut path_count, &mut mode_count)
        };
        if status != ERROR_SUCCESS {
            return Err(OsError::new(
                "GetDisplayConfigBufferSizes",
                format!("error {}", status.0),
            ));
        }

        let mut paths = vec![DISPLAYCONFIG_PATH_INFO::default(); path_count as usize];
        let mut modes = vec![DISPLAYCONFIG_MODE_INFO::default(); mode_count as usize];
        let status = unsafe {
            QueryDisplayConfig(
                QDC_ONLY_ACTIVE_PATHS,
                &mut path_count,
                paths.as_mut_ptr(),
                &mut mode_count,
                modes.as_mut_ptr(),
                None,
            )
        };
        if status == ERROR_INSUFFICIENT_BUFFER {
            continue;
        }
        if status != ERROR_SUCCESS {
            return Err(OsError::new("QueryDisplayConfig", format!("error {}", status.0)));
        }
        paths.truncate(path_count as usize);
        return Ok(paths);
    }
}

fn source_name(path: &DISPLAYCONFIG_PATH_INFO) -> Result<String, OsError> {
    let mut request = DISPLAYCONFIG_SOURCE_DEVICE_NAME {
        header: header::<DISPLAYCONFIG_SOURCE_DEVICE_NAME>(
            DISPLAYCONFIG_DEVICE_INFO_GET_SOURCE_NAME,
            path.sourceInfo.adapterId,
            path.sourceInfo.id,
        ),
        ..Default::default()
    };
    let status = unsafe { DisplayConfigGetDeviceInfo(&mut request.header) };
    check_device_info("DisplayConfigGetDeviceInfo(source name)", status)?;
    Ok(wide_to_string(&request.viewGdiDeviceName))
}

fn target_name(path: &DISPLAYCONFIG_PATH_INFO) -> Result<(String, String), OsError> {
    let mut request = DISPLAYCONFIG_TARGET_DEVICE_NAME {
        header: header::<DISPLAYCONFIG_TARGET_DEVICE_NAME>(
            DISPLAYCONFIG_DEVICE_INFO_GET_TARGET_NAME,
            path.targetInfo.adapterId,
            path.targetInfo.id,
        ),
        ..Default::default()
    };
    let status = unsafe { DisplayConfigGetDeviceInfo(&mut request.header) };
    check_device_info("DisplayConfigGetDeviceInfo(target name)", status)?;
    Ok((
        wide_to_string(&request.monitorDevicePath),
        wide_to_string(&request.monitorFriendlyDeviceName),
    ))
}

/// Returns `(supported, enabled)`.
fn advanced_color(path: &DISPLAYCONFIG_PATH_INFO) -> Result<(bool, bool), OsError> {
    let mut request = DISPLAYCONFIG_GET_ADVANCED_COLOR_INFO {
        header: header::<DISPLAYCONFIG_GET_ADVANCED_COLOR_INFO>(
            DISPLAYCONFIG_DEVICE_INFO_GET_ADVANCED_COLOR_INFO,
            path.targetInfo.adapterId,
            path.targetInfo.id,
        ),
        ..Default::default()
    };
    let status = unsafe { DisplayConfigGetDeviceInfo(&mut request.header) };
    check_device_info("DisplayConfigGetDeviceInfo(advanced color)", status)?;
    let bits = unsafe { request.Anonymous.value };
    Ok((bits & 0x1 != 0, bits & 0x2 != 0))
}

fn current_mode(gdi_name: &str) -> Result<DisplayMode, OsError> {
    let name = to_wide(gdi_name);
    let mut dm = empty_devmode();
    let ok = unsafe { EnumDisplaySettingsW(PCWSTR(name.as_ptr()), ENUM_CURRENT_SETTINGS, &mut dm) };
    if !ok.as_bool() {
        return Err(OsError::new(
            "EnumDisplaySettingsW",
            format!("no current mode for {}", gdi_name),
        ));
    }
    let position = unsafe { dm.Anonymous1.Anonymous2.dmPosition };
    Ok(DisplayMode {
        width: dm.dmPelsWidth,
        height: dm.dmPelsHeight,
        refresh_rate: dm.dmDisplayFrequency,
        position_x: position.x,
        position_y: position.y,
    })
}

/// Every refresh rate the driver offers at `mode`'s resolution.
fn supported_refresh_rates(gdi_name: &str, mode: &DisplayMode) -> Vec<u32> {
    let name = to_wide(gdi_name);
    let mut rates = Vec::new();
    let mut index = 0u32;
    loop {
        let mut dm = empty_devmode();
        let ok = unsafe {
            EnumDisplaySettingsW(PCWSTR(name.as_ptr()), ENUM_DISPLAY_SETTINGS_MODE(index), &mut dm)
        };
        if !ok.as_bool() {
            break;
        }
        if dm.dmPelsWidth == mode.width
            && dm.dmPelsHeight == mode.height
            && dm.dmDisplayFrequency > 1
            && !rates.contains(&dm.dmDisplayFrequency)
        {
            rates.push(dm.dmDisplayFrequency);
        }
        index += 1;
    }
    rates.sort_unstable();
    rates
}

fn move_origin(gdi_name: &str, x: i32, y: i32, flags: CDS_TYPE) -> Result<(), OsError> {
    let name = to_wide(gdi_name);
    let mut dm = empty_devmode();
    dm.dmFields = DM_POSITION;
    unsafe {
        dm.Anonymous1.Anonymous2.dmPosition = POINTL { x, y };
    }
    let result = unsafe {
        ChangeDisplaySettingsExW(PCWSTR(name.as_ptr()), Some(&dm), None, flags, None)
    };
    check_disp_change("ChangeDisplaySettingsExW(position)", result)
}

/// Stage the origin shift that makes `display` primary, one `stage` call
/// per display. If any call fails, the displays already staged are staged
/// back to their snapshot positions before the error is returned.
fn stage_primary_swap<F>(
    display: &DisplayState,
    topology: &DisplayTopologySnapshot,
    mut stage: F,
) -> Result<(), OsError>
where
    F: FnMut(&str, i32, i32, CDS_TYPE) -> Result<(), OsError>,
{
    let dx = display.mode.position_x;
    let dy = display.mode.position_y;

    let mut staged: Vec<&DisplayState> = Vec::new();
    for other in topology.displays.iter().filter(|d| d.id != display.id) {
        if let Err(e) = stage(
            &other.device.gdi_name,
            other.mode.position_x - dx,
            other.mode.position_y - dy,
            CDS_UPDATEREGISTRY | CDS_NORESET,
        ) {
            restage(&staged, &mut stage);
            return Err(e);
        }
        staged.push(other);
    }
    if let Err(e) = stage(
        &display.device.gdi_name,
        0,
        0,
        CDS_UPDATEREGISTRY | CDS_NORESET | CDS_SET_PRIMARY,
    ) {
        restage(&staged, &mut stage);
        return Err(e);
    }
    Ok(())
}

/// Overwrite pending registry changes for `displays` with their snapshot
/// positions, so a later `CDS_UPDATEREGISTRY` call without `CDS_NORESET`
/// has nothing stray to commit.
fn restage<F>(displays: &[&DisplayState], stage: &mut F)
where
    F: FnMut(&str, i32, i32, CDS_TYPE) -> Result<(), OsError>,
{
    for d in displays {
        let flags = if d.is_primary {
            CDS_UPDATEREGISTRY | CDS_NORESET | CDS_SET_PRIMARY
        } else {
            CDS_UPDATEREGISTRY | CDS_NORESET
        };
        if let Err(e) = stage(&d.device.gdi_name, d.mode.position_x, d.mode.position_y, flags) {
            log::warn!("Failed to restore staged position of {}: {}", d.id, e);
        }
    }
}

impl DisplayBackend for Win32Displays {
    fn enumerate(&mut self) -> Result<Vec<DisplayState>, OsError> {
        let paths = query_active_paths()?;
        let mut displays = Vec::with_capacity(paths.len());

        for path in &paths {
            let gdi_name = source_name(path)?;
            let (device_path, friendly_name) = target_name(path)?;
            let (hdr_supported, hdr_enabled) = advanced_color(path)?;
            let mode = current_mode(&gdi_name)?;
            let supported_refresh_rates = supported_refresh_rates(&gdi_name, &mode);

            displays.push(DisplayState {
                id: DisplayId(device_path),
                friendly_name,
                is_primary: mode.position_x == 0 && mode.position_y == 0,
                mode,
                hdr_supported,
                hdr_enabled,
                supported_refresh_rates,
                device: DeviceHandle {
                    gdi_name,
                    adapter: AdapterLuid {
                        low: path.targetInfo.adapterId.LowPart,
                        high: path.targetInfo.adapterId.HighPart,
                    },
                    source_id: path.sourceInfo.id,
                    target_id: path.targetInfo.id,
                },
            });
        }

        Ok(displays)
    }

    fn set_primary(
        &mut self,
        display: &DisplayState,
        topology: &DisplayTopologySnapshot,
    ) -> Result<(), OsError> {
        // The primary display always sits at the desktop origin, so every
        // display is shifted by the new primary's current position.
        stage_primary_swap(display, topology, move_origin)?;

        let result =
            unsafe { ChangeDisplaySettingsExW(PCWSTR::null(), None, None, CDS_TYPE(0), None) };
        if let Err(e) = check_disp_change("ChangeDisplaySettingsExW(commit)", result) {
            let all: Vec<&DisplayState> = topology.displays.iter().collect();
            restage(&all, &mut move_origin);
            return Err(e);
        }
        Ok(())
    }

    fn set_refresh_rate(&mut self, display: &DisplayState, hz: u32) -> Result<(), OsError> {
        let name = to_wide(&display.device.gdi_name);
        let mut dm = empty_devmode();
        dm.dmFields = DM_DISPLAYFREQUENCY;
        dm.dmDisplayFrequency = hz;
        let result = unsafe {
            ChangeDisplaySettingsExW(
                PCWSTR(name.as_ptr()),
                Some(&dm),
                None,
                CDS_UPDATEREGISTRY,
                None,
            )
        };
        check_disp_change("ChangeDisplaySettingsExW(refresh rate)", result)
    }

    fn set_hdr(&mut self, display: &DisplayState, enabled: bool) -> Result<(), OsError> {
        let mut request = DISPLAYCONFIG_SET_ADVANCED_COLOR_STATE {
            header: header::<DISPLAYCONFIG_SET_ADVANCED_COLOR_STATE>(
                DISPLAYCONFIG_DEVICE_INFO_SET_ADVANCED_COLOR_STATE,
                luid(display.device.adapter),
                display.device.target_id,
            ),
            ..Default::default()
        };
        request.Anonymous.value = enabled as u32;
        let status = unsafe { DisplayConfigSetDeviceInfo(&request.header) };
        check_device_info("DisplayConfigSetDeviceInfo(advanced color)", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::monitor;

    fn three_displays() -> DisplayTopologySnapshot {
        DisplayTopologySnapshot {
            displays: vec![
                monitor("A", 1920, 1080, 60).primary(),
                monitor("B", 1920, 1080, 60).at(1920, 0),
                monitor("C", 1920, 1080, 60).at(3840, 0),
            ],
            captured_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn failed_swap_restages_snapshot_positions() {
        let topology = three_displays();
        let promote = topology.displays[1].clone();
        let c_name = topology.displays[2].device.gdi_name.clone();

        let mut calls: Vec<(String, i32, i32, bool)> = Vec::new();
        let result = stage_primary_swap(&promote, &topology, |name, x, y, flags| {
            calls.push((name.to_string(), x, y, flags.0 & CDS_SET_PRIMARY.0 != 0));
            if name == c_name && x == 1920 {
                Err(OsError::new("ChangeDisplaySettingsExW(position)", "bad mode"))
            } else {
                Ok(())
            }
        });

        assert!(result.is_err());
        let a_name = topology.displays[0].device.gdi_name.clone();
        assert_eq!(
            calls,
            vec![
                (a_name.clone(), -1920, 0, false),
                (c_name, 1920, 0, false),
                // A is put back where it was, still primary.
                (a_name, 0, 0, true),
            ]
        );
    }

    #[test]
    fn successful_swap_stages_every_display() {
        let topology = three_displays();
        let promote = topology.displays[1].clone();

        let mut calls = Vec::new();
        stage_primary_swap(&promote, &topology, |name, x, y, flags| {
            calls.push((name.to_string(), x, y, flags.0 & CDS_SET_PRIMARY.0 != 0));
            Ok(())
        })
        .unwrap();

        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], (promote.device.gdi_name.clone(), 0, 0, true));
    }
}

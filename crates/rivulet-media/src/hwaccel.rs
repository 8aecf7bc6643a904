// crates/rivulet-media/src/hwaccel.rs
//
// Hardware acceleration: capability probing, device context creation,
// per-decoder setup, and device-to-host frame transfer. The decoder
// holds a boxed accelerator (or none) behind the HardwareAccel trait;
// the one concrete implementation drives every libav hwdevice backend
// through the generic AVHWDeviceContext API.
//
// A caller may supply its own device handle through the config
// callback; the handle must be an AVBufferRef wrapping an
// AVHWDeviceContext of the requested backend. The type tag is checked
// before adoption and the buffer is ref'd, so the caller keeps
// ownership of its original reference.

use std::ffi::{c_void, CStr, CString};
use std::ptr;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;

use rivulet_core::config::{FreeHwContextCallback, HwContextCallback};
use rivulet_core::{HwAccelType, ImageFormat};

use crate::helpers::formats::{hw_device_type, hw_image_format};

/// One enumerated backend.
#[derive(Debug, Clone)]
pub struct HwAccelInfo {
    pub accel_type: HwAccelType,
    pub name: String,
    pub description: String,
    pub available: bool,
    pub hw_format: ImageFormat,
    pub sw_formats: Vec<ImageFormat>,
}

pub trait HardwareAccel: Send {
    fn accel_type(&self) -> HwAccelType;
    fn device_name(&self) -> &str;
    fn device_description(&self) -> &str;
    fn device_index(&self) -> i32;

    /// Attach the device context to a not-yet-opened codec context.
    fn setup_decoder(&self, codec_ctx: &mut ffmpeg::codec::context::Context) -> bool;

    /// Copy a device-memory frame into system memory.
    fn transfer_to_host(
        &self,
        hw_frame: &ffmpeg::util::frame::video::Video,
        sw_frame: &mut ffmpeg::util::frame::video::Video,
    ) -> bool;
}

fn type_description(accel: HwAccelType) -> &'static str {
    match accel {
        HwAccelType::Dxva2 => "DirectX Video Acceleration 2.0",
        HwAccelType::D3d11va => "Direct3D 11 Video Acceleration",
        HwAccelType::Cuda => "NVIDIA CUDA",
        HwAccelType::Vaapi => "Video Acceleration API",
        HwAccelType::Vdpau => "Video Decode and Presentation API for Unix",
        HwAccelType::Qsv => "Intel Quick Sync Video",
        HwAccelType::VideoToolbox => "Apple VideoToolbox",
        HwAccelType::None | HwAccelType::Auto => "",
    }
}

fn accel_from_device_type(device: ffi::AVHWDeviceType) -> Option<HwAccelType> {
    use ffi::AVHWDeviceType::*;
    match device {
        AV_HWDEVICE_TYPE_DXVA2 => Some(HwAccelType::Dxva2),
        AV_HWDEVICE_TYPE_D3D11VA => Some(HwAccelType::D3d11va),
        AV_HWDEVICE_TYPE_CUDA => Some(HwAccelType::Cuda),
        AV_HWDEVICE_TYPE_VAAPI => Some(HwAccelType::Vaapi),
        AV_HWDEVICE_TYPE_VDPAU => Some(HwAccelType::Vdpau),
        AV_HWDEVICE_TYPE_QSV => Some(HwAccelType::Qsv),
        AV_HWDEVICE_TYPE_VIDEOTOOLBOX => Some(HwAccelType::VideoToolbox),
        _ => None,
    }
}

/// Backends compiled into the linked libav, in no particular order.
fn compiled_in_backends() -> Vec<HwAccelType> {
    let mut found = Vec::new();
    let mut device = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        device = unsafe { ffi::av_hwdevice_iterate_types(device) };
        if device == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        if let Some(accel) = accel_from_device_type(device) {
            found.push(accel);
        }
    }
    found
}

/// List every known backend with its availability on this build.
pub fn enumerate_hw_accels() -> Vec<HwAccelInfo> {
    let compiled = compiled_in_backends();
    HwAccelType::AUTO_PRIORITY
        .iter()
        .map(|&accel| {
            let name = hw_device_type(accel)
                .map(|device| unsafe {
                    let raw = ffi::av_hwdevice_get_type_name(device);
                    if raw.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(raw).to_string_lossy().into_owned()
                    }
                })
                .unwrap_or_default();
            HwAccelInfo {
                accel_type: accel,
                name,
                description: type_description(accel).to_owned(),
                available: compiled.contains(&accel),
                hw_format: hw_image_format(accel),
                sw_formats: vec![ImageFormat::Nv12, ImageFormat::Yuv420p],
            }
        })
        .collect()
}

/// Generic hwdevice-backed accelerator.
pub struct DeviceAccel {
    accel_type: HwAccelType,
    device_index: i32,
    device_ctx: *mut ffi::AVBufferRef,
    name: String,
    description: String,
    /// Foreign handle adopted from the config callback, released
    /// through the matching free callback.
    user_handle: Option<(*mut c_void, Option<FreeHwContextCallback>)>,
}

// The device context buffer is reference counted and only mutated
// through libav calls; the struct moves between the controller and the
// decoder worker but is never shared.
unsafe impl Send for DeviceAccel {}

impl DeviceAccel {
    /// Create an accelerator for one concrete backend. Returns None
    /// when the backend is missing or device creation fails.
    fn for_type(
        accel_type: HwAccelType,
        device_index: i32,
        user_cb: Option<&HwContextCallback>,
        free_cb: Option<FreeHwContextCallback>,
    ) -> Option<Self> {
        let device_type = hw_device_type(accel_type)?;

        // A user-supplied device handle wins over library creation.
        if let Some(cb) = user_cb {
            let handle = cb(accel_type);
            if !handle.is_null() {
                let buffer = handle as *mut ffi::AVBufferRef;
                if unsafe { validate_device_buffer(buffer, device_type) } {
                    let device_ctx = unsafe { ffi::av_buffer_ref(buffer) };
                    if !device_ctx.is_null() {
                        return Some(Self::assemble(
                            accel_type,
                            device_index,
                            device_ctx,
                            Some((handle, free_cb)),
                        ));
                    }
                } else {
                    log::warn!(
                        "user hardware context rejected: not a {:?} device",
                        accel_type
                    );
                }
            }
        }

        let device = if device_index > 0 {
            CString::new(device_index.to_string()).ok()
        } else {
            None
        };
        let device_ptr = device.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let mut device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut device_ctx, device_type, device_ptr, ptr::null_mut(), 0)
        };
        if ret < 0 || device_ctx.is_null() {
            log::debug!("hwdevice create failed for {:?}: {}", accel_type, ret);
            return None;
        }

        Some(Self::assemble(accel_type, device_index, device_ctx, None))
    }

    fn assemble(
        accel_type: HwAccelType,
        device_index: i32,
        device_ctx: *mut ffi::AVBufferRef,
        user_handle: Option<(*mut c_void, Option<FreeHwContextCallback>)>,
    ) -> Self {
        let name = hw_device_type(accel_type)
            .map(|device| unsafe {
                let raw = ffi::av_hwdevice_get_type_name(device);
                if raw.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(raw).to_string_lossy().into_owned()
                }
            })
            .unwrap_or_default();
        Self {
            accel_type,
            device_index,
            device_ctx,
            name,
            description: type_description(accel_type).to_owned(),
            user_handle,
        }
    }
}

/// The handle must be an AVBufferRef whose payload is an
/// AVHWDeviceContext of the expected backend.
unsafe fn validate_device_buffer(
    buffer: *mut ffi::AVBufferRef,
    expected: ffi::AVHWDeviceType,
) -> bool {
    if buffer.is_null() || (*buffer).data.is_null() {
        return false;
    }
    let device = (*buffer).data as *mut ffi::AVHWDeviceContext;
    (*device).type_ == expected
}

impl HardwareAccel for DeviceAccel {
    fn accel_type(&self) -> HwAccelType {
        self.accel_type
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn device_description(&self) -> &str {
        &self.description
    }

    fn device_index(&self) -> i32 {
        self.device_index
    }

    fn setup_decoder(&self, codec_ctx: &mut ffmpeg::codec::context::Context) -> bool {
        unsafe {
            let reference = ffi::av_buffer_ref(self.device_ctx);
            if reference.is_null() {
                return false;
            }
            (*codec_ctx.as_mut_ptr()).hw_device_ctx = reference;
        }
        true
    }

    fn transfer_to_host(
        &self,
        hw_frame: &ffmpeg::util::frame::video::Video,
        sw_frame: &mut ffmpeg::util::frame::video::Video,
    ) -> bool {
        unsafe {
            if ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0) < 0 {
                return false;
            }
            ffi::av_frame_copy_props(sw_frame.as_mut_ptr(), hw_frame.as_ptr());
        }
        true
    }
}

impl Drop for DeviceAccel {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.device_ctx);
        }
        if let Some((handle, Some(free_cb))) = self.user_handle.take() {
            free_cb(self.accel_type, handle);
        }
    }
}

/// Build an accelerator for `accel_type`. `Auto` walks the priority
/// order and takes the first backend that yields a device; `None`
/// yields no accelerator.
pub fn create(
    accel_type: HwAccelType,
    device_index: i32,
    user_cb: Option<&HwContextCallback>,
    free_cb: Option<FreeHwContextCallback>,
) -> Option<Box<dyn HardwareAccel>> {
    match accel_type {
        HwAccelType::None => None,
        HwAccelType::Auto => {
            let compiled = compiled_in_backends();
            for candidate in HwAccelType::AUTO_PRIORITY {
                if !compiled.contains(&candidate) {
                    continue;
                }
                if let Some(accel) =
                    DeviceAccel::for_type(candidate, device_index, user_cb, free_cb.clone())
                {
                    log::info!("auto-selected hardware accelerator {:?}", candidate);
                    return Some(Box::new(accel));
                }
            }
            None
        }
        concrete => DeviceAccel::for_type(concrete, device_index, user_cb, free_cb)
            .map(|accel| Box::new(accel) as Box<dyn HardwareAccel>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_lists_every_known_backend() {
        let infos = enumerate_hw_accels();
        assert_eq!(infos.len(), HwAccelType::AUTO_PRIORITY.len());
        for info in &infos {
            assert_ne!(info.hw_format, ImageFormat::Unknown);
            assert!(!info.description.is_empty());
            assert!(info.sw_formats.contains(&ImageFormat::Nv12));
        }
    }

    #[test]
    fn none_type_yields_no_accelerator() {
        assert!(create(HwAccelType::None, 0, None, None).is_none());
    }
}

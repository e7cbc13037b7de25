//! Binding to the NDI capture SDK.
//!
//! The SDK ships as a redistributable runtime library, so it is loaded
//! dynamically on first use. A machine without the runtime gets
//! [`CastError::NdiUnavailable`] from every entry point instead of a link
//! failure, and the rest of the server (Splash, HTTP) keeps working.
//!
//! Only the capture surface the server needs is bound: one-shot source
//! discovery and a receiver with a bounded video poll. Audio and metadata
//! frames are freed and ignored.

pub mod discovery;

use crate::errors::CastError;
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_float, c_int, c_void};
use std::sync::OnceLock;

/// FourCC codes the receiver is expected to deliver (little-endian).
pub const FOURCC_UYVY: i32 = 0x5956_5955;
pub const FOURCC_BGRA: i32 = 0x4152_4742;
pub const FOURCC_BGRX: i32 = 0x5852_4742;

// NDIlib_recv_color_format_e
const COLOR_FORMAT_BGRX_BGRA: c_int = 0;
const COLOR_FORMAT_UYVY_BGRA: c_int = 1;
// NDIlib_recv_bandwidth_e
const BANDWIDTH_HIGHEST: c_int = 100;
// NDIlib_frame_type_e
const FRAME_TYPE_VIDEO: c_int = 1;
const FRAME_TYPE_AUDIO: c_int = 2;
const FRAME_TYPE_METADATA: c_int = 3;
const FRAME_TYPE_ERROR: c_int = 4;

#[repr(C)]
struct RawSource {
    p_ndi_name: *const c_char,
    p_url_address: *const c_char,
}

#[repr(C)]
struct RawFindCreate {
    show_local_sources: bool,
    p_groups: *const c_char,
    p_extra_ips: *const c_char,
}

#[repr(C)]
struct RawRecvCreateV3 {
    source_to_connect_to: RawSource,
    color_format: c_int,
    bandwidth: c_int,
    allow_video_fields: bool,
    p_ndi_recv_name: *const c_char,
}

#[repr(C)]
struct RawVideoFrameV2 {
    xres: c_int,
    yres: c_int,
    fourcc: c_int,
    frame_rate_n: c_int,
    frame_rate_d: c_int,
    picture_aspect_ratio: c_float,
    frame_format_type: c_int,
    timecode: i64,
    p_data: *mut u8,
    line_stride_in_bytes: c_int,
    p_metadata: *const c_char,
    timestamp: i64,
}

#[repr(C)]
struct RawAudioFrameV2 {
    sample_rate: c_int,
    no_channels: c_int,
    no_samples: c_int,
    timecode: i64,
    p_data: *mut c_float,
    channel_stride_in_bytes: c_int,
    p_metadata: *const c_char,
    timestamp: i64,
}

#[repr(C)]
struct RawMetadataFrame {
    length: c_int,
    timecode: i64,
    p_data: *mut c_char,
}

type FnInitialize = unsafe extern "C" fn() -> bool;
type FnFindCreateV2 = unsafe extern "C" fn(*const RawFindCreate) -> *mut c_void;
type FnFindDestroy = unsafe extern "C" fn(*mut c_void);
type FnFindWaitForSources = unsafe extern "C" fn(*mut c_void, u32) -> bool;
type FnFindGetCurrentSources = unsafe extern "C" fn(*mut c_void, *mut u32) -> *const RawSource;
type FnRecvCreateV3 = unsafe extern "C" fn(*const RawRecvCreateV3) -> *mut c_void;
type FnRecvDestroy = unsafe extern "C" fn(*mut c_void);
type FnRecvCaptureV2 =
    unsafe extern "C" fn(*mut c_void, *mut RawVideoFrameV2, *mut RawAudioFrameV2, *mut RawMetadataFrame, u32) -> c_int;
type FnRecvFreeVideoV2 = unsafe extern "C" fn(*mut c_void, *const RawVideoFrameV2);
type FnRecvFreeAudioV2 = unsafe extern "C" fn(*mut c_void, *const RawAudioFrameV2);
type FnRecvFreeMetadata = unsafe extern "C" fn(*mut c_void, *const RawMetadataFrame);

struct NdiLib {
    _lib: Library,
    find_create_v2: FnFindCreateV2,
    find_destroy: FnFindDestroy,
    find_wait_for_sources: FnFindWaitForSources,
    find_get_current_sources: FnFindGetCurrentSources,
    recv_create_v3: FnRecvCreateV3,
    recv_destroy: FnRecvDestroy,
    recv_capture_v2: FnRecvCaptureV2,
    recv_free_video_v2: FnRecvFreeVideoV2,
    recv_free_audio_v2: FnRecvFreeAudioV2,
    recv_free_metadata: FnRecvFreeMetadata,
}

unsafe impl Send for NdiLib {}
unsafe impl Sync for NdiLib {}

#[cfg(target_os = "windows")]
const LIBRARY_CANDIDATES: &[&str] = &["Processing.NDI.Lib.x64.dll", "Processing.NDI.Lib.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_CANDIDATES: &[&str] = &["libndi.dylib", "libndi.4.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_CANDIDATES: &[&str] = &["libndi.so.6", "libndi.so.5", "libndi.so"];

static LIB: OnceLock<Result<NdiLib, String>> = OnceLock::new();

fn lib() -> Result<&'static NdiLib, CastError> {
    LIB.get_or_init(load)
        .as_ref()
        .map_err(|e| CastError::NdiUnavailable(e.clone()))
}

fn load() -> Result<NdiLib, String> {
    let mut last_err = String::new();
    for name in LIBRARY_CANDIDATES {
        match unsafe { Library::new(name) } {
            Ok(library) => return load_symbols(library),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(format!("runtime not found (tried {:?}): {}", LIBRARY_CANDIDATES, last_err))
}

fn load_symbols(library: Library) -> Result<NdiLib, String> {
    unsafe fn sym<T: Copy>(library: &Library, name: &[u8]) -> Result<T, String> {
        library
            .get::<T>(name)
            .map(|s| *s)
            .map_err(|e| format!("missing symbol {}: {}", String::from_utf8_lossy(name), e))
    }
    unsafe {
        let initialize: FnInitialize = sym(&library, b"NDIlib_initialize\0")?;
        if !initialize() {
            return Err("NDIlib_initialize failed (unsupported CPU?)".into());
        }
        Ok(NdiLib {
            find_create_v2: sym(&library, b"NDIlib_find_create_v2\0")?,
            find_destroy: sym(&library, b"NDIlib_find_destroy\0")?,
            find_wait_for_sources: sym(&library, b"NDIlib_find_wait_for_sources\0")?,
            find_get_current_sources: sym(&library, b"NDIlib_find_get_current_sources\0")?,
            recv_create_v3: sym(&library, b"NDIlib_recv_create_v3\0")?,
            recv_destroy: sym(&library, b"NDIlib_recv_destroy\0")?,
            recv_capture_v2: sym(&library, b"NDIlib_recv_capture_v2\0")?,
            recv_free_video_v2: sym(&library, b"NDIlib_recv_free_video_v2\0")?,
            recv_free_audio_v2: sym(&library, b"NDIlib_recv_free_audio_v2\0")?,
            recv_free_metadata: sym(&library, b"NDIlib_recv_free_metadata\0")?,
            _lib: library,
        })
    }
}

/// True when the NDI runtime could be loaded and initialised.
pub fn available() -> bool {
    lib().is_ok()
}

/// A discovered upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub url: String,
}

fn opt_cstring(value: &str) -> Option<CString> {
    if value.is_empty() {
        None
    } else {
        CString::new(value).ok()
    }
}

fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

/// One-shot discovery with the given wait window. Returns an empty list when
/// the runtime is unavailable or nothing announced itself in time. The
/// `NDI_GROUPS` and `NDI_EXTRA_IPS` environment variables scope the search.
pub fn list_sources(timeout_ms: u32) -> Vec<SourceInfo> {
    let lib = match lib() {
        Ok(lib) => lib,
        Err(_) => return Vec::new(),
    };
    let groups = opt_cstring(&std::env::var("NDI_GROUPS").unwrap_or_default());
    let extra_ips = opt_cstring(&std::env::var("NDI_EXTRA_IPS").unwrap_or_default());
    let create = RawFindCreate {
        show_local_sources: true,
        p_groups: groups.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
        p_extra_ips: extra_ips.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
    };
    unsafe {
        let finder = (lib.find_create_v2)(&create);
        if finder.is_null() {
            return Vec::new();
        }
        (lib.find_wait_for_sources)(finder, timeout_ms);
        let mut count: u32 = 0;
        let arr = (lib.find_get_current_sources)(finder, &mut count);
        let mut out = Vec::with_capacity(count as usize);
        if !arr.is_null() {
            for i in 0..count as usize {
                let raw = &*arr.add(i);
                out.push(SourceInfo {
                    name: cstr_to_string(raw.p_ndi_name),
                    url: cstr_to_string(raw.p_url_address),
                });
            }
        }
        (lib.find_destroy)(finder);
        out
    }
}

/// A captured video frame, copied out of the SDK's buffer.
pub struct VideoFrame {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub fourcc: i32,
    pub data: Vec<u8>,
}

/// Connected receiver for one source URL.
pub struct Receiver {
    inst: *mut c_void,
}

// The receiver handle is owned by a single capture thread.
unsafe impl Send for Receiver {}

impl Receiver {
    /// Connect to a source by URL. `NDI_RECV_COLOR` selects the requested
    /// colour family (UYVY keeps packed 4:2:2; anything else asks for BGRA).
    pub fn connect(url: &str) -> Result<Receiver, CastError> {
        let lib = lib()?;
        let url_c = CString::new(url).map_err(|_| CastError::NoSource(url.into()))?;
        let color = match std::env::var("NDI_RECV_COLOR").unwrap_or_default().to_ascii_uppercase().as_str() {
            "UYVY" => COLOR_FORMAT_UYVY_BGRA,
            _ => COLOR_FORMAT_BGRX_BGRA,
        };
        let create = RawRecvCreateV3 {
            source_to_connect_to: RawSource {
                p_ndi_name: std::ptr::null(),
                p_url_address: url_c.as_ptr(),
            },
            color_format: color,
            bandwidth: BANDWIDTH_HIGHEST,
            allow_video_fields: false,
            p_ndi_recv_name: std::ptr::null(),
        };
        let inst = unsafe { (lib.recv_create_v3)(&create) };
        if inst.is_null() {
            return Err(CastError::CaptureError(format!("NDIlib_recv_create_v3 failed for {}", url)));
        }
        Ok(Receiver { inst })
    }

    /// Poll for a video frame with a bounded timeout. Audio and metadata
    /// frames are freed and reported as `None`; an SDK error frame is an
    /// `Err`.
    pub fn capture_video(&self, timeout_ms: u32) -> Result<Option<VideoFrame>, CastError> {
        let lib = lib()?;
        let mut video: RawVideoFrameV2 = unsafe { std::mem::zeroed() };
        let mut audio: RawAudioFrameV2 = unsafe { std::mem::zeroed() };
        let mut meta: RawMetadataFrame = unsafe { std::mem::zeroed() };
        let kind = unsafe { (lib.recv_capture_v2)(self.inst, &mut video, &mut audio, &mut meta, timeout_ms) };
        match kind {
            FRAME_TYPE_VIDEO => {
                let frame = unsafe { self.copy_video(lib, &video) };
                unsafe { (lib.recv_free_video_v2)(self.inst, &video) };
                Ok(frame)
            }
            FRAME_TYPE_AUDIO => {
                unsafe { (lib.recv_free_audio_v2)(self.inst, &audio) };
                Ok(None)
            }
            FRAME_TYPE_METADATA => {
                unsafe { (lib.recv_free_metadata)(self.inst, &meta) };
                Ok(None)
            }
            FRAME_TYPE_ERROR => Err(CastError::CaptureError("receiver reported an error frame".into())),
            _ => Ok(None), // timeout or status change
        }
    }

    unsafe fn copy_video(&self, _lib: &NdiLib, raw: &RawVideoFrameV2) -> Option<VideoFrame> {
        if raw.p_data.is_null() || raw.xres <= 0 || raw.yres <= 0 || raw.line_stride_in_bytes <= 0 {
            return None;
        }
        let stride = raw.line_stride_in_bytes as usize;
        let height = raw.yres as usize;
        let data = std::slice::from_raw_parts(raw.p_data, stride * height).to_vec();
        Some(VideoFrame {
            width: raw.xres as usize,
            height,
            stride,
            fourcc: raw.fourcc,
            data,
        })
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Ok(lib) = lib() {
            unsafe { (lib.recv_destroy)(self.inst) };
        }
    }
}

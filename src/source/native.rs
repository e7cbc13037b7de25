//! Live NDI receiver source.
//!
//! A dedicated capture thread polls the SDK with a bounded timeout, repacks
//! each video frame to tight stride (cropping odd edges so dimensions stay
//! even), optionally rescales through planar 4:2:0 when an output size was
//! requested, and swaps the result into the latest-wins slot.

use super::{looks_like_url, FrameBuf, NextFrame, PixelFormat};
use crate::errors::CastError;
use crate::ndi::{self, Receiver, FOURCC_UYVY};
use crate::stream::metrics;
use crate::yuv;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_TIMEOUT_MS: u32 = 50;
const SELECT_DISCOVERY_MS: u32 = 2000;
const MAX_CONSECUTIVE_FAILURES: u32 = 100;

pub struct NdiSource {
    latest: Arc<ArcSwapOption<FrameBuf>>,
    /// Requested output size, packed `w << 32 | h`; 0 means native.
    out_size: Arc<AtomicU64>,
    quit: Arc<AtomicBool>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NdiSource {
    /// Select a source by URL if provided, else resolve the display name
    /// against a discovery pass (first case-insensitive substring match
    /// wins), else take the first source found.
    pub fn new(url: &str, name: &str) -> Result<NdiSource, CastError> {
        if !ndi::available() {
            return Err(CastError::NdiUnavailable("runtime not loaded".into()));
        }
        let chosen = if !url.is_empty() {
            url.to_string()
        } else if looks_like_url(name) {
            name.to_string()
        } else {
            let sources = ndi::list_sources(SELECT_DISCOVERY_MS);
            let picked = if name.is_empty() {
                sources.first().cloned()
            } else {
                let needle = name.to_lowercase();
                sources
                    .iter()
                    .find(|s| s.name.to_lowercase().contains(&needle) || s.url == name)
                    .cloned()
            };
            picked
                .map(|s| s.url)
                .ok_or_else(|| {
                    CastError::NoSource(if name.is_empty() {
                        "nothing discovered".to_string()
                    } else {
                        name.to_string()
                    })
                })?
        };
        let receiver = Receiver::connect(&chosen)?;

        let latest: Arc<ArcSwapOption<FrameBuf>> = Arc::new(ArcSwapOption::empty());
        let out_size = Arc::new(AtomicU64::new(0));
        let quit = Arc::new(AtomicBool::new(false));

        let worker = {
            let latest = Arc::clone(&latest);
            let out_size = Arc::clone(&out_size);
            let quit = Arc::clone(&quit);
            std::thread::Builder::new()
                .name("ndi-capture".into())
                .spawn(move || capture_loop(receiver, latest, out_size, quit))
                .map_err(|e| CastError::CaptureError(format!("capture thread spawn failed: {}", e)))?
        };
        metrics::register_source();

        Ok(NdiSource {
            latest,
            out_size,
            quit,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn next(&self) -> NextFrame {
        match self.latest.load_full() {
            Some(frame) => NextFrame::Frame(frame),
            None if self.stopped.load(Ordering::Acquire) => NextFrame::Ended,
            None => NextFrame::Pending,
        }
    }

    pub fn last(&self) -> Option<Arc<FrameBuf>> {
        self.latest.load_full()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.latest.load().as_ref().map(|f| f.format).unwrap_or(PixelFormat::Bgra)
    }

    /// Ask the capture worker to rescale frames to `w x h` before handing
    /// them to encoders. Dimensions are normalised to even values ≥ 2.
    pub fn set_output_size(&self, w: usize, h: usize) {
        let w = (w & !1).max(2) as u64;
        let h = (h & !1).max(2) as u64;
        self.out_size.store(w << 32 | h, Ordering::Release);
    }

    /// Idempotent; the capture worker notices within one poll timeout and
    /// releases the receiver.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.quit.store(true, Ordering::Release);
            // Detach rather than join: the worker exits within one bounded poll.
            let _ = self.worker.lock().map(|mut w| w.take());
        }
    }
}

impl Drop for NdiSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    receiver: Receiver,
    latest: Arc<ArcSwapOption<FrameBuf>>,
    out_size: Arc<AtomicU64>,
    quit: Arc<AtomicBool>,
) {
    let mut first_logged = false;
    let mut failures = 0u32;
    while !quit.load(Ordering::Acquire) {
        let frame = match receiver.capture_video(POLL_TIMEOUT_MS) {
            Ok(Some(frame)) => {
                failures = 0;
                frame
            }
            Ok(None) => continue,
            Err(e) => {
                failures += 1;
                if failures > MAX_CONSECUTIVE_FAILURES {
                    log::error!("NDI capture failing persistently, stopping source: {}", e);
                    break;
                }
                std::thread::sleep(Duration::from_millis(u64::from(POLL_TIMEOUT_MS)));
                continue;
            }
        };
        if !first_logged {
            first_logged = true;
            log::info!(
                "NDI: first frame received {}x{} FourCC={:#x}",
                frame.width,
                frame.height,
                frame.fourcc
            );
        }
        if let Some(buf) = process_frame(frame, out_size.load(Ordering::Acquire)) {
            latest.store(Some(Arc::new(buf)));
        }
    }
    metrics::unregister_source();
}

/// Repack to tight stride (cropping to even dimensions) and apply the
/// optional pre-encode rescale. Returns `None` for degenerate frames.
fn process_frame(frame: ndi::VideoFrame, out_size: u64) -> Option<FrameBuf> {
    let format = if frame.fourcc == FOURCC_UYVY {
        PixelFormat::Uyvy422
    } else {
        // BGRA and BGRX share a layout; anything unknown is treated as BGRA.
        PixelFormat::Bgra
    };
    let bpp = format.bytes_per_pixel();
    let w = frame.width & !1;
    let h = frame.height & !1;
    if w < 2 || h < 2 || frame.data.len() < frame.stride * h {
        return None;
    }

    let mut data = vec![0u8; w * h * bpp];
    if frame.stride == w * bpp && frame.width == w {
        data.copy_from_slice(&frame.data[..w * h * bpp]);
    } else {
        for row in 0..h {
            let src = &frame.data[row * frame.stride..row * frame.stride + w * bpp];
            data[row * w * bpp..(row + 1) * w * bpp].copy_from_slice(src);
        }
    }

    let tw = (out_size >> 32) as usize;
    let th = (out_size & 0xFFFF_FFFF) as usize;
    if tw >= 2 && th >= 2 && (tw != w || th != h) {
        return Some(rescale(&data, w, h, format, tw, th));
    }

    Some(FrameBuf {
        data,
        width: w,
        height: h,
        format,
    })
}

/// Convert → scale → convert back through planar 4:2:0; the result is always
/// packed BGRA-family so downstream sees one format after rescaling.
fn rescale(data: &[u8], w: usize, h: usize, format: PixelFormat, tw: usize, th: usize) -> FrameBuf {
    let mut y = vec![0u8; w * h];
    let mut u = vec![0u8; (w / 2) * (h / 2)];
    let mut v = vec![0u8; (w / 2) * (h / 2)];
    match format {
        PixelFormat::Uyvy422 => yuv::uyvy_to_i420(data, w, h, &mut y, &mut u, &mut v),
        PixelFormat::Bgra => yuv::bgra_to_i420(data, w, h, &mut y, &mut u, &mut v),
    }
    let mut dy = vec![0u8; tw * th];
    let mut du = vec![0u8; (tw / 2) * (th / 2)];
    let mut dv = vec![0u8; (tw / 2) * (th / 2)];
    yuv::i420_scale(&y, &u, &v, w, h, &mut dy, &mut du, &mut dv, tw, th);
    let mut out = vec![0u8; tw * th * 4];
    yuv::i420_to_packed(&dy, &du, &dv, tw, th, &mut out);
    FrameBuf {
        data: out,
        width: tw,
        height: th,
        format: PixelFormat::Bgra,
    }
}

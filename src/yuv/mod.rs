//! Colour-space conversion and planar rescaling kernels.
//!
//! Three pure operations back the encoding pipeline: packed (BGRA or UYVY
//! 4:2:2) to planar I420, planar rescale, and planar back to packed 32-bit.
//! All kernels use BT.601 limited-range coefficients and silently ignore
//! zero/odd dimensions or undersized planes rather than panic.
//!
//! The `simd` build feature swaps in SSE2 paths on x86_64; everything else
//! runs the portable scalar kernels. Results agree within ±1 per channel.
//!
//! Because different capture stacks deliver subtly different byte orders,
//! the packed layout is environment-configurable:
//! - `YUV_BGRA_ORDER` ∈ {BGRA, RGBA, ARGB, ABGR} — byte order in memory
//!   (default BGRA).
//! - `YUV_SWAP_UV` ∈ {0, 1} — swap the chroma planes in both directions.
//! - `YUV_SCALE_FILTER` ∈ {NONE, LINEAR, BILINEAR, BOX} — rescale filter
//!   (default BOX).

mod convert;
mod scale;
#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod simd;

pub use convert::{bgra_to_i420, i420_to_packed, uyvy_to_i420};
pub use scale::i420_scale;

use std::sync::OnceLock;

/// Byte order of the packed 32-bit pixel format, as laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedOrder {
    Bgra,
    Rgba,
    Argb,
    Abgr,
}

impl PackedOrder {
    /// Byte offsets of (r, g, b) within a 4-byte pixel.
    pub(crate) fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PackedOrder::Bgra => (2, 1, 0),
            PackedOrder::Rgba => (0, 1, 2),
            PackedOrder::Argb => (1, 2, 3),
            PackedOrder::Abgr => (3, 2, 1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackedOrder::Bgra => "BGRA",
            PackedOrder::Rgba => "RGBA",
            PackedOrder::Argb => "ARGB",
            PackedOrder::Abgr => "ABGR",
        }
    }
}

/// Rescale filter selection for [`i420_scale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleFilter {
    None,
    Linear,
    Bilinear,
    Box,
}

impl ScaleFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleFilter::None => "NONE",
            ScaleFilter::Linear => "LINEAR",
            ScaleFilter::Bilinear => "BILINEAR",
            ScaleFilter::Box => "BOX",
        }
    }
}

static PACKED_ORDER: OnceLock<PackedOrder> = OnceLock::new();
static SWAP_UV: OnceLock<bool> = OnceLock::new();
static SCALE_FILTER: OnceLock<ScaleFilter> = OnceLock::new();

/// Packed byte order from `YUV_BGRA_ORDER`, defaulting to BGRA.
pub fn packed_order() -> PackedOrder {
    *PACKED_ORDER.get_or_init(|| {
        match std::env::var("YUV_BGRA_ORDER")
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase()
            .as_str()
        {
            "RGBA" => PackedOrder::Rgba,
            "ARGB" => PackedOrder::Argb,
            "ABGR" => PackedOrder::Abgr,
            _ => PackedOrder::Bgra,
        }
    })
}

/// Whether `YUV_SWAP_UV` asks for the chroma planes to be exchanged.
pub fn swap_uv() -> bool {
    *SWAP_UV.get_or_init(|| {
        let v = std::env::var("YUV_SWAP_UV").unwrap_or_default();
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
    })
}

/// Rescale filter from `YUV_SCALE_FILTER`, defaulting to BOX.
pub fn scale_filter() -> ScaleFilter {
    *SCALE_FILTER.get_or_init(|| {
        match std::env::var("YUV_SCALE_FILTER")
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase()
            .as_str()
        {
            "NONE" => ScaleFilter::None,
            "LINEAR" => ScaleFilter::Linear,
            "BILINEAR" => ScaleFilter::Bilinear,
            _ => ScaleFilter::Box,
        }
    })
}

/// Reports the active conversion backend, e.g. `simd(BGRA)` or `scalar(BGRA)`.
pub fn conversion_impl() -> String {
    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    {
        format!("simd({})", packed_order().as_str())
    }
    #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
    {
        format!("scalar({})", packed_order().as_str())
    }
}

pub(crate) fn clamp8(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

/// Plane-size check shared by the kernels: true when the conversion can run.
pub(crate) fn planes_ok(w: usize, h: usize, y: &[u8], u: &[u8], v: &[u8]) -> bool {
    w >= 2 && h >= 2 && w % 2 == 0 && h % 2 == 0 && y.len() >= w * h && u.len() >= (w / 2) * (h / 2) && v.len() >= (w / 2) * (h / 2)
}
